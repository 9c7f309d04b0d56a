// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Best-effort pre-transaction snapshots
//!
//! A snapshot is captured in the background when a transaction begins. The
//! spreadsheet size is estimated first; above the configured ceiling no copy
//! is made and the transaction runs without rollback safety.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::throttle::{Admission, OperationClass};
use crate::upstream::UpstreamClient;

/// A restorable copy of a spreadsheet held by the upstream service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub spreadsheet_id: String,
    /// Opaque id returned by the upstream copy
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotStatus {
    Ready(Snapshot),
    Oversized { size_bytes: u64, limit: u64 },
    Failed(String),
    TimedOut(Duration),
}

impl SnapshotStatus {
    /// Why no snapshot is available, if none is
    pub fn unavailable_reason(&self) -> Option<String> {
        match self {
            SnapshotStatus::Ready(_) => None,
            SnapshotStatus::Oversized { size_bytes, limit } => Some(format!(
                "spreadsheet is {} bytes, above the {} byte snapshot ceiling",
                size_bytes, limit
            )),
            SnapshotStatus::Failed(reason) => Some(format!("snapshot failed: {}", reason)),
            SnapshotStatus::TimedOut(after) => {
                Some(format!("snapshot not ready after {:?}", after))
            }
        }
    }
}

/// Handle to a snapshot being captured
pub struct SnapshotHandle {
    rx: watch::Receiver<Option<SnapshotStatus>>,
}

impl SnapshotHandle {
    /// Start capturing a snapshot of `spreadsheet_id` in the background
    pub fn capture(
        upstream: Arc<dyn UpstreamClient>,
        admission: Arc<Admission>,
        spreadsheet_id: &str,
        max_bytes: u64,
    ) -> Self {
        let (tx, rx) = watch::channel(None);
        let spreadsheet_id = spreadsheet_id.to_string();
        tokio::spawn(async move {
            let status = take_snapshot(upstream.as_ref(), &admission, &spreadsheet_id, max_bytes).await;
            match &status {
                SnapshotStatus::Ready(snapshot) => log::debug!(
                    "Snapshot {} of {} ready ({} bytes)",
                    snapshot.snapshot_id,
                    spreadsheet_id,
                    snapshot.size_bytes
                ),
                other => log::warn!(
                    "No snapshot for {}: {}",
                    spreadsheet_id,
                    other.unavailable_reason().unwrap_or_default()
                ),
            }
            let _ = tx.send(Some(status));
        });
        Self { rx }
    }

    /// Wait up to `timeout` for the capture to finish
    pub async fn wait(&mut self, timeout: Duration) -> SnapshotStatus {
        let waited = tokio::time::timeout(timeout, self.rx.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(status)) => status
                .clone()
                .unwrap_or_else(|| SnapshotStatus::Failed("capture produced no status".to_string())),
            Ok(Err(_)) => SnapshotStatus::Failed("capture task ended without a status".to_string()),
            Err(_) => SnapshotStatus::TimedOut(timeout),
        }
    }

    /// Discard the snapshot once the capture finishes, without waiting for it
    pub fn discard_when_ready(mut self, upstream: Arc<dyn UpstreamClient>) {
        tokio::spawn(async move {
            let Ok(status) = self.rx.wait_for(Option::is_some).await.map(|s| s.clone()) else {
                return;
            };
            if let Some(SnapshotStatus::Ready(snapshot)) = status {
                discard(upstream.as_ref(), &snapshot).await;
            }
        });
    }
}

async fn take_snapshot(
    upstream: &dyn UpstreamClient,
    admission: &Admission,
    spreadsheet_id: &str,
    max_bytes: u64,
) -> SnapshotStatus {
    let size_bytes = match upstream.estimate_size(spreadsheet_id).await {
        Ok(size) => size,
        Err(err) => return SnapshotStatus::Failed(format!("size estimate failed: {}", err)),
    };
    if size_bytes > max_bytes {
        return SnapshotStatus::Oversized {
            size_bytes,
            limit: max_bytes,
        };
    }

    let permit = match admission.admit(OperationClass::Write, None).await {
        Ok(permit) => permit,
        Err(err) => return SnapshotStatus::Failed(err.to_string()),
    };
    let copied = upstream.copy(spreadsheet_id).await;
    admission.complete(permit, !matches!(&copied, Err(err) if err.is_transient()));

    match copied {
        Ok(snapshot_id) => SnapshotStatus::Ready(Snapshot {
            spreadsheet_id: spreadsheet_id.to_string(),
            snapshot_id,
            created_at: Utc::now(),
            size_bytes,
        }),
        Err(err) => SnapshotStatus::Failed(err.to_string()),
    }
}

/// Restore `snapshot` over its spreadsheet
pub async fn restore(
    upstream: &dyn UpstreamClient,
    admission: &Admission,
    snapshot: &Snapshot,
) -> Result<(), String> {
    let permit = admission
        .admit(OperationClass::Write, None)
        .await
        .map_err(|e| e.to_string())?;
    log::info!(
        "Restoring {} from snapshot {} taken at {}",
        snapshot.spreadsheet_id,
        snapshot.snapshot_id,
        snapshot.created_at.to_rfc3339()
    );
    let restored = upstream
        .restore(&snapshot.spreadsheet_id, &snapshot.snapshot_id)
        .await;
    admission.complete(permit, !matches!(&restored, Err(err) if err.is_transient()));
    restored.map_err(|e| e.to_string())
}

/// Drop the upstream copy; failures are logged only
pub async fn discard(upstream: &dyn UpstreamClient, snapshot: &Snapshot) {
    if let Err(err) = upstream.discard(&snapshot.snapshot_id).await {
        log::warn!(
            "Failed to discard snapshot {} of {}: {}",
            snapshot.snapshot_id,
            snapshot.spreadsheet_id,
            err
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::upstream::MemoryUpstream;
    use crate::values::grid;

    fn admission() -> Arc<Admission> {
        Arc::new(Admission::from_config(&EngineConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_and_restore() {
        let upstream = Arc::new(MemoryUpstream::new().with_spreadsheet("s1"));
        upstream.set_values("s1", "A1", grid(vec![vec!["before"]])).unwrap();

        let mut handle = SnapshotHandle::capture(upstream.clone(), admission(), "s1", 1 << 20);
        let SnapshotStatus::Ready(snapshot) = handle.wait(Duration::from_secs(5)).await else {
            panic!("snapshot should be ready");
        };
        assert_eq!(upstream.snapshot_count(), 1);

        upstream.set_values("s1", "A1", grid(vec![vec!["after"]])).unwrap();
        restore(upstream.as_ref(), &admission(), &snapshot).await.unwrap();
        assert_eq!(upstream.values("s1", "A1").unwrap(), grid(vec![vec!["before"]]));

        discard(upstream.as_ref(), &snapshot).await;
        assert_eq!(upstream.snapshot_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_spreadsheet_is_not_copied() {
        let upstream = Arc::new(MemoryUpstream::new().with_spreadsheet("s1"));
        upstream.set_size_override("s1", 10_000);

        let mut handle = SnapshotHandle::capture(upstream.clone(), admission(), "s1", 1_000);
        let status = handle.wait(Duration::from_secs(5)).await;
        assert_eq!(
            status,
            SnapshotStatus::Oversized {
                size_bytes: 10_000,
                limit: 1_000
            }
        );
        assert!(status.unavailable_reason().is_some());
        assert_eq!(upstream.copy_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_capture_times_out() {
        let upstream = Arc::new(MemoryUpstream::new().with_spreadsheet("s1"));
        upstream.set_latency(Duration::from_secs(10));

        let mut handle = SnapshotHandle::capture(upstream.clone(), admission(), "s1", 1 << 20);
        let status = handle.wait(Duration::from_secs(1)).await;
        assert_eq!(status, SnapshotStatus::TimedOut(Duration::from_secs(1)));

        // The late copy is still cleaned up
        handle.discard_when_ready(upstream.clone());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(upstream.snapshot_count(), 0);
    }
}
