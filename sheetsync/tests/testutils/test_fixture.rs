//! Test fixture for sheetsync integration tests
//!
//! Every fixture gets its own upstream and its own engine, so tests never
//! share cache, quota or transaction state.

#![allow(dead_code)]

use sheetsync::{grid, EngineConfig, MemoryUpstream, SyncCoordinator, Values};
use std::sync::Arc;

/// Spreadsheet every fixture creates
pub const SPREADSHEET: &str = "sheet-1";

pub struct TestFixture {
    pub upstream: Arc<MemoryUpstream>,
    pub engine: Arc<SyncCoordinator>,
}

impl TestFixture {
    /// Fixture with the default configuration
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        init_logging();
        let upstream = Arc::new(MemoryUpstream::new().with_spreadsheet(SPREADSHEET));
        let engine = SyncCoordinator::new(config, upstream.clone())
            .expect("Failed to create sync engine");
        Self { upstream, engine }
    }

    /// Put values straight into the upstream, bypassing the engine
    pub fn seed(&self, range: &str, rows: Vec<Vec<&str>>) {
        self.upstream
            .set_values(SPREADSHEET, range, grid(rows))
            .expect("Failed to seed upstream");
    }

    /// A `rows` x `cols` block of distinct values
    pub fn seed_block(&self, range: &str, rows: usize, cols: usize) {
        let data: Values = grid(
            (0..rows)
                .map(|r| (0..cols).map(|c| format!("r{}c{}", r, c)).collect::<Vec<_>>())
                .collect::<Vec<_>>(),
        );
        self.upstream
            .set_values(SPREADSHEET, range, data)
            .expect("Failed to seed upstream");
    }

    /// What the upstream holds now
    pub fn upstream_values(&self, range: &str) -> Values {
        self.upstream
            .values(SPREADSHEET, range)
            .expect("Failed to read upstream")
    }

    pub fn assert_upstream(&self, range: &str, rows: Vec<Vec<&str>>) {
        assert_eq!(
            self.upstream_values(range),
            grid(rows),
            "unexpected upstream contents in {}",
            range
        );
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
