//! Test utilities for sheetsync integration tests
//!
//! TestFixture wraps a SyncCoordinator over an in-process MemoryUpstream so
//! tests can drive the public API and inspect upstream traffic directly.

pub mod test_fixture;
