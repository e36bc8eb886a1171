//! Hive daemon library - exposes the controller components for testing and
//! for `hivectl`.

pub mod bootstrap;
pub mod daemon;
pub mod disk;
pub mod quorum;
pub mod reconciler;
pub mod retry;
pub mod scheduler;
pub mod search_monitor;
pub mod storage;
