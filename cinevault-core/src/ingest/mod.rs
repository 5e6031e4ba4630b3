//! Ingestion domain modules.
//!
//! The ingest subsystem pulls together the durable job queue that drives
//! scan/analyze/metadata/index/image work and the file-change event stream
//! its producers and consumers ride on.

pub mod fs_watch;
pub mod orchestration;

// Re-export key surfaces so downstream code can write `crate::ingest::*`.
pub use fs_watch::*;
pub use orchestration::*;
