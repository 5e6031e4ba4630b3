//! Core data model definitions shared across cinevault crates.
#![allow(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod error;
pub mod ids;

// Intentionally curated re-exports for downstream consumers.
pub use error::ModelError;
pub use ids::{BatchId, BatchSize, EntryId, EventId, FileId, LibraryId};
