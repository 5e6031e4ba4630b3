//! Shared identifier types re-exported from `cinevault-model`.

pub use cinevault_model::error::ModelError;
pub use cinevault_model::ids::{BatchId, BatchSize, EntryId, EventId, FileId, LibraryId};
