//! File-change event log and durable consumer offsets.

pub mod event_bus;

pub use event_bus::{
    FileChangeCursor, FileChangeEvent, FileChangeEventBus, FileChangeEventKind,
    FileChangeEventStream, PostgresFileChangeEventBus,
};
