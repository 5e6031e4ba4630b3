//! # Cinevault Core
//!
//! Core library for the cinevault media server: the durable mechanisms
//! behind catalog ingestion.
//!
//! ## Overview
//!
//! `cinevault-core` implements four collaborating subsystems over one
//! shared Postgres store:
//!
//! - **Job queue & lease manager**: deduplicated, prioritized ingestion
//!   jobs claimed under time-bounded leases, with retry backoff and
//!   dead-lettering
//! - **Batch allocator**: dense, immutable per-library batch ids assigned
//!   to new catalog entries for composite-key locality
//! - **Sort-position builder**: precomputed multi-dimensional ranks for
//!   paged catalog sorting
//! - **Consumer offset tracker**: durable per-group cursors over the
//!   append-only file-change event log
//!
//! The store's transactions are the only synchronization primitive: any
//! number of stateless workers can operate concurrently against the same
//! database.
//!
//! ## Architecture
//!
//! - [`ingest::orchestration`]: job model, queue traits, Postgres queue,
//!   retry policy, and the housekeeper runtime
//! - [`ingest::fs_watch`]: file-change event bus and consumer offsets
//! - [`catalog`]: entry repository, batch allocator, and sort positions
//! - [`database`] / [`settings`]: connection bootstrap and configuration

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Catalog entries, batch allocation, and sort positions
pub mod catalog;

/// Postgres connection bootstrap
pub mod database;

/// Error types and error handling utilities
pub mod error;

/// Ingestion job queue and file-change event stream
pub mod ingest;

/// Configuration loading
pub mod settings;

/// Shared identifier types
pub mod types;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use error::{IngestError, Result};
