//! **granary** - Package-manager-style fetcher that keeps local files in
//! sync with remote platforms
//!
//! Resources (`github://owner/repo/ref/selector`) resolve into sources,
//! sources stream into atomically-swapped destinations, and a relational
//! store remembers enough to skip unchanged revisions, detect user edits and
//! garbage-collect what the remote stopped shipping.

/// Command-line interface with clap integration
pub mod cli;

/// Engine error taxonomy and task failure aggregation
pub mod error;

/// Transactional materialization engine
pub mod core {
    /// Relational state store (tsk/res/src/dst)
    pub mod store;

    /// Single-file atomic writer: stage, hash, swap, back up
    pub mod destination;

    /// Remote fetchable unit: revision probe, streaming, orphan reconciliation
    pub mod source;

    /// Archive member iteration (tar streaming, zip via scratch file)
    pub mod archive;

    /// Per-resource action orchestration
    pub mod resource;

    /// Top-level transaction spanning resources
    pub mod task;

    /// Explicit dependency bundle injected into tasks
    pub mod engine;
}

/// Hosting platform adapters behind a fixed scheme registry
pub mod platform;

/// Infrastructure - configuration, cache, secrets, HTTP session
pub mod infra {
    /// Settings (granary.toml + GRANARY_ env) and per-OS directories
    pub mod config;

    /// Disk cache backing conditional API requests
    pub mod cache;

    /// Keyring-backed secret storage with a 600-file fallback
    pub mod secrets;

    /// Shared blocking HTTP client with bounded retry
    pub mod http;
}

// Strategic re-exports for embedding consumers
pub use crate::core::destination::{DestKind, Destination};
pub use crate::core::engine::Engine;
pub use crate::core::resource::{Resource, TaskAction};
pub use crate::core::source::{ActionArgs, Source, SourceKind};
pub use crate::core::store::{Action, Store};
pub use crate::core::task::Task;
pub use crate::error::{Error, Result, TaskError};
