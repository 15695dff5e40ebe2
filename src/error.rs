//! Engine error taxonomy
//!
//! Every refusal the materialization engine can produce has a variant here,
//! so callers can match on the class instead of parsing messages. `Cancel`
//! is an internal signal: archive extraction swallows it per member and it
//! must never surface from a task.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Resource, owner, repo, ref or selector does not exist remotely.
    #[error("not found: {0}")]
    NotFound(String),

    /// Action refused by a precondition (e.g. update on an absent resource).
    #[error("invalid operation: {0}")]
    Invalid(String),

    /// Destination path already claimed by a different resource in the store.
    #[error("destination \"{path}\" conflicts with resource {owner}")]
    Conflict { path: PathBuf, owner: i64 },

    /// On-disk content diverged from the stored digest; refused without force.
    #[error("destination \"{0}\" was modified since installation")]
    UserModified(PathBuf),

    /// Path exists on disk, outside the store, with different content.
    #[error("destination \"{0}\" already exists with a different content")]
    AlreadyExists(PathBuf),

    /// Archive member path escapes the output directory.
    #[error(
        "\"{source_name}\" targets a destination outside of the output \
         directory ({path}); pass --trusted to allow this"
    )]
    Unsafe { source_name: String, path: PathBuf },

    /// Action not implemented for this source type.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Silent no-op abort; swallowed during extraction, never surfaced.
    #[error("cancelled")]
    Cancel,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for the per-member outcomes extraction skips without failing
    /// the whole archive.
    pub fn skips_member(&self) -> bool {
        matches!(self, Error::Cancel | Error::UserModified(_))
    }
}

/// One failed (resource, source) pair inside a task.
#[derive(Debug)]
pub struct Failure {
    pub resource: String,
    pub source: Option<String>,
    pub error: Error,
}

/// Composite end-of-task error naming every failed pair.
#[derive(Debug)]
pub struct TaskError {
    pub failures: Vec<Failure>,
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} operation(s) failed", self.failures.len())?;
        for failure in &self.failures {
            match &failure.source {
                Some(src) => write!(
                    f,
                    "\n  {} ({}): {}",
                    failure.resource, src, failure.error
                )?,
                None => write!(f, "\n  {}: {}", failure.resource, failure.error)?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for TaskError {}
