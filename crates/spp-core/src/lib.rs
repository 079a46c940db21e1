//! spp-core: Incremental local full-text search library
//!
//! This library tracks the file set of one or more directory trees, keeps an
//! SQLite FTS5 index of their text content up to date via mtime comparison,
//! and answers prefix, exact-word and substring queries against it.

pub mod classify;
pub mod config;
pub mod consts;
pub mod discover;
pub mod orchestrator;
pub mod queue;
pub mod scan;
pub mod search;
pub mod storage;
pub mod tokenize;

pub use classify::FileMeta;
pub use config::Config;
pub use consts::*;
pub use discover::find_spp_root;
pub use orchestrator::{Orchestrator, StatusSink};
pub use queue::IndexQueue;
pub use scan::Scanner;
pub use search::Searcher;
pub use storage::Storage;

#[derive(Debug, thiserror::Error)]
pub enum SppError {
    #[error("Not in an spp workspace (no .spp folder found)")]
    NotInRepo,

    #[error("Already initialized: {0}")]
    AlreadyInitialized(std::path::PathBuf),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid exclude pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("Could not parse ignore file: {0}")]
    IgnoreSyntax(String),

    #[error("Index is locked by another process: {0}")]
    Locked(std::path::PathBuf),

    #[error("Index is corrupt and could not be recreated: {0}")]
    Corrupt(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SppError {
    /// Whether this failure should be shown to the user rather than only logged.
    ///
    /// Re-entrant scans/runs are internal and only logged; everything that
    /// stems from storage trouble or bad configuration is surfaced.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Pattern { .. }
                | Self::IgnoreSyntax(_)
                | Self::Locked(_)
                | Self::Corrupt(_)
                | Self::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SppError>;
