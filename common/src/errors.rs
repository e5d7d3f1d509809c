// Error handling framework
// Configuration errors are fatal before any run; move errors stay inside the task that hit them.

use std::path::PathBuf;
use thiserror::Error;

/// Routing table configuration errors
///
/// Any of these aborts the process before the first run touches the filesystem.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Length of args is {0}, length must be >= 3")]
    TooFewArguments(usize),

    #[error("Length of args is {0}, length must be a multiple of 3")]
    IncompleteTriple(usize),

    #[error("First [{slot}] must not be '$', there is no previous value to repeat")]
    RepeatInFirstTriple { slot: Slot },

    #[error("First [{slot}] is empty")]
    EmptyFirstSlot { slot: Slot },

    #[error("Pattern '{template}' (after replace '{resolved}') does not compile: {reason}")]
    InvalidPattern {
        template: String,
        resolved: String,
        reason: String,
    },

    #[error("No valid [FROM PATTERN TO] triple")]
    EmptyTable,
}

/// Position inside a (source, pattern, destination) triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    From,
    Pattern,
    To,
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Slot::From => "FROM",
            Slot::Pattern => "PATTERN",
            Slot::To => "TO",
        };
        f.write_str(name)
    }
}

/// Per-entity errors raised while a run is in progress
#[derive(Error, Debug)]
pub enum MoveError {
    #[error("Failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create destination directory {path}: {source}")]
    CreateDirFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    RemoveFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Pattern '{pattern}' does not compile: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Failed to walk {path}: {reason}")]
    WalkFailed { path: PathBuf, reason: String },

    #[error("Task aborted: {0}")]
    TaskAborted(String),
}

/// Schedule-related errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid interval '{value}': {reason}")]
    InvalidInterval { value: String, reason: String },

    #[error("No next execution time available for cron schedule")]
    NoNextExecution,
}

impl From<tokio::task::JoinError> for MoveError {
    fn from(err: tokio::task::JoinError) -> Self {
        MoveError::TaskAborted(err.to_string())
    }
}
