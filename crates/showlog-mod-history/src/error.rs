/// Error types for the history engine.
///
/// Two classes live here. Invariant violations (group deltas, missing stats,
/// bad registrations) are programmer errors and always abort the enclosing
/// transaction. Everything else is an operational failure from SQLite.
use thiserror::Error;

/// Errors produced by the history engine.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("history_stats row is missing; history tables were never initialized")]
    MissingStats,

    #[error("table \"{0}\" stores history and can never be tracked")]
    ForbiddenTable(String),

    #[error("table \"{0}\" does not exist")]
    UnknownTable(String),

    #[error("table \"{table}\" cannot be tracked: {reason}")]
    UnsupportedTable { table: String, reason: &'static str },

    #[error(
        "[{label}] function incremented the group independently, causing untracked sub-grouping \
         (expected group {before}, found {after})"
    )]
    GroupAdvancedIndependently { label: String, before: i64, after: i64 },

    #[error("[{label}] undo group went backwards while the transaction was open (before {before}, after {after})")]
    GroupRegressed { label: String, before: i64, after: i64 },

    #[error(
        "[{label}] undo group did not advance (expected {expected}, got {actual}); \
         the function made no change to any tracked table"
    )]
    NoTrackedChanges { label: String, expected: i64, actual: i64 },

    #[error("No item with \"{id_column}\"={id} in table \"{table}\"")]
    NoItem { id_column: &'static str, id: i64, table: String },

    #[error("background task failed: {0}")]
    Task(String),
}

impl HistoryError {
    /// Whether this error is a broken engine invariant rather than an I/O failure.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::MissingStats
                | Self::ForbiddenTable(_)
                | Self::UnknownTable(_)
                | Self::UnsupportedTable { .. }
                | Self::GroupAdvancedIndependently { .. }
                | Self::GroupRegressed { .. }
                | Self::NoTrackedChanges { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type HistoryResult<T> = Result<T, HistoryError>;
