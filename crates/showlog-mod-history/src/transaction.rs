/// The history transaction wrapper.
///
/// Every user-visible edit runs through [`transaction_with_history`], which
/// makes the edit atomic and guarantees it lands in exactly one undo group.
use crate::connection::HistoryConnection;
use crate::error::HistoryError;
use crate::groups::increment_group;
use crate::log_store::{self, HistoryKind};

/// Runs `func` atomically as one undoable operation.
///
/// The group is opened before `func` runs and closed after it. Three things
/// are treated as fatal and roll the whole operation back:
/// - `func` (or something it called) opened a group of its own,
/// - the undo group went backwards,
/// - `func` changed no tracked table, so the operation would be invisible to undo.
///
/// `label` only appears in logs and error messages.
pub fn transaction_with_history<C, T, E, F>(conn: &C, label: &str, func: F) -> Result<T, E>
where
    C: HistoryConnection,
    F: FnOnce(&C) -> Result<T, E>,
    E: From<HistoryError>,
{
    conn.transaction(|tx| {
        let before = increment_group(tx, HistoryKind::Undo)?;
        tracing::trace!("[{label}] opened undo group {before}");

        let value = func(tx)?;

        let stats = log_store::read_stats(tx)?;
        let logged = log_store::max_group(tx, HistoryKind::Undo)?.unwrap_or(0);
        let after = logged.max(stats.cur_undo_group);

        if after > before {
            let err = HistoryError::GroupAdvancedIndependently {
                label: label.to_string(),
                before,
                after,
            };
            tracing::error!("{err}");
            return Err(err.into());
        }
        if after < before {
            let err = HistoryError::GroupRegressed {
                label: label.to_string(),
                before,
                after,
            };
            tracing::error!("{err}");
            return Err(err.into());
        }

        let closing = increment_group(tx, HistoryKind::Undo)?;
        if closing != before + 1 {
            let err = HistoryError::NoTrackedChanges {
                label: label.to_string(),
                expected: before + 1,
                actual: closing,
            };
            tracing::error!("{err}");
            return Err(err.into());
        }

        tracing::debug!("[{label}] committed as undo group {before}");
        Ok(value)
    })
}
