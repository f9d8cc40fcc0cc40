/// Group counters and retention.
///
/// A group's number is always derived from the log (`MAX(history_group) + 1`),
/// never from the stored counter alone, so a counter that drifted after a
/// crash heals on the next increment.
use crate::connection::{HistoryConnection, SqlValue};
use crate::error::{HistoryError, HistoryResult};
use crate::log_store::{self, HistoryKind, STATS_TABLE, UNDO_TABLE};

/// Opens a new group in `kind`'s log and evicts the oldest groups over the limit.
///
/// Returns the new group number.
pub(crate) fn increment_group<C: HistoryConnection>(conn: &C, kind: HistoryKind) -> HistoryResult<i64> {
    conn.transaction(|tx| {
        let stats = log_store::read_stats(tx)?;
        let next = log_store::max_group(tx, kind)?.unwrap_or(0) + 1;
        log_store::write_counter(tx, kind, next)?;

        if stats.group_limit > 0 {
            evict_oldest(tx, kind, stats.group_limit)?;
        }
        Ok(next)
    })
}

/// Deletes the oldest groups until at most `limit` distinct groups remain.
fn evict_oldest<C: HistoryConnection>(conn: &C, kind: HistoryKind, limit: i64) -> HistoryResult<()> {
    let table = kind.table();
    let count = conn
        .get_i64(
            &format!("SELECT COUNT(DISTINCT \"history_group\") FROM {table};"),
            &[],
        )?
        .unwrap_or(0);
    if count <= limit {
        return Ok(());
    }

    let excess = count - limit;
    let removed = conn.run(
        &format!(
            "DELETE FROM {table} WHERE \"history_group\" IN \
             (SELECT DISTINCT \"history_group\" FROM {table} ORDER BY \"history_group\" ASC LIMIT ?);"
        ),
        &[SqlValue::Integer(excess)],
    )?;
    tracing::debug!("Evicted {excess} {kind} group(s) ({removed} entries) over limit {limit}");
    Ok(())
}

/// Opens a new undo group. Returns its number.
///
/// Only needed by code that manages groups by hand; the transaction wrapper
/// does this itself.
pub fn increment_undo_group<C: HistoryConnection>(conn: &C) -> HistoryResult<i64> {
    increment_group(conn, HistoryKind::Undo)
}

/// Resets both counters to one past the largest group in each log.
///
/// An empty log resets its counter to 1.
pub fn refresh_current_groups<C: HistoryConnection>(conn: &C) -> HistoryResult<()> {
    conn.transaction(|tx| {
        for kind in [HistoryKind::Undo, HistoryKind::Redo] {
            let next = log_store::max_group(tx, kind)?.unwrap_or(0) + 1;
            log_store::write_counter(tx, kind, next)?;
        }
        Ok::<_, HistoryError>(())
    })
}

/// Current undo group number from the stats row.
pub fn get_current_undo_group<C: HistoryConnection>(conn: &C) -> HistoryResult<i64> {
    Ok(log_store::read_stats(conn)?.cur_undo_group)
}

/// Current redo group number from the stats row.
pub fn get_current_redo_group<C: HistoryConnection>(conn: &C) -> HistoryResult<i64> {
    Ok(log_store::read_stats(conn)?.cur_redo_group)
}

/// Retags every undo entry with a group above `group` as `group`.
///
/// Merges sub-groups created inside a single logical operation. The counter
/// is not touched.
pub fn flatten_undo_groups_above<C: HistoryConnection>(conn: &C, group: i64) -> HistoryResult<usize> {
    let merged = conn.run(
        &format!(
            "UPDATE {UNDO_TABLE} SET \"history_group\"=? WHERE \"history_group\">?;"
        ),
        &[SqlValue::Integer(group), SqlValue::Integer(group)],
    )?;
    if merged > 0 {
        tracing::debug!("Flattened {merged} undo entries into group {group}");
    }
    Ok(merged)
}

/// Folds the newest undo group into the one before it.
///
/// Does nothing when the log holds fewer than two groups. The stats counter
/// is set to the surviving group.
pub fn decrement_last_undo_group<C: HistoryConnection>(conn: &C) -> HistoryResult<()> {
    conn.transaction(|tx| {
        let Some(last) = log_store::max_group(tx, HistoryKind::Undo)? else {
            return Ok(());
        };
        let previous = tx
            .get_i64(
                &format!(
                    "SELECT MAX(\"history_group\") FROM {UNDO_TABLE} WHERE \"history_group\"<?;"
                ),
                &[SqlValue::Integer(last)],
            )?
            .unwrap_or(0);
        if previous == 0 {
            return Ok(());
        }

        tx.run(
            &format!("UPDATE {UNDO_TABLE} SET \"history_group\"=? WHERE \"history_group\"=?;"),
            &[SqlValue::Integer(previous), SqlValue::Integer(last)],
        )?;
        tx.run(
            &format!("UPDATE {STATS_TABLE} SET \"cur_undo_group\"=?;"),
            &[SqlValue::Integer(previous)],
        )?;
        tracing::debug!("Merged undo group {last} into {previous}");
        Ok::<_, HistoryError>(())
    })
}
