/// Log store: the undo log, the redo log and the singleton stats row.
///
/// Both logs share one layout:
/// - `sequence`: `AUTOINCREMENT` rowid, strictly increasing within a log and
///   never handed out twice, even after the newest group is deleted
/// - `history_group`: logical operation the row belongs to
/// - `sql`: the statement that reverses the recorded mutation
use crate::config::DEFAULT_GROUP_LIMIT;
use crate::connection::{HistoryConnection, SqlValue};
use crate::error::{HistoryError, HistoryResult};

/// Undo log table name.
pub const UNDO_TABLE: &str = "history_undo";

/// Redo log table name.
pub const REDO_TABLE: &str = "history_redo";

/// Singleton stats table name.
pub const STATS_TABLE: &str = "history_stats";

/// Tables owned by the engine. None of them may ever carry history triggers.
pub const RESERVED_TABLES: [&str; 3] = [UNDO_TABLE, REDO_TABLE, STATS_TABLE];

/// Which of the two logs an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryKind {
    Undo,
    Redo,
}

impl HistoryKind {
    /// Name of the log table for this direction.
    pub fn table(self) -> &'static str {
        match self {
            Self::Undo => UNDO_TABLE,
            Self::Redo => REDO_TABLE,
        }
    }

    /// Column in `history_stats` holding this direction's current group.
    pub fn counter_column(self) -> &'static str {
        match self {
            Self::Undo => "cur_undo_group",
            Self::Redo => "cur_redo_group",
        }
    }

    /// The log a replay of this direction writes into.
    pub fn opposite(self) -> Self {
        match self {
            Self::Undo => Self::Redo,
            Self::Redo => Self::Undo,
        }
    }
}

impl std::fmt::Display for HistoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Undo => f.write_str("undo"),
            Self::Redo => f.write_str("redo"),
        }
    }
}

/// Snapshot of the `history_stats` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryStats {
    pub cur_undo_group: i64,
    pub cur_redo_group: i64,
    /// `<= 0` means unbounded retention.
    pub group_limit: i64,
}

/// One recorded inverse statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub sequence: i64,
    pub history_group: i64,
    pub sql: String,
}

/// Creates both log tables and the stats row if they do not exist yet.
///
/// Safe to call on every startup: existing history is left untouched.
pub fn create_history_tables<C: HistoryConnection>(conn: &C) -> HistoryResult<()> {
    let log_table = |name: &str| {
        format!(
            r#"CREATE TABLE IF NOT EXISTS {name} (
                "sequence" INTEGER PRIMARY KEY AUTOINCREMENT,
                "history_group" INTEGER NOT NULL,
                "sql" TEXT NOT NULL
            );"#
        )
    };

    conn.transaction(|tx| {
        tx.run_batch(&log_table(UNDO_TABLE))?;
        tx.run_batch(&log_table(REDO_TABLE))?;
        tx.run_batch(&format!(
            r#"CREATE TABLE IF NOT EXISTS {STATS_TABLE} (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                cur_undo_group INTEGER NOT NULL,
                cur_redo_group INTEGER NOT NULL,
                group_limit INTEGER NOT NULL
            );"#
        ))?;
        tx.run(
            &format!(
                "INSERT OR IGNORE INTO {STATS_TABLE} \
                 (id, cur_undo_group, cur_redo_group, group_limit) VALUES (1, 0, 0, ?);"
            ),
            &[SqlValue::Integer(DEFAULT_GROUP_LIMIT)],
        )?;
        Ok::<_, HistoryError>(())
    })?;

    tracing::debug!("History tables ready");
    Ok(())
}

/// Reads the stats row.
///
/// # Errors
///
/// Returns `MissingStats` if the row was never created.
pub fn read_stats<C: HistoryConnection>(conn: &C) -> HistoryResult<HistoryStats> {
    let row = conn
        .get(
            &format!("SELECT cur_undo_group, cur_redo_group, group_limit FROM {STATS_TABLE};"),
            &[],
        )?
        .ok_or(HistoryError::MissingStats)?;

    let int = |i: usize| match row.get(i) {
        Some(SqlValue::Integer(n)) => Ok(*n),
        _ => Err(HistoryError::MissingStats),
    };

    Ok(HistoryStats {
        cur_undo_group: int(0)?,
        cur_redo_group: int(1)?,
        group_limit: int(2)?,
    })
}

/// Writes one counter column of the stats row.
pub(crate) fn write_counter<C: HistoryConnection>(
    conn: &C,
    kind: HistoryKind,
    value: i64,
) -> HistoryResult<()> {
    let changed = conn.run(
        &format!(
            "UPDATE {STATS_TABLE} SET \"{}\"=?;",
            kind.counter_column()
        ),
        &[SqlValue::Integer(value)],
    )?;
    if changed == 0 {
        tracing::error!("Cannot write {kind} counter: stats row missing");
        return Err(HistoryError::MissingStats);
    }
    Ok(())
}

/// Largest group number present in a log, or `None` if the log is empty.
pub fn max_group<C: HistoryConnection>(conn: &C, kind: HistoryKind) -> HistoryResult<Option<i64>> {
    conn.get_i64(
        &format!("SELECT MAX(\"history_group\") FROM {};", kind.table()),
        &[],
    )
}

/// Distinct groups present in a log, oldest first.
pub fn distinct_groups<C: HistoryConnection>(conn: &C, kind: HistoryKind) -> HistoryResult<Vec<i64>> {
    Ok(conn
        .all(
            &format!(
                "SELECT DISTINCT \"history_group\" FROM {} ORDER BY \"history_group\";",
                kind.table()
            ),
            &[],
        )?
        .into_iter()
        .filter_map(|row| match row.first() {
            Some(SqlValue::Integer(n)) => Some(*n),
            _ => None,
        })
        .collect())
}

/// Every entry of one group, most recently recorded first.
pub fn group_entries<C: HistoryConnection>(
    conn: &C,
    kind: HistoryKind,
    group: i64,
) -> HistoryResult<Vec<LogEntry>> {
    let rows = conn.all(
        &format!(
            "SELECT \"sequence\", \"history_group\", \"sql\" FROM {} \
             WHERE \"history_group\"=? ORDER BY \"sequence\" DESC;",
            kind.table()
        ),
        &[SqlValue::Integer(group)],
    )?;

    Ok(rows
        .into_iter()
        .filter_map(|row| match row.as_slice() {
            [SqlValue::Integer(sequence), SqlValue::Integer(history_group), SqlValue::Text(sql)] => {
                Some(LogEntry {
                    sequence: *sequence,
                    history_group: *history_group,
                    sql: sql.clone(),
                })
            }
            _ => None,
        })
        .collect())
}

/// Deletes every entry of one group.
pub(crate) fn delete_group<C: HistoryConnection>(
    conn: &C,
    kind: HistoryKind,
    group: i64,
) -> HistoryResult<usize> {
    conn.run(
        &format!("DELETE FROM {} WHERE \"history_group\"=?;", kind.table()),
        &[SqlValue::Integer(group)],
    )
}

/// Sets the retention limit. Takes effect at the next group increment.
pub fn set_group_limit<C: HistoryConnection>(conn: &C, limit: i64) -> HistoryResult<()> {
    let changed = conn.run(
        &format!("UPDATE {STATS_TABLE} SET group_limit=?;"),
        &[SqlValue::Integer(limit)],
    )?;
    if changed == 0 {
        return Err(HistoryError::MissingStats);
    }
    tracing::debug!("History group limit set to {limit}");
    Ok(())
}

/// Current retention limit.
pub fn get_group_limit<C: HistoryConnection>(conn: &C) -> HistoryResult<i64> {
    Ok(read_stats(conn)?.group_limit)
}

/// Number of distinct groups on the undo log.
pub fn get_undo_stack_length<C: HistoryConnection>(conn: &C) -> HistoryResult<i64> {
    stack_length(conn, HistoryKind::Undo)
}

/// Number of distinct groups on the redo log.
pub fn get_redo_stack_length<C: HistoryConnection>(conn: &C) -> HistoryResult<i64> {
    stack_length(conn, HistoryKind::Redo)
}

fn stack_length<C: HistoryConnection>(conn: &C, kind: HistoryKind) -> HistoryResult<i64> {
    Ok(conn
        .get_i64(
            &format!(
                "SELECT COUNT(DISTINCT \"history_group\") FROM {};",
                kind.table()
            ),
            &[],
        )?
        .unwrap_or(0))
}

/// Deletes the most recent redo group.
///
/// Used when an operation had to be rolled back through an undo but the
/// rollback itself must not be offered as a redo.
pub fn clear_most_recent_redo<C: HistoryConnection>(conn: &C) -> HistoryResult<()> {
    if let Some(group) = max_group(conn, HistoryKind::Redo)? {
        let removed = delete_group(conn, HistoryKind::Redo, group)?;
        tracing::debug!("Cleared redo group {group} ({removed} entries)");
    }
    Ok(())
}

/// Estimated storage footprint of both logs in bytes.
///
/// Counts two bytes per character of recorded SQL; row overhead is ignored.
pub fn calculate_history_size<C: HistoryConnection>(conn: &C) -> HistoryResult<i64> {
    let chars = |table: &str| {
        conn.get_i64(
            &format!("SELECT COALESCE(SUM(LENGTH(\"sql\")), 0) FROM {table};"),
            &[],
        )
        .map(|n| n.unwrap_or(0))
    };
    Ok((chars(UNDO_TABLE)? + chars(REDO_TABLE)?) * 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        create_history_tables(&conn).expect("create tables");
        conn
    }

    fn push(conn: &Connection, kind: HistoryKind, group: i64, sql: &str) {
        conn.run(
            &format!(
                "INSERT INTO {} (\"history_group\", \"sql\") VALUES (?, ?);",
                kind.table()
            ),
            &[SqlValue::Integer(group), SqlValue::Text(sql.to_string())],
        )
        .expect("push");
    }

    #[test]
    fn test_create_history_tables_initial_stats() {
        let conn = open();
        let stats = read_stats(&conn).expect("stats");
        assert_eq!(
            stats,
            HistoryStats {
                cur_undo_group: 0,
                cur_redo_group: 0,
                group_limit: DEFAULT_GROUP_LIMIT,
            }
        );
    }

    #[test]
    fn test_create_history_tables_is_idempotent() {
        let conn = open();
        push(&conn, HistoryKind::Undo, 1, "SELECT 1");
        set_group_limit(&conn, 7).expect("limit");
        create_history_tables(&conn).expect("again");
        assert_eq!(get_undo_stack_length(&conn).expect("len"), 1);
        assert_eq!(get_group_limit(&conn).expect("limit"), 7);
    }

    #[test]
    fn test_read_stats_missing_row() {
        let conn = open();
        conn.run_batch("DELETE FROM history_stats;").expect("delete");
        assert!(matches!(read_stats(&conn), Err(HistoryError::MissingStats)));
        assert!(matches!(
            write_counter(&conn, HistoryKind::Undo, 3),
            Err(HistoryError::MissingStats)
        ));
    }

    #[test]
    fn test_stats_row_is_singleton() {
        let conn = open();
        let err = conn.run(
            "INSERT INTO history_stats (id, cur_undo_group, cur_redo_group, group_limit) VALUES (2, 0, 0, 0);",
            &[],
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_group_queries() {
        let conn = open();
        assert_eq!(max_group(&conn, HistoryKind::Undo).expect("max"), None);
        push(&conn, HistoryKind::Undo, 1, "a");
        push(&conn, HistoryKind::Undo, 1, "b");
        push(&conn, HistoryKind::Undo, 3, "c");
        push(&conn, HistoryKind::Redo, 2, "r");

        assert_eq!(max_group(&conn, HistoryKind::Undo).expect("max"), Some(3));
        assert_eq!(distinct_groups(&conn, HistoryKind::Undo).expect("groups"), vec![1, 3]);
        assert_eq!(get_undo_stack_length(&conn).expect("len"), 2);
        assert_eq!(get_redo_stack_length(&conn).expect("len"), 1);

        let entries = group_entries(&conn, HistoryKind::Undo, 1).expect("entries");
        let sql: Vec<&str> = entries.iter().map(|e| e.sql.as_str()).collect();
        assert_eq!(sql, vec!["b", "a"]);
        assert!(entries[0].sequence > entries[1].sequence);
    }

    fn max_sequence(conn: &Connection, kind: HistoryKind) -> Option<i64> {
        conn.get_i64(&format!("SELECT MAX(\"sequence\") FROM {};", kind.table()), &[])
            .expect("max sequence")
    }

    #[test]
    fn test_sequence_not_reused_after_group_delete() {
        let conn = open();
        push(&conn, HistoryKind::Undo, 1, "a");
        push(&conn, HistoryKind::Undo, 2, "b");
        let newest = max_sequence(&conn, HistoryKind::Undo).expect("seq");

        delete_group(&conn, HistoryKind::Undo, 2).expect("delete");
        push(&conn, HistoryKind::Undo, 2, "c");
        let entries = group_entries(&conn, HistoryKind::Undo, 2).expect("entries");
        assert!(entries[0].sequence > newest);
    }

    #[test]
    fn test_sequence_grows_across_undo_and_redo() {
        use crate::executor::{perform_redo, perform_undo};
        use crate::transaction::transaction_with_history;
        use crate::triggers::create_undo_triggers;

        let conn = open();
        conn.execute_batch("CREATE TABLE pages (id INTEGER PRIMARY KEY, notes TEXT);")
            .expect("schema");
        create_undo_triggers(&conn, "pages").expect("triggers");
        let result: HistoryResult<()> = transaction_with_history(&conn, "createPage", |tx| {
            tx.run("INSERT INTO pages (notes) VALUES ('a');", &[])?;
            Ok(())
        });
        result.expect("tx");
        let before = max_sequence(&conn, HistoryKind::Undo).expect("seq");

        assert!(perform_undo(&conn).success);
        assert!(perform_redo(&conn).success);
        let after = max_sequence(&conn, HistoryKind::Undo).expect("seq");
        assert!(after > before, "sequence reused: {before} -> {after}");
    }

    #[test]
    fn test_clear_most_recent_redo() {
        let conn = open();
        push(&conn, HistoryKind::Redo, 1, "old");
        push(&conn, HistoryKind::Redo, 2, "new");
        push(&conn, HistoryKind::Redo, 2, "new2");

        clear_most_recent_redo(&conn).expect("clear");
        assert_eq!(distinct_groups(&conn, HistoryKind::Redo).expect("groups"), vec![1]);

        clear_most_recent_redo(&conn).expect("clear");
        clear_most_recent_redo(&conn).expect("clear empty is fine");
        assert_eq!(get_redo_stack_length(&conn).expect("len"), 0);
    }

    #[test]
    fn test_calculate_history_size() {
        let conn = open();
        assert_eq!(calculate_history_size(&conn).expect("size"), 0);

        push(&conn, HistoryKind::Undo, 1, "12345");
        push(&conn, HistoryKind::Redo, 1, "abc");
        assert_eq!(calculate_history_size(&conn).expect("size"), 16);
        assert_eq!(calculate_history_size(&conn).expect("size"), 16);
    }

    #[test]
    fn test_kind_helpers() {
        assert_eq!(HistoryKind::Undo.opposite(), HistoryKind::Redo);
        assert_eq!(HistoryKind::Redo.table(), "history_redo");
        assert_eq!(HistoryKind::Undo.counter_column(), "cur_undo_group");
        assert_eq!(HistoryKind::Redo.to_string(), "redo");
    }
}
