/// Undo/redo replay.
///
/// Replaying a group runs its recorded statements newest-first. While they
/// run, the affected tables' triggers are pointed at the opposite log, so the
/// replay records its own inverse and the operation can be flipped back.
use std::collections::BTreeSet;
use std::error::Error as _;

use crate::connection::HistoryConnection;
use crate::error::{HistoryError, HistoryResult};
use crate::groups::{increment_group, refresh_current_groups};
use crate::log_store::{self, HistoryKind};
use crate::synth::first_quoted_identifier;
use crate::triggers::{TriggerMode, TriggerRegistry};

/// Details of a failed replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryFailure {
    pub message: String,
    /// The error's source chain, outermost first.
    pub stack: Vec<String>,
    /// Statements that ran before the failure. All of them were rolled back.
    pub executed: Vec<String>,
}

/// Outcome of [`perform_undo`] / [`perform_redo`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryResponse {
    pub success: bool,
    /// Tables touched by the replayed group.
    pub table_names: BTreeSet<String>,
    /// Statements executed, in execution order.
    pub sql_statements: Vec<String>,
    pub error: Option<HistoryFailure>,
}

/// Undoes the newest undo group. The undone statements' inverses become the newest redo group.
pub fn perform_undo<C: HistoryConnection>(conn: &C) -> HistoryResponse {
    replay(conn, HistoryKind::Undo)
}

/// Redoes the newest redo group. Its inverses go back onto the undo log.
pub fn perform_redo<C: HistoryConnection>(conn: &C) -> HistoryResponse {
    replay(conn, HistoryKind::Redo)
}

fn replay<C: HistoryConnection>(conn: &C, kind: HistoryKind) -> HistoryResponse {
    let mut response = HistoryResponse::default();
    let mut executed = Vec::new();

    match try_replay(conn, kind, &mut response.table_names, &mut executed) {
        Ok(()) => {
            response.success = true;
            response.sql_statements = executed;
            if response.sql_statements.is_empty() {
                tracing::debug!("Nothing to {kind}");
            } else {
                tracing::info!(
                    "Performed {kind} of {} statement(s) on {:?}",
                    response.sql_statements.len(),
                    response.table_names
                );
            }
        }
        Err(e) => {
            tracing::error!("Failed to {kind}: {e}");
            let mut stack = Vec::new();
            let mut source = e.source();
            while let Some(cause) = source {
                stack.push(cause.to_string());
                source = cause.source();
            }
            response.error = Some(HistoryFailure {
                message: e.to_string(),
                stack,
                executed,
            });
        }
    }
    response
}

fn try_replay<C: HistoryConnection>(
    conn: &C,
    kind: HistoryKind,
    tables: &mut BTreeSet<String>,
    executed: &mut Vec<String>,
) -> HistoryResult<()> {
    let Some(group) = log_store::max_group(conn, kind)? else {
        refresh_current_groups(conn)?;
        return Ok(());
    };

    let entries = log_store::group_entries(conn, kind, group)?;
    tables.extend(entries.iter().filter_map(|e| first_quoted_identifier(&e.sql)));
    let tables: &BTreeSet<String> = tables;

    // PRAGMA foreign_keys cannot change inside a transaction.
    let enforced = foreign_keys_enabled(conn)?;
    if enforced {
        conn.run_batch("PRAGMA foreign_keys = OFF;")?;
    }

    let result = conn.transaction(|tx| {
        let mut registry = TriggerRegistry::from_catalog(tx)?;
        match kind {
            HistoryKind::Undo => {
                increment_group(tx, HistoryKind::Redo)?;
                registry.switch_mode(tx, Some(tables), TriggerMode::Redo)?;
            }
            HistoryKind::Redo => {
                registry.switch_mode(tx, Some(tables), TriggerMode::Undo { clear_redo: false })?;
            }
        }

        for entry in &entries {
            tx.run_batch(&entry.sql)?;
            executed.push(entry.sql.clone());
        }

        log_store::delete_group(tx, kind, group)?;
        refresh_current_groups(tx)?;
        registry.switch_mode(tx, Some(tables), TriggerMode::EDITING)?;
        Ok::<_, HistoryError>(())
    });

    if enforced {
        if let Err(e) = conn.run_batch("PRAGMA foreign_keys = ON;") {
            tracing::error!("Failed to re-enable foreign keys: {e}");
            result?;
            return Err(e);
        }
    }
    result
}

fn foreign_keys_enabled<C: HistoryConnection>(conn: &C) -> HistoryResult<bool> {
    Ok(conn.get_i64("PRAGMA foreign_keys;", &[])?.unwrap_or(0) != 0)
}

/// Whether there is anything to undo.
pub fn can_undo<C: HistoryConnection>(conn: &C) -> HistoryResult<bool> {
    Ok(log_store::max_group(conn, HistoryKind::Undo)?.is_some())
}

/// Whether there is anything to redo.
pub fn can_redo<C: HistoryConnection>(conn: &C) -> HistoryResult<bool> {
    Ok(log_store::max_group(conn, HistoryKind::Redo)?.is_some())
}

/// Undoes the newest group without making it redoable.
///
/// For rolling back an operation that was committed and then found invalid.
pub fn undo_and_discard<C: HistoryConnection>(conn: &C) -> HistoryResponse {
    let response = perform_undo(conn);
    if response.success && !response.sql_statements.is_empty() {
        if let Err(e) = log_store::clear_most_recent_redo(conn) {
            tracing::error!("Failed to discard redo after rollback: {e}");
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::transaction_with_history;
    use crate::triggers::create_all_undo_triggers;
    use rusqlite::Connection;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE pages (id INTEGER PRIMARY KEY, notes TEXT);
             CREATE TABLE beats (id INTEGER PRIMARY KEY, page_id INTEGER REFERENCES pages(id));",
        )
        .expect("schema");
        log_store::create_history_tables(&conn).expect("tables");
        create_all_undo_triggers(&conn, &["pages", "beats"]).expect("triggers");
        conn
    }

    fn notes(conn: &Connection) -> Vec<String> {
        conn.all_strings("SELECT notes FROM pages ORDER BY id;", &[])
            .expect("notes")
    }

    fn edit(conn: &Connection, label: &str, sql: &str) {
        let result: HistoryResult<()> = transaction_with_history(conn, label, |tx| {
            tx.run_batch(sql)?;
            Ok(())
        });
        result.expect("edit");
    }

    #[test]
    fn test_undo_on_empty_log_is_success() {
        let conn = open();
        let response = perform_undo(&conn);
        assert!(response.success);
        assert!(response.sql_statements.is_empty());
        assert!(response.table_names.is_empty());
        assert!(response.error.is_none());
        assert!(perform_redo(&conn).success);
    }

    #[test]
    fn test_undo_then_redo() {
        let conn = open();
        edit(&conn, "create", "INSERT INTO pages (notes) VALUES ('a');");
        edit(&conn, "rename", "UPDATE pages SET notes = 'b' WHERE id = 1;");
        assert_eq!(notes(&conn), vec!["b"]);

        let undo = perform_undo(&conn);
        assert!(undo.success);
        assert_eq!(undo.table_names, BTreeSet::from(["pages".to_string()]));
        assert_eq!(undo.sql_statements.len(), 1);
        assert_eq!(notes(&conn), vec!["a"]);
        assert!(can_redo(&conn).expect("can redo"));

        let redo = perform_redo(&conn);
        assert!(redo.success);
        assert_eq!(notes(&conn), vec!["b"]);
        assert!(!can_redo(&conn).expect("can redo"));
        assert_eq!(log_store::get_undo_stack_length(&conn).expect("len"), 2);
    }

    #[test]
    fn test_group_replays_newest_first() {
        let conn = open();
        edit(
            &conn,
            "build",
            "INSERT INTO pages (notes) VALUES ('p');
             INSERT INTO beats (page_id) VALUES (1);",
        );
        let undo = perform_undo(&conn);
        assert!(undo.success);
        assert!(undo.sql_statements[0].starts_with("DELETE FROM \"beats\""));
        assert_eq!(undo.table_names.len(), 2);
        assert!(notes(&conn).is_empty());

        assert!(perform_redo(&conn).success);
        let beats = conn.get_i64("SELECT page_id FROM beats;", &[]).expect("beat");
        assert_eq!(beats, Some(1));
    }

    #[test]
    fn test_replay_restores_foreign_keys() {
        let conn = open();
        edit(&conn, "create", "INSERT INTO pages (notes) VALUES ('a');");
        perform_undo(&conn);
        assert!(foreign_keys_enabled(&conn).expect("fk"));

        conn.execute_batch("PRAGMA foreign_keys = OFF;").expect("off");
        perform_redo(&conn);
        assert!(!foreign_keys_enabled(&conn).expect("fk"));
    }

    #[test]
    fn test_failed_replay_rolls_back() {
        let conn = open();
        edit(&conn, "create", "INSERT INTO pages (notes) VALUES ('a');");
        conn.execute(
            "INSERT INTO history_undo (history_group, sql) VALUES (1, 'UPDATE \"missing\" SET x=1');",
            [],
        )
        .expect("poison");

        let response = perform_undo(&conn);
        assert!(!response.success);
        let failure = response.error.expect("failure");
        assert!(failure.message.contains("missing"));
        assert!(failure.executed.is_empty());
        assert_eq!(notes(&conn), vec!["a"]);
        assert_eq!(log_store::get_undo_stack_length(&conn).expect("len"), 1);
        assert_eq!(log_store::get_redo_stack_length(&conn).expect("len"), 0);

        let registry = TriggerRegistry::from_catalog(&conn).expect("registry");
        assert_eq!(registry.mode("pages"), Some(TriggerMode::EDITING));
    }

    #[test]
    fn test_undo_and_discard() {
        let conn = open();
        edit(&conn, "create", "INSERT INTO pages (notes) VALUES ('a');");
        let response = undo_and_discard(&conn);
        assert!(response.success);
        assert!(notes(&conn).is_empty());
        assert!(!can_redo(&conn).expect("can redo"));
    }
}
