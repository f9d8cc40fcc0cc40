/// Trigger registration and mode switching.
///
/// Trigger existence and mode live in SQLite's own catalog. `TriggerRegistry`
/// is an owned snapshot of that state: it is loaded once from `sqlite_master`,
/// planned against in memory, and written back through a connection. Planning
/// never touches the database.
use std::collections::{BTreeMap, BTreeSet};

use crate::connection::{HistoryConnection, SqlValue};
use crate::error::{HistoryError, HistoryResult};
use crate::log_store::{self, HistoryKind, REDO_TABLE, RESERVED_TABLES};
use crate::synth::{self, TableShape, TriggerKind};

/// Which log a table's triggers currently append to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerMode {
    /// Append to the undo log, optionally wiping the redo log on every write.
    Undo { clear_redo: bool },
    /// Append to the redo log.
    Redo,
}

impl TriggerMode {
    /// Normal editing mode: record undo history and invalidate redo.
    pub const EDITING: TriggerMode = TriggerMode::Undo { clear_redo: true };

    /// The log this mode writes into.
    pub fn log(self) -> HistoryKind {
        match self {
            Self::Undo { .. } => HistoryKind::Undo,
            Self::Redo => HistoryKind::Redo,
        }
    }

    fn clears_redo(self) -> bool {
        matches!(self, Self::Undo { clear_redo: true })
    }

    /// Infers the mode from the stored `CREATE TRIGGER` text of an insert trigger.
    fn from_trigger_sql(sql: &str) -> Self {
        if sql.contains(&format!("INSERT INTO {REDO_TABLE}")) {
            Self::Redo
        } else {
            Self::Undo {
                clear_redo: sql.contains(&format!("DELETE FROM {REDO_TABLE}")),
            }
        }
    }
}

/// Fails if `table` is one of the engine's own tables.
pub fn ensure_trackable_name(table: &str) -> HistoryResult<()> {
    if RESERVED_TABLES.contains(&table) {
        tracing::error!("Refusing to track history table {table}");
        return Err(HistoryError::ForbiddenTable(table.to_string()));
    }
    Ok(())
}

/// Reads the live column list and rowid layout of a table.
pub fn table_shape<C: HistoryConnection>(conn: &C, table: &str) -> HistoryResult<TableShape> {
    let ddl = conn
        .get(
            "SELECT sql FROM sqlite_master WHERE type='table' AND name=?;",
            &[SqlValue::Text(table.to_string())],
        )?
        .and_then(|row| row.into_iter().next());
    let ddl = match ddl {
        Some(SqlValue::Text(ddl)) => ddl,
        _ => return Err(HistoryError::UnknownTable(table.to_string())),
    };
    if ddl.to_ascii_uppercase().contains("WITHOUT ROWID") {
        return Err(HistoryError::UnsupportedTable {
            table: table.to_string(),
            reason: "WITHOUT ROWID tables have no implicit row identity",
        });
    }

    let rows = conn.all(
        "SELECT name, type, pk FROM pragma_table_info(?) ORDER BY cid;",
        &[SqlValue::Text(table.to_string())],
    )?;

    let mut columns = Vec::with_capacity(rows.len());
    let mut pk_columns = Vec::new();
    for row in rows {
        let [SqlValue::Text(name), decl, SqlValue::Integer(pk)] = row.as_slice() else {
            continue;
        };
        if *pk > 0 {
            let decl = match decl {
                SqlValue::Text(t) => t.to_ascii_uppercase(),
                _ => String::new(),
            };
            pk_columns.push(decl);
        }
        columns.push(name.clone());
    }

    if columns.is_empty() {
        return Err(HistoryError::UnknownTable(table.to_string()));
    }

    Ok(TableShape {
        name: table.to_string(),
        columns,
        rowid_aliased: pk_columns.len() == 1 && pk_columns[0] == "INTEGER",
    })
}

/// Owned view of which tables carry history triggers, and in which mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerRegistry {
    tables: BTreeMap<String, TriggerMode>,
}

impl TriggerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the current trigger state from `sqlite_master`.
    ///
    /// A table counts as tracked when its insert trigger exists; the mode is
    /// read from that trigger's body.
    pub fn from_catalog<C: HistoryConnection>(conn: &C) -> HistoryResult<Self> {
        let rows = conn.all(
            "SELECT name, tbl_name, sql FROM sqlite_master WHERE type='trigger';",
            &[],
        )?;

        let mut tables = BTreeMap::new();
        for row in rows {
            let [SqlValue::Text(name), SqlValue::Text(table), SqlValue::Text(sql)] = row.as_slice()
            else {
                continue;
            };
            if *name == TriggerKind::Insert.trigger_name(table) {
                tables.insert(table.clone(), TriggerMode::from_trigger_sql(sql));
            }
        }
        Ok(Self { tables })
    }

    /// Mode of a table, or `None` if it is not tracked.
    pub fn mode(&self, table: &str) -> Option<TriggerMode> {
        self.tables.get(table).copied()
    }

    /// Tracked tables in name order.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Tables a switch would recreate: the requested tables that are tracked,
    /// or every tracked table when no set is given.
    pub fn plan_switch(&self, tables: Option<&BTreeSet<String>>) -> Vec<String> {
        match tables {
            Some(requested) => requested
                .iter()
                .filter(|t| self.tables.contains_key(t.as_str()))
                .cloned()
                .collect(),
            None => self.tables.keys().cloned().collect(),
        }
    }

    /// Installs triggers for `table` in `mode`, replacing any existing ones.
    pub fn register<C: HistoryConnection>(
        &mut self,
        conn: &C,
        table: &str,
        mode: TriggerMode,
    ) -> HistoryResult<()> {
        ensure_trackable_name(table)?;
        let shape = table_shape(conn, table)?;
        log_store::read_stats(conn)?;

        conn.transaction(|tx| {
            for kind in TriggerKind::ALL {
                tx.run_batch(&synth::drop_trigger_sql(kind, table))?;
            }
            for kind in TriggerKind::ALL {
                tx.run_batch(&synth::create_trigger_sql(
                    kind,
                    &shape,
                    mode.log(),
                    mode.clears_redo(),
                ))?;
            }
            Ok::<_, HistoryError>(())
        })?;

        self.tables.insert(table.to_string(), mode);
        tracing::debug!("Registered history triggers on {table} ({mode:?})");
        Ok(())
    }

    /// Drops the triggers of `table`. Untracked tables are a no-op.
    pub fn unregister<C: HistoryConnection>(&mut self, conn: &C, table: &str) -> HistoryResult<()> {
        conn.transaction(|tx| {
            for kind in TriggerKind::ALL {
                tx.run_batch(&synth::drop_trigger_sql(kind, table))?;
            }
            Ok::<_, HistoryError>(())
        })?;
        self.tables.remove(table);
        Ok(())
    }

    /// Recreates the triggers of the planned tables in `mode`, atomically.
    ///
    /// Returns the tables that were switched.
    pub fn switch_mode<C: HistoryConnection>(
        &mut self,
        conn: &C,
        tables: Option<&BTreeSet<String>>,
        mode: TriggerMode,
    ) -> HistoryResult<Vec<String>> {
        let planned = self.plan_switch(tables);
        if planned.is_empty() {
            return Ok(planned);
        }

        let mut staged = self.clone();
        conn.transaction(|tx| {
            for table in &planned {
                staged.register(tx, table, mode)?;
            }
            Ok::<_, HistoryError>(())
        })?;
        *self = staged;

        tracing::debug!("Switched {} table(s) to {mode:?}", planned.len());
        Ok(planned)
    }
}

/// Tracks `table` in normal editing mode.
pub fn create_undo_triggers<C: HistoryConnection>(conn: &C, table: &str) -> HistoryResult<()> {
    TriggerRegistry::new().register(conn, table, TriggerMode::EDITING)
}

/// Stops tracking `table`. Safe to call on untracked tables.
pub fn drop_undo_triggers<C: HistoryConnection>(conn: &C, table: &str) -> HistoryResult<()> {
    TriggerRegistry::new().unregister(conn, table)
}

/// Switches the triggers of `tables` (or every tracked table) to `mode`.
pub fn switch_trigger_mode<C: HistoryConnection>(
    conn: &C,
    mode: TriggerMode,
    tables: Option<&BTreeSet<String>>,
) -> HistoryResult<Vec<String>> {
    TriggerRegistry::from_catalog(conn)?.switch_mode(conn, tables, mode)
}

/// Tracks every table of `tables` that exists, in one transaction.
///
/// Missing tables are skipped with a warning; reserved or unsupported tables
/// still fail the whole call. Returns the tables now tracked.
pub fn create_all_undo_triggers<C, S>(conn: &C, tables: &[S]) -> HistoryResult<Vec<String>>
where
    C: HistoryConnection,
    S: AsRef<str>,
{
    let mut registry = TriggerRegistry::from_catalog(conn)?;
    let mut tracked = Vec::new();
    conn.transaction(|tx| {
        for table in tables.iter().map(AsRef::as_ref) {
            match registry.register(tx, table, TriggerMode::EDITING) {
                Ok(()) => tracked.push(table.to_string()),
                Err(HistoryError::UnknownTable(name)) => {
                    tracing::warn!("Not tracking {name}: table does not exist");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    })?;
    tracing::info!("History tracking enabled on {} table(s)", tracked.len());
    Ok(tracked)
}

/// Drops the history triggers of every tracked table.
pub fn drop_all_undo_triggers<C: HistoryConnection>(conn: &C) -> HistoryResult<Vec<String>> {
    let mut registry = TriggerRegistry::from_catalog(conn)?;
    let tables: Vec<String> = registry.tables().map(str::to_string).collect();
    conn.transaction(|tx| {
        for table in &tables {
            registry.unregister(tx, table)?;
        }
        Ok::<_, HistoryError>(())
    })?;
    Ok(tables)
}

/// Forces every tracked table back into normal editing mode.
///
/// An interrupted undo/redo may leave some tables producing redo history.
/// Running this at startup restores the single-mode invariant.
pub fn recover_trigger_modes<C: HistoryConnection>(conn: &C) -> HistoryResult<Vec<String>> {
    let mut registry = TriggerRegistry::from_catalog(conn)?;
    let stale: BTreeSet<String> = registry
        .tables()
        .filter(|t| registry.mode(t) != Some(TriggerMode::EDITING))
        .map(str::to_string)
        .collect();
    if stale.is_empty() {
        return Ok(Vec::new());
    }
    tracing::warn!("Recovering {} table(s) left outside editing mode", stale.len());
    registry.switch_mode(conn, Some(&stale), TriggerMode::EDITING)
}
