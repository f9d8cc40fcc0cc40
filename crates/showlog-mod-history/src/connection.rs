/// Minimal connection capability the history engine runs on.
///
/// The engine only ever needs four things from a store: execute a statement,
/// read one row, read all rows, and run a closure atomically. Any driver that
/// offers those can carry the history engine.
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

use crate::error::{HistoryError, HistoryResult};

/// A dynamically typed SQL value, as returned by `get` and `all`.
pub type SqlValue = Value;

/// Savepoint name used for every atomic unit opened by the engine.
///
/// Savepoints nest, so a history transaction can run inside a caller's own
/// transaction and still roll back independently.
const SAVEPOINT: &str = "showlog_tx";

/// Capability set the history engine needs from a database connection.
pub trait HistoryConnection {
    /// Executes one statement, returning the number of changed rows.
    fn run(&self, sql: &str, params: &[SqlValue]) -> HistoryResult<usize>;

    /// Executes several semicolon-separated statements without parameters.
    fn run_batch(&self, sql: &str) -> HistoryResult<()>;

    /// Returns the first row of a query, or `None` if it yields nothing.
    fn get(&self, sql: &str, params: &[SqlValue]) -> HistoryResult<Option<Vec<SqlValue>>>;

    /// Returns every row of a query.
    fn all(&self, sql: &str, params: &[SqlValue]) -> HistoryResult<Vec<Vec<SqlValue>>>;

    /// Runs `func` atomically. Any `Err` (or panic) rolls back everything `func` did.
    fn transaction<T, E, F>(&self, func: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<HistoryError>;

    /// Reads the first column of the first row as an integer.
    ///
    /// `NULL` and an empty result both come back as `None`.
    fn get_i64(&self, sql: &str, params: &[SqlValue]) -> HistoryResult<Option<i64>> {
        Ok(self
            .get(sql, params)?
            .and_then(|row| row.into_iter().next())
            .and_then(|value| match value {
                Value::Integer(n) => Some(n),
                Value::Real(f) => Some(f as i64),
                _ => None,
            }))
    }

    /// Reads the first column of every row as text, skipping non-text values.
    fn all_strings(&self, sql: &str, params: &[SqlValue]) -> HistoryResult<Vec<String>> {
        Ok(self
            .all(sql, params)?
            .into_iter()
            .filter_map(|row| match row.into_iter().next() {
                Some(Value::Text(s)) => Some(s),
                _ => None,
            })
            .collect())
    }
}

/// Rolls the savepoint back on drop unless it was released.
struct SavepointGuard<'a> {
    conn: &'a Connection,
    released: bool,
}

impl<'a> SavepointGuard<'a> {
    fn open(conn: &'a Connection) -> HistoryResult<Self> {
        conn.execute_batch(&format!("SAVEPOINT {SAVEPOINT};"))?;
        Ok(Self {
            conn,
            released: false,
        })
    }

    fn release(mut self) -> HistoryResult<()> {
        self.released = true;
        self.conn.execute_batch(&format!("RELEASE {SAVEPOINT};"))?;
        Ok(())
    }
}

impl Drop for SavepointGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let rollback = format!("ROLLBACK TO {SAVEPOINT}; RELEASE {SAVEPOINT};");
        if let Err(e) = self.conn.execute_batch(&rollback) {
            tracing::error!("Failed to roll back savepoint: {e}");
        }
    }
}

impl HistoryConnection for Connection {
    fn run(&self, sql: &str, params: &[SqlValue]) -> HistoryResult<usize> {
        Ok(self.execute(sql, params_from_iter(params.iter()))?)
    }

    fn run_batch(&self, sql: &str) -> HistoryResult<()> {
        Ok(self.execute_batch(sql)?)
    }

    fn get(&self, sql: &str, params: &[SqlValue]) -> HistoryResult<Option<Vec<SqlValue>>> {
        let mut stmt = self.prepare(sql)?;
        let width = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        match rows.next()? {
            Some(row) => {
                let values = (0..width)
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(values))
            }
            None => Ok(None),
        }
    }

    fn all(&self, sql: &str, params: &[SqlValue]) -> HistoryResult<Vec<Vec<SqlValue>>> {
        let mut stmt = self.prepare(sql)?;
        let width = stmt.column_count();
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            (0..width)
                .map(|i| row.get::<_, Value>(i))
                .collect::<Result<Vec<_>, _>>()
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn transaction<T, E, F>(&self, func: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<HistoryError>,
    {
        let guard = SavepointGuard::open(self)?;
        let value = func(self)?;
        guard.release()?;
        Ok(value)
    }
}
