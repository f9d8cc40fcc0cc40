/// Async handle that serializes history work on one connection.
///
/// Undo, redo and history transactions all switch triggers and move group
/// counters, so at most one of them may run at a time. `SharedHistory` owns
/// the connection behind an async mutex and runs each unit of work on the
/// blocking pool while holding it.
use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::config::HistoryConfig;
use crate::connection::HistoryConnection;
use crate::error::{HistoryError, HistoryResult};
use crate::executor::{self, HistoryResponse};
use crate::transaction;

/// Cloneable, serialized access to a history-tracked database.
#[derive(Clone)]
pub struct SharedHistory {
    conn: Arc<Mutex<Connection>>,
}

impl SharedHistory {
    /// Wraps an already initialized connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Opens `path` and prepares history tracking on it.
    pub fn open(path: &Path, config: &HistoryConfig) -> HistoryResult<Self> {
        let conn = Connection::open(path)?;
        crate::initialize_history(&conn, config)?;
        Ok(Self::new(conn))
    }

    /// Runs `func` on the blocking pool with exclusive use of the connection.
    pub async fn with_connection<T, E, F>(&self, func: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<HistoryError> + Send + 'static,
    {
        let guard = Arc::clone(&self.conn).lock_owned().await;
        tokio::task::spawn_blocking(move || func(&guard))
            .await
            .map_err(|e| {
                tracing::error!("History task panicked: {e}");
                E::from(HistoryError::Task(e.to_string()))
            })?
    }

    /// Atomic work on untracked tables. Nothing is added to the undo log.
    pub async fn with_exclusive<T, E, F>(&self, func: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<HistoryError> + Send + 'static,
    {
        self.with_connection(move |conn| conn.transaction(func)).await
    }

    /// Async [`transaction::transaction_with_history`].
    pub async fn transaction_with_history<T, E, F>(&self, label: &str, func: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<HistoryError> + Send + 'static,
    {
        let label = label.to_string();
        self.with_connection(move |conn| transaction::transaction_with_history(conn, &label, func))
            .await
    }

    /// Async [`executor::perform_undo`].
    pub async fn perform_undo(&self) -> HistoryResult<HistoryResponse> {
        self.with_connection(|conn| Ok(executor::perform_undo(conn)))
            .await
    }

    /// Async [`executor::perform_redo`].
    pub async fn perform_redo(&self) -> HistoryResult<HistoryResponse> {
        self.with_connection(|conn| Ok(executor::perform_redo(conn)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_store;

    async fn shared() -> SharedHistory {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE marchers (id INTEGER PRIMARY KEY, name TEXT);")
            .expect("schema");
        let config = HistoryConfig {
            tracked_tables: vec!["marchers".to_string()],
            ..HistoryConfig::default()
        };
        crate::initialize_history(&conn, &config).expect("init");
        SharedHistory::new(conn)
    }

    fn count(conn: &Connection) -> HistoryResult<i64> {
        Ok(conn.get_i64("SELECT COUNT(*) FROM marchers;", &[])?.unwrap_or(0))
    }

    #[tokio::test]
    async fn test_concurrent_transactions_are_serialized() {
        let history = shared().await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let history = history.clone();
            handles.push(tokio::spawn(async move {
                history
                    .transaction_with_history("createMarcher", move |conn| {
                        conn.run(
                            "INSERT INTO marchers (name) VALUES (?);",
                            &[format!("m{i}").into()],
                        )?;
                        Ok::<_, HistoryError>(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("transaction");
        }

        let groups = history
            .with_connection(|conn| log_store::get_undo_stack_length(conn))
            .await
            .expect("len");
        assert_eq!(groups, 8);
    }

    #[tokio::test]
    async fn test_undo_redo_through_handle() {
        let history = shared().await;
        history
            .transaction_with_history("createMarcher", |conn| {
                conn.run("INSERT INTO marchers (name) VALUES ('jeff');", &[])?;
                Ok::<_, HistoryError>(())
            })
            .await
            .expect("create");

        let undo = history.perform_undo().await.expect("undo");
        assert!(undo.success);
        assert_eq!(history.with_connection(count).await.expect("count"), 0);

        let redo = history.perform_redo().await.expect("redo");
        assert!(redo.success);
        assert_eq!(history.with_connection(count).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn test_with_exclusive_does_not_record() {
        let history = shared().await;
        history
            .with_connection(|conn| conn.run_batch("CREATE TABLE cache (v TEXT);"))
            .await
            .expect("cache");
        history
            .with_exclusive(|conn| conn.run("INSERT INTO cache (v) VALUES ('x');", &[]))
            .await
            .expect("insert");

        let groups = history
            .with_connection(|conn| log_store::get_undo_stack_length(conn))
            .await
            .expect("len");
        assert_eq!(groups, 0);
    }

    #[tokio::test]
    async fn test_panic_becomes_task_error() {
        let history = shared().await;
        let result: HistoryResult<()> = history
            .with_connection(|_| -> HistoryResult<()> { panic!("boom") })
            .await;
        assert!(matches!(result, Err(HistoryError::Task(_))));

        // the lock is released and the connection still usable
        assert_eq!(history.with_connection(count).await.expect("count"), 0);
    }
}
