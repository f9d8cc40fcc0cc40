/// Transactional undo/redo history for a SQLite show database.
///
/// Tracked tables carry triggers that record, for every row change, the SQL
/// statement that reverses it. Statements are bundled into numbered groups
/// (one per user-visible operation) on an undo log and a redo log; undoing
/// replays the newest group and records its inverse on the opposite log.
///
/// Typical use:
/// - call [`initialize_history`] once after opening the database,
/// - wrap every edit in [`transaction_with_history`],
/// - call [`perform_undo`] / [`perform_redo`] from the UI.
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod groups;
pub mod items;
pub mod log_store;
pub mod shared;
pub mod synth;
pub mod transaction;
pub mod triggers;

pub use config::{HistoryConfig, DEFAULT_GROUP_LIMIT, DEFAULT_TRACKED_TABLES};
pub use connection::{HistoryConnection, SqlValue};
pub use error::{HistoryError, HistoryResult};
pub use executor::{
    can_redo, can_undo, perform_redo, perform_undo, undo_and_discard, HistoryFailure,
    HistoryResponse,
};
pub use groups::{
    decrement_last_undo_group, flatten_undo_groups_above, get_current_redo_group,
    get_current_undo_group, increment_undo_group, refresh_current_groups,
};
pub use items::{
    create_items, delete_items, get_all_items, get_item, update_items, Fields, Grouping, ItemRow,
};
pub use log_store::{
    calculate_history_size, clear_most_recent_redo, create_history_tables, get_group_limit,
    get_redo_stack_length, get_undo_stack_length, read_stats, set_group_limit, HistoryKind,
    HistoryStats, LogEntry,
};
pub use shared::SharedHistory;
pub use transaction::transaction_with_history;
pub use triggers::{
    create_all_undo_triggers, create_undo_triggers, drop_all_undo_triggers, drop_undo_triggers,
    recover_trigger_modes, switch_trigger_mode, TriggerMode, TriggerRegistry,
};

/// Prepares a database for history tracking. Safe to call on every open.
///
/// Creates the log tables if needed, applies the configured group limit,
/// tracks every configured table that exists, and puts any table left in
/// replay mode by an interrupted undo or redo back into editing mode.
pub fn initialize_history<C: HistoryConnection>(
    conn: &C,
    config: &HistoryConfig,
) -> HistoryResult<()> {
    create_history_tables(conn)?;
    set_group_limit(conn, config.group_limit)?;
    if config.enforce_foreign_keys {
        conn.run_batch("PRAGMA foreign_keys = ON;")?;
    }
    let tracked = create_all_undo_triggers(conn, &config.tracked_tables)?;
    let recovered = recover_trigger_modes(conn)?;
    if !recovered.is_empty() {
        tracing::warn!("Recovered trigger mode on {recovered:?}");
    }
    tracing::info!(
        "History initialized: {} tracked table(s), group limit {}",
        tracked.len(),
        config.group_limit
    );
    Ok(())
}
