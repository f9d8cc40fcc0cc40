/// Generic row helpers for tracked tables.
///
/// Every mutation here runs through the history wrapper, so each call is one
/// undoable operation (or is folded into the previous one, see [`Grouping`]).
/// Rows are addressed by `rowid`.
use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};

use crate::connection::{HistoryConnection, SqlValue};
use crate::error::{HistoryError, HistoryResult};
use crate::groups::decrement_last_undo_group;
use crate::synth::quote_ident;
use crate::transaction::transaction_with_history;
use crate::triggers::table_shape;

/// Column/value pairs for one row write.
pub type Fields = Vec<(String, SqlValue)>;

/// One row read back from a table.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRow {
    pub rowid: i64,
    pub fields: BTreeMap<String, SqlValue>,
}

impl ItemRow {
    /// Value of one column, if the table has it.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.fields.get(column)
    }
}

/// How a mutation is placed on the undo log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Grouping {
    /// The write is its own undo step.
    #[default]
    NewGroup,
    /// The write is undone together with the operation before it.
    MergeWithPrevious,
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn select_sql(table: &str, columns: &[String]) -> String {
    let list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT rowid, {list} FROM {}", quote_ident(table))
}

fn to_item(columns: &[String], row: Vec<SqlValue>) -> Option<ItemRow> {
    let mut values = row.into_iter();
    let rowid = match values.next()? {
        SqlValue::Integer(n) => n,
        _ => return None,
    };
    Some(ItemRow {
        rowid,
        fields: columns.iter().cloned().zip(values).collect(),
    })
}

/// Reads one row by rowid.
///
/// # Errors
///
/// `NoItem` if the row does not exist.
pub fn get_item<C: HistoryConnection>(conn: &C, table: &str, id: i64) -> HistoryResult<ItemRow> {
    let shape = table_shape(conn, table)?;
    conn.get(
        &format!("{} WHERE rowid=?;", select_sql(table, &shape.columns)),
        &[SqlValue::Integer(id)],
    )?
    .and_then(|row| to_item(&shape.columns, row))
    .ok_or_else(|| HistoryError::NoItem {
        id_column: "rowid",
        id,
        table: table.to_string(),
    })
}

/// Reads every row of a table in rowid order.
pub fn get_all_items<C: HistoryConnection>(conn: &C, table: &str) -> HistoryResult<Vec<ItemRow>> {
    let shape = table_shape(conn, table)?;
    Ok(conn
        .all(
            &format!("{} ORDER BY rowid;", select_sql(table, &shape.columns)),
            &[],
        )?
        .into_iter()
        .filter_map(|row| to_item(&shape.columns, row))
        .collect())
}

/// Runs `func` as one wrapped operation, then folds it into the previous
/// group if asked. Both steps commit or roll back together.
fn with_grouping<C, T, F>(conn: &C, label: &str, grouping: Grouping, func: F) -> HistoryResult<T>
where
    C: HistoryConnection,
    F: FnOnce(&C) -> HistoryResult<T>,
{
    conn.transaction(|tx| {
        let value = transaction_with_history(tx, label, func)?;
        if grouping == Grouping::MergeWithPrevious {
            decrement_last_undo_group(tx)?;
        }
        Ok(value)
    })
}

fn ensure_exist<C: HistoryConnection>(conn: &C, table: &str, ids: &[i64]) -> HistoryResult<()> {
    for &id in ids {
        let found = conn.get(
            &format!("SELECT 1 FROM {} WHERE rowid=?;", quote_ident(table)),
            &[SqlValue::Integer(id)],
        )?;
        if found.is_none() {
            return Err(HistoryError::NoItem {
                id_column: "rowid",
                id,
                table: table.to_string(),
            });
        }
    }
    Ok(())
}

/// Inserts rows and returns them as stored.
///
/// `created_at` and `updated_at` are stamped when the table has them and the
/// caller did not provide a value. A caller-provided `id` is ignored.
pub fn create_items<C: HistoryConnection>(
    conn: &C,
    table: &str,
    items: &[Fields],
    grouping: Grouping,
) -> HistoryResult<Vec<ItemRow>> {
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let shape = table_shape(conn, table)?;
    let has = |column: &str| shape.columns.iter().any(|c| c == column);

    let label = format!("create {table}");
    let created = with_grouping(conn, &label, grouping, |tx| {
        let now = timestamp();
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let mut fields: Fields = item.iter().filter(|(k, _)| k != "id").cloned().collect();
            for stamp in ["created_at", "updated_at"] {
                if has(stamp) && !fields.iter().any(|(k, _)| k == stamp) {
                    fields.push((stamp.to_string(), SqlValue::Text(now.clone())));
                }
            }

            let sql = if fields.is_empty() {
                format!("INSERT INTO {} DEFAULT VALUES;", quote_ident(table))
            } else {
                let names = fields.iter().map(|(k, _)| quote_ident(k)).collect::<Vec<_>>();
                let marks = vec!["?"; fields.len()];
                format!(
                    "INSERT INTO {} ({}) VALUES ({});",
                    quote_ident(table),
                    names.join(", "),
                    marks.join(", ")
                )
            };
            let values: Vec<SqlValue> = fields.into_iter().map(|(_, v)| v).collect();
            tx.run(&sql, &values)?;
            ids.push(last_insert_rowid(tx)?);
        }
        ids.iter()
            .map(|&id| get_item(tx, table, id))
            .collect::<HistoryResult<Vec<_>>>()
    })?;

    tracing::debug!("Created {} row(s) in {table}", created.len());
    Ok(created)
}

fn last_insert_rowid<C: HistoryConnection>(conn: &C) -> HistoryResult<i64> {
    Ok(conn.get_i64("SELECT last_insert_rowid();", &[])?.unwrap_or(0))
}

/// Updates rows by rowid and returns them as stored.
///
/// Each entry must carry an `id` field naming the row. Every id is checked
/// before anything is written. `updated_at` is stamped when the table has it
/// and the caller did not provide a value.
pub fn update_items<C: HistoryConnection>(
    conn: &C,
    table: &str,
    items: &[Fields],
    grouping: Grouping,
) -> HistoryResult<Vec<ItemRow>> {
    let targets: Vec<(i64, Fields)> = items
        .iter()
        .filter_map(|item| {
            let id = item.iter().find_map(|(k, v)| match (k.as_str(), v) {
                ("id", SqlValue::Integer(id)) => Some(*id),
                _ => None,
            });
            if id.is_none() {
                tracing::warn!("No id provided for update in {table}, skipping item");
            }
            let rest = item.iter().filter(|(k, _)| k != "id").cloned().collect();
            id.map(|id| (id, rest))
        })
        .collect();
    if targets.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<i64> = targets.iter().map(|(id, _)| *id).collect();
    ensure_exist(conn, table, &ids)?;
    let shape = table_shape(conn, table)?;
    let stamps_updated = shape.columns.iter().any(|c| c == "updated_at");

    let label = format!("update {table}");
    let updated = with_grouping(conn, &label, grouping, |tx| {
        let now = timestamp();
        for (id, fields) in &targets {
            let mut fields = fields.clone();
            if stamps_updated && !fields.iter().any(|(k, _)| k == "updated_at") {
                fields.push(("updated_at".to_string(), SqlValue::Text(now.clone())));
            }
            if fields.is_empty() {
                continue;
            }
            let set = fields
                .iter()
                .map(|(k, _)| format!("{}=?", quote_ident(k)))
                .collect::<Vec<_>>()
                .join(", ");
            let mut values: Vec<SqlValue> = fields.into_iter().map(|(_, v)| v).collect();
            values.push(SqlValue::Integer(*id));
            tx.run(
                &format!("UPDATE {} SET {set} WHERE rowid=?;", quote_ident(table)),
                &values,
            )?;
        }
        ids.iter()
            .map(|&id| get_item(tx, table, id))
            .collect::<HistoryResult<Vec<_>>>()
    })?;

    tracing::debug!("Updated {} row(s) in {table}", updated.len());
    Ok(updated)
}

/// Deletes rows by rowid and returns them as they were.
///
/// Every id is checked before anything is deleted.
pub fn delete_items<C: HistoryConnection>(
    conn: &C,
    table: &str,
    ids: &[i64],
    grouping: Grouping,
) -> HistoryResult<Vec<ItemRow>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    ensure_exist(conn, table, ids)?;

    let label = format!("delete {table}");
    let deleted = with_grouping(conn, &label, grouping, |tx| {
        let mut deleted = Vec::with_capacity(ids.len());
        for &id in ids {
            let item = match get_item(tx, table, id) {
                Ok(item) => item,
                // duplicate ids are already gone
                Err(HistoryError::NoItem { .. }) => continue,
                Err(e) => return Err(e),
            };
            tx.run(
                &format!("DELETE FROM {} WHERE rowid=?;", quote_ident(table)),
                &[SqlValue::Integer(id)],
            )?;
            deleted.push(item);
        }
        Ok::<_, HistoryError>(deleted)
    })?;

    tracing::debug!("Deleted {} row(s) from {table}", deleted.len());
    Ok(deleted)
}
