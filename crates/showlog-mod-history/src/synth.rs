/// Statement synthesizer: builds the trigger bodies that record inverse SQL.
///
/// Inverse statements are produced inside SQLite at trigger time. This module
/// only builds the SQL *expressions* that evaluate to those statements, so
/// values are always escaped by SQLite's own `quote()` and never pass through
/// Rust string formatting. The produced text is the on-disk log format:
///
/// ```text
/// DELETE FROM "pages" WHERE rowid=4
/// UPDATE "pages" SET "id"=4,"notes"='intro' WHERE rowid=4
/// INSERT INTO "pages" ("id","notes") VALUES (4,'intro')
/// ```
use std::sync::LazyLock;

use regex::Regex;

use crate::log_store::{HistoryKind, REDO_TABLE, STATS_TABLE};

/// Matches a double-quoted identifier, allowing `""` escapes inside.
static QUOTED_IDENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""((?:[^"]|"")*)""#).unwrap_or_else(|e| panic!("invalid identifier regex: {e}"))
});

/// The three row events a tracked table reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    Insert,
    Update,
    Delete,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 3] = [Self::Insert, Self::Update, Self::Delete];

    /// Suffix appended to the table name to form the trigger name.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Insert => "_it",
            Self::Update => "_ut",
            Self::Delete => "_dt",
        }
    }

    /// Trigger name for `table`, e.g. `pages_ut`.
    pub fn trigger_name(self, table: &str) -> String {
        format!("{table}{}", self.suffix())
    }

    /// Timing and event clause. Deletes fire before so `old` is still readable.
    fn timing(self) -> &'static str {
        match self {
            Self::Insert => "AFTER INSERT",
            Self::Update => "AFTER UPDATE",
            Self::Delete => "BEFORE DELETE",
        }
    }
}

/// Columns of a tracked table plus how its rows are identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableShape {
    pub name: String,
    pub columns: Vec<String>,
    /// Whether an `INTEGER PRIMARY KEY` column aliases the rowid.
    ///
    /// When it does not, re-inserts must carry `rowid` explicitly or the
    /// restored row would get a fresh identity.
    pub rowid_aliased: bool,
}

/// Quotes an SQL identifier, doubling embedded double quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes text as an SQL string literal, doubling embedded single quotes.
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Extracts the first double-quoted identifier of a statement, unescaped.
///
/// For recorded statements this is always the table the statement targets.
pub fn first_quoted_identifier(sql: &str) -> Option<String> {
    QUOTED_IDENT
        .captures(sql)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().replace("\"\"", "\""))
}

/// Concatenation of literal text and SQL expressions with `||`.
#[derive(Default)]
struct Concat {
    parts: Vec<String>,
    pending: String,
}

impl Concat {
    fn text(mut self, text: &str) -> Self {
        self.pending.push_str(text);
        self
    }

    fn expr(mut self, expr: String) -> Self {
        if !self.pending.is_empty() {
            self.parts.push(quote_literal(&std::mem::take(&mut self.pending)));
        }
        self.parts.push(expr);
        self
    }

    fn build(mut self) -> String {
        if !self.pending.is_empty() {
            self.parts.push(quote_literal(&std::mem::take(&mut self.pending)));
        }
        self.parts.join("||")
    }
}

/// Expression evaluating to the statement that reverses one row event.
pub fn inverse_expression(kind: TriggerKind, shape: &TableShape) -> String {
    let table = quote_ident(&shape.name);
    match kind {
        TriggerKind::Insert => Concat::default()
            .text(&format!("DELETE FROM {table} WHERE rowid="))
            .expr("new.rowid".to_string())
            .build(),
        TriggerKind::Update => {
            let mut concat = Concat::default().text(&format!("UPDATE {table} SET "));
            for (i, column) in shape.columns.iter().enumerate() {
                if i > 0 {
                    concat = concat.text(",");
                }
                let ident = quote_ident(column);
                concat = concat
                    .text(&format!("{ident}="))
                    .expr(format!("quote(old.{ident})"));
            }
            // The row is located by its current identity, which differs from
            // the old one only when the update rewrote the primary key.
            concat.text(" WHERE rowid=").expr("new.rowid".to_string()).build()
        }
        TriggerKind::Delete => {
            let mut names: Vec<String> = Vec::with_capacity(shape.columns.len() + 1);
            let mut values: Vec<String> = Vec::with_capacity(shape.columns.len() + 1);
            if !shape.rowid_aliased {
                names.push("rowid".to_string());
                values.push("old.rowid".to_string());
            }
            for column in &shape.columns {
                let ident = quote_ident(column);
                values.push(format!("quote(old.{ident})"));
                names.push(ident);
            }

            let mut concat = Concat::default().text(&format!(
                "INSERT INTO {table} ({}) VALUES (",
                names.join(",")
            ));
            for (i, value) in values.into_iter().enumerate() {
                if i > 0 {
                    concat = concat.text(",");
                }
                concat = concat.expr(value);
            }
            concat.text(")").build()
        }
    }
}

/// Full `CREATE TRIGGER` statement for one event of a tracked table.
///
/// `log` selects which history table the trigger appends to. `clear_redo`
/// adds the side effect that wipes the redo log; it is only honoured when
/// writing to the undo log.
pub fn create_trigger_sql(
    kind: TriggerKind,
    shape: &TableShape,
    log: HistoryKind,
    clear_redo: bool,
) -> String {
    let side_effect = if log == HistoryKind::Undo && clear_redo {
        format!("DELETE FROM {REDO_TABLE};\n    UPDATE {STATS_TABLE} SET \"cur_redo_group\" = 1;")
    } else {
        String::new()
    };

    format!(
        "CREATE TRIGGER IF NOT EXISTS {trigger} {timing} ON {table} BEGIN\n    \
         INSERT INTO {log_table} (\"sequence\", \"history_group\", \"sql\")\n        \
         VALUES(NULL, (SELECT {counter} FROM {STATS_TABLE}), {expr});\n    \
         {side_effect}\n\
         END;",
        trigger = quote_ident(&kind.trigger_name(&shape.name)),
        timing = kind.timing(),
        table = quote_ident(&shape.name),
        log_table = log.table(),
        counter = log.counter_column(),
        expr = inverse_expression(kind, shape),
    )
}

/// `DROP TRIGGER` statement for one event of a table.
pub fn drop_trigger_sql(kind: TriggerKind, table: &str) -> String {
    format!("DROP TRIGGER IF EXISTS {};", quote_ident(&kind.trigger_name(table)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(columns: &[&str], rowid_aliased: bool) -> TableShape {
        TableShape {
            name: "pages".to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rowid_aliased,
        }
    }

    #[test]
    fn test_quote_ident_and_literal() {
        assert_eq!(quote_ident("pages"), "\"pages\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_first_quoted_identifier() {
        assert_eq!(
            first_quoted_identifier("DELETE FROM \"test_table\" WHERE rowid=6").as_deref(),
            Some("test_table")
        );
        assert_eq!(
            first_quoted_identifier("UPDATE \"a\"\"b\" SET \"x\"=1 WHERE rowid=1").as_deref(),
            Some("a\"b")
        );
        assert_eq!(first_quoted_identifier("SELECT 1"), None);
    }

    #[test]
    fn test_insert_inverse_expression() {
        let expr = inverse_expression(TriggerKind::Insert, &shape(&["id", "notes"], true));
        assert_eq!(expr, "'DELETE FROM \"pages\" WHERE rowid='||new.rowid");
    }

    #[test]
    fn test_update_inverse_expression() {
        let expr = inverse_expression(TriggerKind::Update, &shape(&["id", "notes"], true));
        assert_eq!(
            expr,
            "'UPDATE \"pages\" SET \"id\"='||quote(old.\"id\")||',\"notes\"='||quote(old.\"notes\")||' WHERE rowid='||new.rowid"
        );
    }

    #[test]
    fn test_delete_inverse_expression() {
        let expr = inverse_expression(TriggerKind::Delete, &shape(&["id", "notes"], true));
        assert_eq!(
            expr,
            "'INSERT INTO \"pages\" (\"id\",\"notes\") VALUES ('||quote(old.\"id\")||','||quote(old.\"notes\")||')'"
        );
    }

    #[test]
    fn test_delete_inverse_carries_rowid_when_not_aliased() {
        let expr = inverse_expression(TriggerKind::Delete, &shape(&["name"], false));
        assert!(expr.starts_with("'INSERT INTO \"pages\" (rowid,\"name\") VALUES ('||old.rowid||','"));
    }

    #[test]
    fn test_create_trigger_sql_undo_with_clear() {
        let sql = create_trigger_sql(TriggerKind::Insert, &shape(&["id"], true), HistoryKind::Undo, true);
        assert!(sql.starts_with("CREATE TRIGGER IF NOT EXISTS \"pages_it\" AFTER INSERT ON \"pages\""));
        assert!(sql.contains("INSERT INTO history_undo"));
        assert!(sql.contains("SELECT cur_undo_group FROM history_stats"));
        assert!(sql.contains("DELETE FROM history_redo;"));
    }

    #[test]
    fn test_create_trigger_sql_redo_never_clears() {
        let sql = create_trigger_sql(TriggerKind::Delete, &shape(&["id"], true), HistoryKind::Redo, true);
        assert!(sql.contains("BEFORE DELETE"));
        assert!(sql.contains("INSERT INTO history_redo"));
        assert!(!sql.contains("DELETE FROM history_redo"));
    }

    #[test]
    fn test_trigger_names() {
        assert_eq!(TriggerKind::Insert.trigger_name("pages"), "pages_it");
        assert_eq!(TriggerKind::Update.trigger_name("pages"), "pages_ut");
        assert_eq!(TriggerKind::Delete.trigger_name("pages"), "pages_dt");
        assert_eq!(drop_trigger_sql(TriggerKind::Update, "pages"), "DROP TRIGGER IF EXISTS \"pages_ut\";");
    }
}
