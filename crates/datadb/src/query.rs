//! Read-query execution: full row count with a bounded preview.

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use wl_domain::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlQueryResult {
    pub columns: Vec<SqlColumn>,
    /// At most `limit` rows.
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Total rows produced by the query.
    pub row_count: usize,
    pub preview_count: usize,
}

impl SqlQueryResult {
    /// The `tool_result_sql` payload, with the measured execution time.
    pub fn to_payload(&self, execution_ms: u64) -> serde_json::Value {
        serde_json::json!({
            "columns": self.columns,
            "rows": self.rows,
            "row_count": self.row_count,
            "preview_count": self.preview_count,
            "execution_ms": execution_ms,
        })
    }
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::Value::String(format!("<blob {} bytes>", bytes.len())),
    }
}

fn value_type_name(value: ValueRef<'_>) -> Option<&'static str> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(_) => Some("INTEGER"),
        ValueRef::Real(_) => Some("REAL"),
        ValueRef::Text(_) => Some("TEXT"),
        ValueRef::Blob(_) => Some("BLOB"),
    }
}

/// Execute `sql` and collect every row, keeping at most `limit` as the
/// preview. Column types come from declared types where available and
/// are otherwise derived from the first non-null value seen.
pub fn run_read_query(conn: &Connection, sql: &str, limit: usize) -> Result<SqlQueryResult> {
    let mut stmt = conn.prepare(sql)?;

    let mut columns: Vec<SqlColumn> = stmt
        .columns()
        .iter()
        .map(|c| SqlColumn {
            name: c.name().to_string(),
            column_type: c.decl_type().unwrap_or("").to_string(),
        })
        .collect();
    let column_count = columns.len();

    let mut rows = stmt.query([])?;
    let mut preview: Vec<Vec<serde_json::Value>> = Vec::new();
    let mut row_count = 0usize;

    while let Some(row) = rows.next()? {
        if row_count < limit {
            let mut out = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                let value = row.get_ref(idx)?;
                if columns[idx].column_type.is_empty() {
                    if let Some(name) = value_type_name(value) {
                        columns[idx].column_type = name.to_string();
                    }
                }
                out.push(value_to_json(value));
            }
            preview.push(out);
        }
        row_count += 1;
    }

    let preview_count = preview.len();
    Ok(SqlQueryResult {
        columns,
        rows: preview,
        row_count,
        preview_count,
    })
}
