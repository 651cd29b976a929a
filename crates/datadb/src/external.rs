//! Read-only external database attachments.
//!
//! Attach definitions live in the `_external_sources` metadata table
//! inside each worldline DB and are reapplied per connection. Missing
//! files and attach failures are reported per-alias instead of failing
//! the whole query.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use wl_domain::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalSource {
    pub alias: String,
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachOutcome {
    pub alias: String,
    pub db_path: String,
    pub attached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn metadata_table_exists(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = '_external_sources' LIMIT 1",
        [],
        |_| Ok(()),
    )
    .is_ok()
}

fn ensure_metadata_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _external_sources (
            alias TEXT PRIMARY KEY,
            db_path TEXT NOT NULL,
            db_type TEXT NOT NULL DEFAULT 'sqlite',
            attached_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}

pub fn load_external_sources(conn: &Connection) -> Result<Vec<ExternalSource>> {
    if !metadata_table_exists(conn) {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT alias, db_path
         FROM _external_sources
         WHERE db_type = 'sqlite'
         ORDER BY attached_at DESC, alias ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ExternalSource {
                alias: row.get(0)?,
                db_path: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn register_external(conn: &Connection, alias: &str, db_path: &str) -> Result<()> {
    ensure_metadata_table(conn)?;
    conn.execute(
        "INSERT INTO _external_sources (alias, db_path, db_type, attached_at)
         VALUES (?1, ?2, 'sqlite', ?3)
         ON CONFLICT(alias) DO UPDATE SET db_path = ?2, attached_at = ?3",
        rusqlite::params![alias, db_path, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn remove_external(conn: &Connection, alias: &str) -> Result<bool> {
    if !metadata_table_exists(conn) {
        return Ok(false);
    }
    let changed = conn.execute(
        "DELETE FROM _external_sources WHERE alias = ?1",
        rusqlite::params![alias],
    )?;
    Ok(changed > 0)
}

fn attach_read_only(conn: &Connection, alias: &str, db_path: &str) -> Result<()> {
    // SQLite URI form gives a read-only attachment.
    let uri = format!("file:{}?mode=ro", db_path.replace('?', "%3f"));
    let sql = format!("ATTACH DATABASE ?1 AS {}", quote_identifier(alias));
    conn.execute(&sql, rusqlite::params![uri])?;
    Ok(())
}

/// Re-attach every recorded source, filtered by `allowed_aliases` when
/// given. Returns one outcome per considered alias.
pub fn reattach_external_sources(
    conn: &Connection,
    allowed_aliases: Option<&[String]>,
) -> Vec<AttachOutcome> {
    let allowed: Option<Vec<String>> = allowed_aliases.map(|aliases| {
        aliases
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect()
    });

    let sources = match load_external_sources(conn) {
        Ok(sources) => sources,
        Err(err) => {
            tracing::warn!(error = %err, "failed to load external sources");
            return Vec::new();
        }
    };

    let mut outcomes = Vec::new();
    for source in sources {
        if let Some(allowed) = &allowed {
            if !allowed.contains(&source.alias) {
                continue;
            }
        }

        if !std::path::Path::new(&source.db_path).exists() {
            outcomes.push(AttachOutcome {
                alias: source.alias,
                db_path: source.db_path,
                attached: false,
                error: Some("database file missing".into()),
            });
            continue;
        }

        match attach_read_only(conn, &source.alias, &source.db_path) {
            Ok(()) => outcomes.push(AttachOutcome {
                alias: source.alias,
                db_path: source.db_path,
                attached: true,
                error: None,
            }),
            Err(err) => outcomes.push(AttachOutcome {
                alias: source.alias,
                db_path: source.db_path,
                attached: false,
                error: Some(err.to_string()),
            }),
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_metadata_table_is_empty() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(load_external_sources(&conn).unwrap().is_empty());
        assert!(!remove_external(&conn, "x").unwrap());
    }

    #[test]
    fn register_upserts_by_alias() {
        let conn = Connection::open_in_memory().unwrap();
        register_external(&conn, "ref", "/a.db").unwrap();
        register_external(&conn, "ref", "/b.db").unwrap();
        let sources = load_external_sources(&conn).unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].db_path, "/b.db");
    }

    #[test]
    fn missing_file_reports_without_failing() {
        let conn = Connection::open_in_memory().unwrap();
        register_external(&conn, "ghost", "/no/such/file.db").unwrap();
        let outcomes = reattach_external_sources(&conn, None);
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].attached);
        assert_eq!(outcomes[0].error.as_deref(), Some("database file missing"));
    }

    #[test]
    fn identifier_quoting_escapes_quotes() {
        assert_eq!(quote_identifier("plain"), "\"plain\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }
}
