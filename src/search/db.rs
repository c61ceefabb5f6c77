//! SQLite schema and blocking operations for the search index.
//!
//! One writable connection (serialized behind the indexer queue) and
//! one read connection share a single database file. All functions here
//! are synchronous; callers hop onto the blocking pool.

use std::path::Path;

use rusqlite::{params, Connection, OpenFlags};

use crate::fileset::SearchRecord;

/// Rows returned to the query layer before excerpting.
#[derive(Debug, Clone)]
pub struct RawRow {
    pub path: String,
    pub title: String,
    pub category: String,
    pub content: String,
}

/// One change applied by an indexer pass.
#[derive(Debug, Clone)]
pub enum IndexUpdate {
    Upsert(SearchRecord),
    Delete { id: String },
}

/// Result cap per query.
pub const MAX_ROWS: usize = 1000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS scope (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account TEXT NOT NULL,
    repo TEXT NOT NULL,
    branch TEXT NOT NULL,
    index_date TEXT,
    since TEXT,
    UNIQUE (account, repo, branch)
);
CREATE TABLE IF NOT EXISTS files (
    id TEXT NOT NULL,
    scopeid INTEGER NOT NULL,
    path TEXT NOT NULL,
    category TEXT,
    title TEXT,
    textid INTEGER,
    UNIQUE (id, scopeid)
);
CREATE VIRTUAL TABLE IF NOT EXISTS text USING fts5(content);
";

/// Open (and create if needed) the database with its schema.
pub fn open_writable(path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Open a read-only connection for queries.
pub fn open_readonly(path: &Path) -> rusqlite::Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
}

/// Ensure the scope row exists; return `(scope id, since)`.
pub fn ensure_scope(
    conn: &Connection,
    account: &str,
    repo: &str,
    branch: &str,
) -> rusqlite::Result<(i64, Option<String>)> {
    conn.execute(
        "INSERT OR IGNORE INTO scope (account, repo, branch, since) VALUES (?1, ?2, ?3, NULL)",
        params![account, repo, branch],
    )?;
    conn.query_row(
        "SELECT id, since FROM scope WHERE account = ?1 AND repo = ?2 AND branch = ?3",
        params![account, repo, branch],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
}

/// The last-indexed commit of a scope, if any.
pub fn scope_since(
    conn: &Connection,
    account: &str,
    repo: &str,
    branch: &str,
) -> rusqlite::Result<Option<String>> {
    let mut stmt = conn.prepare(
        "SELECT since FROM scope WHERE account = ?1 AND repo = ?2 AND branch = ?3",
    )?;
    let mut rows = stmt.query(params![account, repo, branch])?;
    match rows.next()? {
        Some(row) => row.get(0),
        None => Ok(None),
    }
}

fn delete_file_row(conn: &Connection, scope_id: i64, id: &str) -> rusqlite::Result<()> {
    let textid: Option<i64> = conn
        .query_row(
            "SELECT textid FROM files WHERE id = ?1 AND scopeid = ?2",
            params![id, scope_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    if let Some(textid) = textid {
        conn.execute("DELETE FROM text WHERE rowid = ?1", params![textid])?;
        conn.execute(
            "DELETE FROM files WHERE id = ?1 AND scopeid = ?2",
            params![id, scope_id],
        )?;
    }
    Ok(())
}

/// Apply one indexer pass atomically and advance `scope.since`.
///
/// `reset` wipes the scope's rows first (unknown `since`, rewound
/// branch). On any error the transaction rolls back and `since` stays.
pub fn apply_updates(
    conn: &mut Connection,
    scope_id: i64,
    reset: bool,
    updates: &[IndexUpdate],
    new_since: &str,
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;

    if reset {
        tx.execute(
            "DELETE FROM text WHERE rowid IN (SELECT textid FROM files WHERE scopeid = ?1)",
            params![scope_id],
        )?;
        tx.execute("DELETE FROM files WHERE scopeid = ?1", params![scope_id])?;
    }

    for update in updates {
        match update {
            IndexUpdate::Upsert(record) => {
                delete_file_row(&tx, scope_id, &record.id)?;
                tx.execute(
                    "INSERT INTO text (content) VALUES (?1)",
                    params![record.content],
                )?;
                let textid = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO files (id, scopeid, path, category, title, textid)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        record.id,
                        scope_id,
                        record.path,
                        record.category,
                        record.title,
                        textid
                    ],
                )?;
            }
            IndexUpdate::Delete { id } => {
                delete_file_row(&tx, scope_id, id)?;
            }
        }
    }

    tx.execute(
        "UPDATE scope SET since = ?1, index_date = datetime('now') WHERE id = ?2",
        params![new_since, scope_id],
    )?;
    tx.commit()
}

/// Run an FTS query scoped to one branch, optionally narrowed to a
/// path prefix. Capped at [`MAX_ROWS`].
pub fn query(
    conn: &Connection,
    account: &str,
    repo: &str,
    branch: &str,
    match_expr: &str,
    path_prefix: Option<&str>,
) -> rusqlite::Result<Vec<RawRow>> {
    let like = match path_prefix {
        Some(prefix) => format!("{prefix}%"),
        None => "%".to_string(),
    };
    let mut stmt = conn.prepare(
        "SELECT files.path, files.title, files.category, text.content
         FROM files
         JOIN scope ON scope.id = files.scopeid
         JOIN text ON text.rowid = files.textid
         WHERE scope.account = ?1 AND scope.repo = ?2 AND scope.branch = ?3
           AND files.path LIKE ?4
           AND text MATCH ?5
         LIMIT ?6",
    )?;
    let rows = stmt.query_map(
        params![account, repo, branch, like, match_expr, MAX_ROWS as i64],
        |row| {
            Ok(RawRow {
                path: row.get(0)?,
                title: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                category: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                content: row.get(3)?,
            })
        },
    )?;
    rows.collect()
}
