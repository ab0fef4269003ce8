mod schema;

use std::path::Path;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Type, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, ToSql, params};
use time::OffsetDateTime;

use crate::error::{LinkError, Result};
use crate::models::{EntryId, Link, LinkKey, LinkType, Tombstone};
use crate::store::{CachedLink, LinkCache, LinkFilter};

use schema::INITIAL_SCHEMA;

const LINK_COLUMNS: &str = "id, source_entry_id, target_entry_id, link_type, description, \
     created_at, created_by, auto_detected, match_type";

/// SQLite-backed indexed cache of links.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens an in-memory SQLite database.
    ///
    /// Automatically initializes the schema on connection open.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.initialize_schema()?;
        Ok(db)
    }

    /// Opens a file-based SQLite database at the given path.
    ///
    /// Creates the database file if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.initialize_schema()?;
        Ok(db)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute_batch(INITIAL_SCHEMA)?;
        Ok(())
    }

    /// Returns a reference to the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Runs `f` between `begin` and COMMIT, rolling back on any error.
    fn in_transaction<T>(&self, begin: &str, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.conn.execute_batch(begin)?;

        let result = f(&self.conn).and_then(|value| {
            self.conn.execute_batch("COMMIT")?;
            Ok(value)
        });
        if result.is_err() {
            self.conn.execute_batch("ROLLBACK").ok();
        }
        result
    }
}

impl LinkCache for Database {
    fn upsert_link(&self, link: &Link) -> Result<()> {
        if link.is_self_link() {
            return Err(LinkError::SelfLink(link.source_entry_id.clone()));
        }
        self.in_transaction("BEGIN TRANSACTION", |conn| {
            upsert_row(conn, link)?;
            clear_tombstone(conn, &link.key())?;
            Ok(())
        })
    }

    fn delete_link(&self, key: &LinkKey, deleted_at: OffsetDateTime) -> Result<bool> {
        let tomb = Tombstone::new(key.clone(), deleted_at);
        self.in_transaction("BEGIN TRANSACTION", |conn| {
            let removed = conn.execute(
                "DELETE FROM note_links
                 WHERE source_entry_id = ?1 AND target_entry_id = ?2 AND link_type = ?3",
                params![key.source, key.target, key.link_type],
            )?;
            conn.execute(
                "INSERT INTO link_tombstones (source_entry_id, target_entry_id, link_type, deleted_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (source_entry_id, target_entry_id, link_type)
                 DO UPDATE SET deleted_at = excluded.deleted_at",
                params![key.source, key.target, key.link_type, tomb.deleted_at.unix_timestamp()],
            )?;
            Ok(removed > 0)
        })
    }

    /// Rows matching `filter`, ordered by source, target and type name.
    fn list_links(&self, filter: &LinkFilter) -> Result<Vec<CachedLink>> {
        let sql = format!(
            "SELECT {LINK_COLUMNS} FROM note_links
             WHERE (?1 IS NULL OR source_entry_id = ?1)
               AND (?2 IS NULL OR target_entry_id = ?2)
               AND (?3 IS NULL OR link_type = ?3)
             ORDER BY source_entry_id, target_entry_id, link_type"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![filter.source, filter.target, filter.link_type],
                row_to_cached_link,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn clear_all(&self) -> Result<()> {
        self.in_transaction("BEGIN IMMEDIATE", |conn| {
            conn.execute("DELETE FROM note_links", [])?;
            conn.execute("DELETE FROM link_tombstones", [])?;
            Ok(())
        })
    }

    /// Rows are inserted in key order; duplicate keys keep the newer version.
    fn replace_all(&self, links: &[Link]) -> Result<usize> {
        let mut staged: Vec<Link> = Vec::with_capacity(links.len());
        let mut sorted: Vec<&Link> = links.iter().collect();
        sorted.sort_by(|a, b| a.key().cmp(&b.key()));
        for link in sorted {
            match staged.last_mut() {
                Some(last) if last.key() == link.key() => {
                    *last = Link::newer_of(last.clone(), link.clone());
                }
                _ => staged.push(link.clone()),
            }
        }

        self.in_transaction("BEGIN IMMEDIATE", |conn| {
            conn.execute("DELETE FROM note_links", [])?;
            conn.execute("DELETE FROM link_tombstones", [])?;
            for link in &staged {
                if link.is_self_link() {
                    return Err(LinkError::SelfLink(link.source_entry_id.clone()));
                }
                insert_row(conn, link)?;
            }
            Ok(staged.len())
        })
    }

    fn rename_entry(&self, old: &EntryId, new: &EntryId) -> Result<usize> {
        if old == new {
            return Ok(0);
        }
        self.in_transaction("BEGIN IMMEDIATE", |conn| {
            let touching = {
                let sql = format!(
                    "SELECT {LINK_COLUMNS} FROM note_links
                     WHERE source_entry_id = ?1 OR target_entry_id = ?1
                     ORDER BY id"
                );
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params![old], row_to_cached_link)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };

            conn.execute(
                "DELETE FROM note_links WHERE source_entry_id = ?1 OR target_entry_id = ?1",
                params![old],
            )?;

            let mut rewritten = 0;
            for row in &touching {
                let renamed = row.link.renamed(old, new);
                if renamed.is_self_link() {
                    tracing::warn!(link = %renamed.key(), "rename would create a self-link, dropping row");
                    continue;
                }
                let merged = match fetch_row(conn, &renamed.key())? {
                    Some(existing) => Link::newer_of(existing, renamed),
                    None => renamed,
                };
                upsert_row(conn, &merged)?;
                rewritten += 1;
            }

            conn.execute(
                "UPDATE OR REPLACE link_tombstones SET source_entry_id = ?2 WHERE source_entry_id = ?1",
                params![old, new],
            )?;
            conn.execute(
                "UPDATE OR REPLACE link_tombstones SET target_entry_id = ?2 WHERE target_entry_id = ?1",
                params![old, new],
            )?;
            conn.execute(
                "DELETE FROM link_tombstones WHERE source_entry_id = target_entry_id",
                [],
            )?;
            conn.execute(
                "UPDATE OR REPLACE note_sync_state SET entry_id = ?2 WHERE entry_id = ?1",
                params![old, new],
            )?;

            Ok(rewritten)
        })
    }

    fn tombstones(&self) -> Result<Vec<Tombstone>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_entry_id, target_entry_id, link_type, deleted_at
             FROM link_tombstones
             ORDER BY source_entry_id, target_entry_id, link_type",
        )?;
        let tombs = stmt
            .query_map([], |row| {
                let key = LinkKey::new(row.get(0)?, row.get(1)?, row.get(2)?);
                let deleted_at = timestamp_column(row, 3)?;
                Ok(Tombstone { key, deleted_at })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tombs)
    }

    fn mark_synced(&self, entry_id: &EntryId, at: OffsetDateTime) -> Result<()> {
        self.conn.execute(
            "INSERT INTO note_sync_state (entry_id, last_synced_at) VALUES (?1, ?2)
             ON CONFLICT (entry_id) DO UPDATE SET last_synced_at = excluded.last_synced_at",
            params![entry_id, at.unix_timestamp()],
        )?;
        Ok(())
    }

    fn last_synced(&self, entry_id: &EntryId) -> Result<Option<OffsetDateTime>> {
        let at: Option<i64> = self
            .conn
            .query_row(
                "SELECT last_synced_at FROM note_sync_state WHERE entry_id = ?1",
                params![entry_id],
                |row| row.get(0),
            )
            .optional()?;
        at.map(|secs| {
            OffsetDateTime::from_unix_timestamp(secs).map_err(|e| {
                LinkError::Cache(rusqlite::Error::FromSqlConversionFailure(
                    0,
                    Type::Integer,
                    Box::new(e),
                ))
            })
        })
        .transpose()
    }
}

/// Inserts the row, or updates the payload of an existing row for the same
/// key. The original `created_by` is kept.
fn upsert_row(conn: &Connection, link: &Link) -> Result<()> {
    conn.execute(
        "INSERT INTO note_links
            (source_entry_id, target_entry_id, link_type, description,
             created_at, created_by, auto_detected, match_type)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (source_entry_id, target_entry_id, link_type) DO UPDATE SET
            description = excluded.description,
            created_at = excluded.created_at,
            auto_detected = excluded.auto_detected,
            match_type = excluded.match_type",
        params![
            link.source_entry_id,
            link.target_entry_id,
            link.link_type,
            link.description,
            link.created_at.unix_timestamp(),
            link.created_by,
            link.auto_detected,
            link.match_type,
        ],
    )?;
    Ok(())
}

fn insert_row(conn: &Connection, link: &Link) -> Result<()> {
    conn.execute(
        "INSERT INTO note_links
            (source_entry_id, target_entry_id, link_type, description,
             created_at, created_by, auto_detected, match_type)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            link.source_entry_id,
            link.target_entry_id,
            link.link_type,
            link.description,
            link.created_at.unix_timestamp(),
            link.created_by,
            link.auto_detected,
            link.match_type,
        ],
    )?;
    Ok(())
}

fn clear_tombstone(conn: &Connection, key: &LinkKey) -> Result<()> {
    conn.execute(
        "DELETE FROM link_tombstones
         WHERE source_entry_id = ?1 AND target_entry_id = ?2 AND link_type = ?3",
        params![key.source, key.target, key.link_type],
    )?;
    Ok(())
}

fn fetch_row(conn: &Connection, key: &LinkKey) -> Result<Option<Link>> {
    let sql = format!(
        "SELECT {LINK_COLUMNS} FROM note_links
         WHERE source_entry_id = ?1 AND target_entry_id = ?2 AND link_type = ?3"
    );
    let row = conn
        .query_row(
            &sql,
            params![key.source, key.target, key.link_type],
            row_to_cached_link,
        )
        .optional()?;
    Ok(row.map(|cached| cached.link))
}

fn row_to_cached_link(row: &Row<'_>) -> rusqlite::Result<CachedLink> {
    Ok(CachedLink {
        id: row.get(0)?,
        link: Link {
            source_entry_id: row.get(1)?,
            target_entry_id: row.get(2)?,
            link_type: row.get(3)?,
            description: row.get(4)?,
            created_at: timestamp_column(row, 5)?,
            created_by: row.get(6)?,
            auto_detected: row.get(7)?,
            match_type: row.get(8)?,
        },
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let secs: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

impl ToSql for EntryId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for EntryId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str().map(EntryId::new)
    }
}

impl ToSql for LinkType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for LinkType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: LinkError| FromSqlError::Other(Box::new(e)))
    }
}
