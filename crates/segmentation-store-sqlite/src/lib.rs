#![allow(clippy::missing_errors_doc)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use segmentation_core::{
    apply_mutation, format_rfc3339, now_utc, parse_rfc3339_utc, AppliedMutation, AuditAction,
    AuditEntry, AuditEntryInput, MutationError, Period, SegmentError, SegmentKey, Slug, UnitOfWork,
    UserId,
};
use time::OffsetDateTime;
use ulid::Ulid;

const SEGMENTATION_MIGRATION_VERSION: i64 = 1;

// Audit rows keep the segment slug as text rather than a foreign key: the log
// is immutable and must survive catalog deletion unchanged.
const SCHEMA_SEGMENTATION_V1: &str = r"
CREATE TABLE IF NOT EXISTS segments (
  segment_id INTEGER PRIMARY KEY AUTOINCREMENT,
  slug TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS segment_memberships (
  segment_id INTEGER NOT NULL REFERENCES segments(segment_id),
  user_id TEXT NOT NULL,
  PRIMARY KEY (segment_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_segment_memberships_user
  ON segment_memberships(user_id);

CREATE TABLE IF NOT EXISTS audit_entries (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  user_id TEXT NOT NULL,
  slug TEXT NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('add', 'remove')),
  created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_audit_entries_no_update
BEFORE UPDATE ON audit_entries
BEGIN
  SELECT RAISE(FAIL, 'audit_entries is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_audit_entries_no_delete
BEFORE DELETE ON audit_entries
BEGIN
  SELECT RAISE(FAIL, 'audit_entries is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_audit_entries_created_seq
  ON audit_entries(created_at, entry_seq);
CREATE INDEX IF NOT EXISTS idx_audit_entries_user_created_seq
  ON audit_entries(user_id, created_at, entry_seq);
";

/// SQLite-backed segment catalog, membership store, and audit log.
///
/// The store holds only the database path; every operation opens a scoped
/// connection, runs a single transaction, and releases the connection on all
/// exit paths.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    db_path: PathBuf,
}

impl SegmentStore {
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).with_context(|| {
            format!(
                "failed to open sqlite database at {}",
                self.db_path.display()
            )
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(conn)
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.connect()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_SEGMENTATION_V1)
            .context("failed to apply segmentation schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![SEGMENTATION_MIGRATION_VERSION, now],
        )
        .context("failed to register segmentation schema migration")?;

        Ok(())
    }

    /// Creates a catalog entry for `slug` and returns its internal key.
    pub fn create_segment(&self, slug: &Slug) -> Result<SegmentKey> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .context("failed to start catalog transaction")?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT segment_id FROM segments WHERE slug = ?1",
                params![slug.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up segment slug")?;
        if existing.is_some() {
            return Err(anyhow::Error::new(SegmentError::SegmentAlreadyExists));
        }

        let created_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        tx.execute(
            "INSERT INTO segments(slug, created_at) VALUES (?1, ?2)",
            params![slug.as_str(), created_at],
        )
        .context("failed to insert segment")?;

        let key = SegmentKey(tx.last_insert_rowid());
        tx.commit().context("failed to commit segment creation")?;
        Ok(key)
    }

    /// Deletes a segment and every membership referencing it, in one
    /// transaction. The cascade is structural: no audit entries are written
    /// for the removed memberships, so a concurrent reader observes the
    /// segment fully present or fully absent, never partially cascaded.
    pub fn delete_segment(&self, slug: &Slug) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .context("failed to start catalog transaction")?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT segment_id FROM segments WHERE slug = ?1",
                params![slug.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up segment slug")?;
        let Some(segment_id) = existing else {
            return Err(anyhow::Error::new(SegmentError::SegmentNotFound));
        };

        tx.execute(
            "DELETE FROM segment_memberships WHERE segment_id = ?1",
            params![segment_id],
        )
        .context("failed to cascade segment memberships")?;
        tx.execute(
            "DELETE FROM segments WHERE segment_id = ?1",
            params![segment_id],
        )
        .context("failed to delete segment")?;

        tx.commit().context("failed to commit segment deletion")?;
        Ok(())
    }

    /// Applies a membership mutation batch for one user inside a single
    /// transaction; see [`segmentation_core::apply_mutation`] for the
    /// semantics.
    pub fn update_user_segments(
        &self,
        user: UserId,
        to_add: &[Slug],
        to_remove: &[Slug],
    ) -> Result<Vec<AppliedMutation>> {
        self.update_user_segments_at(user, to_add, to_remove, now_utc())
    }

    /// Same as [`SegmentStore::update_user_segments`] with a caller-supplied
    /// timestamp for the audit entries.
    pub fn update_user_segments_at(
        &self,
        user: UserId,
        to_add: &[Slug],
        to_remove: &[Slug],
        now: OffsetDateTime,
    ) -> Result<Vec<AppliedMutation>> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .context("failed to start mutation transaction")?;

        let applied = {
            let mut uow = SqliteUnitOfWork { tx: &tx };
            apply_mutation(&mut uow, user, to_add, to_remove, now)
        }
        .map_err(|err| match err {
            MutationError::SegmentNotFound(slug) => {
                anyhow::Error::new(SegmentError::SegmentNotFound)
                    .context(format!("unknown segment slug '{slug}' in mutation request"))
            }
            MutationError::Storage(source) => {
                anyhow::Error::new(source).context("membership mutation failed")
            }
        })?;

        tx.commit().context("failed to commit membership mutation")?;
        Ok(applied)
    }

    /// Returns the slugs of all segments the user currently belongs to,
    /// sorted for deterministic output.
    pub fn user_segments(&self, user: UserId) -> Result<Vec<Slug>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT segments.slug FROM segments
             INNER JOIN segment_memberships
               ON segments.segment_id = segment_memberships.segment_id
             WHERE segment_memberships.user_id = ?1
             ORDER BY segments.slug ASC",
        )?;

        let rows = stmt.query_map(params![user.to_string()], |row| {
            let raw: String = row.get(0)?;
            Slug::parse(&raw).map_err(to_sql_error)
        })?;

        collect_rows(rows)
    }

    /// Returns audit entries with timestamp in the period's half-open window,
    /// optionally filtered to one user, ordered by timestamp ascending with
    /// insertion order breaking ties.
    pub fn audit_entries(&self, period: Period, user: Option<UserId>) -> Result<Vec<AuditEntry>> {
        let start = format_rfc3339(period.start()).map_err(|err| anyhow!(err.to_string()))?;
        let end = format_rfc3339(period.end()).map_err(|err| anyhow!(err.to_string()))?;

        let conn = self.connect()?;
        let entries = if let Some(user) = user {
            let mut stmt = conn.prepare(
                "SELECT entry_seq, entry_id, user_id, slug, action, created_at
                 FROM audit_entries
                 WHERE created_at >= ?1 AND created_at < ?2 AND user_id = ?3
                 ORDER BY created_at ASC, entry_seq ASC",
            )?;
            let rows = stmt.query_map(params![start, end, user.to_string()], parse_audit_row)?;
            collect_rows(rows)?
        } else {
            let mut stmt = conn.prepare(
                "SELECT entry_seq, entry_id, user_id, slug, action, created_at
                 FROM audit_entries
                 WHERE created_at >= ?1 AND created_at < ?2
                 ORDER BY created_at ASC, entry_seq ASC",
            )?;
            let rows = stmt.query_map(params![start, end], parse_audit_row)?;
            collect_rows(rows)?
        };

        Ok(entries)
    }
}

/// The engine's unit-of-work contract over one open transaction. Dropping
/// the transaction uncommitted rolls every step back.
struct SqliteUnitOfWork<'a> {
    tx: &'a Transaction<'a>,
}

impl UnitOfWork for SqliteUnitOfWork<'_> {
    type Error = rusqlite::Error;

    fn resolve_segment(&mut self, slug: &Slug) -> Result<Option<SegmentKey>, Self::Error> {
        let key: Option<i64> = self
            .tx
            .query_row(
                "SELECT segment_id FROM segments WHERE slug = ?1",
                params![slug.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key.map(SegmentKey))
    }

    fn membership_exists(
        &mut self,
        user: UserId,
        segment: SegmentKey,
    ) -> Result<bool, Self::Error> {
        let count: i64 = self.tx.query_row(
            "SELECT COUNT(*) FROM segment_memberships WHERE segment_id = ?1 AND user_id = ?2",
            params![segment.0, user.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn add_membership(&mut self, user: UserId, segment: SegmentKey) -> Result<(), Self::Error> {
        self.tx.execute(
            "INSERT OR IGNORE INTO segment_memberships(segment_id, user_id) VALUES (?1, ?2)",
            params![segment.0, user.to_string()],
        )?;
        Ok(())
    }

    fn remove_membership(&mut self, user: UserId, segment: SegmentKey) -> Result<(), Self::Error> {
        self.tx.execute(
            "DELETE FROM segment_memberships WHERE segment_id = ?1 AND user_id = ?2",
            params![segment.0, user.to_string()],
        )?;
        Ok(())
    }

    fn append_audit(&mut self, entry: &AuditEntryInput) -> Result<(), Self::Error> {
        let created_at = format_rfc3339(entry.recorded_at).map_err(|err| {
            rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            )))
        })?;

        self.tx.execute(
            "INSERT INTO audit_entries(entry_id, user_id, slug, action, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.entry_id.to_string(),
                entry.user_id.to_string(),
                entry.slug.as_str(),
                entry.action.as_str(),
                created_at,
            ],
        )?;
        Ok(())
    }
}

fn parse_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let entry_id_raw: String = row.get(1)?;
    let user_id_raw: String = row.get(2)?;
    let slug_raw: String = row.get(3)?;
    let action_raw: String = row.get(4)?;
    let created_at_raw: String = row.get(5)?;

    let entry_id = Ulid::from_string(&entry_id_raw).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid entry_id ULID: {entry_id_raw}"),
            )),
        )
    })?;

    let action = AuditAction::parse(&action_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid action: {action_raw}"),
            )),
        )
    })?;

    Ok(AuditEntry {
        entry_seq: row.get(0)?,
        entry_id,
        user_id: UserId::parse(&user_id_raw).map_err(to_sql_error)?,
        slug: Slug::parse(&slug_raw).map_err(to_sql_error)?,
        action,
        recorded_at: parse_rfc3339_utc(&created_at_raw).map_err(to_sql_error)?,
    })
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: SegmentError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
