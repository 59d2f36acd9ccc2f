use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use secret_santa_core::{Assignment, RawParticipant};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS participants (
  participant_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  is_admin INTEGER NOT NULL CHECK (is_admin IN (0, 1)),
  conflicts_json TEXT NOT NULL,
  wishlist TEXT NOT NULL DEFAULT '',
  giftee_id TEXT,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pairing_settings (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  lock_in_time TEXT
);

INSERT OR IGNORE INTO pairing_settings(id, lock_in_time) VALUES (1, NULL);

CREATE INDEX IF NOT EXISTS idx_participants_is_admin ON participants(is_admin);
";

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_001_SQL)];

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// One row of the participant directory.
///
/// `conflicts` is kept as raw JSON: the pairing engine sanitises it, so the
/// store never rejects a record for a malformed conflict list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub conflicts: Value,
    #[serde(default)]
    pub wishlist: String,
    #[serde(default)]
    pub giftee_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    Committed,
    /// A previous run already set the lock; nothing was written.
    AlreadyLocked,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairingCounts {
    pub participant_count: usize,
    pub paired_count: usize,
}

impl SqliteStore {
    /// Open a SQLite-backed participant store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = MIGRATIONS
            .iter()
            .map(|(version, _)| *version)
            .filter(|version| *version > current_version)
            .collect();

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let current = current_schema_version(&self.conn)?;
        if current > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {current}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (version, sql) in MIGRATIONS.iter().filter(|(version, _)| *version > current) {
            let tx = self
                .conn
                .transaction()
                .with_context(|| format!("failed to start migration v{version} transaction"))?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
            record_schema_version(&tx, *version)?;
            tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
            tracing::info!(version, "applied schema migration");
        }

        Ok(())
    }

    /// Insert a participant or update their profile fields.
    ///
    /// An existing `giftee_id` is never touched here; only
    /// [`SqliteStore::commit_assignment`] writes it.
    ///
    /// # Errors
    /// Returns an error when the id or name is blank or the write fails.
    pub fn upsert_participant(&mut self, record: &ParticipantRecord) -> Result<()> {
        if record.id.trim().is_empty() {
            return Err(anyhow!("participant id MUST be provided"));
        }
        if record.name.trim().is_empty() {
            return Err(anyhow!("participant name MUST be provided for {}", record.id));
        }

        let conflicts_json =
            serde_json::to_string(&record.conflicts).context("failed to serialize conflicts")?;
        self.conn
            .execute(
                "INSERT INTO participants(
                    participant_id, name, is_admin, conflicts_json, wishlist, giftee_id, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)
                ON CONFLICT(participant_id) DO UPDATE SET
                    name = excluded.name,
                    is_admin = excluded.is_admin,
                    conflicts_json = excluded.conflicts_json,
                    wishlist = excluded.wishlist,
                    updated_at = excluded.updated_at",
                params![
                    record.id,
                    record.name,
                    record.is_admin,
                    conflicts_json,
                    record.wishlist,
                    now_rfc3339()?,
                ],
            )
            .with_context(|| format!("failed to upsert participant {}", record.id))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_participant(&self, participant_id: &str) -> Result<Option<ParticipantRecord>> {
        self.conn
            .query_row(
                "SELECT participant_id, name, is_admin, conflicts_json, wishlist, giftee_id
                 FROM participants
                 WHERE participant_id = ?1",
                params![participant_id],
                read_participant_row,
            )
            .optional()
            .with_context(|| format!("failed to load participant {participant_id}"))
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_participants(&self) -> Result<Vec<ParticipantRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT participant_id, name, is_admin, conflicts_json, wishlist, giftee_id
             FROM participants
             ORDER BY participant_id ASC",
        )?;
        let rows = stmt.query_map([], read_participant_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("failed to read participant row")?);
        }
        Ok(records)
    }

    /// Non-admin participants in the shape the pairing engine consumes.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_pairing_candidates(&self) -> Result<Vec<RawParticipant>> {
        let mut stmt = self.conn.prepare(
            "SELECT participant_id, name, conflicts_json
             FROM participants
             WHERE is_admin = 0
             ORDER BY participant_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let conflicts_json: String = row.get(2)?;
            Ok(RawParticipant {
                conflicts: parse_conflicts(&id, &conflicts_json),
                id,
                name: row.get(1)?,
            })
        })?;

        let mut candidates = Vec::new();
        for row in rows {
            candidates.push(row.context("failed to read pairing candidate row")?);
        }
        Ok(candidates)
    }

    /// Replace a participant's wishlist. Returns `false` when no such participant exists.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn set_wishlist(&mut self, participant_id: &str, wishlist: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE participants SET wishlist = ?2, updated_at = ?3 WHERE participant_id = ?1",
                params![participant_id, wishlist, now_rfc3339()?],
            )
            .with_context(|| format!("failed to update wishlist for {participant_id}"))?;
        Ok(changed == 1)
    }

    /// Time the pairing was locked in, or `None` while pairing is still open.
    ///
    /// # Errors
    /// Returns an error when the settings row is missing or holds an invalid timestamp.
    pub fn pairing_lock(&self) -> Result<Option<OffsetDateTime>> {
        read_lock(&self.conn)
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn pairing_counts(&self) -> Result<PairingCounts> {
        let (participants, paired) = self
            .conn
            .query_row(
                "SELECT COUNT(*), COUNT(giftee_id) FROM participants WHERE is_admin = 0",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .context("failed to count participants")?;

        Ok(PairingCounts {
            participant_count: usize::try_from(participants).context("negative participant count")?,
            paired_count: usize::try_from(paired).context("negative paired count")?,
        })
    }

    /// Persist every giver's giftee and set the pairing lock, all or nothing.
    ///
    /// The write lock is taken before the lock is read, so two concurrent
    /// commits cannot both succeed.
    ///
    /// # Errors
    /// Returns an error, leaving the database unchanged, when any giver is
    /// unknown or an admin, or when a write fails.
    pub fn commit_assignment(
        &mut self,
        assignment: &Assignment,
        locked_at: OffsetDateTime,
    ) -> Result<CommitStatus> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start pairing commit transaction")?;

        if read_lock(&tx)?.is_some() {
            tracing::warn!("pairing already locked; commit skipped");
            return Ok(CommitStatus::AlreadyLocked);
        }

        let locked_at = rfc3339(locked_at)?;
        for (giver, receiver) in assignment.iter() {
            let changed = tx
                .execute(
                    "UPDATE participants SET giftee_id = ?2, updated_at = ?3
                     WHERE participant_id = ?1 AND is_admin = 0",
                    params![giver.as_str(), receiver.as_str(), locked_at],
                )
                .with_context(|| format!("failed to store giftee for {giver}"))?;
            if changed != 1 {
                return Err(anyhow!("cannot assign a giftee to unknown or admin participant {giver}"));
            }
        }

        tx.execute("UPDATE pairing_settings SET lock_in_time = ?1 WHERE id = 1", params![locked_at])
            .context("failed to set pairing lock")?;
        tx.commit().context("failed to commit pairing transaction")?;

        tracing::info!(pairings = assignment.len(), locked_at = %locked_at, "pairing committed");
        Ok(CommitStatus::Committed)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }
}

fn read_participant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ParticipantRecord> {
    let id: String = row.get(0)?;
    let conflicts_json: String = row.get(3)?;
    Ok(ParticipantRecord {
        conflicts: parse_conflicts(&id, &conflicts_json),
        id,
        name: row.get(1)?,
        is_admin: row.get(2)?,
        wishlist: row.get(4)?,
        giftee_id: row.get(5)?,
    })
}

fn parse_conflicts(participant_id: &str, raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|err| {
        tracing::warn!(participant = participant_id, error = %err, "stored conflicts are not valid JSON");
        Value::Null
    })
}

fn read_lock(conn: &Connection) -> Result<Option<OffsetDateTime>> {
    let raw = conn
        .query_row("SELECT lock_in_time FROM pairing_settings WHERE id = 1", [], |row| {
            row.get::<_, Option<String>>(0)
        })
        .optional()
        .context("failed to read pairing lock")?
        .ok_or_else(|| anyhow!("pairing settings are missing; run migrations first"))?;

    raw.as_deref().map(parse_rfc3339).transpose()
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
