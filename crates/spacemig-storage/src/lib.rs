use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use spacemig_core::{
    Attribution, ErrorKind, MigrationStatus, Owner, SpaceKey, SpaceMigrationRecord,
};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

mod inventory;

pub use inventory::SqliteInventory;

pub const LEDGER_SCHEMA_VERSION: i64 = 2;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

const RECORD_COLUMNS: &str = "customer, space, status, instance_id, worker_id, total_uploads, \
     completed_uploads, last_processed_upload, attempts, created_at, updated_at, error_kind, error";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("invalid page token: {0}")]
    PageToken(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("record {key} already exists")]
    AlreadyExists { key: SpaceKey },
    #[error("record {key} not found")]
    NotFound { key: SpaceKey },
    #[error("record {key} is {status}")]
    Conflict {
        key: SpaceKey,
        status: MigrationStatus,
    },
    #[error("record {key} is not owned by {owner}")]
    NotOwner { key: SpaceKey, owner: Owner },
    #[error("invalid progress for {key}: {reason}")]
    InvalidProgress { key: SpaceKey, reason: String },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(value: rusqlite::Error) -> Self {
        LedgerError::Storage(StorageError::Sqlite(value))
    }
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            LedgerError::NotFound { .. } => ErrorKind::NotFound,
            LedgerError::Conflict { .. } => ErrorKind::Conflict,
            LedgerError::NotOwner { .. } => ErrorKind::NotOwner,
            LedgerError::InvalidProgress { .. } => ErrorKind::InvalidProgress,
            LedgerError::Storage(_) => ErrorKind::Internal,
        }
    }

    /// Ownership races a worker recovers from by dropping the space.
    pub fn is_ownership_lost(&self) -> bool {
        matches!(
            self,
            LedgerError::Conflict { .. } | LedgerError::NotOwner { .. }
        )
    }
}

/// Opaque keyset cursor. Encodes the sort key of the last row of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageToken(Vec<String>);

impl PageToken {
    pub fn encode(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    pub fn decode(value: &str) -> Result<Self, StorageError> {
        serde_json::from_str::<Vec<String>>(value)
            .map(PageToken)
            .map_err(|err| StorageError::PageToken(err.to_string()))
    }

    fn parts<const N: usize>(&self) -> Result<[&str; N], StorageError> {
        if self.0.len() != N {
            return Err(StorageError::PageToken(format!(
                "expected {N} key parts, found {}",
                self.0.len()
            )));
        }
        let mut parts = [""; N];
        for (slot, part) in parts.iter_mut().zip(self.0.iter()) {
            *slot = part.as_str();
        }
        Ok(parts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub after: Option<PageToken>,
    pub limit: usize,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self { after: None, limit }
    }

    pub fn after(token: PageToken, limit: usize) -> Self {
        Self {
            after: Some(token),
            limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageToken>,
}

impl<T> Page<T> {
    pub fn next_request(&self, limit: usize) -> Option<PageRequest> {
        self.next
            .clone()
            .map(|token| PageRequest::after(token, limit))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributionConflictRecord {
    pub customer: String,
    pub space: String,
    pub digest: String,
    pub attributions: Vec<Attribution>,
    pub observed_at: DateTime<Utc>,
}

enum RecordFilter<'a> {
    All,
    Customer(&'a str),
    Instance(&'a str),
    Status(MigrationStatus),
    StuckSince(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    TotalRaised,
    Unchanged,
}

pub struct MigrationLedger {
    conn: Connection,
}

impl MigrationLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        let ledger = Self { conn };
        ledger.migrate()?;
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self { conn };
        ledger.migrate()?;
        Ok(ledger)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > LEDGER_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: LEDGER_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_space_migrations.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_inventory.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 2", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn inventory(&self) -> SqliteInventory<'_> {
        SqliteInventory::new(&self.conn)
    }

    pub fn create(
        &self,
        key: &SpaceKey,
        total_uploads: u64,
        now: DateTime<Utc>,
    ) -> Result<SpaceMigrationRecord, LedgerError> {
        if !self.insert_pending(key, total_uploads, now)? {
            return Err(LedgerError::AlreadyExists { key: key.clone() });
        }
        info!(key = %key, total_uploads, "migration_record_created");
        self.require(key)
    }

    /// Idempotent create for seeding. An existing record that is not `completed` has
    /// its total raised to `total_uploads`; totals never shrink.
    pub fn ensure(
        &self,
        key: &SpaceKey,
        total_uploads: u64,
        now: DateTime<Utc>,
    ) -> Result<EnsureOutcome, LedgerError> {
        if self.insert_pending(key, total_uploads, now)? {
            info!(key = %key, total_uploads, "migration_record_created");
            return Ok(EnsureOutcome::Created);
        }
        let changes = self.conn.execute(
            "
            UPDATE space_migrations
            SET total_uploads = ?3
            WHERE customer = ?1
              AND space = ?2
              AND status != 'completed'
              AND total_uploads < ?3
            ",
            params![key.customer, key.space, total_uploads as i64],
        )?;
        if changes > 0 {
            info!(key = %key, total_uploads, "migration_total_raised");
            Ok(EnsureOutcome::TotalRaised)
        } else {
            Ok(EnsureOutcome::Unchanged)
        }
    }

    fn insert_pending(
        &self,
        key: &SpaceKey,
        total_uploads: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let now = format_timestamp(now);
        let changes = self.conn.execute(
            "
            INSERT INTO space_migrations (
                customer,
                space,
                status,
                total_uploads,
                completed_uploads,
                attempts,
                created_at,
                updated_at
            ) VALUES (?1, ?2, 'pending', ?3, 0, 0, ?4, ?4)
            ON CONFLICT(customer, space) DO NOTHING
            ",
            params![key.customer, key.space, total_uploads as i64, now],
        )?;
        Ok(changes > 0)
    }

    pub fn get(&self, key: &SpaceKey) -> Result<Option<SpaceMigrationRecord>, StorageError> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM space_migrations WHERE customer = ?1 AND space = ?2"
                ),
                params![key.customer, key.space],
                map_record,
            )
            .optional()?;
        Ok(record)
    }

    fn require(&self, key: &SpaceKey) -> Result<SpaceMigrationRecord, LedgerError> {
        self.get(key)?
            .ok_or_else(|| LedgerError::NotFound { key: key.clone() })
    }

    /// `pending|failed -> in-progress`. A single conditional update, so of any number
    /// of racing callers exactly one observes a changed row.
    pub fn claim(
        &self,
        key: &SpaceKey,
        owner: &Owner,
        now: DateTime<Utc>,
    ) -> Result<SpaceMigrationRecord, LedgerError> {
        let changes = self.conn.execute(
            "
            UPDATE space_migrations SET
                status = 'in-progress',
                instance_id = ?3,
                worker_id = ?4,
                attempts = attempts + 1,
                error_kind = NULL,
                error = NULL,
                updated_at = MAX(updated_at, ?5)
            WHERE customer = ?1 AND space = ?2 AND status IN ('pending', 'failed')
            ",
            params![
                key.customer,
                key.space,
                owner.instance_id,
                owner.worker_id,
                format_timestamp(now),
            ],
        )?;

        if changes == 0 {
            let current = self.require(key)?;
            debug!(key = %key, owner = %owner, status = %current.status, "claim_lost");
            return Err(LedgerError::Conflict {
                key: key.clone(),
                status: current.status,
            });
        }

        info!(key = %key, owner = %owner, "migration_record_claimed");
        self.require(key)
    }

    pub fn record_progress(
        &self,
        key: &SpaceKey,
        owner: &Owner,
        completed_uploads: u64,
        last_processed_upload: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let changes = self.conn.execute(
            "
            UPDATE space_migrations SET
                completed_uploads = ?5,
                last_processed_upload = ?6,
                updated_at = MAX(updated_at, ?7)
            WHERE customer = ?1 AND space = ?2
                AND status = 'in-progress' AND instance_id = ?3 AND worker_id = ?4
                AND completed_uploads <= ?5 AND total_uploads >= ?5
            ",
            params![
                key.customer,
                key.space,
                owner.instance_id,
                owner.worker_id,
                completed_uploads as i64,
                last_processed_upload,
                format_timestamp(now),
            ],
        )?;
        if changes > 0 {
            return Ok(());
        }

        let current = self.require(key)?;
        if !current.is_owned_by(owner) {
            return Err(LedgerError::NotOwner {
                key: key.clone(),
                owner: owner.clone(),
            });
        }
        let reason = if completed_uploads < current.completed_uploads {
            format!(
                "completed uploads cannot decrease from {} to {completed_uploads}",
                current.completed_uploads
            )
        } else {
            format!(
                "completed uploads {completed_uploads} exceed total {}",
                current.total_uploads
            )
        };
        Err(LedgerError::InvalidProgress {
            key: key.clone(),
            reason,
        })
    }

    pub fn heartbeat(
        &self,
        key: &SpaceKey,
        owner: &Owner,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let changes = self.conn.execute(
            "
            UPDATE space_migrations SET updated_at = MAX(updated_at, ?5)
            WHERE customer = ?1 AND space = ?2
                AND status = 'in-progress' AND instance_id = ?3 AND worker_id = ?4
            ",
            params![
                key.customer,
                key.space,
                owner.instance_id,
                owner.worker_id,
                format_timestamp(now),
            ],
        )?;
        if changes == 0 {
            self.require(key)?;
            return Err(LedgerError::NotOwner {
                key: key.clone(),
                owner: owner.clone(),
            });
        }
        Ok(())
    }

    pub fn complete(
        &self,
        key: &SpaceKey,
        owner: &Owner,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let changes = self.conn.execute(
            "
            UPDATE space_migrations SET
                status = 'completed',
                error_kind = NULL,
                error = NULL,
                updated_at = MAX(updated_at, ?5)
            WHERE customer = ?1 AND space = ?2
                AND status = 'in-progress' AND instance_id = ?3 AND worker_id = ?4
            ",
            params![
                key.customer,
                key.space,
                owner.instance_id,
                owner.worker_id,
                format_timestamp(now),
            ],
        )?;
        if changes > 0 {
            info!(key = %key, owner = %owner, "migration_record_completed");
            return Ok(());
        }

        let current = self.require(key)?;
        if current.status == MigrationStatus::Completed {
            return Ok(());
        }
        Err(LedgerError::NotOwner {
            key: key.clone(),
            owner: owner.clone(),
        })
    }

    pub fn fail(
        &self,
        key: &SpaceKey,
        owner: &Owner,
        error_kind: ErrorKind,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let changes = self.conn.execute(
            "
            UPDATE space_migrations SET
                status = 'failed',
                error_kind = ?5,
                error = ?6,
                updated_at = MAX(updated_at, ?7)
            WHERE customer = ?1 AND space = ?2
                AND status = 'in-progress' AND instance_id = ?3 AND worker_id = ?4
            ",
            params![
                key.customer,
                key.space,
                owner.instance_id,
                owner.worker_id,
                error_kind.as_str(),
                error,
                format_timestamp(now),
            ],
        )?;
        if changes > 0 {
            warn!(key = %key, owner = %owner, error_kind = %error_kind, error, "migration_record_failed");
            return Ok(());
        }

        let current = self.require(key)?;
        match current.status {
            MigrationStatus::Failed
                if current.instance_id.as_deref() == Some(owner.instance_id.as_str())
                    && current.worker_id.as_deref() == Some(owner.worker_id.as_str()) =>
            {
                Ok(())
            }
            MigrationStatus::Completed => Err(LedgerError::Conflict {
                key: key.clone(),
                status: current.status,
            }),
            _ => Err(LedgerError::NotOwner {
                key: key.clone(),
                owner: owner.clone(),
            }),
        }
    }

    /// Owner gives the record back: `in-progress -> pending`. The owner fields are
    /// kept as the last owner.
    pub fn release(
        &self,
        key: &SpaceKey,
        owner: &Owner,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let changes = self.conn.execute(
            "
            UPDATE space_migrations SET
                status = 'pending',
                updated_at = MAX(updated_at, ?5)
            WHERE customer = ?1 AND space = ?2
                AND status = 'in-progress' AND instance_id = ?3 AND worker_id = ?4
            ",
            params![
                key.customer,
                key.space,
                owner.instance_id,
                owner.worker_id,
                format_timestamp(now),
            ],
        )?;
        if changes == 0 {
            self.require(key)?;
            return Err(LedgerError::NotOwner {
                key: key.clone(),
                owner: owner.clone(),
            });
        }
        info!(key = %key, owner = %owner, "migration_record_released");
        Ok(())
    }

    /// Compare-and-set `in-progress -> pending` against the owner and `updated_at`
    /// the caller observed. Loses if the owner wrote anything since.
    pub fn reclaim_stale(
        &self,
        observed: &SpaceMigrationRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let changes = self.conn.execute(
            "
            UPDATE space_migrations SET
                status = 'pending',
                updated_at = MAX(updated_at, ?6)
            WHERE customer = ?1 AND space = ?2 AND status = 'in-progress'
                AND instance_id IS ?3 AND worker_id IS ?4 AND updated_at = ?5
            ",
            params![
                observed.customer,
                observed.space,
                observed.instance_id,
                observed.worker_id,
                format_timestamp(observed.updated_at),
                format_timestamp(now),
            ],
        )?;
        if changes > 0 {
            warn!(
                key = %observed.key(),
                instance_id = observed.instance_id.as_deref().unwrap_or("-"),
                worker_id = observed.worker_id.as_deref().unwrap_or("-"),
                last_update = %observed.updated_at,
                "stale_claim_reclaimed"
            );
        }
        Ok(changes > 0)
    }

    /// Manual retry reset: `failed -> pending`.
    pub fn retry_failed(&self, key: &SpaceKey, now: DateTime<Utc>) -> Result<(), LedgerError> {
        let changes = self.conn.execute(
            "
            UPDATE space_migrations SET
                status = 'pending',
                error_kind = NULL,
                error = NULL,
                updated_at = MAX(updated_at, ?3)
            WHERE customer = ?1 AND space = ?2 AND status = 'failed'
            ",
            params![key.customer, key.space, format_timestamp(now)],
        )?;
        if changes == 0 {
            let current = self.require(key)?;
            return Err(LedgerError::Conflict {
                key: key.clone(),
                status: current.status,
            });
        }
        info!(key = %key, "failed_record_reset");
        Ok(())
    }

    pub fn scan_all(&self, page: &PageRequest) -> Result<Page<SpaceMigrationRecord>, StorageError> {
        self.scan_records(RecordFilter::All, page)
    }

    pub fn scan_by_customer(
        &self,
        customer: &str,
        page: &PageRequest,
    ) -> Result<Page<SpaceMigrationRecord>, StorageError> {
        self.scan_records(RecordFilter::Customer(customer), page)
    }

    pub fn scan_by_instance(
        &self,
        instance_id: &str,
        page: &PageRequest,
    ) -> Result<Page<SpaceMigrationRecord>, StorageError> {
        self.scan_records(RecordFilter::Instance(instance_id), page)
    }

    pub fn scan_pending(
        &self,
        page: &PageRequest,
    ) -> Result<Page<SpaceMigrationRecord>, StorageError> {
        self.scan_records(RecordFilter::Status(MigrationStatus::Pending), page)
    }

    pub fn scan_failed(
        &self,
        page: &PageRequest,
    ) -> Result<Page<SpaceMigrationRecord>, StorageError> {
        self.scan_records(RecordFilter::Status(MigrationStatus::Failed), page)
    }

    /// `in-progress` records with `now - updated_at >= threshold`.
    pub fn scan_stuck(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
        page: &PageRequest,
    ) -> Result<Page<SpaceMigrationRecord>, StorageError> {
        let cutoff = format_timestamp(now - threshold);
        self.scan_records(RecordFilter::StuckSince(cutoff), page)
    }

    fn scan_records(
        &self,
        filter: RecordFilter<'_>,
        page: &PageRequest,
    ) -> Result<Page<SpaceMigrationRecord>, StorageError> {
        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM space_migrations WHERE 1 = 1");
        let mut values: Vec<Value> = Vec::new();

        match filter {
            RecordFilter::All => {}
            RecordFilter::Customer(customer) => {
                sql.push_str(" AND customer = ?");
                values.push(Value::Text(customer.to_string()));
            }
            RecordFilter::Instance(instance_id) => {
                sql.push_str(" AND instance_id = ?");
                values.push(Value::Text(instance_id.to_string()));
            }
            RecordFilter::Status(status) => {
                sql.push_str(" AND status = ?");
                values.push(Value::Text(status.as_str().to_string()));
            }
            RecordFilter::StuckSince(cutoff) => {
                sql.push_str(" AND status = 'in-progress' AND updated_at <= ?");
                values.push(Value::Text(cutoff));
            }
        }

        if let Some(token) = &page.after {
            let [customer, space] = token.parts::<2>()?;
            sql.push_str(" AND (customer, space) > (?, ?)");
            values.push(Value::Text(customer.to_string()));
            values.push(Value::Text(space.to_string()));
        }

        let limit = page.limit.max(1);
        sql.push_str(" ORDER BY customer ASC, space ASC LIMIT ?");
        values.push(Value::Integer(limit as i64 + 1));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), map_record)?;
        let mut items = rows.collect::<Result<Vec<_>, _>>()?;

        let next = if items.len() > limit {
            items.truncate(limit);
            items
                .last()
                .map(|last| PageToken(vec![last.customer.clone(), last.space.clone()]))
        } else {
            None
        };

        Ok(Page { items, next })
    }

    pub fn record_attribution_conflict(
        &self,
        conflict: &AttributionConflictRecord,
    ) -> Result<(), StorageError> {
        let attributions_json = serde_json::to_string(&conflict.attributions)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.conn.execute(
            "
            INSERT INTO attribution_conflicts (
                customer,
                space,
                digest,
                attributions_json,
                observed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(customer, space, digest) DO UPDATE SET
                attributions_json=excluded.attributions_json,
                observed_at=excluded.observed_at
            ",
            params![
                conflict.customer,
                conflict.space,
                conflict.digest,
                attributions_json,
                format_timestamp(conflict.observed_at),
            ],
        )?;
        Ok(())
    }

    pub fn scan_attribution_conflicts(
        &self,
        page: &PageRequest,
    ) -> Result<Page<AttributionConflictRecord>, StorageError> {
        let limit = page.limit.max(1);
        let (customer, space, digest) = match &page.after {
            Some(token) => {
                let [customer, space, digest] = token.parts::<3>()?;
                (customer, space, digest)
            }
            None => ("", "", ""),
        };

        let mut stmt = self.conn.prepare(
            "
            SELECT customer, space, digest, attributions_json, observed_at
            FROM attribution_conflicts
            WHERE (customer, space, digest) > (?1, ?2, ?3)
            ORDER BY customer ASC, space ASC, digest ASC
            LIMIT ?4
            ",
        )?;
        let rows = stmt.query_map(
            params![customer, space, digest, limit as i64 + 1],
            |row| {
                let attributions_json: String = row.get(3)?;
                let attributions: Vec<Attribution> = serde_json::from_str(&attributions_json)
                    .map_err(|err| {
                        rusqlite::Error::FromSqlConversionFailure(
                            3,
                            rusqlite::types::Type::Text,
                            Box::new(err),
                        )
                    })?;
                Ok(AttributionConflictRecord {
                    customer: row.get(0)?,
                    space: row.get(1)?,
                    digest: row.get(2)?,
                    attributions,
                    observed_at: timestamp_column(row, 4)?,
                })
            },
        )?;
        let mut items = rows.collect::<Result<Vec<_>, _>>()?;

        let next = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|last| {
                PageToken(vec![
                    last.customer.clone(),
                    last.space.clone(),
                    last.digest.clone(),
                ])
            })
        } else {
            None
        };

        Ok(Page { items, next })
    }
}

/// Fixed-width UTC RFC 3339 with milliseconds, so text order is time order.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    parse_timestamp(&value).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn text_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let value: String = row.get(idx)?;
    value.parse::<T>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(StorageError::Serialization(err)),
        )
    })
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<SpaceMigrationRecord> {
    let error_kind = match row.get::<_, Option<String>>(11)? {
        Some(_) => Some(text_column::<ErrorKind>(row, 11)?),
        None => None,
    };

    Ok(SpaceMigrationRecord {
        customer: row.get(0)?,
        space: row.get(1)?,
        status: text_column::<MigrationStatus>(row, 2)?,
        instance_id: row.get(3)?,
        worker_id: row.get(4)?,
        total_uploads: row.get::<_, i64>(5)? as u64,
        completed_uploads: row.get::<_, i64>(6)? as u64,
        last_processed_upload: row.get(7)?,
        attempts: row.get::<_, i64>(8)? as u32,
        created_at: timestamp_column(row, 9)?,
        updated_at: timestamp_column(row, 10)?,
        error_kind,
        error: row.get(12)?,
    })
}
