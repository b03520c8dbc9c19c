use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod claims;
pub mod inventory;

pub use claims::{
    Attribution, Claim, ClaimSet, EqualsClaim, IndexClaim, LocationClaim, ShardReference, Slice,
};
pub use inventory::{InventoryError, ShardRecords, UploadRef, UploadSource};

/// Default age after which an `in-progress` record counts as stuck and may be reclaimed.
pub const DEFAULT_STALE_AFTER_SECS: i64 = 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpaceKey {
    pub customer: String,
    pub space: String,
}

impl SpaceKey {
    pub fn new(customer: impl Into<String>, space: impl Into<String>) -> Self {
        Self {
            customer: customer.into(),
            space: space.into(),
        }
    }
}

impl fmt::Display for SpaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.customer, self.space)
    }
}

/// Identity of a worker holding a claim. Ownership is a plain comparison of these
/// identifiers at write time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub instance_id: String,
    pub worker_id: String,
}

impl Owner {
    pub fn new(instance_id: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            worker_id: worker_id.into(),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instance_id, self.worker_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::InProgress => "in-progress",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" => Ok(MigrationStatus::Pending),
            "in-progress" | "in_progress" | "inprogress" => Ok(MigrationStatus::InProgress),
            "completed" | "complete" => Ok(MigrationStatus::Completed),
            "failed" => Ok(MigrationStatus::Failed),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

/// Stable codes for every error the migration engine reports. Failed records store
/// the code next to the error text so diagnostics never parse messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    AlreadyExists,
    NotFound,
    Conflict,
    NotOwner,
    InvalidProgress,
    IndexingServiceUnavailable,
    ResolutionDegraded,
    VerificationIncomplete,
    ProviderAttributionConflict,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyExists => "already-exists",
            Self::NotFound => "not-found",
            Self::Conflict => "conflict",
            Self::NotOwner => "not-owner",
            Self::InvalidProgress => "invalid-progress",
            Self::IndexingServiceUnavailable => "indexing-service-unavailable",
            Self::ResolutionDegraded => "resolution-degraded",
            Self::VerificationIncomplete => "verification-incomplete",
            Self::ProviderAttributionConflict => "provider-attribution-conflict",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "already-exists" => Ok(Self::AlreadyExists),
            "not-found" => Ok(Self::NotFound),
            "conflict" => Ok(Self::Conflict),
            "not-owner" => Ok(Self::NotOwner),
            "invalid-progress" => Ok(Self::InvalidProgress),
            "indexing-service-unavailable" => Ok(Self::IndexingServiceUnavailable),
            "resolution-degraded" => Ok(Self::ResolutionDegraded),
            "verification-incomplete" => Ok(Self::VerificationIncomplete),
            "provider-attribution-conflict" => Ok(Self::ProviderAttributionConflict),
            "internal" => Ok(Self::Internal),
            other => Err(format!("Unknown error kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpaceMigrationRecord {
    pub customer: String,
    pub space: String,
    pub status: MigrationStatus,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    pub total_uploads: u64,
    pub completed_uploads: u64,
    #[serde(default)]
    pub last_processed_upload: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SpaceMigrationRecord {
    pub fn key(&self) -> SpaceKey {
        SpaceKey::new(self.customer.clone(), self.space.clone())
    }

    pub fn owner(&self) -> Option<Owner> {
        match (&self.instance_id, &self.worker_id) {
            (Some(instance_id), Some(worker_id)) => {
                Some(Owner::new(instance_id.clone(), worker_id.clone()))
            }
            _ => None,
        }
    }

    pub fn is_owned_by(&self, owner: &Owner) -> bool {
        self.status == MigrationStatus::InProgress
            && self.instance_id.as_deref() == Some(owner.instance_id.as_str())
            && self.worker_id.as_deref() == Some(owner.worker_id.as_str())
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.updated_at
    }

    /// An `in-progress` record whose last write is at least `threshold` old.
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.status == MigrationStatus::InProgress && self.age(now) >= threshold
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn record(status: MigrationStatus) -> SpaceMigrationRecord {
        SpaceMigrationRecord {
            customer: "did:mailto:example.com:alice".to_string(),
            space: "did:key:z6MkSpaceA".to_string(),
            status,
            instance_id: Some("inst-1".to_string()),
            worker_id: Some("w-0".to_string()),
            total_uploads: 10,
            completed_uploads: 4,
            last_processed_upload: None,
            attempts: 1,
            created_at: ts(),
            updated_at: ts(),
            error_kind: None,
            error: None,
        }
    }

    #[test]
    fn status_parses_aliases_and_serializes_kebab_case() {
        assert_eq!(
            "in_progress".parse::<MigrationStatus>().expect("parse"),
            MigrationStatus::InProgress
        );
        assert_eq!(
            serde_json::to_string(&MigrationStatus::InProgress).expect("json"),
            "\"in-progress\""
        );
        assert!("done".parse::<MigrationStatus>().is_err());
    }

    #[test]
    fn error_kind_codes_are_stable() {
        for kind in [
            ErrorKind::IndexingServiceUnavailable,
            ErrorKind::VerificationIncomplete,
            ErrorKind::ProviderAttributionConflict,
            ErrorKind::Internal,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().expect("parse"), kind);
        }
    }

    #[test]
    fn staleness_requires_in_progress_and_threshold_age() {
        let threshold = Duration::seconds(DEFAULT_STALE_AFTER_SECS);
        let running = record(MigrationStatus::InProgress);
        assert!(!running.is_stale(threshold, ts() + Duration::minutes(59)));
        assert!(running.is_stale(threshold, ts() + Duration::hours(1)));

        let pending = record(MigrationStatus::Pending);
        assert!(!pending.is_stale(threshold, ts() + Duration::hours(3)));
    }

    #[test]
    fn ownership_is_identifier_comparison_on_in_progress_records() {
        let running = record(MigrationStatus::InProgress);
        assert!(running.is_owned_by(&Owner::new("inst-1", "w-0")));
        assert!(!running.is_owned_by(&Owner::new("inst-1", "w-1")));

        let failed = record(MigrationStatus::Failed);
        assert!(!failed.is_owned_by(&Owner::new("inst-1", "w-0")));
    }
}
