use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use spacemig_core::SpaceKey;
use spacemig_storage::{EnsureOutcome, MigrationLedger};
use std::path::Path;
use tracing::info;

/// Spaces to migrate with their legacy upload listing and local shard records.
#[derive(Debug, Deserialize)]
pub struct SeedManifest {
    pub spaces: Vec<SeedSpace>,
}

#[derive(Debug, Deserialize)]
pub struct SeedSpace {
    pub customer: String,
    pub space: String,
    #[serde(default)]
    pub uploads: Vec<SeedUpload>,
    #[serde(default)]
    pub shards: Vec<SeedShard>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SeedUpload {
    Root(String),
    Detailed {
        root: String,
        #[serde(default)]
        inserted_at: Option<DateTime<Utc>>,
    },
}

impl SeedUpload {
    fn parts(&self) -> (&str, Option<DateTime<Utc>>) {
        match self {
            SeedUpload::Root(root) => (root, None),
            SeedUpload::Detailed { root, inserted_at } => (root, *inserted_at),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SeedShard {
    pub shard: String,
    pub size: u64,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub spaces_created: usize,
    pub spaces_existing: usize,
    pub totals_raised: usize,
    pub uploads_inserted: usize,
    pub shards_upserted: usize,
}

pub fn load_manifest(path: &Path) -> Result<SeedManifest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed manifest {}", path.display()))?;
    serde_json::from_str(&content).context("Failed to parse seed manifest")
}

/// Inserts inventory rows, then a `pending` record per space sized to its upload
/// count. Spaces already in the ledger keep their record; unfinished ones have their
/// total raised when the inventory grew.
pub fn apply_manifest(
    ledger: &MigrationLedger,
    manifest: &SeedManifest,
    now: DateTime<Utc>,
) -> Result<SeedReport> {
    let inventory = ledger.inventory();
    let mut report = SeedReport::default();

    for entry in &manifest.spaces {
        for upload in &entry.uploads {
            let (root, inserted_at) = upload.parts();
            if inventory.insert_upload(&entry.space, root, inserted_at)? {
                report.uploads_inserted += 1;
            }
        }
        for shard in &entry.shards {
            inventory.upsert_shard(&entry.space, &shard.shard, shard.size)?;
            report.shards_upserted += 1;
        }

        let key = SpaceKey::new(entry.customer.as_str(), entry.space.as_str());
        let total = inventory.upload_count(&entry.space)?;
        match ledger
            .ensure(&key, total, now)
            .with_context(|| format!("Failed to seed {key}"))?
        {
            EnsureOutcome::Created => report.spaces_created += 1,
            EnsureOutcome::TotalRaised => {
                report.spaces_existing += 1;
                report.totals_raised += 1;
            }
            EnsureOutcome::Unchanged => report.spaces_existing += 1,
        }
    }

    info!(
        created = report.spaces_created,
        existing = report.spaces_existing,
        raised = report.totals_raised,
        uploads = report.uploads_inserted,
        shards = report.shards_upserted,
        "ledger_seeded"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use spacemig_core::MigrationStatus;

    const MANIFEST: &str = r#"{
        "spaces": [
            {
                "customer": "did:mailto:example.com:alice",
                "space": "did:key:z6MkSpaceA",
                "uploads": ["bafyA1", {"root": "bafyA2", "inserted_at": "2026-01-05T10:00:00Z"}],
                "shards": [{"shard": "bagA1", "size": 1024}]
            },
            {"customer": "did:mailto:example.com:bob", "space": "did:key:z6MkSpaceB"}
        ]
    }"#;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn seeding_creates_pending_records_sized_to_uploads() {
        let ledger = MigrationLedger::open_in_memory().expect("ledger");
        let manifest: SeedManifest = serde_json::from_str(MANIFEST).expect("parse");
        let report = apply_manifest(&ledger, &manifest, ts()).expect("seed");
        assert_eq!(report.spaces_created, 2);
        assert_eq!(report.uploads_inserted, 2);
        assert_eq!(report.shards_upserted, 1);

        let record = ledger
            .get(&SpaceKey::new("did:mailto:example.com:alice", "did:key:z6MkSpaceA"))
            .expect("get")
            .expect("exists");
        assert_eq!(record.status, MigrationStatus::Pending);
        assert_eq!(record.total_uploads, 2);
    }

    #[test]
    fn reseeding_keeps_existing_records() {
        let ledger = MigrationLedger::open_in_memory().expect("ledger");
        let manifest: SeedManifest = serde_json::from_str(MANIFEST).expect("parse");
        apply_manifest(&ledger, &manifest, ts()).expect("seed");
        let again = apply_manifest(&ledger, &manifest, ts()).expect("reseed");
        assert_eq!(again.spaces_created, 0);
        assert_eq!(again.spaces_existing, 2);
        assert_eq!(again.uploads_inserted, 0);
        assert_eq!(again.totals_raised, 0);
    }

    #[test]
    fn reseeding_with_new_uploads_raises_the_total() {
        let ledger = MigrationLedger::open_in_memory().expect("ledger");
        let manifest: SeedManifest = serde_json::from_str(MANIFEST).expect("parse");
        apply_manifest(&ledger, &manifest, ts()).expect("seed");

        let grown: SeedManifest = serde_json::from_str(
            r#"{"spaces": [{
                "customer": "did:mailto:example.com:alice",
                "space": "did:key:z6MkSpaceA",
                "uploads": ["bafyA3"]
            }]}"#,
        )
        .expect("parse");
        let report = apply_manifest(&ledger, &grown, ts()).expect("reseed");
        assert_eq!(report.uploads_inserted, 1);
        assert_eq!(report.totals_raised, 1);

        let record = ledger
            .get(&SpaceKey::new("did:mailto:example.com:alice", "did:key:z6MkSpaceA"))
            .expect("get")
            .expect("exists");
        assert_eq!(record.total_uploads, 3);
    }
}
