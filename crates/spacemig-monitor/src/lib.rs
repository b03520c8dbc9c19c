//! Read-only fleet statistics over the migration ledger.
//!
//! [`FleetAccumulator`] is an explicit value folded over ledger pages; nothing is
//! shared between runs, so concurrent `stats`/`watch` invocations cannot interfere.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;
use spacemig_core::{
    Attribution, ErrorKind, MigrationStatus, SpaceMigrationRecord, DEFAULT_STALE_AFTER_SECS,
};
use spacemig_storage::{
    AttributionConflictRecord, MigrationLedger, Page, PageRequest, StorageError,
};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MonitorError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub stuck_threshold: Duration,
    pub page_size: usize,
    /// Restrict the scan to one customer.
    pub customer: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            stuck_threshold: Duration::seconds(DEFAULT_STALE_AFTER_SECS),
            page_size: 500,
            customer: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    fn record(&mut self, status: MigrationStatus) {
        self.total += 1;
        match status {
            MigrationStatus::Pending => self.pending += 1,
            MigrationStatus::InProgress => self.in_progress += 1,
            MigrationStatus::Completed => self.completed += 1,
            MigrationStatus::Failed => self.failed += 1,
        }
    }

    pub fn percentages(&self) -> StatusPercentages {
        StatusPercentages {
            pending: percent(self.pending, self.total),
            in_progress: percent(self.in_progress, self.total),
            completed: percent(self.completed, self.total),
            failed: percent(self.failed, self.total),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatusPercentages {
    pub pending: f64,
    pub in_progress: f64,
    pub completed: f64,
    pub failed: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UploadProgress {
    pub total: u64,
    pub completed: u64,
    pub percent: f64,
}

/// Spaces grouped by current or last owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnerStats {
    pub owner: String,
    pub spaces: StatusCounts,
    pub completed_uploads: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StuckRecord {
    pub customer: String,
    pub space: String,
    pub instance_id: Option<String>,
    pub worker_id: Option<String>,
    pub updated_at: String,
    pub age_secs: i64,
    pub completed_uploads: u64,
    pub total_uploads: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRecord {
    pub customer: String,
    pub space: String,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub attempts: u32,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictDigest {
    pub digest: String,
    pub attributions: Vec<Attribution>,
    pub observed_at: String,
}

/// Every digest with competing owners inside one (customer, space).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpaceConflicts {
    pub customer: String,
    pub space: String,
    pub digests: Vec<ConflictDigest>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetStats {
    pub generated_at: String,
    pub stuck_threshold_secs: i64,
    pub spaces: StatusCounts,
    pub percentages: StatusPercentages,
    pub uploads: UploadProgress,
    pub instances: Vec<OwnerStats>,
    pub workers: Vec<OwnerStats>,
    pub stuck: Vec<StuckRecord>,
    pub failed: Vec<FailedRecord>,
    pub failures_by_kind: BTreeMap<String, u64>,
    pub attribution_conflicts: Vec<SpaceConflicts>,
}

#[derive(Debug, Default, Clone)]
struct OwnerTally {
    spaces: StatusCounts,
    completed_uploads: u64,
}

#[derive(Debug, Clone)]
pub struct FleetAccumulator {
    now: DateTime<Utc>,
    stuck_threshold: Duration,
    spaces: StatusCounts,
    total_uploads: u64,
    completed_uploads: u64,
    instances: BTreeMap<String, OwnerTally>,
    workers: BTreeMap<String, OwnerTally>,
    stuck: Vec<StuckRecord>,
    failed: Vec<FailedRecord>,
    failures_by_kind: BTreeMap<String, u64>,
    conflicts: BTreeMap<(String, String), Vec<ConflictDigest>>,
}

impl FleetAccumulator {
    pub fn new(stuck_threshold: Duration, now: DateTime<Utc>) -> Self {
        Self {
            now,
            stuck_threshold,
            spaces: StatusCounts::default(),
            total_uploads: 0,
            completed_uploads: 0,
            instances: BTreeMap::new(),
            workers: BTreeMap::new(),
            stuck: Vec::new(),
            failed: Vec::new(),
            failures_by_kind: BTreeMap::new(),
            conflicts: BTreeMap::new(),
        }
    }

    pub fn observe(&mut self, record: &SpaceMigrationRecord) {
        self.spaces.record(record.status);
        self.total_uploads += record.total_uploads;
        self.completed_uploads += record.completed_uploads;

        if let Some(owner) = record.owner() {
            for (map, label) in [
                (&mut self.instances, owner.instance_id.clone()),
                (&mut self.workers, owner.to_string()),
            ] {
                let tally = map.entry(label).or_default();
                tally.spaces.record(record.status);
                tally.completed_uploads += record.completed_uploads;
            }
        }

        if record.is_stale(self.stuck_threshold, self.now) {
            self.stuck.push(StuckRecord {
                customer: record.customer.clone(),
                space: record.space.clone(),
                instance_id: record.instance_id.clone(),
                worker_id: record.worker_id.clone(),
                updated_at: timestamp(record.updated_at),
                age_secs: record.age(self.now).num_seconds(),
                completed_uploads: record.completed_uploads,
                total_uploads: record.total_uploads,
            });
        }

        if record.status == MigrationStatus::Failed {
            let kind = record
                .error_kind
                .map(|kind| kind.as_str())
                .unwrap_or("unknown");
            *self.failures_by_kind.entry(kind.to_string()).or_default() += 1;
            self.failed.push(FailedRecord {
                customer: record.customer.clone(),
                space: record.space.clone(),
                error_kind: record.error_kind,
                error: record.error.clone(),
                attempts: record.attempts,
                updated_at: timestamp(record.updated_at),
            });
        }
    }

    pub fn observe_conflict(&mut self, conflict: &AttributionConflictRecord) {
        self.conflicts
            .entry((conflict.customer.clone(), conflict.space.clone()))
            .or_default()
            .push(ConflictDigest {
                digest: conflict.digest.clone(),
                attributions: conflict.attributions.clone(),
                observed_at: timestamp(conflict.observed_at),
            });
    }

    pub fn observe_page(&mut self, page: &Page<SpaceMigrationRecord>) {
        for record in &page.items {
            self.observe(record);
        }
    }

    pub fn finish(self) -> FleetStats {
        let mut stuck = self.stuck;
        stuck.sort_by(|a, b| {
            b.age_secs
                .cmp(&a.age_secs)
                .then_with(|| (&a.customer, &a.space).cmp(&(&b.customer, &b.space)))
        });
        let mut failed = self.failed;
        failed.sort_by(|a, b| (&a.customer, &a.space).cmp(&(&b.customer, &b.space)));

        FleetStats {
            generated_at: timestamp(self.now),
            stuck_threshold_secs: self.stuck_threshold.num_seconds(),
            spaces: self.spaces,
            percentages: self.spaces.percentages(),
            uploads: UploadProgress {
                total: self.total_uploads,
                completed: self.completed_uploads,
                percent: percent(self.completed_uploads, self.total_uploads),
            },
            instances: owner_stats(self.instances),
            workers: owner_stats(self.workers),
            stuck,
            failed,
            failures_by_kind: self.failures_by_kind,
            attribution_conflicts: self
                .conflicts
                .into_iter()
                .map(|((customer, space), mut digests)| {
                    digests.sort_by(|a, b| a.digest.cmp(&b.digest));
                    SpaceConflicts {
                        customer,
                        space,
                        digests,
                    }
                })
                .collect(),
        }
    }
}

/// Scans the whole ledger (or one customer) page by page and reduces it.
pub fn collect_fleet_stats(
    ledger: &MigrationLedger,
    config: &MonitorConfig,
    now: DateTime<Utc>,
) -> Result<FleetStats, MonitorError> {
    let page_size = config.page_size.max(1);
    let mut acc = FleetAccumulator::new(config.stuck_threshold, now);

    let mut request = PageRequest::first(page_size);
    let mut pages = 0usize;
    loop {
        let page = match &config.customer {
            Some(customer) => ledger.scan_by_customer(customer, &request)?,
            None => ledger.scan_all(&request)?,
        };
        pages += 1;
        acc.observe_page(&page);
        match page.next_request(page_size) {
            Some(next) => request = next,
            None => break,
        }
    }

    let mut request = PageRequest::first(page_size);
    loop {
        let page = ledger.scan_attribution_conflicts(&request)?;
        for conflict in &page.items {
            if config
                .customer
                .as_deref()
                .is_some_and(|customer| customer != conflict.customer)
            {
                continue;
            }
            acc.observe_conflict(conflict);
        }
        match page.next_request(page_size) {
            Some(next) => request = next,
            None => break,
        }
    }

    debug!(pages, page_size, "fleet_stats_collected");
    Ok(acc.finish())
}

pub fn render_json(stats: &FleetStats) -> Result<String, MonitorError> {
    Ok(serde_json::to_string_pretty(stats)?)
}

pub fn render_text(stats: &FleetStats) -> String {
    let mut out = String::new();
    let spaces = &stats.spaces;
    let pct = &stats.percentages;

    let _ = writeln!(out, "Space migration status at {}", stats.generated_at);
    let _ = writeln!(out, "Spaces: {}", spaces.total);
    for (label, count, share) in [
        ("completed", spaces.completed, pct.completed),
        ("in-progress", spaces.in_progress, pct.in_progress),
        ("pending", spaces.pending, pct.pending),
        ("failed", spaces.failed, pct.failed),
    ] {
        let _ = writeln!(out, "  {label:<12} {count:>8} ({share:.1}%)");
    }
    let _ = writeln!(
        out,
        "Uploads: {}/{} verified ({:.1}%)",
        stats.uploads.completed, stats.uploads.total, stats.uploads.percent
    );

    if !stats.instances.is_empty() {
        let _ = writeln!(out, "\nBy instance:");
        render_owners(&mut out, &stats.instances);
    }
    if !stats.workers.is_empty() {
        let _ = writeln!(out, "\nBy worker:");
        render_owners(&mut out, &stats.workers);
    }

    if !stats.stuck.is_empty() {
        let _ = writeln!(
            out,
            "\nStuck (no update for >= {}s): {}",
            stats.stuck_threshold_secs,
            stats.stuck.len()
        );
        for record in &stats.stuck {
            let _ = writeln!(
                out,
                "  {}/{} owner={}:{} last_update={} age={}s progress={}/{}",
                record.customer,
                record.space,
                record.instance_id.as_deref().unwrap_or("-"),
                record.worker_id.as_deref().unwrap_or("-"),
                record.updated_at,
                record.age_secs,
                record.completed_uploads,
                record.total_uploads
            );
        }
    }

    if !stats.failed.is_empty() {
        let _ = writeln!(out, "\nFailed: {}", stats.failed.len());
        for (kind, count) in &stats.failures_by_kind {
            let _ = writeln!(out, "  {kind:<30} {count:>6}");
        }
        for record in &stats.failed {
            let _ = writeln!(
                out,
                "  {}/{} [{}] attempts={} {}",
                record.customer,
                record.space,
                record.error_kind.map(|kind| kind.as_str()).unwrap_or("unknown"),
                record.attempts,
                record.error.as_deref().unwrap_or("")
            );
        }
    }

    if !stats.attribution_conflicts.is_empty() {
        let _ = writeln!(
            out,
            "\nProvider attribution conflicts: {} spaces",
            stats.attribution_conflicts.len()
        );
        for group in &stats.attribution_conflicts {
            let _ = writeln!(
                out,
                "  {}/{}: {} digests",
                group.customer,
                group.space,
                group.digests.len()
            );
            for conflict in &group.digests {
                let owners: Vec<String> = conflict
                    .attributions
                    .iter()
                    .map(|attribution| {
                        format!(
                            "{}@{}",
                            attribution.provider.as_deref().unwrap_or("-"),
                            attribution.space.as_deref().unwrap_or("-")
                        )
                    })
                    .collect();
                let _ = writeln!(out, "    {} {}", conflict.digest, owners.join(" "));
            }
        }
    }

    out
}

fn render_owners(out: &mut String, owners: &[OwnerStats]) {
    for owner in owners {
        let _ = writeln!(
            out,
            "  {:<40} total={} in-progress={} completed={} failed={} uploads={}",
            owner.owner,
            owner.spaces.total,
            owner.spaces.in_progress,
            owner.spaces.completed,
            owner.spaces.failed,
            owner.completed_uploads
        );
    }
}

fn owner_stats(map: BTreeMap<String, OwnerTally>) -> Vec<OwnerStats> {
    map.into_iter()
        .map(|(owner, tally)| OwnerStats {
            owner,
            spaces: tally.spaces,
            completed_uploads: tally.completed_uploads,
        })
        .collect()
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / whole as f64
}

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use spacemig_core::{Owner, SpaceKey};

    const CUSTOMER: &str = "did:mailto:example.com:alice";

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn key(space: &str) -> SpaceKey {
        SpaceKey::new(CUSTOMER, space)
    }

    /// s1 completed, s2 failed, s3 stuck, s4 fresh in-progress, s5 pending, plus one
    /// record for a second customer.
    fn fleet() -> MigrationLedger {
        let ledger = MigrationLedger::open_in_memory().expect("open ledger");
        for (space, total) in [("s1", 4), ("s2", 2), ("s3", 5), ("s4", 1), ("s5", 3)] {
            ledger.create(&key(space), total, ts()).expect("create");
        }
        ledger
            .create(&SpaceKey::new("did:mailto:example.com:bob", "b1"), 10, ts())
            .expect("create");

        let w0 = Owner::new("inst-a", "w0");
        let w1 = Owner::new("inst-a", "w1");
        let w2 = Owner::new("inst-b", "w0");

        ledger.claim(&key("s1"), &w0, ts()).expect("claim s1");
        ledger
            .record_progress(&key("s1"), &w0, 4, Some("bafy4"), ts())
            .expect("progress s1");
        ledger.complete(&key("s1"), &w0, ts()).expect("complete s1");

        ledger.claim(&key("s2"), &w1, ts()).expect("claim s2");
        ledger
            .fail(
                &key("s2"),
                &w1,
                ErrorKind::IndexingServiceUnavailable,
                "indexing service unavailable for bafy2: 503",
                ts(),
            )
            .expect("fail s2");

        ledger.claim(&key("s3"), &w2, ts()).expect("claim s3");
        ledger
            .record_progress(&key("s3"), &w2, 2, Some("bafy2"), ts())
            .expect("progress s3");

        ledger
            .claim(&key("s4"), &w0, ts() + Duration::minutes(90))
            .expect("claim s4");

        ledger
            .record_attribution_conflict(&AttributionConflictRecord {
                customer: CUSTOMER.to_string(),
                space: "s1".to_string(),
                digest: "bagshard".to_string(),
                attributions: vec![
                    Attribution {
                        provider: Some("did:web:legacy".to_string()),
                        space: Some("did:key:old".to_string()),
                    },
                    Attribution {
                        provider: Some("did:web:new".to_string()),
                        space: Some("s1".to_string()),
                    },
                ],
                observed_at: ts(),
            })
            .expect("conflict");
        ledger
    }

    fn now() -> DateTime<Utc> {
        ts() + Duration::minutes(100)
    }

    #[test]
    fn counts_percentages_and_uploads() {
        let ledger = fleet();
        let stats =
            collect_fleet_stats(&ledger, &MonitorConfig::default(), now()).expect("collect");

        assert_eq!(
            stats.spaces,
            StatusCounts {
                total: 6,
                pending: 2,
                in_progress: 2,
                completed: 1,
                failed: 1,
            }
        );
        assert!((stats.percentages.pending - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.uploads.total, 25);
        assert_eq!(stats.uploads.completed, 6);
        assert!((stats.uploads.percent - 24.0).abs() < 1e-9);
    }

    #[test]
    fn owner_breakdowns_group_by_instance_and_worker() {
        let ledger = fleet();
        let stats =
            collect_fleet_stats(&ledger, &MonitorConfig::default(), now()).expect("collect");

        let instances: Vec<_> = stats
            .instances
            .iter()
            .map(|o| (o.owner.as_str(), o.spaces.total))
            .collect();
        assert_eq!(instances, vec![("inst-a", 3), ("inst-b", 1)]);

        let workers: Vec<_> = stats.workers.iter().map(|o| o.owner.as_str()).collect();
        assert_eq!(workers, vec!["inst-a:w0", "inst-a:w1", "inst-b:w0"]);
        assert_eq!(stats.workers[0].spaces.completed, 1);
        assert_eq!(stats.workers[0].spaces.in_progress, 1);
        assert_eq!(stats.workers[0].completed_uploads, 4);
    }

    #[test]
    fn stuck_failed_and_conflicts_are_listed() {
        let ledger = fleet();
        let stats =
            collect_fleet_stats(&ledger, &MonitorConfig::default(), now()).expect("collect");

        assert_eq!(stats.stuck.len(), 1);
        assert_eq!(stats.stuck[0].space, "s3");
        assert_eq!(stats.stuck[0].age_secs, 100 * 60);

        assert_eq!(stats.failed.len(), 1);
        assert_eq!(
            stats.failed[0].error.as_deref(),
            Some("indexing service unavailable for bafy2: 503")
        );
        assert_eq!(
            stats.failures_by_kind.get("indexing-service-unavailable"),
            Some(&1)
        );

        assert_eq!(stats.attribution_conflicts.len(), 1);
        assert_eq!(stats.attribution_conflicts[0].space, "s1");
        assert_eq!(stats.attribution_conflicts[0].digests[0].attributions.len(), 2);
    }

    #[test]
    fn paged_scan_matches_single_page() {
        let ledger = fleet();
        let single = collect_fleet_stats(
            &ledger,
            &MonitorConfig {
                page_size: 1_000,
                ..MonitorConfig::default()
            },
            now(),
        )
        .expect("single page");
        let paged = collect_fleet_stats(
            &ledger,
            &MonitorConfig {
                page_size: 1,
                ..MonitorConfig::default()
            },
            now(),
        )
        .expect("paged");
        assert_eq!(single, paged);
    }

    #[test]
    fn rerunning_is_side_effect_free() {
        let ledger = fleet();
        let first =
            collect_fleet_stats(&ledger, &MonitorConfig::default(), now()).expect("first");
        let second =
            collect_fleet_stats(&ledger, &MonitorConfig::default(), now()).expect("second");
        assert_eq!(first, second);
        let s3 = ledger.get(&key("s3")).expect("get").expect("exists");
        assert_eq!(s3.status, MigrationStatus::InProgress);
    }

    #[test]
    fn customer_filter_limits_scan() {
        let ledger = fleet();
        let stats = collect_fleet_stats(
            &ledger,
            &MonitorConfig {
                customer: Some("did:mailto:example.com:bob".to_string()),
                ..MonitorConfig::default()
            },
            now(),
        )
        .expect("collect");
        assert_eq!(stats.spaces.total, 1);
        assert_eq!(stats.spaces.pending, 1);
        assert!(stats.attribution_conflicts.is_empty());
    }

    #[test]
    fn empty_ledger_reports_zero_percentages() {
        let ledger = MigrationLedger::open_in_memory().expect("open ledger");
        let stats =
            collect_fleet_stats(&ledger, &MonitorConfig::default(), ts()).expect("collect");
        assert_eq!(stats.spaces.total, 0);
        assert_eq!(stats.uploads.percent, 0.0);
        assert!(render_text(&stats).contains("Spaces: 0"));
    }

    #[test]
    fn text_and_json_rendering() {
        let ledger = fleet();
        let stats =
            collect_fleet_stats(&ledger, &MonitorConfig::default(), now()).expect("collect");

        let text = render_text(&stats);
        assert!(text.contains("Spaces: 6"));
        assert!(text.contains("Uploads: 6/25 verified (24.0%)"));
        assert!(text.contains("Stuck (no update for >= 3600s): 1"));
        assert!(text.contains("[indexing-service-unavailable]"));
        assert!(text.contains("did:web:legacy@did:key:old"));

        let json = render_json(&stats).expect("json");
        let value: serde_json::Value = serde_json::from_str(&json).expect("parse json");
        assert_eq!(value["spaces"]["failed"], 1);
        assert_eq!(value["failed"][0]["error_kind"], "indexing-service-unavailable");
    }
}
