use crate::coordinator::WorkCoordinator;
use chrono::{DateTime, Duration, Utc};
use spacemig_claims::ClaimsService;
use spacemig_core::{
    Clock, ErrorKind, Owner, ShardRecords, SpaceKey, SpaceMigrationRecord, UploadSource,
};
use spacemig_reconcile::{ReconcileError, ReconcileOutcome, ShardReconciler};
use spacemig_storage::{AttributionConflictRecord, LedgerError, MigrationLedger};
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub owner: Owner,
    pub batch_size: usize,
    pub upload_page_size: usize,
    pub heartbeat_interval: Duration,
    /// Missing shard digests quoted in a `verification-incomplete` error.
    pub max_reported_missing: usize,
}

impl WorkerConfig {
    pub fn for_owner(owner: Owner) -> Self {
        Self {
            owner,
            batch_size: 1,
            upload_page_size: 100,
            heartbeat_interval: Duration::seconds(60),
            max_reported_missing: 10,
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpaceOutcome {
    Completed,
    Failed { kind: ErrorKind, error: String },
    /// Ownership was lost mid-run; the record now belongs to someone else.
    Abandoned { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceReport {
    pub key: SpaceKey,
    pub uploads_checked: u64,
    pub uploads_verified: u64,
    pub uploads_pending_republish: u64,
    pub degraded_lookups: u64,
    pub attribution_conflicts: u64,
    pub outcome: SpaceOutcome,
}

impl SpaceReport {
    fn new(key: SpaceKey) -> Self {
        Self {
            key,
            uploads_checked: 0,
            uploads_verified: 0,
            uploads_pending_republish: 0,
            degraded_lookups: 0,
            attribution_conflicts: 0,
            outcome: SpaceOutcome::Completed,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerTickReport {
    pub spaces_acquired: usize,
    pub spaces_completed: usize,
    pub spaces_failed: usize,
    pub spaces_abandoned: usize,
    pub uploads_verified: u64,
    pub uploads_pending_republish: u64,
    pub degraded_lookups: u64,
    pub service_unavailable: u64,
    pub attribution_conflicts: u64,
}

impl WorkerTickReport {
    fn record_space(&mut self, space: &SpaceReport) {
        self.uploads_verified += space.uploads_verified;
        self.uploads_pending_republish += space.uploads_pending_republish;
        self.degraded_lookups += space.degraded_lookups;
        self.attribution_conflicts += space.attribution_conflicts;
        match &space.outcome {
            SpaceOutcome::Completed => self.spaces_completed += 1,
            SpaceOutcome::Failed { kind, .. } => {
                self.spaces_failed += 1;
                if *kind == ErrorKind::IndexingServiceUnavailable {
                    self.service_unavailable += 1;
                }
            }
            SpaceOutcome::Abandoned { .. } => self.spaces_abandoned += 1,
        }
    }

    pub fn absorb(&mut self, other: &WorkerTickReport) {
        self.spaces_acquired += other.spaces_acquired;
        self.spaces_completed += other.spaces_completed;
        self.spaces_failed += other.spaces_failed;
        self.spaces_abandoned += other.spaces_abandoned;
        self.uploads_verified += other.uploads_verified;
        self.uploads_pending_republish += other.uploads_pending_republish;
        self.degraded_lookups += other.degraded_lookups;
        self.service_unavailable += other.service_unavailable;
        self.attribution_conflicts += other.attribution_conflicts;
    }
}

/// Per-space progress carried through one processing pass.
struct Pass<'a> {
    key: SpaceKey,
    space: &'a str,
    completed: u64,
    cursor: Option<String>,
    verified_prefix: bool,
    missing: Vec<String>,
    last_heartbeat: DateTime<Utc>,
    report: SpaceReport,
}

pub struct MigrationWorker<S, C> {
    config: WorkerConfig,
    coordinator: WorkCoordinator,
    reconciler: ShardReconciler<S>,
    clock: C,
}

impl<S: ClaimsService, C: Clock> MigrationWorker<S, C> {
    pub fn new(
        config: WorkerConfig,
        coordinator: WorkCoordinator,
        reconciler: ShardReconciler<S>,
        clock: C,
    ) -> Self {
        Self {
            config,
            coordinator,
            reconciler,
            clock,
        }
    }

    pub fn owner(&self) -> &Owner {
        &self.config.owner
    }

    /// Acquires one batch and drives every space in it to a terminal state or
    /// abandons it when the claim is lost.
    pub fn run_once<U, R>(
        &self,
        ledger: &MigrationLedger,
        uploads: &U,
        shards: &R,
    ) -> Result<WorkerTickReport, WorkerError>
    where
        U: UploadSource + ?Sized,
        R: ShardRecords + ?Sized,
    {
        let mut report = WorkerTickReport::default();
        let owner = &self.config.owner;
        let acquired = self.coordinator.acquire_work(
            ledger,
            owner,
            self.config.batch_size.max(1),
            self.clock.now(),
        )?;
        report.spaces_acquired = acquired.len();

        let mut queue: VecDeque<SpaceMigrationRecord> = acquired.into();
        while let Some(record) = queue.pop_front() {
            let space = self.process_space(ledger, uploads, shards, &record)?;
            report.record_space(&space);

            let now = self.clock.now();
            let mut held = VecDeque::with_capacity(queue.len());
            for waiting in queue.drain(..) {
                match ledger.heartbeat(&waiting.key(), owner, now) {
                    Ok(()) => held.push_back(waiting),
                    Err(err) if err.is_ownership_lost() => {
                        warn!(key = %waiting.key(), owner = %owner, "queued_claim_lost");
                        report.spaces_abandoned += 1;
                    }
                    Err(err) => {
                        warn!(key = %waiting.key(), owner = %owner, error = %err, "queued_heartbeat_failed");
                        held.push_back(waiting);
                    }
                }
            }
            queue = held;
        }

        Ok(report)
    }

    /// Repeats [`run_once`](Self::run_once) until a tick acquires nothing or `stop` is set.
    pub fn run_until_idle<U, R>(
        &self,
        ledger: &MigrationLedger,
        uploads: &U,
        shards: &R,
        stop: &AtomicBool,
    ) -> Result<WorkerTickReport, WorkerError>
    where
        U: UploadSource + ?Sized,
        R: ShardRecords + ?Sized,
    {
        let mut total = WorkerTickReport::default();
        while !stop.load(Ordering::Relaxed) {
            let tick = self.run_once(ledger, uploads, shards)?;
            total.absorb(&tick);
            if tick.spaces_acquired == 0 {
                break;
            }
        }
        Ok(total)
    }

    pub fn process_space<U, R>(
        &self,
        ledger: &MigrationLedger,
        uploads: &U,
        shards: &R,
        record: &SpaceMigrationRecord,
    ) -> Result<SpaceReport, WorkerError>
    where
        U: UploadSource + ?Sized,
        R: ShardRecords + ?Sized,
    {
        let mut pass = Pass {
            key: record.key(),
            space: &record.space,
            completed: record.completed_uploads,
            cursor: record.last_processed_upload.clone(),
            verified_prefix: true,
            missing: Vec::new(),
            last_heartbeat: self.clock.now(),
            report: SpaceReport::new(record.key()),
        };
        info!(
            key = %pass.key,
            owner = %self.config.owner,
            completed = pass.completed,
            total = record.total_uploads,
            cursor = pass.cursor.as_deref().unwrap_or("-"),
            "space_processing_started"
        );

        let mut scan_cursor = pass.cursor.clone();
        loop {
            let page = match uploads.uploads_after(
                pass.space,
                scan_cursor.as_deref(),
                self.config.upload_page_size.max(1),
            ) {
                Ok(page) => page,
                Err(err) => {
                    return self.fail_space(ledger, pass, ErrorKind::Internal, err.to_string());
                }
            };
            if page.is_empty() {
                break;
            }

            for upload in page {
                scan_cursor = Some(upload.root.clone());
                pass.report.uploads_checked += 1;

                let space = pass.space;
                let mut heartbeat_error = None;
                let result = self.reconciler.reconcile_with(shards, &upload.root, space, |_| {
                    match self.heartbeat_if_due(ledger, &pass.key, &mut pass.last_heartbeat) {
                        Ok(()) => ControlFlow::Continue(()),
                        Err(err) => {
                            heartbeat_error = Some(err);
                            ControlFlow::Break(())
                        }
                    }
                });
                if let Some(err) = heartbeat_error {
                    return self.handle_ledger_error(ledger, pass, err);
                }
                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(err @ ReconcileError::Resolve(_)) => {
                        let kind = err.kind();
                        return self.fail_space(ledger, pass, kind, err.to_string());
                    }
                    Err(err) => {
                        return self.fail_space(ledger, pass, ErrorKind::Internal, err.to_string());
                    }
                };

                if let Err(err) = self.record_conflicts(ledger, &mut pass, &outcome) {
                    return self.handle_ledger_error(ledger, pass, err);
                }
                pass.report.degraded_lookups += outcome.degraded_lookups as u64;

                if outcome.is_verified() {
                    pass.report.uploads_verified += 1;
                    if pass.verified_prefix {
                        pass.completed += 1;
                        pass.cursor = Some(upload.root.clone());
                        let now = self.clock.now();
                        if let Err(err) = ledger.record_progress(
                            &pass.key,
                            &self.config.owner,
                            pass.completed,
                            pass.cursor.as_deref(),
                            now,
                        ) {
                            return self.handle_ledger_error(ledger, pass, err);
                        }
                        pass.last_heartbeat = now;
                    }
                } else {
                    pass.report.uploads_pending_republish += 1;
                    pass.verified_prefix = false;
                    pass.missing.extend(outcome.missing().iter().cloned());
                }

                if let Err(err) = self.heartbeat_if_due(ledger, &pass.key, &mut pass.last_heartbeat)
                {
                    return self.handle_ledger_error(ledger, pass, err);
                }
            }
        }

        if pass.report.uploads_pending_republish > 0 {
            let error = self.incomplete_message(&pass);
            return self.fail_space(ledger, pass, ErrorKind::VerificationIncomplete, error);
        }

        match ledger.complete(&pass.key, &self.config.owner, self.clock.now()) {
            Ok(()) => {
                pass.report.outcome = SpaceOutcome::Completed;
                Ok(pass.report)
            }
            Err(err) => self.handle_ledger_error(ledger, pass, err),
        }
    }

    fn heartbeat_if_due(
        &self,
        ledger: &MigrationLedger,
        key: &SpaceKey,
        last_heartbeat: &mut DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let now = self.clock.now();
        if now - *last_heartbeat >= self.config.heartbeat_interval {
            ledger.heartbeat(key, &self.config.owner, now)?;
            *last_heartbeat = now;
        }
        Ok(())
    }

    fn record_conflicts(
        &self,
        ledger: &MigrationLedger,
        pass: &mut Pass<'_>,
        outcome: &ReconcileOutcome,
    ) -> Result<(), LedgerError> {
        for conflict in &outcome.attribution_conflicts {
            warn!(
                key = %pass.key,
                root = %outcome.root,
                digest = %conflict.digest,
                owners = conflict.attributions.len(),
                "provider_attribution_conflict"
            );
            ledger
                .record_attribution_conflict(&AttributionConflictRecord {
                    customer: pass.key.customer.clone(),
                    space: pass.key.space.clone(),
                    digest: conflict.digest.clone(),
                    attributions: conflict.attributions.clone(),
                    observed_at: self.clock.now(),
                })?;
            pass.report.attribution_conflicts += 1;
        }
        Ok(())
    }

    fn incomplete_message(&self, pass: &Pass<'_>) -> String {
        let shown: Vec<&str> = pass
            .missing
            .iter()
            .take(self.config.max_reported_missing)
            .map(String::as_str)
            .collect();
        let hidden = pass.missing.len().saturating_sub(shown.len());
        let mut message = format!(
            "{} of {} uploads pending republish; missing shards: {}",
            pass.report.uploads_pending_republish,
            pass.report.uploads_checked,
            shown.join(", ")
        );
        if hidden > 0 {
            message.push_str(&format!(" (+{hidden} more)"));
        }
        message
    }

    fn fail_space(
        &self,
        ledger: &MigrationLedger,
        mut pass: Pass<'_>,
        kind: ErrorKind,
        error: String,
    ) -> Result<SpaceReport, WorkerError> {
        match ledger.fail(&pass.key, &self.config.owner, kind, &error, self.clock.now()) {
            Ok(()) => {
                pass.report.outcome = SpaceOutcome::Failed { kind, error };
                Ok(pass.report)
            }
            Err(err) if err.is_ownership_lost() => {
                warn!(key = %pass.key, owner = %self.config.owner, error = %err, "space_abandoned");
                pass.report.outcome = SpaceOutcome::Abandoned {
                    reason: err.to_string(),
                };
                Ok(pass.report)
            }
            Err(err) => {
                error!(
                    key = %pass.key,
                    owner = %self.config.owner,
                    kind = %kind,
                    error = %err,
                    "space_fail_not_recorded"
                );
                Err(err.into())
            }
        }
    }

    fn handle_ledger_error(
        &self,
        ledger: &MigrationLedger,
        mut pass: Pass<'_>,
        err: LedgerError,
    ) -> Result<SpaceReport, WorkerError> {
        match err {
            LedgerError::Conflict { .. } | LedgerError::NotOwner { .. } => {
                warn!(key = %pass.key, owner = %self.config.owner, error = %err, "space_abandoned");
                pass.report.outcome = SpaceOutcome::Abandoned {
                    reason: err.to_string(),
                };
                Ok(pass.report)
            }
            LedgerError::Storage(_) => {
                warn!(key = %pass.key, owner = %self.config.owner, error = %err, "ledger_write_failed");
                self.fail_space(ledger, pass, ErrorKind::Internal, err.to_string())
            }
            other => {
                let kind = other.kind();
                self.fail_space(ledger, pass, kind, other.to_string())
            }
        }
    }
}
