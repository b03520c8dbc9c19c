use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use spacemig_claims::{ClaimResolver, SnapshotClaimsService};
use spacemig_core::{Owner, SystemClock};
use spacemig_reconcile::{ReconcileConfig, ShardReconciler};
use spacemig_runtime::{
    CoordinatorConfig, MigrationWorker, WorkCoordinator, WorkerConfig, WorkerTickReport,
};
use spacemig_storage::MigrationLedger;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkConfig {
    pub db: PathBuf,
    pub instance_id: String,
    pub workers: usize,
    pub batch_size: usize,
    pub upload_page_size: usize,
    pub heartbeat_interval: ChronoDuration,
    pub stale_after: ChronoDuration,
    pub retry_failed: bool,
    pub reconcile: ReconcileConfig,
    /// Zero exits once the ledger has no claimable work.
    pub poll_interval: Duration,
}

/// Runs `workers` migration workers, each on its own blocking thread and ledger
/// connection, until they go idle or `stop` is set. A failing worker sets `stop`;
/// the rest finish their current space before the first error is returned.
pub async fn run_workers(
    config: WorkConfig,
    claims: Arc<SnapshotClaimsService>,
    stop: Arc<AtomicBool>,
) -> Result<WorkerTickReport> {
    let mut handles = Vec::with_capacity(config.workers);
    for index in 0..config.workers.max(1) {
        let owner = Owner::new(config.instance_id.clone(), format!("w{index}"));
        let config = config.clone();
        let claims = claims.clone();
        handles.push(spawn_worker(stop.clone(), move |stop| {
            run_worker(&config, owner, claims, stop)
        }));
    }
    join_workers(handles, &stop).await
}

type WorkerHandle = JoinHandle<Result<WorkerTickReport>>;

fn spawn_worker<F>(stop: Arc<AtomicBool>, work: F) -> WorkerHandle
where
    F: FnOnce(&AtomicBool) -> Result<WorkerTickReport> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = work(&stop);
        if result.is_err() {
            stop.store(true, Ordering::Relaxed);
        }
        result
    })
}

async fn join_workers(handles: Vec<WorkerHandle>, stop: &AtomicBool) -> Result<WorkerTickReport> {
    let mut total = WorkerTickReport::default();
    let mut first_error = None;
    for handle in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(err) => {
                stop.store(true, Ordering::Relaxed);
                Err(anyhow::Error::new(err).context("worker task panicked"))
            }
        };
        match result {
            Ok(report) => total.absorb(&report),
            Err(err) => {
                error!(error = %format!("{err:#}"), "worker_failed");
                first_error.get_or_insert(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(total),
    }
}

fn run_worker(
    config: &WorkConfig,
    owner: Owner,
    claims: Arc<SnapshotClaimsService>,
    stop: &AtomicBool,
) -> Result<WorkerTickReport> {
    let ledger = MigrationLedger::open(&config.db)
        .with_context(|| format!("Failed to open ledger {}", config.db.display()))?;
    let inventory = ledger.inventory();

    let mut worker_config = WorkerConfig::for_owner(owner.clone());
    worker_config.batch_size = config.batch_size.max(1);
    worker_config.upload_page_size = config.upload_page_size.max(1);
    worker_config.heartbeat_interval = config.heartbeat_interval;
    let coordinator = WorkCoordinator::new(CoordinatorConfig {
        stale_after: config.stale_after,
        retry_failed: config.retry_failed,
        ..CoordinatorConfig::default()
    });
    let reconciler = ShardReconciler::new(ClaimResolver::new(claims), config.reconcile.clone());
    let worker = MigrationWorker::new(worker_config, coordinator, reconciler, SystemClock);

    info!(owner = %owner, "worker_started");
    let mut total = WorkerTickReport::default();
    loop {
        let report = worker
            .run_until_idle(&ledger, &inventory, &inventory, stop)
            .with_context(|| format!("Worker {owner} failed"))?;
        total.absorb(&report);

        if stop.load(Ordering::Relaxed) || config.poll_interval.is_zero() {
            break;
        }
        if !sleep_unless_stopped(config.poll_interval, stop) {
            break;
        }
    }

    if total.service_unavailable > 0 {
        warn!(
            owner = %owner,
            spaces = total.service_unavailable,
            "indexing_service_unavailable_failures"
        );
    }
    info!(
        owner = %owner,
        acquired = total.spaces_acquired,
        completed = total.spaces_completed,
        failed = total.spaces_failed,
        abandoned = total.spaces_abandoned,
        degraded_lookups = total.degraded_lookups,
        "worker_stopped"
    );
    Ok(total)
}

/// Returns false when `stop` was set during the wait.
fn sleep_unless_stopped(interval: Duration, stop: &AtomicBool) -> bool {
    let step = Duration::from_millis(200);
    let mut waited = Duration::ZERO;
    while waited < interval {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let chunk = step.min(interval - waited);
        std::thread::sleep(chunk);
        waited += chunk;
    }
    !stop.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use spacemig_claims::SnapshotEntry;
    use spacemig_core::{Claim, LocationClaim, MigrationStatus, SpaceKey};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn workers_drain_the_ledger_and_exit_when_idle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("ledger.db");
        let customer = "did:mailto:example.com:alice";
        let mut claims = SnapshotClaimsService::default();
        {
            let ledger = MigrationLedger::open(&db).expect("open ledger");
            let inventory = ledger.inventory();
            for index in 0..6 {
                let space = format!("did:key:space{index}");
                let root = format!("bafyroot{index}");
                inventory.insert_upload(&space, &root, None).expect("upload");
                ledger
                    .create(&SpaceKey::new(customer, space.as_str()), 1, Utc::now())
                    .expect("create");
                claims.insert(
                    root.as_str(),
                    SnapshotEntry {
                        claims: vec![Claim::Location(LocationClaim {
                            content: root.clone(),
                            space: Some(space.clone()),
                            provider: Some("did:web:new.example".to_string()),
                            location: vec![],
                            size: None,
                        })],
                        error: None,
                    },
                );
            }
        }

        let config = WorkConfig {
            db: db.clone(),
            instance_id: "inst-test".to_string(),
            workers: 3,
            batch_size: 1,
            upload_page_size: 10,
            heartbeat_interval: ChronoDuration::seconds(60),
            stale_after: ChronoDuration::hours(1),
            retry_failed: false,
            reconcile: ReconcileConfig::default(),
            poll_interval: Duration::ZERO,
        };
        let report = run_workers(config, Arc::new(claims), Arc::new(AtomicBool::new(false)))
            .await
            .expect("run workers");
        assert_eq!(report.spaces_completed, 6);
        assert_eq!(report.spaces_acquired, 6);

        let ledger = MigrationLedger::open(&db).expect("reopen ledger");
        for index in 0..6 {
            let record = ledger
                .get(&SpaceKey::new(customer, format!("did:key:space{index}")))
                .expect("get")
                .expect("exists");
            assert_eq!(record.status, MigrationStatus::Completed);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_worker_stops_and_joins_its_siblings() {
        let stop = Arc::new(AtomicBool::new(false));
        let sibling_done = Arc::new(AtomicBool::new(false));
        let done = sibling_done.clone();
        let handles = vec![
            spawn_worker(stop.clone(), move |stop| {
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(10));
                }
                done.store(true, Ordering::Relaxed);
                Ok(WorkerTickReport {
                    spaces_completed: 1,
                    ..WorkerTickReport::default()
                })
            }),
            spawn_worker(stop.clone(), |_| Err(anyhow::anyhow!("ledger unavailable"))),
        ];

        let err = join_workers(handles, &stop)
            .await
            .expect_err("worker error is returned");
        assert!(err.to_string().contains("ledger unavailable"));
        assert!(stop.load(Ordering::Relaxed));
        assert!(sibling_done.load(Ordering::Relaxed));
    }

    #[test]
    fn sleep_returns_early_on_stop() {
        let stop = AtomicBool::new(true);
        assert!(!sleep_unless_stopped(Duration::from_secs(30), &stop));
    }
}
