use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Args, Parser, Subcommand};
use spacemig_claims::SnapshotClaimsService;
use spacemig_core::{Owner, SpaceKey, SpaceMigrationRecord};
use spacemig_monitor::{collect_fleet_stats, render_json, render_text, MonitorConfig};
use spacemig_reconcile::ReconcileConfig;
use spacemig_runtime::{CoordinatorConfig, WorkCoordinator};
use spacemig_storage::{MigrationLedger, Page, PageRequest, StorageError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

mod logging;
mod seed;
mod work;

const PAGE_SIZE: usize = 200;

#[derive(Parser, Debug)]
#[command(name = "spacemig")]
#[command(about = "Space migration orchestration and verification", long_about = None)]
struct Cli {
    /// SQLite ledger file.
    #[arg(long, env = "SPACEMIG_DB", default_value = "spacemig.db", global = true)]
    db: PathBuf,
    #[arg(
        long,
        env = "SPACEMIG_DEBUG",
        value_parser = clap::builder::BoolishValueParser::new(),
        global = true
    )]
    debug: bool,
    #[arg(long, env = "SPACEMIG_LOG_DIR", default_value = "", global = true)]
    log_dir: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Load spaces, uploads and shard records from a JSON manifest
    Seed { manifest: PathBuf },
    /// Claim and migrate spaces
    Work(WorkArgs),
    /// Fleet statistics
    Stats(StatsArgs),
    /// Re-print fleet statistics on an interval until Ctrl-C
    Watch(WatchArgs),
    /// Show one record
    Show(KeyArgs),
    /// List in-progress records with no recent update
    Stuck(ThresholdArgs),
    /// List failed records with their error text
    Failed,
    /// Return stuck records to pending
    ResetStuck(ThresholdArgs),
    /// Move failed records back to pending
    RetryFailed(RetryArgs),
    /// Give up a claim held by a crashed worker
    Release(ReleaseArgs),
}

#[derive(Args, Debug)]
struct WorkArgs {
    /// JSON claims snapshot keyed by digest.
    #[arg(long, env = "SPACEMIG_CLAIMS")]
    claims: PathBuf,
    #[arg(long, env = "SPACEMIG_INSTANCE_ID")]
    instance_id: Option<String>,
    #[arg(long, env = "SPACEMIG_WORKERS", default_value_t = 1)]
    workers: usize,
    #[arg(long, default_value_t = 1)]
    batch_size: usize,
    #[arg(long, default_value_t = 100)]
    upload_page_size: usize,
    #[arg(long, default_value_t = 60)]
    heartbeat_secs: i64,
    #[arg(long, default_value_t = 3600)]
    stale_after_secs: i64,
    #[arg(long, default_value_t = false)]
    retry_failed: bool,
    /// Require target-space attribution even for legacy index shards.
    #[arg(long, default_value_t = false)]
    strict_attribution: bool,
    /// Seconds between acquisition passes; 0 exits when idle.
    #[arg(long, default_value_t = 0)]
    poll_secs: u64,
}

#[derive(Args, Debug)]
struct StatsArgs {
    #[arg(long, default_value_t = false)]
    json: bool,
    #[arg(long, default_value_t = 3600)]
    stuck_threshold_secs: i64,
    #[arg(long)]
    customer: Option<String>,
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[command(flatten)]
    stats: StatsArgs,
    #[arg(long, default_value_t = 30)]
    interval_secs: u64,
}

#[derive(Args, Debug)]
struct KeyArgs {
    #[arg(long)]
    customer: String,
    #[arg(long)]
    space: String,
}

#[derive(Args, Debug)]
struct ThresholdArgs {
    #[arg(long, default_value_t = 3600)]
    threshold_secs: i64,
}

#[derive(Args, Debug)]
struct RetryArgs {
    /// Only this customer's failed records.
    #[arg(long)]
    customer: Option<String>,
    /// Only this space (requires --customer).
    #[arg(long, requires = "customer")]
    space: Option<String>,
}

#[derive(Args, Debug)]
struct ReleaseArgs {
    #[command(flatten)]
    key: KeyArgs,
    #[arg(long)]
    instance_id: String,
    #[arg(long)]
    worker_id: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let instance_id = match &cli.command {
        Commands::Work(args) => args
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        _ => "cli".to_string(),
    };
    logging::init_logging(cli.debug, &cli.log_dir, &instance_id);

    if let Err(err) = run(cli, instance_id).await {
        error!(error = %format!("{err:#}"), "command_failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, instance_id: String) -> Result<()> {
    let ledger = MigrationLedger::open(&cli.db)
        .with_context(|| format!("Failed to open ledger {}", cli.db.display()))?;

    match cli.command {
        Commands::Seed { manifest } => {
            let manifest = seed::load_manifest(&manifest)?;
            let report = seed::apply_manifest(&ledger, &manifest, Utc::now())?;
            println!(
                "seeded: {} created, {} already present ({} totals raised), {} uploads, {} shards",
                report.spaces_created,
                report.spaces_existing,
                report.totals_raised,
                report.uploads_inserted,
                report.shards_upserted
            );
        }
        Commands::Work(args) => {
            drop(ledger);
            let claims = SnapshotClaimsService::load(&args.claims).with_context(|| {
                format!("Failed to load claims snapshot {}", args.claims.display())
            })?;
            let config = work::WorkConfig {
                db: cli.db,
                instance_id,
                workers: args.workers,
                batch_size: args.batch_size,
                upload_page_size: args.upload_page_size,
                heartbeat_interval: ChronoDuration::seconds(args.heartbeat_secs),
                stale_after: ChronoDuration::seconds(args.stale_after_secs),
                retry_failed: args.retry_failed,
                reconcile: ReconcileConfig {
                    allow_unattributed_legacy: !args.strict_attribution,
                    ..ReconcileConfig::default()
                },
                poll_interval: Duration::from_secs(args.poll_secs),
            };
            info!(
                instance_id = %config.instance_id,
                workers = config.workers,
                claims = claims.len(),
                "work_started"
            );

            let stop = Arc::new(AtomicBool::new(false));
            let signal_stop = stop.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown_requested");
                    signal_stop.store(true, Ordering::Relaxed);
                }
            });

            let report = work::run_workers(config, Arc::new(claims), stop).await?;
            println!(
                "acquired={} completed={} failed={} abandoned={} uploads_verified={} \
                 pending_republish={} degraded_lookups={} service_unavailable={} \
                 attribution_conflicts={}",
                report.spaces_acquired,
                report.spaces_completed,
                report.spaces_failed,
                report.spaces_abandoned,
                report.uploads_verified,
                report.uploads_pending_republish,
                report.degraded_lookups,
                report.service_unavailable,
                report.attribution_conflicts
            );
        }
        Commands::Stats(args) => {
            let stats = collect_fleet_stats(&ledger, &monitor_config(&args), Utc::now())?;
            print_stats(&stats, args.json)?;
        }
        Commands::Watch(args) => {
            let config = monitor_config(&args.stats);
            let mut ticker =
                tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = collect_fleet_stats(&ledger, &config, Utc::now())?;
                        print_stats(&stats, args.stats.json)?;
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Commands::Show(args) => {
            let key = SpaceKey::new(args.customer, args.space);
            let Some(record) = ledger.get(&key)? else {
                bail!("No migration record for {key}");
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Stuck(args) => {
            let threshold = ChronoDuration::seconds(args.threshold_secs);
            let now = Utc::now();
            let records = collect_pages(|page| ledger.scan_stuck(threshold, now, page))?;
            for record in &records {
                println!(
                    "{}/{} owner={}:{} last_update={} progress={}/{}",
                    record.customer,
                    record.space,
                    record.instance_id.as_deref().unwrap_or("-"),
                    record.worker_id.as_deref().unwrap_or("-"),
                    record.updated_at.to_rfc3339(),
                    record.completed_uploads,
                    record.total_uploads
                );
            }
            println!("{} stuck", records.len());
        }
        Commands::Failed => {
            let records = collect_pages(|page| ledger.scan_failed(page))?;
            for record in &records {
                println!(
                    "{}/{} [{}] attempts={} {}",
                    record.customer,
                    record.space,
                    record
                        .error_kind
                        .map(|kind| kind.as_str())
                        .unwrap_or("unknown"),
                    record.attempts,
                    record.error.as_deref().unwrap_or("")
                );
            }
            println!("{} failed", records.len());
        }
        Commands::ResetStuck(args) => {
            let coordinator = WorkCoordinator::new(CoordinatorConfig {
                stale_after: ChronoDuration::seconds(args.threshold_secs),
                ..CoordinatorConfig::default()
            });
            let reclaimed = coordinator.reclaim_stuck(&ledger, Utc::now())?;
            println!("{reclaimed} stuck records returned to pending");
        }
        Commands::RetryFailed(args) => {
            let keys: Vec<SpaceKey> = match (&args.customer, &args.space) {
                (Some(customer), Some(space)) => {
                    vec![SpaceKey::new(customer.as_str(), space.as_str())]
                }
                _ => collect_pages(|page| ledger.scan_failed(page))?
                    .into_iter()
                    .filter(|record| {
                        args.customer
                            .as_deref()
                            .map_or(true, |customer| customer == record.customer)
                    })
                    .map(|record| record.key())
                    .collect(),
            };
            let now = Utc::now();
            for key in &keys {
                ledger
                    .retry_failed(key, now)
                    .with_context(|| format!("Failed to reset {key}"))?;
            }
            println!("{} failed records returned to pending", keys.len());
        }
        Commands::Release(args) => {
            let key = SpaceKey::new(args.key.customer, args.key.space);
            let owner = Owner::new(args.instance_id, args.worker_id);
            WorkCoordinator::new(CoordinatorConfig::default())
                .release(&ledger, &key, &owner, Utc::now())
                .with_context(|| format!("Failed to release {key}"))?;
            println!("released {key}");
        }
    }

    Ok(())
}

fn monitor_config(args: &StatsArgs) -> MonitorConfig {
    MonitorConfig {
        stuck_threshold: ChronoDuration::seconds(args.stuck_threshold_secs),
        customer: args.customer.clone(),
        ..MonitorConfig::default()
    }
}

fn print_stats(stats: &spacemig_monitor::FleetStats, json: bool) -> Result<()> {
    if json {
        println!("{}", render_json(stats)?);
    } else {
        println!("{}", render_text(stats));
    }
    Ok(())
}

fn collect_pages<F>(mut scan: F) -> Result<Vec<SpaceMigrationRecord>>
where
    F: FnMut(&PageRequest) -> Result<Page<SpaceMigrationRecord>, StorageError>,
{
    let mut request = PageRequest::first(PAGE_SIZE);
    let mut records = Vec::new();
    loop {
        let page = scan(&request)?;
        let next = page.next_request(PAGE_SIZE);
        records.extend(page.items);
        match next {
            Some(next) => request = next,
            None => return Ok(records),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_work_arguments() {
        let cli = Cli::try_parse_from([
            "spacemig",
            "--db",
            "/tmp/ledger.db",
            "work",
            "--claims",
            "claims.json",
            "--workers",
            "4",
            "--retry-failed",
        ])
        .expect("parse");
        assert_eq!(cli.db, PathBuf::from("/tmp/ledger.db"));
        let Commands::Work(args) = cli.command else {
            panic!("expected work command");
        };
        assert_eq!(args.workers, 4);
        assert!(args.retry_failed);
        assert_eq!(args.poll_secs, 0);
    }

    #[test]
    fn retry_space_requires_customer() {
        let err = Cli::try_parse_from(["spacemig", "retry-failed", "--space", "did:key:x"])
            .expect_err("space without customer");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn collect_pages_walks_every_page() {
        let ledger = MigrationLedger::open_in_memory().expect("ledger");
        let now = Utc::now();
        for index in 0..(PAGE_SIZE + 5) {
            ledger
                .create(
                    &SpaceKey::new("did:mailto:example.com:alice", format!("s{index:04}")),
                    1,
                    now,
                )
                .expect("create");
        }
        let records = collect_pages(|page| ledger.scan_pending(page)).expect("collect");
        assert_eq!(records.len(), PAGE_SIZE + 5);
    }
}
