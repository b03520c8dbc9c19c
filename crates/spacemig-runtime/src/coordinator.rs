use chrono::{DateTime, Duration, Utc};
use spacemig_core::{Owner, SpaceKey, SpaceMigrationRecord, DEFAULT_STALE_AFTER_SECS};
use spacemig_storage::{LedgerError, MigrationLedger, Page, PageRequest, StorageError};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub stale_after: Duration,
    pub retry_failed: bool,
    pub scan_page_size: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::seconds(DEFAULT_STALE_AFTER_SECS),
            retry_failed: false,
            scan_page_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Stale,
    Pending,
    Failed,
}

pub struct WorkCoordinator {
    config: CoordinatorConfig,
}

impl WorkCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Claims up to `batch_size` spaces for `owner`: stale claims first, then pending
    /// records, then failed ones when retries are enabled. Races lost to other
    /// workers are skipped.
    pub fn acquire_work(
        &self,
        ledger: &MigrationLedger,
        owner: &Owner,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<SpaceMigrationRecord>, LedgerError> {
        let mut acquired = Vec::new();
        let mut sources = vec![Source::Stale, Source::Pending];
        if self.config.retry_failed {
            sources.push(Source::Failed);
        }

        for source in sources {
            if acquired.len() >= batch_size {
                break;
            }
            self.acquire_from(ledger, owner, source, batch_size, now, &mut acquired)?;
        }

        if !acquired.is_empty() {
            info!(
                owner = %owner,
                acquired = acquired.len(),
                batch_size,
                "work_acquired"
            );
        }
        Ok(acquired)
    }

    fn acquire_from(
        &self,
        ledger: &MigrationLedger,
        owner: &Owner,
        source: Source,
        batch_size: usize,
        now: DateTime<Utc>,
        acquired: &mut Vec<SpaceMigrationRecord>,
    ) -> Result<(), LedgerError> {
        let page_size = self.config.scan_page_size.max(1);
        let mut request = PageRequest::first(page_size);

        loop {
            let page = self.scan(ledger, source, &request, now)?;
            for record in &page.items {
                if acquired.len() >= batch_size {
                    return Ok(());
                }
                if source == Source::Stale && !ledger.reclaim_stale(record, now)? {
                    continue;
                }
                if let Some(claimed) = try_claim(ledger, &record.key(), owner, now)? {
                    acquired.push(claimed);
                }
            }
            match page.next_request(page_size) {
                Some(next) => request = next,
                None => return Ok(()),
            }
        }
    }

    fn scan(
        &self,
        ledger: &MigrationLedger,
        source: Source,
        request: &PageRequest,
        now: DateTime<Utc>,
    ) -> Result<Page<SpaceMigrationRecord>, StorageError> {
        match source {
            Source::Stale => ledger.scan_stuck(self.config.stale_after, now, request),
            Source::Pending => ledger.scan_pending(request),
            Source::Failed => ledger.scan_failed(request),
        }
    }

    /// Returns every stale claim to `pending` without claiming it.
    pub fn reclaim_stuck(
        &self,
        ledger: &MigrationLedger,
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        let page_size = self.config.scan_page_size.max(1);
        let mut request = PageRequest::first(page_size);
        let mut reclaimed = 0;
        loop {
            let page = ledger.scan_stuck(self.config.stale_after, now, &request)?;
            for record in &page.items {
                if ledger.reclaim_stale(record, now)? {
                    reclaimed += 1;
                }
            }
            match page.next_request(page_size) {
                Some(next) => request = next,
                None => return Ok(reclaimed),
            }
        }
    }

    pub fn release(
        &self,
        ledger: &MigrationLedger,
        key: &SpaceKey,
        owner: &Owner,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        ledger.release(key, owner, now)
    }
}

fn try_claim(
    ledger: &MigrationLedger,
    key: &SpaceKey,
    owner: &Owner,
    now: DateTime<Utc>,
) -> Result<Option<SpaceMigrationRecord>, LedgerError> {
    match ledger.claim(key, owner, now) {
        Ok(record) => Ok(Some(record)),
        Err(err @ (LedgerError::Conflict { .. } | LedgerError::NotFound { .. })) => {
            debug!(key = %key, owner = %owner, error = %err, "claim_skipped");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
