use spacemig_claims::{ClaimResolver, ClaimsService, ResolveError};
use spacemig_core::{
    Attribution, ClaimSet, ErrorKind, InventoryError, ShardRecords, ShardReference,
};
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("shard record lookup failed: {0}")]
    Inventory(#[from] InventoryError),
    #[error("reconciliation of {root} stopped after shard {digest}")]
    Interrupted { root: String, digest: String },
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::Resolve(err) => err.kind(),
            ReconcileError::Inventory(_) | ReconcileError::Interrupted { .. } => {
                ErrorKind::Internal
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Accept location claims with no attribution for indexed shards. Records migrated
    /// before claims carried a space have none.
    pub allow_unattributed_legacy: bool,
    /// Query shards individually when the root's claim set has no location claim for them.
    pub resolve_missing_shards: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            allow_unattributed_legacy: true,
            resolve_missing_shards: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardStatus {
    Verified,
    LegacyAttribution,
    MissingLocalRecord,
    SizeMismatch { local: u64, expected: u64 },
    MissingLocationClaim,
    AttributedElsewhere { spaces: Vec<String> },
    /// The index claim lists no shards.
    EmptyIndex,
}

impl ShardStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(self, ShardStatus::Verified | ShardStatus::LegacyAttribution)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardVerdict {
    pub digest: String,
    pub status: ShardStatus,
}

/// Two or more distinct owners claim the same digest. Diagnostic only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributionConflict {
    pub digest: String,
    pub attributions: Vec<Attribution>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Verified,
    PendingRepublish { missing: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub root: String,
    pub space: String,
    pub index_cid: Option<String>,
    pub verdict: Verdict,
    pub shards: Vec<ShardVerdict>,
    pub degraded_lookups: usize,
    pub attribution_conflicts: Vec<AttributionConflict>,
}

impl ReconcileOutcome {
    pub fn is_verified(&self) -> bool {
        self.verdict == Verdict::Verified
    }

    pub fn missing(&self) -> &[String] {
        match &self.verdict {
            Verdict::Verified => &[],
            Verdict::PendingRepublish { missing } => missing,
        }
    }
}

pub struct ShardReconciler<S> {
    resolver: ClaimResolver<S>,
    config: ReconcileConfig,
}

impl<S: ClaimsService> ShardReconciler<S> {
    pub fn new(resolver: ClaimResolver<S>, config: ReconcileConfig) -> Self {
        Self { resolver, config }
    }

    /// Decides whether `root` is fully migrated into `space`: every shard of its index
    /// (or the root itself, for unindexed uploads) is located in the target space.
    pub fn reconcile<R: ShardRecords + ?Sized>(
        &self,
        records: &R,
        root: &str,
        space: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        self.reconcile_with(records, root, space, |_| ControlFlow::Continue(()))
    }

    /// [`reconcile`](Self::reconcile), calling `on_shard` after each shard of an indexed
    /// upload is checked. `Break` stops the pass with [`ReconcileError::Interrupted`].
    pub fn reconcile_with<R, F>(
        &self,
        records: &R,
        root: &str,
        space: &str,
        mut on_shard: F,
    ) -> Result<ReconcileOutcome, ReconcileError>
    where
        R: ShardRecords + ?Sized,
        F: FnMut(&ShardVerdict) -> ControlFlow<()>,
    {
        let resolution = self.resolver.resolve(root)?;
        let mut degraded_lookups = usize::from(resolution.is_degraded());
        let claims = resolution.into_claim_set();

        let mut shards = Vec::new();
        let mut conflicts = Vec::new();

        if !claims.has_index_claim {
            let status = attribution_status(&claims, root, space, false);
            collect_conflict(&claims, root, &mut conflicts);
            shards.push(ShardVerdict {
                digest: root.to_string(),
                status,
            });
        } else if claims.shards.is_empty() {
            let digest = claims.index_cid.clone().unwrap_or_else(|| root.to_string());
            warn!(root, index = %digest, "index_claim_without_shards");
            shards.push(ShardVerdict {
                digest,
                status: ShardStatus::EmptyIndex,
            });
        } else {
            for shard in claims.shard_references() {
                let fetched;
                let shard_claims = if claims.location_claims_for(&shard.digest).next().is_none()
                    && self.config.resolve_missing_shards
                {
                    let resolution = self.resolver.resolve(&shard.digest)?;
                    degraded_lookups += usize::from(resolution.is_degraded());
                    fetched = resolution.into_claim_set();
                    &fetched
                } else {
                    &claims
                };

                let status = self.shard_status(records, shard_claims, &shard, space)?;
                debug!(root, shard = %shard.digest, status = ?status, "shard_checked");
                collect_conflict(shard_claims, &shard.digest, &mut conflicts);
                let verdict = ShardVerdict {
                    digest: shard.digest,
                    status,
                };
                if on_shard(&verdict).is_break() {
                    return Err(ReconcileError::Interrupted {
                        root: root.to_string(),
                        digest: verdict.digest,
                    });
                }
                shards.push(verdict);
            }
        }

        let missing: Vec<String> = shards
            .iter()
            .filter(|verdict| !verdict.status.is_resolved())
            .map(|verdict| verdict.digest.clone())
            .collect();
        let verdict = if missing.is_empty() {
            Verdict::Verified
        } else {
            Verdict::PendingRepublish { missing }
        };

        info!(
            root,
            space,
            shards = shards.len(),
            verified = verdict == Verdict::Verified,
            degraded_lookups,
            conflicts = conflicts.len(),
            "upload_reconciled"
        );

        Ok(ReconcileOutcome {
            root: root.to_string(),
            space: space.to_string(),
            index_cid: claims.index_cid.clone(),
            verdict,
            shards,
            degraded_lookups,
            attribution_conflicts: conflicts,
        })
    }

    fn shard_status<R: ShardRecords + ?Sized>(
        &self,
        records: &R,
        claims: &ClaimSet,
        shard: &ShardReference,
        space: &str,
    ) -> Result<ShardStatus, ReconcileError> {
        let stated_size = shard.size.or_else(|| {
            claims
                .location_claims_for(&shard.digest)
                .find_map(|location| location.size)
        });

        let Some(local) = records.shard_size(space, &shard.digest)? else {
            return Ok(ShardStatus::MissingLocalRecord);
        };
        match stated_size {
            Some(expected) if local != expected => {
                return Ok(ShardStatus::SizeMismatch { local, expected });
            }
            None if local < shard.required_len() => {
                return Ok(ShardStatus::SizeMismatch {
                    local,
                    expected: shard.required_len(),
                });
            }
            _ => {}
        }

        Ok(attribution_status(
            claims,
            &shard.digest,
            space,
            self.config.allow_unattributed_legacy,
        ))
    }
}

fn attribution_status(
    claims: &ClaimSet,
    digest: &str,
    space: &str,
    allow_legacy: bool,
) -> ShardStatus {
    let mut unattributed = false;
    let mut elsewhere = BTreeSet::new();

    for location in claims.location_claims_for(digest) {
        match location.space.as_deref() {
            Some(claimed) if claimed == space => return ShardStatus::Verified,
            Some(claimed) => {
                elsewhere.insert(claimed.to_string());
            }
            None => unattributed = true,
        }
    }

    if unattributed && allow_legacy {
        ShardStatus::LegacyAttribution
    } else if !elsewhere.is_empty() {
        ShardStatus::AttributedElsewhere {
            spaces: elsewhere.into_iter().collect(),
        }
    } else {
        ShardStatus::MissingLocationClaim
    }
}

fn collect_conflict(claims: &ClaimSet, digest: &str, conflicts: &mut Vec<AttributionConflict>) {
    if let Some(attributions) = claims.conflicting_attributions(digest) {
        conflicts.push(AttributionConflict {
            digest: digest.to_string(),
            attributions: attributions.into_iter().collect(),
        });
    }
}
