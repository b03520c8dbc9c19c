use crate::{ClaimQuery, ClaimsService, ServiceError};
use serde::{Deserialize, Serialize};
use spacemig_core::Claim;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One digest's answer in a snapshot: its claims, or a scripted service error.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotEntry {
    #[serde(default)]
    pub claims: Vec<Claim>,
    #[serde(default)]
    pub error: Option<ServiceError>,
}

/// Claims service answering from a JSON document keyed by digest. Digests missing
/// from the snapshot resolve to no claims.
#[derive(Debug, Clone, Default)]
pub struct SnapshotClaimsService {
    entries: BTreeMap<String, SnapshotEntry>,
}

impl SnapshotClaimsService {
    pub fn new(entries: BTreeMap<String, SnapshotEntry>) -> Self {
        Self { entries }
    }

    pub fn from_json(input: &str) -> Result<Self, SnapshotError> {
        Ok(Self::new(serde_json::from_str(input)?))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn insert(&mut self, digest: impl Into<String>, entry: SnapshotEntry) {
        self.entries.insert(digest.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ClaimsService for SnapshotClaimsService {
    fn query(&self, query: &ClaimQuery) -> Result<Vec<Claim>, ServiceError> {
        let mut claims = Vec::new();
        for digest in &query.digests {
            let Some(entry) = self.entries.get(digest) else {
                continue;
            };
            if let Some(err) = &entry.error {
                return Err(err.clone());
            }
            claims.extend(
                entry
                    .claims
                    .iter()
                    .filter(|claim| match (&query.match_space, claim) {
                        (Some(space), Claim::Location(location)) => {
                            location.space.as_deref() == Some(space.as_str())
                        }
                        _ => true,
                    })
                    .cloned(),
            );
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClaimResolver, ResolveError, Resolution, ServiceErrorKind};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SNAPSHOT: &str = r#"{
        "bafyroot": {
            "claims": [
                {"type": "location", "content": "bafyroot", "space": "did:key:new", "provider": "did:web:new"},
                {"type": "location", "content": "bafyroot", "space": "did:key:old"}
            ]
        },
        "bafydown": {
            "error": {"kind": "service_unavailable", "message": "503 service unavailable"}
        }
    }"#;

    #[test]
    fn loads_snapshot_file_and_answers_queries() {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(SNAPSHOT.as_bytes()).expect("write snapshot");
        let service = SnapshotClaimsService::load(file.path()).expect("load");
        assert_eq!(service.len(), 2);

        let resolver = ClaimResolver::new(&service);
        let resolution = resolver.resolve("bafyroot").expect("resolve");
        let claims = resolution.claim_set().expect("claims");
        assert_eq!(claims.claims.len(), 2);

        let empty = resolver.resolve("bafyunknown").expect("resolve");
        assert!(matches!(empty, Resolution::Resolved(ref set) if set.is_empty()));

        let err = resolver.resolve("bafydown").expect_err("scripted outage");
        assert!(matches!(err, ResolveError::IndexingServiceUnavailable { .. }));
    }

    #[test]
    fn space_filter_drops_foreign_location_claims() {
        let service = SnapshotClaimsService::from_json(SNAPSHOT).expect("parse");
        let claims = service
            .query(&ClaimQuery {
                digests: vec!["bafyroot".to_string()],
                kind: Default::default(),
                match_space: Some("did:key:new".to_string()),
            })
            .expect("query");
        assert_eq!(claims.len(), 1);

        let err = service
            .query(&ClaimQuery::standard("bafydown"))
            .expect_err("error entry");
        assert_eq!(err.kind, ServiceErrorKind::ServiceUnavailable);
    }
}
