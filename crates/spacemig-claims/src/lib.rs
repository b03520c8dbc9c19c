use serde::{Deserialize, Serialize};
use spacemig_core::{Claim, ClaimSet, ErrorKind};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

mod snapshot;

pub use snapshot::{SnapshotClaimsService, SnapshotEntry, SnapshotError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServiceErrorKind {
    ServiceUnavailable,
    NotFound,
    Malformed,
    Network,
}

impl ServiceErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServiceUnavailable => "service_unavailable",
            Self::NotFound => "not_found",
            Self::Malformed => "malformed",
            Self::Network => "network",
        }
    }

    /// Classification of an HTTP response status, decided once at the client boundary.
    pub fn from_http_status(status: u16) -> Option<Self> {
        match status {
            500..=599 => Some(Self::ServiceUnavailable),
            404 => Some(Self::NotFound),
            400..=499 => Some(Self::Malformed),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    #[default]
    Standard,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimQuery {
    pub digests: Vec<String>,
    #[serde(default)]
    pub kind: QueryKind,
    #[serde(default)]
    pub match_space: Option<String>,
}

impl ClaimQuery {
    pub fn standard(digest: impl Into<String>) -> Self {
        Self {
            digests: vec![digest.into()],
            kind: QueryKind::Standard,
            match_space: None,
        }
    }
}

/// The claims-resolution network client.
pub trait ClaimsService {
    fn query(&self, query: &ClaimQuery) -> Result<Vec<Claim>, ServiceError>;
}

impl<T: ClaimsService + ?Sized> ClaimsService for &T {
    fn query(&self, query: &ClaimQuery) -> Result<Vec<Claim>, ServiceError> {
        (**self).query(query)
    }
}

impl<T: ClaimsService + ?Sized> ClaimsService for Arc<T> {
    fn query(&self, query: &ClaimQuery) -> Result<Vec<Claim>, ServiceError> {
        (**self).query(query)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(ClaimSet),
    /// The service answered that it knows nothing about the digest.
    NotFound,
    /// Resolution failed for a non-service reason; callers continue with an empty set
    /// and count it.
    Degraded {
        kind: ServiceErrorKind,
        message: String,
    },
}

impl Resolution {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Resolution::Degraded { .. })
    }

    pub fn claim_set(&self) -> Option<&ClaimSet> {
        match self {
            Resolution::Resolved(claims) => Some(claims),
            _ => None,
        }
    }

    pub fn into_claim_set(self) -> ClaimSet {
        match self {
            Resolution::Resolved(claims) => claims,
            Resolution::NotFound | Resolution::Degraded { .. } => ClaimSet::empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("indexing service unavailable for {digest}: {message}")]
    IndexingServiceUnavailable { digest: String, message: String },
}

impl ResolveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolveError::IndexingServiceUnavailable { .. } => {
                ErrorKind::IndexingServiceUnavailable
            }
        }
    }
}

/// Wraps a [`ClaimsService`] and classifies its failures. Never retries; retry budget
/// belongs to the caller.
pub struct ClaimResolver<S> {
    service: S,
}

impl<S: ClaimsService> ClaimResolver<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }

    pub fn resolve(&self, digest: &str) -> Result<Resolution, ResolveError> {
        self.resolve_query(digest, &ClaimQuery::standard(digest))
    }

    pub fn resolve_query(
        &self,
        digest: &str,
        query: &ClaimQuery,
    ) -> Result<Resolution, ResolveError> {
        match self.service.query(query) {
            Ok(claims) => {
                let claims = ClaimSet::from_claims(claims);
                debug!(
                    digest,
                    claims = claims.claims.len(),
                    has_index_claim = claims.has_index_claim,
                    has_location_claim = claims.has_location_claim,
                    "claims_resolved"
                );
                Ok(Resolution::Resolved(claims))
            }
            Err(err) => match err.kind {
                ServiceErrorKind::ServiceUnavailable => {
                    warn!(digest, error = %err.message, "indexing_service_unavailable");
                    Err(ResolveError::IndexingServiceUnavailable {
                        digest: digest.to_string(),
                        message: err.message,
                    })
                }
                ServiceErrorKind::NotFound => {
                    debug!(digest, "claims_not_found");
                    Ok(Resolution::NotFound)
                }
                kind @ (ServiceErrorKind::Malformed | ServiceErrorKind::Network) => {
                    warn!(digest, kind = %kind, error = %err.message, "claims_resolution_degraded");
                    Ok(Resolution::Degraded {
                        kind,
                        message: err.message,
                    })
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spacemig_core::LocationClaim;
    use std::cell::Cell;

    struct ScriptedService {
        result: Result<Vec<Claim>, ServiceError>,
        calls: Cell<usize>,
    }

    impl ClaimsService for ScriptedService {
        fn query(&self, _query: &ClaimQuery) -> Result<Vec<Claim>, ServiceError> {
            self.calls.set(self.calls.get() + 1);
            self.result.clone()
        }
    }

    fn scripted(result: Result<Vec<Claim>, ServiceError>) -> ClaimResolver<ScriptedService> {
        ClaimResolver::new(ScriptedService {
            result,
            calls: Cell::new(0),
        })
    }

    #[test]
    fn http_status_classification() {
        assert_eq!(
            ServiceErrorKind::from_http_status(503),
            Some(ServiceErrorKind::ServiceUnavailable)
        );
        assert_eq!(
            ServiceErrorKind::from_http_status(404),
            Some(ServiceErrorKind::NotFound)
        );
        assert_eq!(
            ServiceErrorKind::from_http_status(422),
            Some(ServiceErrorKind::Malformed)
        );
        assert_eq!(ServiceErrorKind::from_http_status(200), None);
    }

    #[test]
    fn server_failure_is_a_typed_error_not_an_empty_set() {
        let service = ScriptedService {
            result: Err(ServiceError::new(
                ServiceErrorKind::ServiceUnavailable,
                "502 bad gateway",
            )),
            calls: Cell::new(0),
        };
        let err = ClaimResolver::new(&service)
            .resolve("bafyroot")
            .expect_err("unavailable");
        assert_eq!(
            err,
            ResolveError::IndexingServiceUnavailable {
                digest: "bafyroot".to_string(),
                message: "502 bad gateway".to_string(),
            }
        );
        assert_eq!(err.kind(), ErrorKind::IndexingServiceUnavailable);
        assert_eq!(service.calls.get(), 1);
    }

    #[test]
    fn not_found_and_degraded_stay_distinct() {
        let not_found = scripted(Err(ServiceError::new(ServiceErrorKind::NotFound, "404")))
            .resolve("bafyroot")
            .expect("not found");
        assert_eq!(not_found, Resolution::NotFound);
        assert!(!not_found.is_degraded());

        let degraded = scripted(Err(ServiceError::new(
            ServiceErrorKind::Network,
            "connection reset",
        )))
        .resolve("bafyroot")
        .expect("degraded");
        assert!(degraded.is_degraded());
        assert!(degraded.claim_set().is_none());
        assert!(degraded.into_claim_set().is_empty());
    }

    #[test]
    fn success_is_normalized_into_claim_set() {
        let resolution = scripted(Ok(vec![Claim::Location(LocationClaim {
            content: "bafyroot".to_string(),
            space: Some("did:key:space".to_string()),
            provider: None,
            location: vec![],
            size: None,
        })]))
        .resolve("bafyroot")
        .expect("resolved");

        let claims = resolution.claim_set().expect("claim set");
        assert!(claims.has_location_claim);
        assert_eq!(claims.spaces, vec!["did:key:space".to_string()]);
    }
}
