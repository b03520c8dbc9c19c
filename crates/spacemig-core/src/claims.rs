//! Typed claims returned by the claims-resolution service and the normalized
//! [`ClaimSet`] the reconciler works from.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slice {
    pub digest: String,
    pub offset: u64,
    pub length: u64,
}

impl Slice {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

/// A shard as described by a DAG index, plus its size when a location claim states one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardReference {
    pub digest: String,
    pub size: Option<u64>,
    pub slices: Vec<Slice>,
}

impl ShardReference {
    /// Smallest byte size that can hold every slice the index places in this shard.
    pub fn required_len(&self) -> u64 {
        self.slices.iter().map(Slice::end).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocationClaim {
    pub content: String,
    #[serde(default)]
    pub space: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub location: Vec<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl LocationClaim {
    pub fn attribution(&self) -> Attribution {
        Attribution {
            provider: self.provider.clone(),
            space: self.space.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexClaim {
    pub content: String,
    pub index: String,
    #[serde(default)]
    pub shards: BTreeMap<String, Vec<Slice>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EqualsClaim {
    pub content: String,
    pub equals: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Claim {
    Location(LocationClaim),
    Index(IndexClaim),
    Equals(EqualsClaim),
}

/// Who a location claim says owns the bytes. Claims issued before space attribution
/// existed carry neither field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attribution {
    pub provider: Option<String>,
    pub space: Option<String>,
}

impl Attribution {
    pub fn is_unattributed(&self) -> bool {
        self.provider.is_none() && self.space.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimSet {
    pub has_index_claim: bool,
    pub has_location_claim: bool,
    pub spaces: Vec<String>,
    pub index_cid: Option<String>,
    pub claims: Vec<Claim>,
    pub shards: BTreeMap<String, Vec<Slice>>,
}

impl ClaimSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_claims(claims: Vec<Claim>) -> Self {
        let mut spaces = BTreeSet::new();
        let mut has_location_claim = false;
        let mut index_cid = None;
        let mut shards: BTreeMap<String, Vec<Slice>> = BTreeMap::new();

        for claim in &claims {
            match claim {
                Claim::Location(location) => {
                    has_location_claim = true;
                    if let Some(space) = &location.space {
                        spaces.insert(space.clone());
                    }
                }
                Claim::Index(index) => {
                    if index_cid.is_none() {
                        index_cid = Some(index.index.clone());
                    }
                    for (shard, slices) in &index.shards {
                        let entry = shards.entry(shard.clone()).or_default();
                        for slice in slices {
                            if !entry.contains(slice) {
                                entry.push(slice.clone());
                            }
                        }
                    }
                }
                Claim::Equals(_) => {}
            }
        }

        Self {
            has_index_claim: index_cid.is_some(),
            has_location_claim,
            spaces: spaces.into_iter().collect(),
            index_cid,
            claims,
            shards,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    pub fn location_claims_for<'a>(
        &'a self,
        digest: &'a str,
    ) -> impl Iterator<Item = &'a LocationClaim> + 'a {
        self.claims.iter().filter_map(move |claim| match claim {
            Claim::Location(location) if location.content == digest => Some(location),
            _ => None,
        })
    }

    /// Distinct attributed owners for a digest; unattributed claims are left out.
    pub fn attributions_for(&self, digest: &str) -> BTreeSet<Attribution> {
        self.location_claims_for(digest)
            .map(LocationClaim::attribution)
            .filter(|attribution| !attribution.is_unattributed())
            .collect()
    }

    /// Attributed owners of `digest` when they disagree: two stated providers or two
    /// stated spaces. A claim that leaves a field unset never disagrees on it.
    pub fn conflicting_attributions(&self, digest: &str) -> Option<BTreeSet<Attribution>> {
        let mut providers = BTreeSet::new();
        let mut spaces = BTreeSet::new();
        for location in self.location_claims_for(digest) {
            providers.extend(location.provider.as_deref());
            spaces.extend(location.space.as_deref());
        }
        if providers.len() > 1 || spaces.len() > 1 {
            Some(self.attributions_for(digest))
        } else {
            None
        }
    }

    pub fn shard_references(&self) -> Vec<ShardReference> {
        self.shards
            .iter()
            .map(|(digest, slices)| ShardReference {
                digest: digest.clone(),
                size: self
                    .location_claims_for(digest)
                    .find_map(|location| location.size),
                slices: slices.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(content: &str, space: Option<&str>, provider: Option<&str>) -> Claim {
        Claim::Location(LocationClaim {
            content: content.to_string(),
            space: space.map(str::to_string),
            provider: provider.map(str::to_string),
            location: vec![format!("https://r2.example/{content}")],
            size: Some(128),
        })
    }

    #[test]
    fn normalizes_index_and_location_claims() {
        let index = Claim::Index(IndexClaim {
            content: "bafyroot".to_string(),
            index: "bafyindex".to_string(),
            shards: BTreeMap::from([(
                "bagshard1".to_string(),
                vec![Slice {
                    digest: "zQmSlice".to_string(),
                    offset: 10,
                    length: 90,
                }],
            )]),
        });
        let set = ClaimSet::from_claims(vec![
            index,
            location("bagshard1", Some("did:key:space-b"), Some("did:web:new")),
            location("bagshard1", Some("did:key:space-a"), Some("did:web:new")),
        ]);

        assert!(set.has_index_claim);
        assert!(set.has_location_claim);
        assert_eq!(set.index_cid.as_deref(), Some("bafyindex"));
        assert_eq!(
            set.spaces,
            vec!["did:key:space-a".to_string(), "did:key:space-b".to_string()]
        );

        let shards = set.shard_references();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].size, Some(128));
        assert_eq!(shards[0].required_len(), 100);
    }

    #[test]
    fn unattributed_claims_are_not_counted_as_owners() {
        let set = ClaimSet::from_claims(vec![
            location("bagshard1", None, None),
            location("bagshard1", Some("did:key:space-a"), Some("did:web:legacy")),
        ]);
        assert_eq!(set.attributions_for("bagshard1").len(), 1);
        assert_eq!(set.location_claims_for("bagshard1").count(), 2);
        assert!(!set.has_index_claim);
    }

    #[test]
    fn partially_attributed_claims_for_one_owner_do_not_conflict() {
        let set = ClaimSet::from_claims(vec![
            location("bagroot", Some("did:key:target"), Some("did:web:new")),
            location("bagroot", Some("did:key:target"), None),
            location("bagroot", None, Some("did:web:new")),
        ]);
        assert_eq!(set.attributions_for("bagroot").len(), 3);
        assert_eq!(set.conflicting_attributions("bagroot"), None);
    }

    #[test]
    fn differing_providers_or_spaces_conflict() {
        let providers = ClaimSet::from_claims(vec![
            location("bagroot", Some("did:key:target"), Some("did:web:new")),
            location("bagroot", None, Some("did:web:legacy")),
        ]);
        let owners = providers
            .conflicting_attributions("bagroot")
            .expect("provider conflict");
        assert_eq!(owners.len(), 2);

        let spaces = ClaimSet::from_claims(vec![
            location("bagroot", Some("did:key:target"), None),
            location("bagroot", Some("did:key:other"), None),
        ]);
        assert!(spaces.conflicting_attributions("bagroot").is_some());
    }

    #[test]
    fn claims_deserialize_from_tagged_json() {
        let claims: Vec<Claim> = serde_json::from_str(
            r#"[
                {"type": "location", "content": "bagroot", "space": "did:key:s", "location": ["https://x"]},
                {"type": "equals", "content": "bagroot", "equals": "zQmOther"}
            ]"#,
        )
        .expect("parse claims");
        let set = ClaimSet::from_claims(claims);
        assert!(set.has_location_claim);
        assert_eq!(set.claims.len(), 2);
        assert_eq!(set.spaces, vec!["did:key:s".to_string()]);
    }
}
