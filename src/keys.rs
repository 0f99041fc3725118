//! Bucket to key-encryption-key resolution

use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// Entry that applies to every bucket
pub const WILDCARD_BUCKET: &str = "*";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyMappingError {
    #[error("entry '{0}' is not of the form bucket:key")]
    MissingSeparator(String),

    #[error("entry '{0}' has an empty bucket or key")]
    EmptyField(String),
}

/// Resolves the key-encryption-key identifier for a bucket.
///
/// An empty identifier means "do not encrypt": the exchange is passed through.
pub trait KeyResolver: Send + Sync {
    fn resolve(&self, bucket: &str) -> String;
}

/// Static bucket to key mapping parsed from `bucket1:key1,bucket2:key2`.
///
/// A `*` entry overrides every specific entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyMapping {
    global: Option<String>,
    per_bucket: HashMap<String, String>,
}

impl KeyMapping {
    pub fn parse(raw: &str) -> Result<Self, KeyMappingError> {
        let mut mapping = KeyMapping::default();
        for entry in raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            // Key identifiers (projects/.../cryptoKeys/k) never contain ':',
            // bucket names never do either, so the first colon splits.
            let (bucket, key) = entry
                .split_once(':')
                .ok_or_else(|| KeyMappingError::MissingSeparator(entry.to_string()))?;
            let (bucket, key) = (bucket.trim(), key.trim());
            if bucket.is_empty() || key.is_empty() {
                return Err(KeyMappingError::EmptyField(entry.to_string()));
            }
            if bucket == WILDCARD_BUCKET {
                mapping.global = Some(key.to_string());
            } else {
                mapping
                    .per_bucket
                    .insert(bucket.to_string(), key.to_string());
            }
        }
        Ok(mapping)
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_none() && self.per_bucket.is_empty()
    }

    /// Distinct key identifiers any bucket can resolve to, sorted. With a
    /// `*` entry that is the global key alone.
    pub fn key_ids(&self) -> BTreeSet<&str> {
        match &self.global {
            Some(global) => BTreeSet::from([global.as_str()]),
            None => self.per_bucket.values().map(String::as_str).collect(),
        }
    }
}

impl KeyResolver for KeyMapping {
    fn resolve(&self, bucket: &str) -> String {
        if let Some(global) = &self.global {
            return global.clone();
        }
        self.per_bucket.get(bucket).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_per_bucket_lookup() {
        let mapping = KeyMapping::parse("photos:K1, logs:K2").unwrap();
        assert_eq!(mapping.resolve("photos"), "K1");
        assert_eq!(mapping.resolve("logs"), "K2");
        assert_eq!(mapping.resolve("other"), "");
    }

    #[test]
    fn test_wildcard_overrides_specific_entries() {
        let mapping = KeyMapping::parse("photos:K1,*:KG").unwrap();
        assert_eq!(mapping.resolve("photos"), "KG");
        assert_eq!(mapping.resolve("anything"), "KG");
    }

    #[test]
    fn test_empty_mapping_resolves_nothing() {
        let mapping = KeyMapping::parse("").unwrap();
        assert!(mapping.is_empty());
        assert_eq!(mapping.resolve("photos"), "");

        let mapping = KeyMapping::parse(" , ,").unwrap();
        assert!(mapping.is_empty());
    }

    #[test]
    fn test_key_ids_deduplicated() {
        let mapping = KeyMapping::parse("photos:K1,logs:K2,backup:K1").unwrap();
        assert_eq!(mapping.key_ids().into_iter().collect::<Vec<_>>(), ["K1", "K2"]);

        let mapping = KeyMapping::parse("photos:K1,*:KG").unwrap();
        assert_eq!(mapping.key_ids().into_iter().collect::<Vec<_>>(), ["KG"]);
        assert!(KeyMapping::default().key_ids().is_empty());
    }

    #[test]
    fn test_rejects_malformed_entries() {
        assert_eq!(
            KeyMapping::parse("photos"),
            Err(KeyMappingError::MissingSeparator("photos".to_string()))
        );
        assert!(matches!(
            KeyMapping::parse("photos:"),
            Err(KeyMappingError::EmptyField(_))
        ));
    }

    #[test]
    fn test_kms_style_key_ids() {
        let key = "projects/p/locations/global/keyRings/r/cryptoKeys/k";
        let mapping = KeyMapping::parse(&format!("b:{key}")).unwrap();
        assert_eq!(mapping.resolve("b"), key);
    }

    proptest! {
        #[test]
        fn prop_every_listed_bucket_resolves(
            entries in proptest::collection::btree_map("[a-z0-9][a-z0-9._-]{0,20}", "[A-Za-z0-9/_-]{1,40}", 1..8)
        ) {
            let raw = entries
                .iter()
                .map(|(b, k)| format!("{b}:{k}"))
                .collect::<Vec<_>>()
                .join(",");
            let mapping = KeyMapping::parse(&raw).unwrap();
            for (bucket, key) in &entries {
                prop_assert_eq!(&mapping.resolve(bucket), key);
            }
        }
    }
}
