//! Tracks which rule artifacts were written for each `auth-proxy` relation.
//!
//! Entries live in the application's peer databag so that every unit (and a newly elected
//! leader) sees the same view. An entry is keyed by relation id and lists the artifact names
//! in allow-then-deny order.

use oathkeeper_operator_core::{ArtifactNames, RelationId};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;

const KEY_PREFIX: &str = "auth_proxy_";

/// The application-level databag shared by all units over the peer relation.
#[async_trait::async_trait]
pub trait PeerData: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set(&self, key: &str, value: String) -> anyhow::Result<()>;

    async fn remove(&self, key: &str) -> anyhow::Result<()>;

    async fn keys(&self) -> anyhow::Result<Vec<String>>;
}

#[derive(Clone)]
pub struct Registry {
    peers: Arc<dyn PeerData>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to access peer data: {0}")]
    Peers(#[from] anyhow::Error),

    #[error("malformed registry entry {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode registry entry: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Entry {
    access_rules_filenames: Vec<String>,
}

// === impl Registry ===

impl Registry {
    pub fn new(peers: Arc<dyn PeerData>) -> Self {
        Self { peers }
    }

    /// Replaces a relation's entry. Recording an empty set of names removes the entry.
    pub async fn record(
        &self,
        relation_id: RelationId,
        names: &ArtifactNames,
    ) -> Result<(), RegistryError> {
        if names.is_empty() {
            self.forget(relation_id).await?;
            return Ok(());
        }

        let entry = Entry {
            access_rules_filenames: names.to_vec(),
        };
        let value = serde_json::to_string(&entry).map_err(RegistryError::Encode)?;
        self.peers.set(&entry_key(relation_id), value).await?;
        Ok(())
    }

    pub async fn lookup(
        &self,
        relation_id: RelationId,
    ) -> Result<Option<Vec<String>>, RegistryError> {
        let key = entry_key(relation_id);
        match self.peers.get(&key).await? {
            Some(value) => decode(&key, &value).map(Some),
            None => Ok(None),
        }
    }

    /// Removes a relation's entry, returning the names it held.
    pub async fn forget(
        &self,
        relation_id: RelationId,
    ) -> Result<Option<Vec<String>>, RegistryError> {
        let names = self.lookup(relation_id).await?;
        if names.is_some() {
            self.peers.remove(&entry_key(relation_id)).await?;
        }
        Ok(names)
    }

    /// Returns every entry, ordered by relation id. Peer keys that are not registry entries
    /// are ignored.
    pub async fn entries(&self) -> Result<BTreeMap<RelationId, Vec<String>>, RegistryError> {
        let mut entries = BTreeMap::new();
        for key in self.peers.keys().await? {
            let Some(relation_id) = parse_key(&key) else {
                continue;
            };
            if let Some(value) = self.peers.get(&key).await? {
                entries.insert(relation_id, decode(&key, &value)?);
            }
        }
        Ok(entries)
    }

    /// Every recorded artifact name, ordered by relation id.
    pub async fn all_artifact_names(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.entries().await?.into_values().flatten().collect())
    }
}

fn entry_key(relation_id: RelationId) -> String {
    format!("{KEY_PREFIX}{relation_id}")
}

fn parse_key(key: &str) -> Option<RelationId> {
    key.strip_prefix(KEY_PREFIX)?.parse().ok()
}

fn decode(key: &str, value: &str) -> Result<Vec<String>, RegistryError> {
    serde_json::from_str::<Entry>(value)
        .map(|entry| entry.access_rules_filenames)
        .map_err(|source| RegistryError::Decode {
            key: key.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entry_keys() {
        assert_eq!(parse_key("auth_proxy_7"), Some(7));
        assert_eq!(parse_key(&entry_key(12)), Some(12));
        assert_eq!(parse_key("auth_proxy_"), None);
        assert_eq!(parse_key("auth_proxy_x"), None);
        assert_eq!(parse_key("other"), None);
    }

    #[test]
    fn decodes_entries() {
        let names = decode(
            "auth_proxy_1",
            r#"{"access_rules_filenames":["access-rules-a-allow.json","access-rules-a-deny.json"]}"#,
        )
        .unwrap();
        assert_eq!(
            names,
            vec!["access-rules-a-allow.json", "access-rules-a-deny.json"]
        );

        assert!(matches!(
            decode("auth_proxy_1", "not json"),
            Err(RegistryError::Decode { ref key, .. }) if key == "auth_proxy_1"
        ));
    }
}
