// storage/mod.rs - Agency Storage
//
//! Storage contract for entity records, messages, connection links and
//! per-agent settings.
//!
//! # Architecture
//!
//! ```text
//! +------------------+     +------------------+
//! |   Entities       |---->|  Storage (trait) |
//! | (Agent, AgentConn|     +------------------+
//! |  ForwardAgent)   |        |            |
//! +------------------+        v            v
//!                      MemoryStorage   SledStorage
//! ```
//!
//! Every operation is atomic on its own; nothing spans several calls.

pub mod memory;
pub mod sled_store;

pub use memory::MemoryStorage;
pub use sled_store::SledStorage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Current version written into new entity records
pub const ENTITY_VERSION: &str = "1";

/// Forward Agent record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardAgentRecord {
    pub did: String,
    pub verkey: String,
    pub entity_version: String,
    pub wallet_name: String,
}

/// Agent record, one per onboarded owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub did: String,
    pub verkey: String,
    pub entity_version: String,
    pub wallet_name: String,
    pub owner_did: String,
    pub owner_verkey: String,
}

/// Agent-Connection record, one per pairwise relationship
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConnectionRecord {
    pub did: String,
    pub verkey: String,
    pub entity_version: String,
    pub wallet_name: String,
    pub agent_did: String,
    pub owner_did: String,
    pub owner_verkey: String,
    pub user_pairwise_did: String,
    pub user_pairwise_verkey: String,
}

/// Persisted entity, tagged by type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entityType")]
pub enum EntityRecord {
    #[serde(rename = "forward-agent")]
    ForwardAgent(ForwardAgentRecord),
    #[serde(rename = "agent")]
    Agent(AgentRecord),
    #[serde(rename = "agent-connection")]
    AgentConnection(AgentConnectionRecord),
}

impl EntityRecord {
    pub fn did(&self) -> &str {
        match self {
            Self::ForwardAgent(r) => &r.did,
            Self::Agent(r) => &r.did,
            Self::AgentConnection(r) => &r.did,
        }
    }

    pub fn verkey(&self) -> &str {
        match self {
            Self::ForwardAgent(r) => &r.verkey,
            Self::Agent(r) => &r.verkey,
            Self::AgentConnection(r) => &r.verkey,
        }
    }

    pub fn entity_type(&self) -> &'static str {
        match self {
            Self::ForwardAgent(_) => "forward-agent",
            Self::Agent(_) => "agent",
            Self::AgentConnection(_) => "agent-connection",
        }
    }
}

/// A stored message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub agent_did: String,
    pub agent_connection_did: String,
    pub uid: String,
    pub status_code: String,
    pub payload: serde_json::Value,
}

/// Message filter; an empty component means "no restriction"
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub connection_dids: Vec<String>,
    pub uids: Vec<String>,
    pub status_codes: Vec<String>,
}

impl MessageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connections(mut self, dids: Vec<String>) -> Self {
        self.connection_dids = dids;
        self
    }

    pub fn with_uids(mut self, uids: Vec<String>) -> Self {
        self.uids = uids;
        self
    }

    pub fn with_status_codes(mut self, status_codes: Vec<String>) -> Self {
        self.status_codes = status_codes;
        self
    }

    /// Check a message against every non-empty component
    pub fn matches(&self, message: &StoredMessage) -> bool {
        fn allows(filter: &[String], value: &str) -> bool {
            filter.is_empty() || filter.iter().any(|v| v == value)
        }

        allows(&self.connection_dids, &message.agent_connection_did)
            && allows(&self.uids, &message.uid)
            && allows(&self.status_codes, &message.status_code)
    }
}

/// Bidirectional index between an agent-connection and its user's pairwise DID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConnectionLink {
    pub agent_connection_did: String,
    pub user_pairwise_did: String,
    pub agent_did: String,
}

/// Uids to update under one agent-connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidsByConnection {
    pub agent_connection_did: String,
    pub uids: Vec<String>,
}

/// Per-connection outcome of a status update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdateResult {
    pub agent_connection_did: String,
    pub updated: Vec<String>,
    pub failed: Vec<String>,
}

/// Uids in input order with repeats removed
pub(crate) fn dedup_uids(uids: &[String]) -> Vec<&String> {
    let mut seen = HashSet::new();
    uids.iter().filter(|uid| seen.insert(uid.as_str())).collect()
}

/// Storage backend trait
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist a new entity record; its DID and verkey must both be unused
    async fn save_entity_record(&self, record: &EntityRecord) -> Result<(), StorageError>;

    /// Load an entity record by DID
    async fn load_entity_record(&self, did: &str) -> Result<Option<EntityRecord>, StorageError>;

    /// Load an entity record by DID or by verkey
    async fn load_entity_record_by_did_or_verkey(
        &self,
        did_or_verkey: &str,
    ) -> Result<Option<EntityRecord>, StorageError>;

    /// Store a message; the uid must be unused under the agent
    async fn store_message(&self, message: &StoredMessage) -> Result<(), StorageError>;

    /// Load an agent's messages in delivery order
    async fn load_messages(
        &self,
        agent_did: &str,
        filter: &MessageFilter,
    ) -> Result<Vec<StoredMessage>, StorageError>;

    /// Set the status of the given uids, partitioning each connection's uids
    /// into updated and failed
    async fn update_status_codes(
        &self,
        agent_did: &str,
        uids_by_connection: &[UidsByConnection],
        status_code: &str,
    ) -> Result<Vec<StatusUpdateResult>, StorageError>;

    /// Create the per-agent settings row
    async fn create_agent(&self, agent_did: &str) -> Result<(), StorageError>;

    async fn create_agent_connection_link(
        &self,
        link: &AgentConnectionLink,
    ) -> Result<(), StorageError>;

    /// Links of an agent by user pairwise DIDs; empty input returns all links
    async fn links_by_pairwise_dids(
        &self,
        agent_did: &str,
        user_pairwise_dids: &[String],
    ) -> Result<Vec<AgentConnectionLink>, StorageError>;

    /// Links of an agent by agent-connection DIDs; empty input returns all links
    async fn links_by_connection_dids(
        &self,
        agent_did: &str,
        agent_connection_dids: &[String],
    ) -> Result<Vec<AgentConnectionLink>, StorageError>;

    async fn get_webhook_url(&self, agent_did: &str) -> Result<Option<String>, StorageError>;

    /// Set the webhook URL; `None` clears it
    async fn set_webhook_url(
        &self,
        agent_did: &str,
        webhook_url: Option<&str>,
    ) -> Result<(), StorageError>;

    async fn has_new_message(&self, agent_did: &str) -> Result<bool, StorageError>;

    async fn set_has_new_message(&self, agent_did: &str, value: bool)
    -> Result<(), StorageError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_record_json_shape() {
        let record = contract::agent_record("did-1", "verkey-1");
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["entityType"], "agent");
        assert_eq!(json["ownerVerkey"], "owner-verkey");
        assert_eq!(record.entity_type(), "agent");

        let back: EntityRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_dedup_uids_keeps_order() {
        let uids = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        let deduped: Vec<&str> = dedup_uids(&uids).into_iter().map(|s| s.as_str()).collect();
        assert_eq!(deduped, vec!["b", "a"]);
    }
}
