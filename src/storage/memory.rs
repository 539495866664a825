// storage/memory.rs - In-Memory Storage
//
//! In-memory storage backend (for testing and ephemeral deployments)

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{
    AgentConnectionLink, EntityRecord, MessageFilter, StatusUpdateResult, Storage, StorageError,
    StoredMessage, UidsByConnection, dedup_uids,
};

#[derive(Debug, Clone, Default)]
struct AgentRow {
    webhook_url: Option<String>,
    has_new_message: bool,
}

#[derive(Debug, Default)]
struct State {
    entities: HashMap<String, EntityRecord>,
    did_by_verkey: HashMap<String, String>,
    messages: HashMap<String, Vec<StoredMessage>>,
    agents: HashMap<String, AgentRow>,
    links: Vec<AgentConnectionLink>,
}

/// In-memory storage backend
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<State>,
}

impl MemoryStorage {
    /// Create a new memory storage
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_entity_record(&self, record: &EntityRecord) -> Result<(), StorageError> {
        let mut state = self.state.write();

        if state.entities.contains_key(record.did()) {
            return Err(StorageError::Conflict(format!("did {}", record.did())));
        }
        if state.did_by_verkey.contains_key(record.verkey()) {
            return Err(StorageError::Conflict(format!("verkey {}", record.verkey())));
        }

        state
            .did_by_verkey
            .insert(record.verkey().to_string(), record.did().to_string());
        state
            .entities
            .insert(record.did().to_string(), record.clone());
        Ok(())
    }

    async fn load_entity_record(&self, did: &str) -> Result<Option<EntityRecord>, StorageError> {
        Ok(self.state.read().entities.get(did).cloned())
    }

    async fn load_entity_record_by_did_or_verkey(
        &self,
        did_or_verkey: &str,
    ) -> Result<Option<EntityRecord>, StorageError> {
        let state = self.state.read();
        if let Some(record) = state.entities.get(did_or_verkey) {
            return Ok(Some(record.clone()));
        }
        Ok(state
            .did_by_verkey
            .get(did_or_verkey)
            .and_then(|did| state.entities.get(did))
            .cloned())
    }

    async fn store_message(&self, message: &StoredMessage) -> Result<(), StorageError> {
        let mut state = self.state.write();
        let messages = state.messages.entry(message.agent_did.clone()).or_default();

        if messages.iter().any(|m| m.uid == message.uid) {
            return Err(StorageError::Conflict(format!(
                "uid {} under agent {}",
                message.uid, message.agent_did
            )));
        }
        messages.push(message.clone());
        Ok(())
    }

    async fn load_messages(
        &self,
        agent_did: &str,
        filter: &MessageFilter,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let state = self.state.read();
        Ok(state
            .messages
            .get(agent_did)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| filter.matches(m))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update_status_codes(
        &self,
        agent_did: &str,
        uids_by_connection: &[UidsByConnection],
        status_code: &str,
    ) -> Result<Vec<StatusUpdateResult>, StorageError> {
        let mut state = self.state.write();
        let mut results = Vec::with_capacity(uids_by_connection.len());

        for entry in uids_by_connection {
            let mut result = StatusUpdateResult {
                agent_connection_did: entry.agent_connection_did.clone(),
                ..Default::default()
            };

            for uid in dedup_uids(&entry.uids) {
                let found = state.messages.get_mut(agent_did).and_then(|messages| {
                    messages.iter_mut().find(|m| {
                        m.uid == *uid && m.agent_connection_did == entry.agent_connection_did
                    })
                });

                match found {
                    Some(message) => {
                        message.status_code = status_code.to_string();
                        result.updated.push(uid.clone());
                    }
                    None => result.failed.push(uid.clone()),
                }
            }

            results.push(result);
        }

        Ok(results)
    }

    async fn create_agent(&self, agent_did: &str) -> Result<(), StorageError> {
        self.state
            .write()
            .agents
            .entry(agent_did.to_string())
            .or_default();
        Ok(())
    }

    async fn create_agent_connection_link(
        &self,
        link: &AgentConnectionLink,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write();
        if state
            .links
            .iter()
            .any(|l| l.agent_connection_did == link.agent_connection_did)
        {
            return Err(StorageError::Conflict(format!(
                "link for {}",
                link.agent_connection_did
            )));
        }
        state.links.push(link.clone());
        Ok(())
    }

    async fn links_by_pairwise_dids(
        &self,
        agent_did: &str,
        user_pairwise_dids: &[String],
    ) -> Result<Vec<AgentConnectionLink>, StorageError> {
        let state = self.state.read();
        Ok(state
            .links
            .iter()
            .filter(|l| l.agent_did == agent_did)
            .filter(|l| {
                user_pairwise_dids.is_empty() || user_pairwise_dids.contains(&l.user_pairwise_did)
            })
            .cloned()
            .collect())
    }

    async fn links_by_connection_dids(
        &self,
        agent_did: &str,
        agent_connection_dids: &[String],
    ) -> Result<Vec<AgentConnectionLink>, StorageError> {
        let state = self.state.read();
        Ok(state
            .links
            .iter()
            .filter(|l| l.agent_did == agent_did)
            .filter(|l| {
                agent_connection_dids.is_empty()
                    || agent_connection_dids.contains(&l.agent_connection_did)
            })
            .cloned()
            .collect())
    }

    async fn get_webhook_url(&self, agent_did: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .state
            .read()
            .agents
            .get(agent_did)
            .and_then(|row| row.webhook_url.clone()))
    }

    async fn set_webhook_url(
        &self,
        agent_did: &str,
        webhook_url: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write();
        let row = state
            .agents
            .get_mut(agent_did)
            .ok_or_else(|| StorageError::NotFound(format!("agent {agent_did}")))?;
        row.webhook_url = webhook_url.map(str::to_string);
        Ok(())
    }

    async fn has_new_message(&self, agent_did: &str) -> Result<bool, StorageError> {
        Ok(self
            .state
            .read()
            .agents
            .get(agent_did)
            .map(|row| row.has_new_message)
            .unwrap_or(false))
    }

    async fn set_has_new_message(
        &self,
        agent_did: &str,
        value: bool,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write();
        let row = state
            .agents
            .get_mut(agent_did)
            .ok_or_else(|| StorageError::NotFound(format!("agent {agent_did}")))?;
        row.has_new_message = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_memory_entity_records() {
        contract::entity_records(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn test_memory_message_filters() {
        contract::message_filters(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn test_memory_status_updates() {
        contract::status_updates(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn test_memory_links() {
        contract::links(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn test_memory_agent_settings() {
        contract::agent_settings(&MemoryStorage::new()).await;
    }

    fn pick(pool: &'static [&'static str]) -> impl Strategy<Value = Vec<String>> {
        proptest::sample::subsequence(pool.to_vec(), 0..=pool.len())
            .prop_map(|v| v.into_iter().map(str::to_string).collect())
    }

    const CONNS: &[&str] = &["c1", "c2", "c3"];
    const STATUSES: &[&str] = &["MS-103", "MS-104", "MS-106"];
    const UIDS: &[&str] = &["u0", "u1", "u2", "u3", "u4", "u5", "u6", "u7"];

    proptest! {
        #[test]
        fn prop_load_messages_honours_filter(
            rows in proptest::collection::vec((0usize..3, 0usize..3), 0..8),
            conn_filter in pick(CONNS),
            uid_filter in pick(UIDS),
            status_filter in pick(STATUSES),
        ) {
            let storage = MemoryStorage::new();
            let messages: Vec<StoredMessage> = rows
                .iter()
                .enumerate()
                .map(|(i, (c, s))| contract::message("a1", CONNS[*c], UIDS[i], STATUSES[*s]))
                .collect();

            let filter = MessageFilter::new()
                .with_connections(conn_filter.clone())
                .with_uids(uid_filter.clone())
                .with_status_codes(status_filter.clone());

            let loaded = tokio_test::block_on(async {
                for message in &messages {
                    storage.store_message(message).await.unwrap();
                }
                storage.load_messages("a1", &filter).await.unwrap()
            });

            let expected: Vec<StoredMessage> = messages
                .into_iter()
                .filter(|m| conn_filter.is_empty() || conn_filter.contains(&m.agent_connection_did))
                .filter(|m| uid_filter.is_empty() || uid_filter.contains(&m.uid))
                .filter(|m| status_filter.is_empty() || status_filter.contains(&m.status_code))
                .collect();

            prop_assert_eq!(loaded, expected);
        }
    }
}
