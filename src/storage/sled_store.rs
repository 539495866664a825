// storage/sled_store.rs - Persistent Storage using Sled

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, Tree};
use std::path::Path;
use tracing::debug;

use super::{
    AgentConnectionLink, EntityRecord, MessageFilter, StatusUpdateResult, Storage, StorageError,
    StoredMessage, UidsByConnection, dedup_uids,
};

/// Tree names for different data types
const TREE_ENTITIES: &str = "entities";
const TREE_ENTITY_VERKEYS: &str = "entity_verkeys";
const TREE_MESSAGES: &str = "messages";
const TREE_MESSAGE_UIDS: &str = "message_uids";
const TREE_AGENTS: &str = "agents";
const TREE_LINKS: &str = "agent_connections";
const TREE_LINKS_BY_PAIRWISE: &str = "agent_connections_by_pw";

/// Message as persisted; the payload is kept as JSON bytes
#[derive(Serialize, Deserialize)]
struct MessageRow {
    agent_connection_did: String,
    uid: String,
    status_code: String,
    payload: Vec<u8>,
}

#[derive(Default, Serialize, Deserialize)]
struct AgentRow {
    webhook_url: Option<String>,
    has_new_message: bool,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StorageError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StorageError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// `scope \0 id`, so that a scope prefix scan never matches a longer scope
fn scoped_key(scope: &str, id: &[u8]) -> Vec<u8> {
    [scope.as_bytes(), &[0u8], id].concat()
}

fn conflict<T>(result: Result<T, TransactionError<String>>) -> Result<T, StorageError> {
    result.map_err(|e| match e {
        TransactionError::Abort(reason) => StorageError::Conflict(reason),
        TransactionError::Storage(e) => StorageError::Database(e),
    })
}

/// Persistent storage backed by sled
pub struct SledStorage {
    db: Db,
    entities: Tree,
    entity_verkeys: Tree,
    messages: Tree,
    message_uids: Tree,
    agents: Tree,
    links: Tree,
    links_by_pairwise: Tree,
}

impl SledStorage {
    /// Open or create storage at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// Create a temporary storage (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        Ok(Self {
            entities: db.open_tree(TREE_ENTITIES)?,
            entity_verkeys: db.open_tree(TREE_ENTITY_VERKEYS)?,
            messages: db.open_tree(TREE_MESSAGES)?,
            message_uids: db.open_tree(TREE_MESSAGE_UIDS)?,
            agents: db.open_tree(TREE_AGENTS)?,
            links: db.open_tree(TREE_LINKS)?,
            links_by_pairwise: db.open_tree(TREE_LINKS_BY_PAIRWISE)?,
            db,
        })
    }

    fn decode_entity(bytes: &[u8]) -> Result<EntityRecord, StorageError> {
        serde_json::from_slice(bytes).map_err(|e| StorageError::Deserialization(e.to_string()))
    }

    fn decode_message(agent_did: &str, bytes: &[u8]) -> Result<StoredMessage, StorageError> {
        let row: MessageRow = decode(bytes)?;
        let payload = serde_json::from_slice(&row.payload)
            .map_err(|e| StorageError::Deserialization(e.to_string()))?;

        Ok(StoredMessage {
            agent_did: agent_did.to_string(),
            agent_connection_did: row.agent_connection_did,
            uid: row.uid,
            status_code: row.status_code,
            payload,
        })
    }

    fn load_link(&self, agent_connection_did: &[u8]) -> Result<Option<AgentConnectionLink>, StorageError> {
        match self.links.get(agent_connection_did)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn update_agent_row<F>(&self, agent_did: &str, update: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut AgentRow),
    {
        let bytes = self
            .agents
            .get(agent_did.as_bytes())?
            .ok_or_else(|| StorageError::NotFound(format!("agent {agent_did}")))?;
        let mut row: AgentRow = decode(&bytes)?;
        update(&mut row);
        self.agents.insert(agent_did.as_bytes(), encode(&row)?)?;
        Ok(())
    }

    fn load_agent_row(&self, agent_did: &str) -> Result<Option<AgentRow>, StorageError> {
        match self.agents.get(agent_did.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Storage for SledStorage {
    async fn save_entity_record(&self, record: &EntityRecord) -> Result<(), StorageError> {
        let did = record.did();
        let verkey = record.verkey();
        let bytes =
            serde_json::to_vec(record).map_err(|e| StorageError::Serialization(e.to_string()))?;

        let result = (&self.entities, &self.entity_verkeys).transaction(|(entities, verkeys)| {
            if entities.get(did.as_bytes())?.is_some() {
                return Err(ConflictableTransactionError::Abort(format!("did {did}")));
            }
            if verkeys.get(verkey.as_bytes())?.is_some() {
                return Err(ConflictableTransactionError::Abort(format!("verkey {verkey}")));
            }
            entities.insert(did.as_bytes(), bytes.as_slice())?;
            verkeys.insert(verkey.as_bytes(), did.as_bytes())?;
            Ok(())
        });
        conflict(result)?;

        debug!(did, entity_type = record.entity_type(), "Saved entity record");
        Ok(())
    }

    async fn load_entity_record(&self, did: &str) -> Result<Option<EntityRecord>, StorageError> {
        match self.entities.get(did.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_entity(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn load_entity_record_by_did_or_verkey(
        &self,
        did_or_verkey: &str,
    ) -> Result<Option<EntityRecord>, StorageError> {
        if let Some(record) = self.load_entity_record(did_or_verkey).await? {
            return Ok(Some(record));
        }
        match self.entity_verkeys.get(did_or_verkey.as_bytes())? {
            Some(did) => match self.entities.get(&did)? {
                Some(bytes) => Ok(Some(Self::decode_entity(&bytes)?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    async fn store_message(&self, message: &StoredMessage) -> Result<(), StorageError> {
        let row = MessageRow {
            agent_connection_did: message.agent_connection_did.clone(),
            uid: message.uid.clone(),
            status_code: message.status_code.clone(),
            payload: serde_json::to_vec(&message.payload)
                .map_err(|e| StorageError::Serialization(e.to_string()))?,
        };
        let bytes = encode(&row)?;

        let seq = self.db.generate_id()?;
        let message_key = scoped_key(&message.agent_did, &seq.to_be_bytes());
        let uid_key = scoped_key(&message.agent_did, message.uid.as_bytes());

        let result = (&self.messages, &self.message_uids).transaction(|(messages, uids)| {
            if uids.get(uid_key.as_slice())?.is_some() {
                return Err(ConflictableTransactionError::Abort(format!(
                    "uid {} under agent {}",
                    message.uid, message.agent_did
                )));
            }
            messages.insert(message_key.as_slice(), bytes.as_slice())?;
            uids.insert(uid_key.as_slice(), message_key.as_slice())?;
            Ok(())
        });
        conflict(result)
    }

    async fn load_messages(
        &self,
        agent_did: &str,
        filter: &MessageFilter,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let mut messages = Vec::new();

        for item in self.messages.scan_prefix(scoped_key(agent_did, &[])) {
            let (_, bytes) = item?;
            let message = Self::decode_message(agent_did, &bytes)?;
            if filter.matches(&message) {
                messages.push(message);
            }
        }

        Ok(messages)
    }

    async fn update_status_codes(
        &self,
        agent_did: &str,
        uids_by_connection: &[UidsByConnection],
        status_code: &str,
    ) -> Result<Vec<StatusUpdateResult>, StorageError> {
        let mut results = Vec::with_capacity(uids_by_connection.len());

        for entry in uids_by_connection {
            let mut result = StatusUpdateResult {
                agent_connection_did: entry.agent_connection_did.clone(),
                ..Default::default()
            };

            for uid in dedup_uids(&entry.uids) {
                let Some(message_key) = self.message_uids.get(scoped_key(agent_did, uid.as_bytes()))?
                else {
                    result.failed.push(uid.clone());
                    continue;
                };
                let Some(bytes) = self.messages.get(&message_key)? else {
                    result.failed.push(uid.clone());
                    continue;
                };

                let mut row: MessageRow = decode(&bytes)?;
                if row.agent_connection_did != entry.agent_connection_did {
                    result.failed.push(uid.clone());
                    continue;
                }

                row.status_code = status_code.to_string();
                self.messages.insert(message_key, encode(&row)?)?;
                result.updated.push(uid.clone());
            }

            results.push(result);
        }

        Ok(results)
    }

    async fn create_agent(&self, agent_did: &str) -> Result<(), StorageError> {
        // an existing row is kept as is
        let _ = self.agents.compare_and_swap(
            agent_did.as_bytes(),
            None::<&[u8]>,
            Some(encode(&AgentRow::default())?),
        )?;
        Ok(())
    }

    async fn create_agent_connection_link(
        &self,
        link: &AgentConnectionLink,
    ) -> Result<(), StorageError> {
        let bytes = encode(link)?;
        let pairwise_key = scoped_key(&link.agent_did, link.user_pairwise_did.as_bytes());
        let conn_did = link.agent_connection_did.as_bytes();

        let result = (&self.links, &self.links_by_pairwise).transaction(|(links, by_pairwise)| {
            if links.get(conn_did)?.is_some() {
                return Err(ConflictableTransactionError::Abort(format!(
                    "link for {}",
                    link.agent_connection_did
                )));
            }
            links.insert(conn_did, bytes.as_slice())?;
            by_pairwise.insert(pairwise_key.as_slice(), conn_did)?;
            Ok(())
        });
        conflict(result)
    }

    async fn links_by_pairwise_dids(
        &self,
        agent_did: &str,
        user_pairwise_dids: &[String],
    ) -> Result<Vec<AgentConnectionLink>, StorageError> {
        let mut links = Vec::new();

        if user_pairwise_dids.is_empty() {
            for item in self.links_by_pairwise.scan_prefix(scoped_key(agent_did, &[])) {
                let (_, conn_did) = item?;
                links.extend(self.load_link(&conn_did)?);
            }
            return Ok(links);
        }

        for pairwise_did in user_pairwise_dids {
            let key = scoped_key(agent_did, pairwise_did.as_bytes());
            if let Some(conn_did) = self.links_by_pairwise.get(key)? {
                links.extend(self.load_link(&conn_did)?);
            }
        }
        Ok(links)
    }

    async fn links_by_connection_dids(
        &self,
        agent_did: &str,
        agent_connection_dids: &[String],
    ) -> Result<Vec<AgentConnectionLink>, StorageError> {
        if agent_connection_dids.is_empty() {
            return self.links_by_pairwise_dids(agent_did, &[]).await;
        }

        let mut links = Vec::new();
        for conn_did in agent_connection_dids {
            if let Some(link) = self.load_link(conn_did.as_bytes())? {
                if link.agent_did == agent_did {
                    links.push(link);
                }
            }
        }
        Ok(links)
    }

    async fn get_webhook_url(&self, agent_did: &str) -> Result<Option<String>, StorageError> {
        Ok(self.load_agent_row(agent_did)?.and_then(|row| row.webhook_url))
    }

    async fn set_webhook_url(
        &self,
        agent_did: &str,
        webhook_url: Option<&str>,
    ) -> Result<(), StorageError> {
        self.update_agent_row(agent_did, |row| {
            row.webhook_url = webhook_url.map(str::to_string);
        })
    }

    async fn has_new_message(&self, agent_did: &str) -> Result<bool, StorageError> {
        Ok(self
            .load_agent_row(agent_did)?
            .map(|row| row.has_new_message)
            .unwrap_or(false))
    }

    async fn set_has_new_message(
        &self,
        agent_did: &str,
        value: bool,
    ) -> Result<(), StorageError> {
        self.update_agent_row(agent_did, |row| row.has_new_message = value)
    }
}
