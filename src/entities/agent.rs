// entities/agent.rs - Agent

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, instrument};

use super::{AgencyServices, authorize};
use crate::error::{AgencyError, Result};
use crate::identity::WalletHandle;
use crate::messages::{
    AgencyMessage, ComMethodUpdated, ConnectionMessages, CreateKey, GetMsgsByConns, MessageEntry,
    MsgStatusUpdatedByConns, MsgsByConns, PairwiseIdentity, PairwiseUids, UpdateComMethod,
    UpdateMsgStatusByConns,
};
use crate::observability::{record_entity_created, record_status_update};
use crate::routing::{HandleRoutedMessage, MessageRouter, RoutedPayload};
use crate::storage::{
    AgentConnectionLink, AgentConnectionRecord, AgentRecord, ENTITY_VERSION, EntityRecord,
    MessageFilter, StorageError, UidsByConnection,
};

/// Wallet name of the connection between `agent_did` and a user pairwise DID
pub fn connection_wallet_name(agent_did: &str, user_pairwise_did: &str) -> String {
    format!("agent-connection-{agent_did}-{user_pairwise_did}")
}

/// Agent access object, authorized by its owner's verkey
pub struct AgentAo {
    services: Arc<AgencyServices>,
    wallet: WalletHandle,
    record: AgentRecord,
    router: Weak<dyn MessageRouter>,
}

impl AgentAo {
    pub async fn load(
        services: Arc<AgencyServices>,
        record: AgentRecord,
        router: Weak<dyn MessageRouter>,
    ) -> Result<Self> {
        let wallet = services.open_wallet(&record.wallet_name).await?;
        Ok(Self {
            services,
            wallet,
            record,
            router,
        })
    }

    pub fn did(&self) -> &str {
        &self.record.did
    }

    pub fn owner_verkey(&self) -> &str {
        &self.record.owner_verkey
    }

    fn identity(&self) -> PairwiseIdentity {
        PairwiseIdentity {
            did: self.record.did.clone(),
            verkey: self.record.verkey.clone(),
        }
    }

    async fn handle_owner_message(&self, message: AgencyMessage) -> Result<AgencyMessage> {
        match message {
            AgencyMessage::SignUp => Ok(AgencyMessage::SignedUp),
            AgencyMessage::CreateAgent => Ok(AgencyMessage::AgentCreated(self.identity())),
            AgencyMessage::CreateKey(create_key) => {
                Ok(AgencyMessage::KeyCreated(self.create_key(&create_key).await?))
            }
            AgencyMessage::GetMsgsByConns(request) => {
                Ok(AgencyMessage::MsgsByConns(self.get_msgs_by_conns(request).await?))
            }
            AgencyMessage::UpdateMsgStatusByConns(request) => Ok(
                AgencyMessage::MsgStatusUpdatedByConns(self.update_msg_status_by_conns(request).await?),
            ),
            AgencyMessage::UpdateComMethod(request) => {
                Ok(AgencyMessage::ComMethodUpdated(self.update_com_method(request).await?))
            }
            other => Err(AgencyError::UnknownMessageType(other.message_type().to_string())),
        }
    }

    /// Provision the agent-connection for a user pairwise DID; repeated
    /// requests return the existing connection
    #[instrument(skip(self, request), fields(agent_did = %self.record.did, for_did = %request.for_did))]
    async fn create_key(&self, request: &CreateKey) -> Result<PairwiseIdentity> {
        let storage = &self.services.storage;

        let existing = storage
            .links_by_pairwise_dids(&self.record.did, std::slice::from_ref(&request.for_did))
            .await?;
        if let Some(link) = existing.first() {
            if let Some(EntityRecord::AgentConnection(connection)) =
                storage.load_entity_record(&link.agent_connection_did).await?
            {
                debug!(connection_did = %connection.did, "Connection already provisioned");
                return Ok(PairwiseIdentity {
                    did: connection.did,
                    verkey: connection.verkey,
                });
            }
        }

        let wallet_name = connection_wallet_name(&self.record.did, &request.for_did);
        let connection = self
            .services
            .identity
            .create_identity(&self.services.config.wallet_ref(&wallet_name), None)
            .await?;

        if storage.load_entity_record(&connection.did).await?.is_none() {
            let record = EntityRecord::AgentConnection(AgentConnectionRecord {
                did: connection.did.clone(),
                verkey: connection.verkey.clone(),
                entity_version: ENTITY_VERSION.to_string(),
                wallet_name,
                agent_did: self.record.did.clone(),
                owner_did: self.record.owner_did.clone(),
                owner_verkey: self.record.owner_verkey.clone(),
                user_pairwise_did: request.for_did.clone(),
                user_pairwise_verkey: request.for_did_verkey.clone(),
            });
            ignore_conflict(storage.save_entity_record(&record).await)?;
            record_entity_created("agent-connection");
        }

        let link = AgentConnectionLink {
            agent_connection_did: connection.did.clone(),
            user_pairwise_did: request.for_did.clone(),
            agent_did: self.record.did.clone(),
        };
        ignore_conflict(storage.create_agent_connection_link(&link).await)?;

        info!(connection_did = %connection.did, "Agent connection created");
        Ok(PairwiseIdentity {
            did: connection.did,
            verkey: connection.verkey,
        })
    }

    async fn get_msgs_by_conns(&self, request: GetMsgsByConns) -> Result<MsgsByConns> {
        let storage = &self.services.storage;
        let links = storage
            .links_by_pairwise_dids(&self.record.did, &request.pairwise_dids)
            .await?;

        // a pairwise filter nobody matches must not widen to every connection
        if links.is_empty() {
            return Ok(MsgsByConns {
                msgs_by_conns: Vec::new(),
            });
        }

        let filter = MessageFilter::new()
            .with_connections(links.iter().map(|l| l.agent_connection_did.clone()).collect())
            .with_uids(request.uids)
            .with_status_codes(request.status_codes);
        let messages = storage.load_messages(&self.record.did, &filter).await?;

        let mut by_connection: HashMap<String, Vec<MessageEntry>> = HashMap::new();
        for message in messages {
            by_connection
                .entry(message.agent_connection_did)
                .or_default()
                .push(MessageEntry {
                    uid: message.uid,
                    status_code: message.status_code,
                    payload: message.payload,
                });
        }

        let msgs_by_conns = links
            .into_iter()
            .filter_map(|link| {
                by_connection
                    .remove(&link.agent_connection_did)
                    .map(|msgs| ConnectionMessages {
                        pairwise_did: link.user_pairwise_did,
                        msgs,
                    })
            })
            .collect();

        Ok(MsgsByConns { msgs_by_conns })
    }

    async fn update_msg_status_by_conns(
        &self,
        request: UpdateMsgStatusByConns,
    ) -> Result<MsgStatusUpdatedByConns> {
        let mut reply = MsgStatusUpdatedByConns {
            status_code: request.status_code.clone(),
            updated_uids_by_conns: Vec::new(),
            failed_uids_by_conns: Vec::new(),
        };
        if request.uids_by_conns.is_empty() {
            return Ok(reply);
        }

        let storage = &self.services.storage;
        let pairwise_dids: Vec<String> = request
            .uids_by_conns
            .iter()
            .map(|entry| entry.pairwise_did.clone())
            .collect();
        let links = storage
            .links_by_pairwise_dids(&self.record.did, &pairwise_dids)
            .await?;

        let connection_of: HashMap<&str, &str> = links
            .iter()
            .map(|l| (l.user_pairwise_did.as_str(), l.agent_connection_did.as_str()))
            .collect();
        let pairwise_of: HashMap<&str, &str> = links
            .iter()
            .map(|l| (l.agent_connection_did.as_str(), l.user_pairwise_did.as_str()))
            .collect();

        let mut uids_by_connection = Vec::new();
        for entry in request.uids_by_conns {
            match connection_of.get(entry.pairwise_did.as_str()) {
                Some(connection_did) => uids_by_connection.push(UidsByConnection {
                    agent_connection_did: connection_did.to_string(),
                    uids: entry.uids,
                }),
                None => reply.failed_uids_by_conns.push(entry),
            }
        }

        let results = storage
            .update_status_codes(&self.record.did, &uids_by_connection, &request.status_code)
            .await?;

        for result in results {
            let Some(pairwise_did) = pairwise_of.get(result.agent_connection_did.as_str()) else {
                continue;
            };
            record_status_update(result.updated.len(), result.failed.len());
            if !result.updated.is_empty() {
                reply.updated_uids_by_conns.push(PairwiseUids {
                    pairwise_did: pairwise_did.to_string(),
                    uids: result.updated,
                });
            }
            if !result.failed.is_empty() {
                reply.failed_uids_by_conns.push(PairwiseUids {
                    pairwise_did: pairwise_did.to_string(),
                    uids: result.failed,
                });
            }
        }

        Ok(reply)
    }

    async fn update_com_method(&self, request: UpdateComMethod) -> Result<ComMethodUpdated> {
        let method = request.com_method;
        let webhook_url = Some(method.value.as_str()).filter(|url| !url.is_empty());

        self.services
            .storage
            .set_webhook_url(&self.record.did, webhook_url)
            .await?;
        debug!(agent_did = %self.record.did, cleared = webhook_url.is_none(), "Webhook updated");

        Ok(ComMethodUpdated { id: method.id })
    }
}

fn ignore_conflict(result: std::result::Result<(), StorageError>) -> Result<()> {
    match result {
        Ok(()) | Err(StorageError::Conflict(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl HandleRoutedMessage for AgentAo {
    async fn handle_routed_message(&self, payload: RoutedPayload) -> Result<Vec<u8>> {
        let bytes = match payload {
            RoutedPayload::Sealed(bytes) => bytes,
            RoutedPayload::Relayed(_) => {
                return Err(AgencyError::UnknownMessageType(
                    "agents do not store relayed messages".to_string(),
                ));
            }
        };

        let unpacked = self.services.identity.unpack(&self.wallet, &bytes).await?;
        let message = AgencyMessage::from_slice(&unpacked.message)?;

        if let AgencyMessage::Forward(forward) = message {
            let router = self.router.upgrade().ok_or(AgencyError::RouterUnavailable)?;
            return router
                .route_msg(&forward.fwd, RoutedPayload::sealed(&forward.msg)?)
                .await;
        }

        authorize(unpacked.sender_verkey.as_deref(), &self.record.owner_verkey)?;
        let reply = self.handle_owner_message(message).await?;
        self.services
            .seal_reply(&self.wallet, &reply, &self.record.owner_verkey)
            .await
    }
}
