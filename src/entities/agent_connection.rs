// entities/agent_connection.rs - Agent-Connection

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AgencyServices, authorize};
use crate::error::{AgencyError, Result};
use crate::identity::WalletHandle;
use crate::messages::{AgencyMessage, GetMsgs, MessageEntry, MsgStatus, Msgs, STATUS_RECEIVED};
use crate::notifications::NotificationError;
use crate::observability::{record_message_stored, record_status_update};
use crate::routing::{HandleRoutedMessage, RoutedPayload};
use crate::storage::{AgentConnectionRecord, MessageFilter, StoredMessage, UidsByConnection};
use crate::webhook::NewMessageEvent;

/// Agent-connection access object. Anyone may relay messages to it; only the
/// user's pairwise key may read them.
pub struct AgentConnectionAo {
    services: Arc<AgencyServices>,
    wallet: WalletHandle,
    record: AgentConnectionRecord,
}

impl AgentConnectionAo {
    pub async fn load(services: Arc<AgencyServices>, record: AgentConnectionRecord) -> Result<Self> {
        let wallet = services.open_wallet(&record.wallet_name).await?;
        Ok(Self {
            services,
            wallet,
            record,
        })
    }

    pub fn did(&self) -> &str {
        &self.record.did
    }

    pub fn agent_did(&self) -> &str {
        &self.record.agent_did
    }

    /// Store a relayed message and tell the owner about it
    async fn store_inbound(&self, payload: Value) -> Result<()> {
        let agent_did = &self.record.agent_did;
        let uid = Uuid::new_v4().to_string();

        self.services
            .storage
            .store_message(&StoredMessage {
                agent_did: agent_did.clone(),
                agent_connection_did: self.record.did.clone(),
                uid: uid.clone(),
                status_code: STATUS_RECEIVED.to_string(),
                payload,
            })
            .await?;
        record_message_stored();
        debug!(agent_did = %agent_did, connection_did = %self.record.did, uid = %uid, "Stored inbound message");

        // delivery is done; signalling failures are only logged
        match self.services.notifier.flag_new_message(agent_did).await {
            Ok(()) | Err(NotificationError::Unavailable) => {}
            Err(e) => warn!(agent_did = %agent_did, error = %e, "Failed to flag new message"),
        }
        if let Err(e) = self.services.storage.set_has_new_message(agent_did, true).await {
            warn!(agent_did = %agent_did, error = %e, "Failed to set new-message flag");
        }

        match self.services.storage.get_webhook_url(agent_did).await {
            Ok(Some(url)) => self.services.webhook.dispatch(
                &url,
                NewMessageEvent {
                    msg_uid: uid,
                    pw_did: self.record.user_pairwise_did.clone(),
                },
            ),
            Ok(None) => {}
            Err(e) => warn!(agent_did = %agent_did, error = %e, "Failed to load webhook url"),
        }

        Ok(())
    }

    async fn get_msgs(&self, request: GetMsgs) -> Result<Msgs> {
        let filter = MessageFilter::new()
            .with_connections(vec![self.record.did.clone()])
            .with_uids(request.uids)
            .with_status_codes(request.status_codes);

        let msgs = self
            .services
            .storage
            .load_messages(&self.record.agent_did, &filter)
            .await?
            .into_iter()
            .map(|m| MessageEntry {
                uid: m.uid,
                status_code: m.status_code,
                payload: m.payload,
            })
            .collect();

        Ok(Msgs { msgs })
    }

    async fn update_msg_status(&self, request: MsgStatus) -> Result<MsgStatus> {
        let results = self
            .services
            .storage
            .update_status_codes(
                &self.record.agent_did,
                &[UidsByConnection {
                    agent_connection_did: self.record.did.clone(),
                    uids: request.uids,
                }],
                &request.status_code,
            )
            .await?;

        let uids = results
            .into_iter()
            .flat_map(|result| {
                record_status_update(result.updated.len(), result.failed.len());
                result.updated
            })
            .collect();

        Ok(MsgStatus {
            status_code: request.status_code,
            uids,
        })
    }
}

#[async_trait]
impl HandleRoutedMessage for AgentConnectionAo {
    async fn handle_routed_message(&self, payload: RoutedPayload) -> Result<Vec<u8>> {
        let bytes = match payload {
            RoutedPayload::Relayed(message) => {
                self.store_inbound(message).await?;
                return Ok(Vec::new());
            }
            RoutedPayload::Sealed(bytes) => bytes,
        };

        let unpacked = self.services.identity.unpack(&self.wallet, &bytes).await?;
        authorize(
            unpacked.sender_verkey.as_deref(),
            &self.record.user_pairwise_verkey,
        )?;

        let reply = match AgencyMessage::from_slice(&unpacked.message)? {
            AgencyMessage::GetMsgs(request) => AgencyMessage::Msgs(self.get_msgs(request).await?),
            AgencyMessage::UpdateMsgStatus(request) => {
                AgencyMessage::MsgStatusUpdated(self.update_msg_status(request).await?)
            }
            other => {
                return Err(AgencyError::UnknownMessageType(
                    other.message_type().to_string(),
                ));
            }
        };

        self.services
            .seal_reply(&self.wallet, &reply, &self.record.user_pairwise_verkey)
            .await
    }
}
