// entities/forward_agent.rs - Forward Agent
//
//! Terminal endpoint for all inbound traffic.
//!
//! The outer layer of every inbound envelope is anoncrypted to the Forward
//! Agent. It carries either a legacy `FORWARD {@fwd, @msg}` or an Aries
//! forward `{to, msg}`, which are handed to the Router. Envelopes forwarded to
//! the Forward Agent's own DID carry onboarding (`CONNECT`).

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, instrument};

use super::{AgencyServices, authorize};
use crate::error::{AgencyError, ErrorEnvelope, Result};
use crate::identity::{DidInfo, WalletHandle};
use crate::messages::{AgencyMessage, Connect, PairwiseIdentity};
use crate::observability::record_entity_created;
use crate::routing::{HandleRoutedMessage, MessageRouter, RoutedPayload};
use crate::storage::{AgentRecord, ENTITY_VERSION, EntityRecord, ForwardAgentRecord, StorageError};

/// Wallet name of the agent owned by `owner_did`
pub fn agent_wallet_name(owner_did: &str) -> String {
    format!("agent-{owner_did}")
}

/// The Forward Agent singleton
pub struct ForwardAgent {
    services: Arc<AgencyServices>,
    wallet: WalletHandle,
    router: Weak<dyn MessageRouter>,
}

impl ForwardAgent {
    /// Create or open the Forward Agent identity and persist its record
    pub async fn bootstrap(services: &AgencyServices) -> Result<WalletHandle> {
        let config = &services.config.forward_agent;
        let wallet = services.config.wallet_ref(&config.wallet_name);

        let did_info = services
            .identity
            .create_identity(&wallet, config.seed.as_deref())
            .await?;
        let handle = services.identity.open(&wallet).await?;

        if services.storage.load_entity_record(&did_info.did).await?.is_none() {
            let record = EntityRecord::ForwardAgent(ForwardAgentRecord {
                did: did_info.did.clone(),
                verkey: did_info.verkey.clone(),
                entity_version: ENTITY_VERSION.to_string(),
                wallet_name: config.wallet_name.clone(),
            });
            services.storage.save_entity_record(&record).await?;
            record_entity_created("forward-agent");
        }

        info!(did = %did_info.did, verkey = %did_info.verkey, "Forward Agent ready");
        Ok(handle)
    }

    pub fn new(
        services: Arc<AgencyServices>,
        wallet: WalletHandle,
        router: Weak<dyn MessageRouter>,
    ) -> Self {
        Self {
            services,
            wallet,
            router,
        }
    }

    pub fn did(&self) -> &str {
        self.wallet.did()
    }

    pub fn verkey(&self) -> &str {
        self.wallet.verkey()
    }

    pub fn did_info(&self) -> &DidInfo {
        self.wallet.did_info()
    }

    fn router(&self) -> Result<Arc<dyn MessageRouter>> {
        self.router.upgrade().ok_or(AgencyError::RouterUnavailable)
    }

    /// Handle one inbound envelope. Errors become an [`ErrorEnvelope`]
    /// whose trace id is logged.
    pub async fn handle_message(&self, bytes: &[u8]) -> std::result::Result<Vec<u8>, ErrorEnvelope> {
        self.handle_inbound(bytes).await.map_err(|e| {
            let envelope = ErrorEnvelope::new(&e);
            error!(trace_id = %envelope.error_trace_id, error = %e, "Failed to handle inbound message");
            envelope
        })
    }

    async fn handle_inbound(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let plaintext = self.services.identity.anon_decrypt(&self.wallet, bytes).await?;

        match AgencyMessage::from_slice(&plaintext)? {
            AgencyMessage::Forward(forward) => {
                self.router()?
                    .route_msg(&forward.fwd, RoutedPayload::sealed(&forward.msg)?)
                    .await
            }
            AgencyMessage::AriesForward(forward) => {
                self.router()?
                    .route_msg(&forward.to, RoutedPayload::Relayed(forward.msg))
                    .await
            }
            other => Err(AgencyError::UnknownMessageType(format!(
                "{} is not accepted by the forward agent endpoint",
                other.message_type()
            ))),
        }
    }

    /// Provision (or find) the agent owned by the sender of a CONNECT
    #[instrument(skip(self, connect), fields(owner_did = %connect.from_did))]
    async fn connect(&self, connect: &Connect) -> Result<DidInfo> {
        let storage = &self.services.storage;
        let identity = &self.services.identity;

        if let Some(pairwise) = identity.lookup_pairwise(&self.wallet, &connect.from_did).await? {
            if let Some(EntityRecord::Agent(agent)) = storage.load_entity_record(&pairwise.label).await? {
                authorize(Some(&connect.from_did_verkey), &agent.owner_verkey)?;
                storage.create_agent(&agent.did).await?;
                debug!(agent_did = %agent.did, "Owner already onboarded");
                return Ok(DidInfo {
                    did: agent.did,
                    verkey: agent.verkey,
                });
            }
        }

        // an interrupted onboarding left the wallet behind; reuse its identity
        let wallet_name = agent_wallet_name(&connect.from_did);
        let agent_info = identity
            .create_identity(&self.services.config.wallet_ref(&wallet_name), None)
            .await?;

        match storage.load_entity_record(&agent_info.did).await? {
            Some(EntityRecord::Agent(agent)) => {
                authorize(Some(&connect.from_did_verkey), &agent.owner_verkey)?;
            }
            Some(other) => {
                return Err(StorageError::Conflict(format!(
                    "{} is already a {}",
                    agent_info.did,
                    other.entity_type()
                ))
                .into());
            }
            None => {
                let record = EntityRecord::Agent(AgentRecord {
                    did: agent_info.did.clone(),
                    verkey: agent_info.verkey.clone(),
                    entity_version: ENTITY_VERSION.to_string(),
                    wallet_name,
                    owner_did: connect.from_did.clone(),
                    owner_verkey: connect.from_did_verkey.clone(),
                });
                storage.save_entity_record(&record).await?;
                record_entity_created("agent");
                info!(agent_did = %agent_info.did, "Agent created");
            }
        }

        storage.create_agent(&agent_info.did).await?;
        identity
            .store_pairwise(
                &self.wallet,
                &connect.from_did,
                &connect.from_did_verkey,
                &agent_info.did,
            )
            .await?;

        Ok(agent_info)
    }
}

#[async_trait]
impl HandleRoutedMessage for ForwardAgent {
    async fn handle_routed_message(&self, payload: RoutedPayload) -> Result<Vec<u8>> {
        let bytes = match payload {
            RoutedPayload::Sealed(bytes) => bytes,
            RoutedPayload::Relayed(_) => {
                return Err(AgencyError::UnknownMessageType(
                    "the forward agent does not store relayed messages".to_string(),
                ));
            }
        };

        let unpacked = self.services.identity.unpack(&self.wallet, &bytes).await?;

        match AgencyMessage::from_slice(&unpacked.message)? {
            AgencyMessage::Connect(connect) => {
                let sender = unpacked.sender_verkey.as_deref();
                authorize(sender, &connect.from_did_verkey)?;

                let agent = self.connect(&connect).await?;
                let reply = AgencyMessage::Connected(PairwiseIdentity {
                    did: agent.did,
                    verkey: agent.verkey,
                });
                self.services
                    .seal_reply(&self.wallet, &reply, &connect.from_did_verkey)
                    .await
            }
            AgencyMessage::Forward(forward) => {
                self.router()?
                    .route_msg(&forward.fwd, RoutedPayload::sealed(&forward.msg)?)
                    .await
            }
            other => Err(AgencyError::UnknownMessageType(other.message_type().to_string())),
        }
    }
}
