// entities/mod.rs - Agency Entities
//
//! The three protocol state machines.
//!
//! - [`ForwardAgent`]: singleton endpoint for all inbound traffic, onboarding
//! - [`AgentAo`]: one per owner, provisions connections and serves messages
//! - [`AgentConnectionAo`]: one per pairwise relationship, stores inbound messages
//!
//! Every entity owns one wallet. Handles for agents and connections are built
//! per request by the [`Resolver`](crate::routing::Resolver).

pub mod agent;
pub mod agent_connection;
pub mod forward_agent;

pub use agent::AgentAo;
pub use agent_connection::AgentConnectionAo;
pub use forward_agent::ForwardAgent;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::config::AgencyConfig;
use crate::error::{AgencyError, Result};
use crate::identity::{IdentityProvider, WalletHandle};
use crate::messages::AgencyMessage;
use crate::notifications::Notifier;
use crate::routing::{HandleRoutedMessage, RoutedPayload};
use crate::storage::Storage;
use crate::webhook::WebhookDispatcher;

/// Services shared by every entity
pub struct AgencyServices {
    pub config: AgencyConfig,
    pub storage: Arc<dyn Storage>,
    pub identity: Arc<dyn IdentityProvider>,
    pub notifier: Notifier,
    pub webhook: WebhookDispatcher,
}

impl fmt::Debug for AgencyServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgencyServices")
            .field("listen_address", &self.config.listen_address)
            .field("notifications", &self.notifier.is_available())
            .finish_non_exhaustive()
    }
}

impl AgencyServices {
    /// Open an entity wallet by name
    pub(crate) async fn open_wallet(&self, wallet_name: &str) -> Result<WalletHandle> {
        let wallet = self.config.wallet_ref(wallet_name);
        Ok(self.identity.open(&wallet).await?)
    }

    /// Serialize a reply and authcrypt it from `wallet` to `recipient_verkey`
    pub(crate) async fn seal_reply(
        &self,
        wallet: &WalletHandle,
        reply: &AgencyMessage,
        recipient_verkey: &str,
    ) -> Result<Vec<u8>> {
        let bytes = reply.to_vec()?;
        Ok(self
            .identity
            .auth_encrypt(wallet, &bytes, recipient_verkey, wallet.verkey())
            .await?)
    }
}

/// Reject a sender that is not the expected key
pub(crate) fn authorize(sender_verkey: Option<&str>, expected: &str) -> Result<()> {
    match sender_verkey {
        Some(sender) if sender == expected => Ok(()),
        Some(sender) => Err(AgencyError::Unauthorized(format!(
            "sender {sender} is not allowed here"
        ))),
        None => Err(AgencyError::Unauthorized(
            "anonymous messages are not allowed here".to_string(),
        )),
    }
}

/// A resolved entity
pub enum EntityHandle {
    ForwardAgent(Arc<ForwardAgent>),
    Agent(AgentAo),
    AgentConnection(AgentConnectionAo),
}

impl EntityHandle {
    pub fn entity_type(&self) -> &'static str {
        match self {
            Self::ForwardAgent(_) => "forward-agent",
            Self::Agent(_) => "agent",
            Self::AgentConnection(_) => "agent-connection",
        }
    }

    pub fn did(&self) -> &str {
        match self {
            Self::ForwardAgent(fa) => fa.did(),
            Self::Agent(agent) => agent.did(),
            Self::AgentConnection(connection) => connection.did(),
        }
    }
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityHandle")
            .field("entity_type", &self.entity_type())
            .field("did", &self.did())
            .finish()
    }
}

#[async_trait]
impl HandleRoutedMessage for EntityHandle {
    async fn handle_routed_message(&self, payload: RoutedPayload) -> Result<Vec<u8>> {
        match self {
            Self::ForwardAgent(fa) => fa.handle_routed_message(payload).await,
            Self::Agent(agent) => agent.handle_routed_message(payload).await,
            Self::AgentConnection(connection) => connection.handle_routed_message(payload).await,
        }
    }
}
