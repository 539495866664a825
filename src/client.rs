// client.rs - Agency Client Packer
//
//! Builds the nested envelopes a client sends to the agency and opens the
//! replies.
//!
//! ```text
//! anoncrypt(forward agent,
//!     FORWARD { @fwd: entity DID,
//!               @msg: authcrypt(entity verkey, message) })
//! ```
//!
//! Onboarding uses the same shape with the Forward Agent itself as entity.

use serde_json::Value;
use std::sync::Arc;

use crate::error::{AgencyError, Result};
use crate::identity::{DidInfo, IdentityProvider, WalletHandle, WalletRef};
use crate::messages::{AgencyMessage, AriesForward, Connect, Forward};

/// Packs messages for the agency from one client identity
pub struct AgencyClient {
    identity: Arc<dyn IdentityProvider>,
    wallet: WalletHandle,
    agency: DidInfo,
}

impl AgencyClient {
    /// Create (or reopen) the client identity held in `wallet`
    pub async fn new(
        identity: Arc<dyn IdentityProvider>,
        wallet: &WalletRef,
        agency: DidInfo,
    ) -> Result<Self> {
        identity.create_identity(wallet, None).await?;
        let wallet = identity.open(wallet).await?;
        Ok(Self {
            identity,
            wallet,
            agency,
        })
    }

    pub fn did_info(&self) -> &DidInfo {
        self.wallet.did_info()
    }

    pub fn did(&self) -> &str {
        self.wallet.did()
    }

    pub fn verkey(&self) -> &str {
        self.wallet.verkey()
    }

    /// CONNECT from this identity to the Forward Agent
    pub async fn pack_connect(&self) -> Result<Vec<u8>> {
        let connect = AgencyMessage::Connect(Connect {
            from_did: self.did().to_string(),
            from_did_verkey: self.verkey().to_string(),
        });
        let agency = self.agency.clone();
        self.pack_for(&agency, &connect).await
    }

    /// Authcrypt `message` to `recipient` and forward it through the agency
    pub async fn pack_for(&self, recipient: &DidInfo, message: &AgencyMessage) -> Result<Vec<u8>> {
        let inner = self
            .identity
            .auth_encrypt(&self.wallet, &message.to_vec()?, &recipient.verkey, self.verkey())
            .await?;
        self.forward_to(&recipient.did, &inner).await
    }

    /// Like [`pack_for`](Self::pack_for) without revealing the sender
    pub async fn pack_anonymous_for(
        &self,
        recipient: &DidInfo,
        message: &AgencyMessage,
    ) -> Result<Vec<u8>> {
        let inner = self
            .identity
            .anon_encrypt(&message.to_vec()?, &recipient.verkey)
            .await?;
        self.forward_to(&recipient.did, &inner).await
    }

    /// Wrap an already sealed envelope in a legacy FORWARD to `to`
    pub async fn forward_to(&self, to: &str, sealed: &[u8]) -> Result<Vec<u8>> {
        let msg: Value = serde_json::from_slice(sealed)
            .map_err(|e| AgencyError::MalformedMessage(e.to_string()))?;
        let forward = AgencyMessage::Forward(Forward {
            fwd: to.to_string(),
            msg,
        });
        self.seal_for_agency(&forward).await
    }

    /// Aries forward of an opaque message to an agent-connection
    pub async fn pack_aries_forward(&self, to: &str, msg: Value) -> Result<Vec<u8>> {
        let forward = AgencyMessage::AriesForward(AriesForward {
            to: to.to_string(),
            msg,
        });
        self.seal_for_agency(&forward).await
    }

    async fn seal_for_agency(&self, message: &AgencyMessage) -> Result<Vec<u8>> {
        Ok(self
            .identity
            .anon_encrypt(&message.to_vec()?, &self.agency.verkey)
            .await?)
    }

    /// Open a reply, returning it with the sender verkey
    pub async fn unpack(&self, bytes: &[u8]) -> Result<(AgencyMessage, String)> {
        let (message, sender) = self.identity.auth_decrypt(&self.wallet, bytes).await?;
        Ok((AgencyMessage::from_slice(&message)?, sender))
    }
}
