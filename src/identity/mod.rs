// identity/mod.rs - Identity Provider
//
//! Identity Provider interface consumed by the agency core
//!
//! Every entity owns one wallet holding one DID/verkey. The core only ever sees
//! [`WalletRef`] (how to open a wallet) and [`WalletHandle`] (an open wallet);
//! key material stays inside the provider.
//!
//! # Example
//!
//! ```ignore
//! use ssi_agency::identity::{IdentityProvider, LocalIdentityProvider};
//!
//! let provider = LocalIdentityProvider::in_memory()?;
//! let wallet = config.wallet_ref("agent-owner");
//! let did = provider.create_identity(&wallet, None).await?;
//! let handle = provider.open(&wallet).await?;
//! let sealed = provider.anon_encrypt(b"hi", &did.verkey).await?;
//! ```

pub mod envelope;
pub mod local;

pub use envelope::SealedEnvelope;
pub use local::LocalIdentityProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors related to identity operations
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    #[error("Wallet not open: {0}")]
    WalletNotOpen(String),

    #[error("Invalid key for wallet: {0}")]
    InvalidWalletKey(String),

    #[error("Invalid verkey: {0}")]
    InvalidVerkey(String),

    #[error("Invalid seed: {0}")]
    InvalidSeed(String),

    #[error("Key {0} is not held by this wallet")]
    UnknownSenderKey(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
}

/// How to open a wallet
#[derive(Clone, PartialEq, Eq)]
pub struct WalletRef {
    pub name: String,
    pub key: String,
}

impl fmt::Debug for WalletRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletRef")
            .field("name", &self.name)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Public part of an identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DidInfo {
    pub did: String,
    pub verkey: String,
}

/// An open wallet
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WalletHandle {
    name: String,
    did_info: DidInfo,
}

impl WalletHandle {
    pub(crate) fn new(name: String, did_info: DidInfo) -> Self {
        Self { name, did_info }
    }

    /// Wallet name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// DID held by the wallet
    pub fn did(&self) -> &str {
        &self.did_info.did
    }

    /// Verkey held by the wallet
    pub fn verkey(&self) -> &str {
        &self.did_info.verkey
    }

    pub fn did_info(&self) -> &DidInfo {
        &self.did_info
    }
}

/// Result of decrypting an envelope of either kind
#[derive(Debug, Clone)]
pub struct Unpacked {
    pub message: Vec<u8>,

    /// Present only for authenticated envelopes
    pub sender_verkey: Option<String>,
}

/// Pairwise record kept in a wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairwiseRecord {
    pub their_did: String,
    pub their_verkey: String,
    pub label: String,
}

/// Cryptographic identity operations used by the agency
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Create the wallet and its identity. Calling it again for an existing
    /// wallet returns the identity already stored there.
    async fn create_identity(
        &self,
        wallet: &WalletRef,
        seed: Option<&str>,
    ) -> Result<DidInfo, IdentityError>;

    /// Open a wallet. Repeated and concurrent opens return the same handle.
    async fn open(&self, wallet: &WalletRef) -> Result<WalletHandle, IdentityError>;

    /// Whether a wallet with this name exists
    async fn wallet_exists(&self, wallet_name: &str) -> Result<bool, IdentityError>;

    async fn auth_encrypt(
        &self,
        handle: &WalletHandle,
        message: &[u8],
        recipient_verkey: &str,
        sender_verkey: &str,
    ) -> Result<Vec<u8>, IdentityError>;

    async fn anon_encrypt(
        &self,
        message: &[u8],
        recipient_verkey: &str,
    ) -> Result<Vec<u8>, IdentityError>;

    /// Decrypt an authenticated envelope, returning the sender verkey
    async fn auth_decrypt(
        &self,
        handle: &WalletHandle,
        bytes: &[u8],
    ) -> Result<(Vec<u8>, String), IdentityError>;

    /// Decrypt an anonymous envelope
    async fn anon_decrypt(&self, handle: &WalletHandle, bytes: &[u8])
    -> Result<Vec<u8>, IdentityError>;

    /// Decrypt an envelope of either kind
    async fn unpack(&self, handle: &WalletHandle, bytes: &[u8]) -> Result<Unpacked, IdentityError>;

    async fn store_pairwise(
        &self,
        handle: &WalletHandle,
        their_did: &str,
        their_verkey: &str,
        label: &str,
    ) -> Result<(), IdentityError>;

    async fn lookup_pairwise(
        &self,
        handle: &WalletHandle,
        their_did: &str,
    ) -> Result<Option<PairwiseRecord>, IdentityError>;
}
