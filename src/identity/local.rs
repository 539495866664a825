// identity/local.rs - Local Identity Provider using Sled

use async_trait::async_trait;
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use dashmap::DashMap;
use ed25519_dalek::{SECRET_KEY_LENGTH, SigningKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sled::{Db, Tree};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::envelope;
use super::{
    DidInfo, IdentityError, IdentityProvider, PairwiseRecord, Unpacked, WalletHandle, WalletRef,
};

/// Tree names for different data types
const TREE_WALLETS: &str = "wallets";
const TREE_PAIRWISE: &str = "pairwise";

const NONCE_SIZE: usize = 12;

/// Wallet content as persisted (sealed under the wallet key)
#[derive(Serialize, Deserialize)]
struct StoredWallet {
    did: String,
    verkey: String,
    secret_key: Vec<u8>,
    created_at: i64,
}

/// Decrypted wallet kept in the open-wallet cache
struct OpenWallet {
    did_info: DidInfo,
    signing_key: SigningKey,
    key_digest: [u8; 32],
}

/// Identity provider keeping one sealed wallet per entity in sled
pub struct LocalIdentityProvider {
    db: Db,
    wallets: Tree,
    pairwise: Tree,
    open_wallets: DashMap<String, Arc<OpenWallet>>,
}

impl fmt::Debug for LocalIdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentityProvider")
            .field("wallets", &self.wallets.len())
            .field("open_wallets", &self.open_wallets.len())
            .finish()
    }
}

impl LocalIdentityProvider {
    /// Open or create a wallet vault at the given path
    pub fn open_vault<P: AsRef<Path>>(path: P) -> Result<Self, IdentityError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a temporary vault (for testing)
    pub fn in_memory() -> Result<Self, IdentityError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, IdentityError> {
        let wallets = db.open_tree(TREE_WALLETS)?;
        let pairwise = db.open_tree(TREE_PAIRWISE)?;

        Ok(Self {
            db,
            wallets,
            pairwise,
            open_wallets: DashMap::new(),
        })
    }

    fn wallet(&self, handle: &WalletHandle) -> Result<Arc<OpenWallet>, IdentityError> {
        self.open_wallets
            .get(handle.name())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| IdentityError::WalletNotOpen(handle.name().to_string()))
    }

    fn pairwise_key(wallet_name: &str, their_did: &str) -> Vec<u8> {
        [wallet_name.as_bytes(), &[0u8], their_did.as_bytes()].concat()
    }
}

fn key_digest(wallet_key: &str) -> [u8; 32] {
    Sha256::digest(wallet_key.as_bytes()).into()
}

fn seal_wallet(stored: &StoredWallet, wallet_key: &str) -> Result<Vec<u8>, IdentityError> {
    let plaintext = bincode::serde::encode_to_vec(stored, bincode::config::standard())
        .map_err(|e| IdentityError::Serialization(e.to_string()))?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);

    let digest = key_digest(wallet_key);
    let ciphertext = ChaCha20Poly1305::new(Key::from_slice(&digest))
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|e| IdentityError::Encryption(e.to_string()))?;

    Ok([nonce.as_slice(), ciphertext.as_slice()].concat())
}

fn unseal_wallet(bytes: &[u8], wallet: &WalletRef) -> Result<StoredWallet, IdentityError> {
    if bytes.len() < NONCE_SIZE {
        return Err(IdentityError::Serialization(format!(
            "wallet {} is truncated",
            wallet.name
        )));
    }
    let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);

    let digest = key_digest(&wallet.key);
    let plaintext = ChaCha20Poly1305::new(Key::from_slice(&digest))
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| IdentityError::InvalidWalletKey(wallet.name.clone()))?;

    let (stored, _): (StoredWallet, _) =
        bincode::serde::decode_from_slice(&plaintext, bincode::config::standard())
            .map_err(|e| IdentityError::Serialization(e.to_string()))?;
    Ok(stored)
}

fn signing_key_from_seed(seed: Option<&str>) -> Result<SigningKey, IdentityError> {
    let mut secret = [0u8; SECRET_KEY_LENGTH];
    match seed {
        Some(seed) => {
            if seed.len() != SECRET_KEY_LENGTH {
                return Err(IdentityError::InvalidSeed(format!(
                    "expected {} bytes, got {}",
                    SECRET_KEY_LENGTH,
                    seed.len()
                )));
            }
            secret.copy_from_slice(seed.as_bytes());
        }
        None => rand::rng().fill_bytes(&mut secret),
    }
    Ok(SigningKey::from_bytes(&secret))
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    async fn create_identity(
        &self,
        wallet: &WalletRef,
        seed: Option<&str>,
    ) -> Result<DidInfo, IdentityError> {
        if self.wallets.contains_key(wallet.name.as_bytes())? {
            debug!(wallet = %wallet.name, "Wallet exists, reusing its identity");
            return Ok(self.open(wallet).await?.did_info().clone());
        }

        let signing_key = signing_key_from_seed(seed)?;
        let verifying_key = signing_key.verifying_key();
        let did_info = DidInfo {
            did: envelope::did_from_verkey(&verifying_key),
            verkey: envelope::encode_verkey(&verifying_key),
        };

        let stored = StoredWallet {
            did: did_info.did.clone(),
            verkey: did_info.verkey.clone(),
            secret_key: signing_key.to_bytes().to_vec(),
            created_at: chrono::Utc::now().timestamp(),
        };
        let sealed = seal_wallet(&stored, &wallet.key)?;

        let swapped = self
            .wallets
            .compare_and_swap(wallet.name.as_bytes(), None::<&[u8]>, Some(sealed))?;
        if swapped.is_err() {
            // lost a creation race; the winner's identity is the wallet's identity
            return Ok(self.open(wallet).await?.did_info().clone());
        }
        self.db.flush_async().await?;

        info!(wallet = %wallet.name, did = %did_info.did, "Created identity");
        Ok(did_info)
    }

    async fn open(&self, wallet: &WalletRef) -> Result<WalletHandle, IdentityError> {
        let digest = key_digest(&wallet.key);

        if let Some(open) = self.open_wallets.get(&wallet.name) {
            if open.key_digest != digest {
                return Err(IdentityError::InvalidWalletKey(wallet.name.clone()));
            }
            return Ok(WalletHandle::new(wallet.name.clone(), open.did_info.clone()));
        }

        let bytes = self
            .wallets
            .get(wallet.name.as_bytes())?
            .ok_or_else(|| IdentityError::WalletNotFound(wallet.name.clone()))?;
        let stored = unseal_wallet(&bytes, wallet)?;

        let secret: [u8; SECRET_KEY_LENGTH] = stored
            .secret_key
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::Serialization(format!("wallet {} key", wallet.name)))?;

        let opened = Arc::new(OpenWallet {
            did_info: DidInfo {
                did: stored.did,
                verkey: stored.verkey,
            },
            signing_key: SigningKey::from_bytes(&secret),
            key_digest: digest,
        });

        // concurrent first opens race here; whichever lands first is kept
        let open = self
            .open_wallets
            .entry(wallet.name.clone())
            .or_insert(opened)
            .clone();

        debug!(wallet = %wallet.name, did = %open.did_info.did, "Opened wallet");
        Ok(WalletHandle::new(wallet.name.clone(), open.did_info.clone()))
    }

    async fn wallet_exists(&self, wallet_name: &str) -> Result<bool, IdentityError> {
        Ok(self.wallets.contains_key(wallet_name.as_bytes())?)
    }

    async fn auth_encrypt(
        &self,
        handle: &WalletHandle,
        message: &[u8],
        recipient_verkey: &str,
        sender_verkey: &str,
    ) -> Result<Vec<u8>, IdentityError> {
        let wallet = self.wallet(handle)?;
        if wallet.did_info.verkey != sender_verkey {
            return Err(IdentityError::UnknownSenderKey(sender_verkey.to_string()));
        }
        envelope::auth_encrypt(message, recipient_verkey, &wallet.signing_key, sender_verkey)
    }

    async fn anon_encrypt(
        &self,
        message: &[u8],
        recipient_verkey: &str,
    ) -> Result<Vec<u8>, IdentityError> {
        envelope::anon_encrypt(message, recipient_verkey)
    }

    async fn auth_decrypt(
        &self,
        handle: &WalletHandle,
        bytes: &[u8],
    ) -> Result<(Vec<u8>, String), IdentityError> {
        let unpacked = self.unpack(handle, bytes).await?;
        match unpacked.sender_verkey {
            Some(sender) => Ok((unpacked.message, sender)),
            None => Err(IdentityError::Decryption(
                "envelope is not authenticated".to_string(),
            )),
        }
    }

    async fn anon_decrypt(
        &self,
        handle: &WalletHandle,
        bytes: &[u8],
    ) -> Result<Vec<u8>, IdentityError> {
        let unpacked = self.unpack(handle, bytes).await?;
        match unpacked.sender_verkey {
            None => Ok(unpacked.message),
            Some(_) => Err(IdentityError::Decryption(
                "envelope is authenticated, expected anonymous".to_string(),
            )),
        }
    }

    async fn unpack(&self, handle: &WalletHandle, bytes: &[u8]) -> Result<Unpacked, IdentityError> {
        let wallet = self.wallet(handle)?;
        envelope::unpack(bytes, &wallet.signing_key, &wallet.did_info.verkey)
    }

    async fn store_pairwise(
        &self,
        handle: &WalletHandle,
        their_did: &str,
        their_verkey: &str,
        label: &str,
    ) -> Result<(), IdentityError> {
        self.wallet(handle)?;

        let record = PairwiseRecord {
            their_did: their_did.to_string(),
            their_verkey: their_verkey.to_string(),
            label: label.to_string(),
        };
        let bytes =
            serde_json::to_vec(&record).map_err(|e| IdentityError::Serialization(e.to_string()))?;

        self.pairwise
            .insert(Self::pairwise_key(handle.name(), their_did), bytes)?;
        Ok(())
    }

    async fn lookup_pairwise(
        &self,
        handle: &WalletHandle,
        their_did: &str,
    ) -> Result<Option<PairwiseRecord>, IdentityError> {
        self.wallet(handle)?;

        match self.pairwise.get(Self::pairwise_key(handle.name(), their_did))? {
            Some(bytes) => {
                let record = serde_json::from_slice(&bytes)
                    .map_err(|e| IdentityError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet(name: &str) -> WalletRef {
        WalletRef {
            name: name.to_string(),
            key: format!("{name}-key"),
        }
    }

    #[tokio::test]
    async fn test_create_and_open() {
        let provider = LocalIdentityProvider::in_memory().unwrap();
        let did = provider.create_identity(&wallet("alice"), None).await.unwrap();

        let handle = provider.open(&wallet("alice")).await.unwrap();
        assert_eq!(handle.did(), did.did);
        assert_eq!(handle.verkey(), did.verkey);
        assert!(provider.wallet_exists("alice").await.unwrap());
        assert!(!provider.wallet_exists("bob").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let provider = LocalIdentityProvider::in_memory().unwrap();
        let first = provider.create_identity(&wallet("alice"), None).await.unwrap();
        let second = provider.create_identity(&wallet("alice"), None).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_seed_is_deterministic() {
        let seed = "000000000000000000000000Trustee1";
        let a = LocalIdentityProvider::in_memory().unwrap();
        let b = LocalIdentityProvider::in_memory().unwrap();

        let did_a = a.create_identity(&wallet("fwa"), Some(seed)).await.unwrap();
        let did_b = b.create_identity(&wallet("fwa"), Some(seed)).await.unwrap();
        assert_eq!(did_a, did_b);

        assert!(matches!(
            a.create_identity(&wallet("short"), Some("too-short")).await,
            Err(IdentityError::InvalidSeed(_))
        ));
    }

    #[tokio::test]
    async fn test_open_with_wrong_key() {
        let provider = LocalIdentityProvider::in_memory().unwrap();
        provider.create_identity(&wallet("alice"), None).await.unwrap();

        let wrong = WalletRef {
            name: "alice".to_string(),
            key: "nope".to_string(),
        };
        assert!(matches!(
            provider.open(&wrong).await,
            Err(IdentityError::InvalidWalletKey(_))
        ));
        assert!(matches!(
            provider.open(&wallet("missing")).await,
            Err(IdentityError::WalletNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_opens_share_identity() {
        let provider = Arc::new(LocalIdentityProvider::in_memory().unwrap());
        let did = provider.create_identity(&wallet("shared"), None).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let provider = provider.clone();
            tasks.push(tokio::spawn(async move {
                provider.open(&wallet("shared")).await.unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().did(), did.did);
        }
    }

    #[tokio::test]
    async fn test_auth_and_anon_roundtrip() {
        let provider = LocalIdentityProvider::in_memory().unwrap();
        let alice = provider.create_identity(&wallet("alice"), None).await.unwrap();
        let bob = provider.create_identity(&wallet("bob"), None).await.unwrap();
        let alice_handle = provider.open(&wallet("alice")).await.unwrap();
        let bob_handle = provider.open(&wallet("bob")).await.unwrap();

        let sealed = provider
            .auth_encrypt(&alice_handle, b"hi bob", &bob.verkey, &alice.verkey)
            .await
            .unwrap();
        let (message, sender) = provider.auth_decrypt(&bob_handle, &sealed).await.unwrap();
        assert_eq!(message, b"hi bob");
        assert_eq!(sender, alice.verkey);
        assert!(provider.anon_decrypt(&bob_handle, &sealed).await.is_err());

        let sealed = provider.anon_encrypt(b"anonymous", &bob.verkey).await.unwrap();
        assert_eq!(
            provider.anon_decrypt(&bob_handle, &sealed).await.unwrap(),
            b"anonymous"
        );
        assert!(provider.auth_decrypt(&bob_handle, &sealed).await.is_err());
    }

    #[tokio::test]
    async fn test_auth_encrypt_rejects_foreign_sender() {
        let provider = LocalIdentityProvider::in_memory().unwrap();
        provider.create_identity(&wallet("alice"), None).await.unwrap();
        let bob = provider.create_identity(&wallet("bob"), None).await.unwrap();
        let alice_handle = provider.open(&wallet("alice")).await.unwrap();

        let result = provider
            .auth_encrypt(&alice_handle, b"x", &bob.verkey, &bob.verkey)
            .await;
        assert!(matches!(result, Err(IdentityError::UnknownSenderKey(_))));
    }

    #[tokio::test]
    async fn test_pairwise_records() {
        let provider = LocalIdentityProvider::in_memory().unwrap();
        provider.create_identity(&wallet("alice"), None).await.unwrap();
        let handle = provider.open(&wallet("alice")).await.unwrap();

        assert!(provider.lookup_pairwise(&handle, "their-did").await.unwrap().is_none());

        provider
            .store_pairwise(&handle, "their-did", "their-verkey", "agent-did")
            .await
            .unwrap();
        let record = provider.lookup_pairwise(&handle, "their-did").await.unwrap().unwrap();
        assert_eq!(record.their_verkey, "their-verkey");
        assert_eq!(record.label, "agent-did");
    }
}
