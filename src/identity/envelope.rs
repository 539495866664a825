// identity/envelope.rs - Sealed Envelopes
//
//! Anonymous and authenticated encryption of agency envelopes.
//!
//! Keys are Ed25519 (the verkey is the base58 public key); encryption runs on
//! their Montgomery form.
//!
//! ```text
//! anoncrypt:  ephemeral X25519 -> HKDF-SHA256 -> ChaCha20-Poly1305(body)
//! authcrypt:  static X25519(sender, recipient) -> ChaCha20-Poly1305(message)
//!             wrapped in an anoncrypt body that carries the sender verkey
//! ```
//!
//! The outer wire form is a JSON object, so an envelope can be embedded as the
//! `@msg` of a forward without re-encoding.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use curve25519_dalek::{edwards::CompressedEdwardsY, montgomery::MontgomeryPoint, scalar::Scalar};
use ed25519_dalek::{SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use super::{IdentityError, Unpacked};

const NONCE_SIZE: usize = 12;
const ANON_INFO: &[u8] = b"ssi-agency/anoncrypt/v1";
const AUTH_INFO: &[u8] = b"ssi-agency/authcrypt/v1";

/// Outer envelope as it travels on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedEnvelope {
    /// Recipient verkey (base58)
    pub recipient: String,

    /// Ephemeral X25519 public key (base64)
    pub ephemeral: String,

    /// ChaCha20-Poly1305 nonce (base64)
    pub nonce: String,

    /// Encrypted body (base64)
    pub ciphertext: String,
}

/// Decrypted content of a sealed envelope
#[derive(Debug, Serialize, Deserialize)]
enum SealedBody {
    Anonymous {
        message: Vec<u8>,
    },
    Authenticated {
        sender_verkey: String,
        nonce: Vec<u8>,
        ciphertext: Vec<u8>,
    },
}

/// Encode an Ed25519 public key as a verkey
pub fn encode_verkey(key: &VerifyingKey) -> String {
    bs58::encode(key.as_bytes()).into_string()
}

/// Indy-style DID: base58 of the first 16 bytes of the verkey
pub fn did_from_verkey(key: &VerifyingKey) -> String {
    bs58::encode(&key.as_bytes()[..16]).into_string()
}

/// Decode a base58 verkey into its Ed25519 bytes
pub fn decode_verkey(verkey: &str) -> Result<[u8; 32], IdentityError> {
    let bytes = bs58::decode(verkey)
        .into_vec()
        .map_err(|e| IdentityError::InvalidVerkey(format!("{verkey}: {e}")))?;

    bytes
        .try_into()
        .map_err(|_| IdentityError::InvalidVerkey(format!("{verkey}: expected 32 bytes")))
}

/// Montgomery form of a verkey, used for key agreement
fn verkey_to_x25519(verkey: &str) -> Result<MontgomeryPoint, IdentityError> {
    let bytes = decode_verkey(verkey)?;
    CompressedEdwardsY(bytes)
        .decompress()
        .map(|point| point.to_montgomery())
        .ok_or_else(|| IdentityError::InvalidVerkey(format!("{verkey}: not a curve point")))
}

/// X25519 scalar of an Ed25519 signing key (clamped lower half of SHA-512(seed))
fn signing_key_to_x25519(key: &SigningKey) -> Scalar {
    let digest = Sha512::digest(key.to_bytes());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest[..32]);
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
    Scalar::from_bytes_mod_order(bytes)
}

fn derive_key(shared: &MontgomeryPoint, salt: &[u8], info: &[u8]) -> Result<[u8; 32], IdentityError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|e| IdentityError::Encryption(e.to_string()))?;
    Ok(okm)
}

fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);
    nonce
}

fn encrypt(key: &[u8; 32], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, IdentityError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| IdentityError::Encryption(e.to_string()))
}

fn decrypt(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, IdentityError> {
    if nonce.len() != NONCE_SIZE {
        return Err(IdentityError::Decryption(format!(
            "invalid nonce length {}",
            nonce.len()
        )));
    }
    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| IdentityError::Decryption("authentication tag mismatch".to_string()))
}

/// Static key shared by a sender and a recipient, identical on both sides
fn static_key(
    own_key: &SigningKey,
    own_verkey: &str,
    their_verkey: &str,
    sender_verkey: &str,
) -> Result<[u8; 32], IdentityError> {
    let their_point = verkey_to_x25519(their_verkey)?;
    let shared = signing_key_to_x25519(own_key) * their_point;

    // salt is always sender || recipient
    let recipient_verkey = if own_verkey == sender_verkey {
        their_verkey
    } else {
        own_verkey
    };
    let salt = [sender_verkey.as_bytes(), recipient_verkey.as_bytes()].concat();
    derive_key(&shared, &salt, AUTH_INFO)
}

fn seal(body: &SealedBody, recipient_verkey: &str) -> Result<Vec<u8>, IdentityError> {
    let recipient_point = verkey_to_x25519(recipient_verkey)?;

    let mut ephemeral_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut ephemeral_bytes);
    let ephemeral_scalar = Scalar::from_bytes_mod_order(ephemeral_bytes);
    let ephemeral_public = MontgomeryPoint::mul_base(&ephemeral_scalar);
    let shared = ephemeral_scalar * recipient_point;

    let salt = [ephemeral_public.as_bytes().as_slice(), recipient_verkey.as_bytes()].concat();
    let key = derive_key(&shared, &salt, ANON_INFO)?;

    let plaintext = bincode::serde::encode_to_vec(body, bincode::config::standard())
        .map_err(|e| IdentityError::Serialization(e.to_string()))?;
    let nonce = random_nonce();
    let ciphertext = encrypt(&key, &nonce, &plaintext)?;

    let envelope = SealedEnvelope {
        recipient: recipient_verkey.to_string(),
        ephemeral: STANDARD.encode(ephemeral_public.as_bytes()),
        nonce: STANDARD.encode(nonce),
        ciphertext: STANDARD.encode(ciphertext),
    };
    serde_json::to_vec(&envelope).map_err(|e| IdentityError::Serialization(e.to_string()))
}

fn open_sealed(
    bytes: &[u8],
    own_key: &SigningKey,
    own_verkey: &str,
) -> Result<SealedBody, IdentityError> {
    let envelope: SealedEnvelope = serde_json::from_slice(bytes)
        .map_err(|e| IdentityError::Decryption(format!("malformed envelope: {e}")))?;

    if envelope.recipient != own_verkey {
        return Err(IdentityError::Decryption(format!(
            "envelope addressed to {}",
            envelope.recipient
        )));
    }

    let decode = |field: &str| {
        STANDARD
            .decode(field)
            .map_err(|e| IdentityError::Decryption(format!("malformed envelope: {e}")))
    };
    let ephemeral: [u8; 32] = decode(&envelope.ephemeral)?
        .try_into()
        .map_err(|_| IdentityError::Decryption("invalid ephemeral key".to_string()))?;
    let nonce = decode(&envelope.nonce)?;
    let ciphertext = decode(&envelope.ciphertext)?;

    let ephemeral_point = MontgomeryPoint(ephemeral);
    let shared = signing_key_to_x25519(own_key) * ephemeral_point;
    let salt = [ephemeral.as_slice(), own_verkey.as_bytes()].concat();
    let key = derive_key(&shared, &salt, ANON_INFO)?;

    let plaintext = decrypt(&key, &nonce, &ciphertext)?;
    let (body, _): (SealedBody, _) =
        bincode::serde::decode_from_slice(&plaintext, bincode::config::standard())
            .map_err(|e| IdentityError::Decryption(format!("malformed body: {e}")))?;
    Ok(body)
}

/// Encrypt for a recipient without revealing the sender
pub fn anon_encrypt(message: &[u8], recipient_verkey: &str) -> Result<Vec<u8>, IdentityError> {
    seal(
        &SealedBody::Anonymous {
            message: message.to_vec(),
        },
        recipient_verkey,
    )
}

/// Encrypt for a recipient, proving the sender's key
pub fn auth_encrypt(
    message: &[u8],
    recipient_verkey: &str,
    sender_key: &SigningKey,
    sender_verkey: &str,
) -> Result<Vec<u8>, IdentityError> {
    let key = static_key(sender_key, sender_verkey, recipient_verkey, sender_verkey)?;
    let nonce = random_nonce();
    let ciphertext = encrypt(&key, &nonce, message)?;

    seal(
        &SealedBody::Authenticated {
            sender_verkey: sender_verkey.to_string(),
            nonce: nonce.to_vec(),
            ciphertext,
        },
        recipient_verkey,
    )
}

/// Decrypt either envelope kind, reporting the sender when authenticated
pub fn unpack(bytes: &[u8], own_key: &SigningKey, own_verkey: &str) -> Result<Unpacked, IdentityError> {
    match open_sealed(bytes, own_key, own_verkey)? {
        SealedBody::Anonymous { message } => Ok(Unpacked {
            message,
            sender_verkey: None,
        }),
        SealedBody::Authenticated {
            sender_verkey,
            nonce,
            ciphertext,
        } => {
            let key = static_key(own_key, own_verkey, &sender_verkey, &sender_verkey)?;
            let message = decrypt(&key, &nonce, &ciphertext)?;
            Ok(Unpacked {
                message,
                sender_verkey: Some(sender_verkey),
            })
        }
    }
}
