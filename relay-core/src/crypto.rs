//! Cryptographic building blocks: the password-authenticated key exchange,
//! the per-chunk AEAD, and the streaming content digest.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use spake2::{Ed25519Group, Identity, Password, Spake2};

use crate::error::{CoreError, CoreResult};
use crate::session::TransferRole;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Fixed key-exchange identities, one per role. Both sides must agree on
/// the pair for the derived secrets to match.
const SENDER_IDENTITY: &[u8] = b"relay-sender";
const RECEIVER_IDENTITY: &[u8] = b"relay-receiver";

/// One run of the SPAKE2 exchange over the Ed25519 group.
///
/// The transfer code is the password. A run where the two sides used
/// different codes still completes but yields two different secrets; the
/// mismatch surfaces later as an AEAD failure, never here.
pub struct KeyExchange {
    state: Spake2<Ed25519Group>,
    outbound: Vec<u8>,
}

impl KeyExchange {
    pub fn start(role: TransferRole, code: &str) -> Self {
        let password = Password::new(code.as_bytes());
        let id_sender = Identity::new(SENDER_IDENTITY);
        let id_receiver = Identity::new(RECEIVER_IDENTITY);

        let (state, outbound) = match role {
            TransferRole::Sender => {
                Spake2::<Ed25519Group>::start_a(&password, &id_sender, &id_receiver)
            }
            TransferRole::Receiver => {
                Spake2::<Ed25519Group>::start_b(&password, &id_sender, &id_receiver)
            }
        };

        Self { state, outbound }
    }

    /// The message to hand to the peer through signaling.
    pub fn outbound_message(&self) -> &[u8] {
        &self.outbound
    }

    /// Consume the peer's message and derive the 32-byte session key.
    pub fn finish(self, peer_message: &[u8]) -> CoreResult<[u8; KEY_LEN]> {
        let secret = self
            .state
            .finish(peer_message)
            .map_err(|e| CoreError::Crypto(format!("key agreement failed: {e:?}")))?;

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&secret);
        Ok(key)
    }
}

/// Encrypting half of the chunk cipher (AES-256-GCM).
///
/// Nonce layout: 4 random bytes chosen at construction, then an 8-byte
/// big-endian counter that advances once per sealed chunk. The prefix is
/// drawn fresh per session and per side, so nonces never repeat under one
/// key within a session.
pub struct ChunkSealer {
    cipher: Aes256Gcm,
    nonce_prefix: [u8; 4],
    counter: u64,
}

impl ChunkSealer {
    pub fn new(key: &[u8; KEY_LEN]) -> CoreResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| CoreError::Crypto("invalid AES-256-GCM key length".into()))?;

        let mut nonce_prefix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut nonce_prefix);

        Ok(Self {
            cipher,
            nonce_prefix,
            counter: 0,
        })
    }

    /// Encrypt one chunk. Returns the ciphertext (16-byte tag appended)
    /// and the nonce the receiver needs to open it.
    pub fn seal(&mut self, plaintext: &[u8]) -> CoreResult<(Vec<u8>, [u8; NONCE_LEN])> {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.nonce_prefix);
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CoreError::Crypto("chunk encryption failed".into()))?;

        self.counter += 1;
        Ok((ciphertext, nonce))
    }
}

/// Decrypting half of the chunk cipher. Stateless apart from the key; the
/// nonce travels with each chunk and is not validated beyond the tag check.
pub struct ChunkOpener {
    cipher: Aes256Gcm,
}

impl ChunkOpener {
    pub fn new(key: &[u8; KEY_LEN]) -> CoreResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| CoreError::Crypto("invalid AES-256-GCM key length".into()))?;
        Ok(Self { cipher })
    }

    /// Decrypt one chunk. Any tampering or key mismatch fails the tag
    /// check, which is fatal to the session.
    pub fn open(&self, ciphertext: &[u8], nonce: &[u8; NONCE_LEN]) -> CoreResult<Vec<u8>> {
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CoreError::Crypto("chunk authentication failed".into()))
    }
}

/// Seal a single small payload with a fresh random-prefix nonce. Used for
/// the certificate fingerprint during signaling.
pub fn seal_once(key: &[u8; KEY_LEN], plaintext: &[u8]) -> CoreResult<(Vec<u8>, [u8; NONCE_LEN])> {
    ChunkSealer::new(key)?.seal(plaintext)
}

/// Inverse of [`seal_once`].
pub fn open_once(
    key: &[u8; KEY_LEN],
    ciphertext: &[u8],
    nonce: &[u8; NONCE_LEN],
) -> CoreResult<Vec<u8>> {
    ChunkOpener::new(key)?.open(ciphertext, nonce)
}

/// Incremental SHA-256 over file plaintext.
#[derive(Default)]
pub struct StreamingDigest {
    hasher: Sha256,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        self.hasher.finalize().into()
    }
}

/// SHA-256 of a DER-encoded certificate.
pub fn certificate_fingerprint(der: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(der);
    hasher.finalize().into()
}
