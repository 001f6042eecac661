//! Logical protection state and remote-secret value types.
//!
//! [`MasterKeyState`] is the non-serialized representation of how the key
//! is protected. It is a closed enum so that every conversion boundary
//! (storage ⇄ logical state, wrap ⇄ unwrap) is exhaustively matched and a
//! future format version becomes a compile-time-checked change.

use std::fmt;

use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::{
    ARGON2_SALT_LENGTH, AUTHENTICATION_TOKEN_LENGTH, NONCE_LENGTH, REMOTE_SECRET_HASH_LENGTH,
    REMOTE_SECRET_LENGTH, V1_SALT_LENGTH, V1_VERIFICATION_LENGTH,
};
use crate::master_key::data::MasterKeyData;

pub(crate) type Blake2bMac256 = Blake2bMac<U32>;

/// BLAKE2b personalization string for remote-secret derivations.
const REMOTE_SECRET_PERSONAL: &[u8] = b"keykitrs";

/// Argon2 algorithm version recorded alongside version 2 protection data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Argon2Version {
    /// Argon2 version 1.0 (0x10).
    Version10,
    /// Argon2 version 1.3 (0x13).
    Version13,
}

impl Argon2Version {
    /// The version byte stored on disk.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Version10 => 0x10,
            Self::Version13 => 0x13,
        }
    }

    /// Parses a stored version byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x10 => Some(Self::Version10),
            0x13 => Some(Self::Version13),
            _ => None,
        }
    }
}

/// Argon2id cost parameters recorded for future-proof re-derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Parameters {
    /// Algorithm version.
    pub version: Argon2Version,
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Iteration count.
    pub iterations: u32,
    /// Lane count.
    pub parallelism: u32,
}

impl Argon2Parameters {
    /// The parameters used when newly protecting a key.
    #[must_use]
    pub const fn recommended() -> Self {
        Self {
            version: Argon2Version::Version13,
            memory_kib: crate::config::ARGON2_MEMORY_KIB,
            iterations: crate::config::ARGON2_ITERATIONS,
            parallelism: crate::config::ARGON2_PARALLELISM,
        }
    }
}

/// Passphrase protection data, by storage format version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassphraseProtection {
    /// Legacy protection: XOR-wrapped key, short salt and a truncated-hash
    /// verification tag. Read-only; migrated to version 2 on first unlock.
    Version1 {
        /// The master key XORed with the passphrase-derived wrapping key.
        protected_key: [u8; crate::config::KEY_LENGTH],
        /// KDF salt.
        salt: [u8; V1_SALT_LENGTH],
        /// Truncated hash of the un-wrapped key.
        verification: [u8; V1_VERIFICATION_LENGTH],
    },
    /// Current protection: Argon2id-derived key authenticated-encrypting
    /// the serialized inner layer.
    Version2 {
        /// Argon2id cost parameters.
        argon2: Argon2Parameters,
        /// Argon2id salt.
        salt: [u8; ARGON2_SALT_LENGTH],
        /// AEAD nonce.
        nonce: [u8; NONCE_LENGTH],
        /// AEAD ciphertext of the serialized inner layer.
        encrypted_data: Vec<u8>,
    },
}

/// Remote secret obtained from the work server.
///
/// Used directly as a symmetric AEAD key; never persisted, only held in
/// memory while active and re-derived on demand by the monitor.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct RemoteSecret(pub(crate) [u8; REMOTE_SECRET_LENGTH]);

impl RemoteSecret {
    /// Creates a remote secret from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; REMOTE_SECRET_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Samples a fresh random remote secret.
    ///
    /// # Panics
    ///
    /// Panics if the system's random number generator fails.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; REMOTE_SECRET_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Returns a reference to the raw secret bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; REMOTE_SECRET_LENGTH] {
        &self.0
    }

    /// Derives the non-secret fingerprint of this secret.
    ///
    /// The hash is a keyed BLAKE2b-256 with a domain-separating salt, used
    /// by the server to recognize re-connections without storing the
    /// secret, and by the monitor to detect secret rotation.
    ///
    /// # Panics
    ///
    /// This function will not panic - the `expect` covers key/salt lengths
    /// that are fixed at compile time.
    #[must_use]
    pub fn derive_hash(&self) -> RemoteSecretHash {
        let mac = Blake2bMac256::new_with_salt_and_personal(&self.0, b"rs-hash", REMOTE_SECRET_PERSONAL)
            .expect("key and salt lengths are fixed");
        RemoteSecretHash(mac.finalize().into_bytes().into())
    }
}

impl fmt::Debug for RemoteSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSecret")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Server-issued token identifying a remote secret, needed to revoke it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RemoteSecretAuthenticationToken(pub(crate) [u8; AUTHENTICATION_TOKEN_LENGTH]);

impl RemoteSecretAuthenticationToken {
    /// Creates a token from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; AUTHENTICATION_TOKEN_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns a reference to the raw token bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; AUTHENTICATION_TOKEN_LENGTH] {
        &self.0
    }
}

impl PartialEq for RemoteSecretAuthenticationToken {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for RemoteSecretAuthenticationToken {}

impl fmt::Debug for RemoteSecretAuthenticationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSecretAuthenticationToken")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Keyed hash of a remote secret; a non-secret fingerprint.
#[derive(Clone)]
pub struct RemoteSecretHash(pub(crate) [u8; REMOTE_SECRET_HASH_LENGTH]);

impl RemoteSecretHash {
    /// Creates a hash from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; REMOTE_SECRET_HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns a reference to the raw hash bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; REMOTE_SECRET_HASH_LENGTH] {
        &self.0
    }
}

impl PartialEq for RemoteSecretHash {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for RemoteSecretHash {}

impl fmt::Debug for RemoteSecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RemoteSecretHash")
            .field(&hex::encode(self.0))
            .finish()
    }
}

/// Parameters binding an active remote-secret protection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSecretParameters {
    /// Token for fetching and revoking the secret.
    pub authentication_token: RemoteSecretAuthenticationToken,
    /// Fingerprint the monitor verifies fetched secrets against.
    pub remote_secret_hash: RemoteSecretHash,
}

/// Remote-secret-protected inner state: the parameters plus the AEAD blob
/// (nonce followed by ciphertext) wrapping the unprotected key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSecretLockData {
    /// Parameters of the protecting secret.
    pub parameters: RemoteSecretParameters,
    /// `nonce || ciphertext` of the wrapped inner layer.
    pub encrypted_data: Vec<u8>,
}

/// The logical (non-serialized) protection state of the master key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterKeyState {
    /// Unprotected key material.
    Plain {
        /// The raw master key.
        master_key_data: MasterKeyData,
        /// Set when the state was decoded from a legacy version 1 file and
        /// must be rewritten as version 2.
        was_migrated: bool,
    },
    /// Passphrase-protected key material; always the outermost transform.
    WithPassphrase(PassphraseProtection),
    /// Remote-secret-protected key material.
    WithRemoteSecret(RemoteSecretLockData),
}

impl MasterKeyState {
    /// Convenience constructor for an unmigrated plain state.
    #[must_use]
    pub const fn plain(master_key_data: MasterKeyData) -> Self {
        Self::Plain {
            master_key_data,
            was_migrated: false,
        }
    }
}

/// Observable three-valued passphrase lock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassphraseLockState {
    /// No passphrase protection is configured.
    NoPassphrase,
    /// Passphrase protection is configured and the key is locked.
    Locked,
    /// Passphrase protection is configured and the key is unlocked.
    Unlocked,
}

/// Domain events emitted by the master-key manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterKeyEvent {
    /// Remote-secret protection was activated.
    RemoteSecretActivated,
    /// Remote-secret protection was deactivated; the caller should ask the
    /// server to revoke the token.
    RemoteSecretDeactivated {
        /// Token of the deactivated secret.
        authentication_token: RemoteSecretAuthenticationToken,
    },
}
