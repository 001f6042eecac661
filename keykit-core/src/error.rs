//! Error types for the key protection engine.
//!
//! Strongly-typed errors per concern: cryptographic failures, storage
//! codec/file failures, storage-state transitions, remote-secret endpoint
//! calls and the monitoring loop. [`MasterKeyError`] is the umbrella the
//! manager surfaces at its API boundary.
//!
//! Cryptographic and storage failures are never silently recovered: a
//! wrong passphrase surfaces as `false`/an error to the caller rather than
//! proceeding with garbage key material.

use thiserror::Error;

/// Errors from the cryptographic transforms.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// AEAD authentication failed: wrong passphrase, wrong remote secret
    /// or corrupted ciphertext. Always fail-closed.
    #[error("decryption failed: {context}")]
    DecryptionFailed {
        /// What was being decrypted.
        context: &'static str,
    },

    /// A key derivation function rejected its parameters.
    #[error("key derivation failed: {context}")]
    KeyDerivationFailed {
        /// What was being derived.
        context: &'static str,
    },

    /// The operation was invoked with a state it cannot transform.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// The decrypted inner layer could not be decoded.
    #[error("inner layer corrupted: {0}")]
    InnerLayerCorrupted(#[from] StorageError),
}

/// Errors while encoding, decoding or persisting key storage data.
#[derive(Error, Debug)]
pub enum StorageError {
    /// An I/O operation on a key file failed.
    #[error("i/o error while {context}: {source}")]
    Io {
        /// The operation that failed.
        context: &'static str,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file does not start with the expected magic bytes.
    #[error("invalid magic bytes")]
    InvalidMagic,

    /// The format version is not supported.
    #[error("unsupported format version {found}")]
    InvalidVersion {
        /// The version byte found in the file.
        found: u8,
    },

    /// The data ended before a field was complete.
    #[error("unexpected end of data while reading {context}")]
    UnexpectedEof {
        /// The field being read.
        context: &'static str,
    },

    /// The data is structurally invalid.
    #[error("corrupted data: {context}")]
    CorruptedData {
        /// Description of the corruption.
        context: &'static str,
    },

    /// No key file exists.
    #[error("no key file exists")]
    NoKeyFile,
}

/// Errors from the storage-state holder's protection transitions.
#[derive(Error, Debug)]
pub enum StorageStateError {
    /// Passphrase protection is already configured; it must be removed
    /// before a new passphrase can be added.
    #[error("passphrase protection is already configured")]
    AlreadyPassphraseProtected,

    /// Passphrase protection is active, so the passphrase is required to
    /// re-wrap the outer layer when the inner layer changes.
    #[error("passphrase required to change the protected state")]
    PassphraseRequired,

    /// A wrap or unwrap transform failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Errors from the remote-secret HTTPS endpoint (create/fetch/delete).
#[derive(Error, Debug)]
pub enum RemoteSecretEndpointError {
    /// The server rejected the submitted identity or credentials.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The authentication challenge expired before it was answered.
    #[error("challenge expired")]
    ChallengeExpired,

    /// The solved challenge was rejected.
    #[error("invalid challenge response")]
    InvalidChallengeResponse,

    /// A rate limit of the server has been exceeded.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Access to the remote secret is prohibited by the administrator.
    #[error("access to remote secret forbidden")]
    Forbidden,

    /// The remote secret does not exist (removed by user or administrator).
    #[error("remote secret not found")]
    NotFound,

    /// The request could not be completed.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a status the protocol does not define.
    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),

    /// The response body could not be decoded.
    #[error("decoding response failed: {0}")]
    Decoding(String),
}

impl From<reqwest::Error> for RemoteSecretEndpointError {
    fn from(error: reqwest::Error) -> Self {
        Self::Network(error.to_string())
    }
}

/// An error occurred while monitoring the remote secret.
///
/// All variants require the caller to treat the secret as unavailable:
/// lock access to the storage and purge keys from memory.
#[derive(Error, Debug)]
pub enum RemoteSecretMonitorError {
    /// The consecutive-failure budget was exceeded.
    #[error("fetching the remote secret timed out, most recent cause: {cause}")]
    Timeout {
        /// The most recent fetch failure.
        #[source]
        cause: RemoteSecretEndpointError,
    },

    /// The remote secret no longer exists on the server.
    #[error("remote secret could not be found")]
    NotFound,

    /// Access to the remote secret is prohibited by the administrator.
    #[error("access to remote secret prohibited by administrator")]
    Blocked,

    /// The fetched secret does not match the one this client expects.
    #[error("remote secret differs from the expected one")]
    Mismatch,
}

/// Umbrella error of the master-key manager API.
#[derive(Error, Debug)]
pub enum MasterKeyError {
    /// The operation requires the master key while it is locked.
    #[error("master key is locked")]
    Locked,

    /// The lock state has not been established yet (startup read pending).
    #[error("lock state is not yet known")]
    StateNotYetKnown,

    /// The passphrase is required for the requested state change.
    #[error("passphrase required")]
    PassphraseRequired,

    /// Passphrase protection is already configured.
    #[error("passphrase protection is already configured")]
    AlreadyPassphraseProtected,

    /// A cryptographic transform failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Reading or writing key storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A remote-secret endpoint call failed.
    #[error(transparent)]
    RemoteSecret(#[from] RemoteSecretEndpointError),
}

impl From<StorageStateError> for MasterKeyError {
    fn from(error: StorageStateError) -> Self {
        match error {
            StorageStateError::AlreadyPassphraseProtected => Self::AlreadyPassphraseProtected,
            StorageStateError::PassphraseRequired => Self::PassphraseRequired,
            StorageStateError::Crypto(error) => Self::Crypto(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_state_errors_map_to_master_key_errors() {
        assert!(matches!(
            MasterKeyError::from(StorageStateError::PassphraseRequired),
            MasterKeyError::PassphraseRequired
        ));
        assert!(matches!(
            MasterKeyError::from(StorageStateError::AlreadyPassphraseProtected),
            MasterKeyError::AlreadyPassphraseProtected
        ));
    }

    #[test]
    fn endpoint_error_display_is_stable() {
        assert_eq!(
            RemoteSecretEndpointError::InvalidCredentials.to_string(),
            "invalid credentials"
        );
        assert_eq!(
            RemoteSecretEndpointError::UnexpectedStatus(500).to_string(),
            "unexpected status 500"
        );
    }
}
