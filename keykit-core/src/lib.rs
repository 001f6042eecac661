//! Local master-key protection engine.
//!
//! The crate owns a single 32-byte symmetric master key that encrypts all
//! locally persisted application data, decides under what conditions that
//! key may be held in memory, and manages how the key itself is protected
//! at rest: by nothing, by a user passphrase, or by a secret issued and
//! periodically re-validated by a work server ("remote secret").
//!
//! # Architecture
//!
//! ```text
//! MasterKeyManager
//!    ├── MasterKeyStorageManager   versioned key file (v1 → v2 migration)
//!    ├── MasterKeyLockStateHolder  observable lock-state machine
//!    │      └── MasterKeyProvider  live-key access for the application
//!    ├── MasterKeyStorageStateHolder  persisted protection configuration
//!    ├── MasterKeyCrypto           passphrase / remote-secret wrapping
//!    └── RemoteSecretManager       create / monitor / delete over HTTPS
//! ```
//!
//! Protection composes in two layers: a remote secret may wrap the key
//! material (inner layer) and a passphrase may additionally wrap the
//! result (outer layer, always outermost). The unwrapped master key also
//! acts as a cipher for arbitrary application data (see
//! [`MasterKey::encrypt_to_writer`](master_key::MasterKey::encrypt_to_writer)).
//!
//! The surrounding application drives the engine through
//! [`manager::MasterKeyManager`]: read or generate the key at startup,
//! lock/unlock with a passphrase, activate/deactivate/monitor
//! remote-secret protection, and observe lock-state changes.

pub mod config;
pub mod error;
pub mod lock_state;
pub mod manager;
pub mod master_key;
pub mod remote_secret;
pub mod storage;
pub mod storage_state;

mod http_request;

pub use error::{
    CryptoError, MasterKeyError, RemoteSecretEndpointError, RemoteSecretMonitorError,
    StorageError, StorageStateError,
};
pub use lock_state::{MasterKeyLockStateHolder, MasterKeyProvider};
pub use manager::MasterKeyManager;
pub use master_key::{
    MasterKey, MasterKeyCrypto, MasterKeyData, MasterKeyEvent, MasterKeyState,
    PassphraseLockState, RemoteSecret, RemoteSecretParameters,
};
pub use remote_secret::{
    ClientKey, RemoteSecretCheckType, RemoteSecretClient, RemoteSecretClientParameters,
    RemoteSecretManager, RemoteSecretMonitor, RemoteSecretProtectionCheck, WorkCredentials,
};
pub use storage::MasterKeyStorageManager;
pub use storage_state::MasterKeyStorageStateHolder;
