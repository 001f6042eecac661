//! Master key primitives: key values, protection state, crypto transforms
//! and the application-data cipher.

mod cipher;
pub mod crypto;
pub mod data;
pub mod state;

pub use crypto::MasterKeyCrypto;
pub use data::{generate_master_key, MasterKey, MasterKeyData};
pub use state::{
    Argon2Parameters, Argon2Version, MasterKeyEvent, MasterKeyState, PassphraseLockState,
    PassphraseProtection, RemoteSecret, RemoteSecretAuthenticationToken, RemoteSecretHash,
    RemoteSecretLockData, RemoteSecretParameters,
};
