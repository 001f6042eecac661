//! Persisted-protection state holder.
//!
//! Tracks the protection configuration that is (or will be) persisted,
//! independent of the lock state: a key can be unlocked right now yet
//! still be configured with passphrase protection for next time. The
//! holder owns the wrap/unwrap ordering rule: passphrase protection is
//! always the outermost transform, so changing the inner (remote-secret)
//! layer requires the passphrase when one is configured.

use tokio::sync::watch;

use crate::error::StorageStateError;
use crate::master_key::crypto::MasterKeyCrypto;
use crate::master_key::data::MasterKeyData;
use crate::master_key::state::{MasterKeyState, RemoteSecret, RemoteSecretParameters};

/// Observable holder of the persisted protection configuration.
pub struct MasterKeyStorageStateHolder {
    crypto: MasterKeyCrypto,
    state: watch::Sender<Option<MasterKeyState>>,
}

impl MasterKeyStorageStateHolder {
    /// Creates an uninitialized holder.
    #[must_use]
    pub fn new(crypto: MasterKeyCrypto) -> Self {
        Self {
            crypto,
            state: watch::channel(None).0,
        }
    }

    /// Initializes the holder with the state read from storage (or the
    /// freshly generated state on first run).
    pub fn init(&self, state: MasterKeyState) {
        self.state.send_replace(Some(state));
    }

    /// Returns the current storage state.
    ///
    /// # Panics
    ///
    /// Panics before [`MasterKeyStorageStateHolder::init`] was called.
    #[must_use]
    pub fn storage_state(&self) -> MasterKeyState {
        self.state
            .borrow()
            .clone()
            .expect("storage state accessed before init")
    }

    /// Observes the storage state (`None` until initialized).
    #[must_use]
    pub fn observe(&self) -> watch::Receiver<Option<MasterKeyState>> {
        self.state.subscribe()
    }

    /// Returns whether any protection is configured, suspending until the
    /// holder is initialized.
    ///
    /// False only when the key is stored without passphrase and without
    /// remote-secret protection.
    pub async fn is_protected(&self) -> bool {
        let mut receiver = self.state.subscribe();
        let state = receiver
            .wait_for(Option::is_some)
            .await
            .expect("sender lives in this holder");
        !matches!(
            state.as_ref().expect("wait_for only admits Some"),
            MasterKeyState::Plain { .. }
        )
    }

    /// Wraps the current state with passphrase protection.
    ///
    /// # Errors
    ///
    /// Returns [`StorageStateError::AlreadyPassphraseProtected`] if a
    /// passphrase is already configured, or a crypto error.
    pub fn add_passphrase_protection(&self, passphrase: &str) -> Result<(), StorageStateError> {
        let state = self.storage_state();
        if matches!(state, MasterKeyState::WithPassphrase(_)) {
            return Err(StorageStateError::AlreadyPassphraseProtected);
        }
        let protected = self.crypto.encrypt_with_passphrase(&state, passphrase)?;
        self.init(protected);
        Ok(())
    }

    /// Removes passphrase protection, exposing whatever inner state was
    /// wrapped (plain or remote-secret-protected). A no-op when no
    /// passphrase protection is configured.
    ///
    /// # Errors
    ///
    /// Returns a crypto error when the passphrase is wrong.
    pub fn remove_passphrase_protection(&self, passphrase: &str) -> Result<(), StorageStateError> {
        let MasterKeyState::WithPassphrase(protection) = self.storage_state() else {
            return Ok(());
        };
        let inner = self.crypto.decrypt_with_passphrase(&protection, passphrase)?;
        self.init(inner);
        Ok(())
    }

    /// Wraps the inner layer with the remote secret, re-applying
    /// passphrase wrapping when one is currently configured.
    ///
    /// # Errors
    ///
    /// Returns [`StorageStateError::PassphraseRequired`] when passphrase
    /// protection is active but no passphrase was supplied (it is needed
    /// to re-wrap the outer layer, since the inner layer is changing), or
    /// a crypto error.
    pub fn set_state_with_remote_secret_protection(
        &self,
        master_key_data: MasterKeyData,
        passphrase: Option<&str>,
        remote_secret: &RemoteSecret,
        parameters: RemoteSecretParameters,
    ) -> Result<(), StorageStateError> {
        let lock_data = self.crypto.encrypt_with_remote_secret(
            &MasterKeyState::plain(master_key_data),
            remote_secret,
            parameters,
        )?;
        self.replace_inner(MasterKeyState::WithRemoteSecret(lock_data), passphrase)
    }

    /// Removes remote-secret protection from the inner layer, re-applying
    /// passphrase wrapping when one is currently configured.
    ///
    /// # Errors
    ///
    /// Same passphrase-required rule as
    /// [`MasterKeyStorageStateHolder::set_state_with_remote_secret_protection`].
    pub fn set_state_without_remote_secret_protection(
        &self,
        master_key_data: MasterKeyData,
        passphrase: Option<&str>,
    ) -> Result<(), StorageStateError> {
        self.replace_inner(MasterKeyState::plain(master_key_data), passphrase)
    }

    fn replace_inner(
        &self,
        new_inner: MasterKeyState,
        passphrase: Option<&str>,
    ) -> Result<(), StorageStateError> {
        let passphrase_protected =
            matches!(self.storage_state(), MasterKeyState::WithPassphrase(_));
        let new_state = if passphrase_protected {
            let passphrase = passphrase.ok_or(StorageStateError::PassphraseRequired)?;
            self.crypto.encrypt_with_passphrase(&new_inner, passphrase)?
        } else {
            new_inner
        };
        self.init(new_state);
        Ok(())
    }
}
