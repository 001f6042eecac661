//! Lock-state machine and the master-key provider.
//!
//! The holder is a single-writer, multi-reader observable: the manager
//! issues transitions, any number of collaborators observe them through
//! `tokio::sync::watch` channels. Queries that depend on not-yet-available
//! state suspend the caller instead of returning a default: "the startup
//! read has not finished" is distinct from "unlocked with no remote
//! secret", which returns immediately with a none value.

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::MasterKeyError;
use crate::master_key::data::MasterKey;
use crate::master_key::state::{
    PassphraseProtection, RemoteSecretLockData, RemoteSecretParameters,
};

enum LockState {
    /// Initial state; nothing is known until the startup read completes.
    Unknown,
    LockedWithPassphrase(PassphraseProtection),
    LockedWithRemoteSecret(RemoteSecretLockData),
    Unlocked {
        master_key: MasterKey,
        remote_secret_lock_data: Option<RemoteSecretLockData>,
    },
    /// Terminal; no further unlock is possible, even programmatically.
    PermanentlyLocked,
}

/// Remote-secret view of the lock state once it is known.
#[derive(Debug, Clone)]
pub struct RemoteSecretLockState {
    /// The active remote-secret protection, if any.
    pub remote_secret_lock_data: Option<RemoteSecretLockData>,
}

/// Observable lock-state machine of the master key.
pub struct MasterKeyLockStateHolder {
    state: watch::Sender<LockState>,
    master_key: watch::Sender<Option<MasterKey>>,
    passphrase_locked: watch::Sender<bool>,
    remote_secret_parameters: watch::Sender<Option<RemoteSecretParameters>>,
}

impl Default for MasterKeyLockStateHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterKeyLockStateHolder {
    /// Creates a holder in the `Unknown` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: watch::channel(LockState::Unknown).0,
            master_key: watch::channel(None).0,
            passphrase_locked: watch::channel(false).0,
            remote_secret_parameters: watch::channel(None).0,
        }
    }

    // -------------------------------------------------------------------------
    // Transitions (single writer: the manager)
    // -------------------------------------------------------------------------

    /// Locks with passphrase protection, clearing the live key.
    pub fn set_locked_with_passphrase(&self, protection: PassphraseProtection) {
        info!("Lock state: locked with passphrase");
        self.transition(LockState::LockedWithPassphrase(protection));
    }

    /// Locks with remote-secret protection, clearing the live key.
    pub fn set_locked_with_remote_secret(&self, lock_data: RemoteSecretLockData) {
        info!("Lock state: locked with remote secret");
        self.transition(LockState::LockedWithRemoteSecret(lock_data));
    }

    /// Installs the live key, optionally remembering the remote-secret
    /// protection metadata so a future re-lock can target remote-secret
    /// locking specifically.
    ///
    /// # Panics
    ///
    /// Panics when the holder is permanently locked; that transition is
    /// one-way and blocks all future unlocks.
    pub fn set_unlocked(
        &self,
        master_key: MasterKey,
        remote_secret_lock_data: Option<RemoteSecretLockData>,
    ) {
        assert!(
            !matches!(&*self.state.borrow(), LockState::PermanentlyLocked),
            "cannot unlock a permanently locked master key"
        );
        info!("Lock state: unlocked");
        self.transition(LockState::Unlocked {
            master_key,
            remote_secret_lock_data,
        });
    }

    /// Permanently locks the holder, clearing the key and blocking all
    /// future unlock attempts. Used for irrecoverable security wipes.
    pub fn set_permanently_locked(&self) {
        info!("Lock state: permanently locked");
        self.transition(LockState::PermanentlyLocked);
    }

    fn transition(&self, new_state: LockState) {
        self.state.send_modify(|state| {
            if matches!(state, LockState::PermanentlyLocked)
                && !matches!(new_state, LockState::PermanentlyLocked)
            {
                warn!("Ignoring lock transition on permanently locked state");
                return;
            }
            // Zero the outgoing key for every holder of it.
            if let LockState::Unlocked { master_key, .. } = state {
                master_key.invalidate();
            }
            *state = new_state;
        });
        self.publish_derived();
    }

    fn publish_derived(&self) {
        let state = self.state.borrow();

        let master_key = match &*state {
            LockState::Unlocked { master_key, .. } => Some(master_key.clone()),
            _ => None,
        };
        let passphrase_locked = matches!(&*state, LockState::LockedWithPassphrase(_));
        let parameters = match &*state {
            LockState::LockedWithRemoteSecret(lock_data)
            | LockState::Unlocked {
                remote_secret_lock_data: Some(lock_data),
                ..
            } => Some(lock_data.parameters.clone()),
            _ => None,
        };
        drop(state);

        self.master_key.send_replace(master_key);
        self.passphrase_locked.send_if_modified(|value| {
            let changed = *value != passphrase_locked;
            *value = passphrase_locked;
            changed
        });
        // Deduplicated: monitoring supervision restarts only on a
        // genuinely different parameter set.
        self.remote_secret_parameters.send_if_modified(|value| {
            let changed = *value != parameters;
            *value = parameters;
            changed
        });
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Returns whether the key is locked with a passphrase.
    ///
    /// # Errors
    ///
    /// Returns [`MasterKeyError::StateNotYetKnown`] before the first
    /// transition.
    pub fn is_locked_with_passphrase(&self) -> Result<bool, MasterKeyError> {
        match &*self.state.borrow() {
            LockState::Unknown => Err(MasterKeyError::StateNotYetKnown),
            LockState::LockedWithPassphrase(_) => Ok(true),
            _ => Ok(false),
        }
    }

    /// Returns whether the key is locked with a remote secret, suspending
    /// until the lock state is known.
    pub async fn is_locked_with_remote_secret(&self) -> bool {
        let mut receiver = self.state.subscribe();
        let state = receiver
            .wait_for(|state| !matches!(state, LockState::Unknown))
            .await
            .expect("sender lives in this holder");
        matches!(&*state, LockState::LockedWithRemoteSecret(_))
    }

    /// Suspends until the key is unlocked or locked only with a remote
    /// secret, then returns the remote-secret view of the state.
    pub async fn await_remote_secret_lock_state(&self) -> RemoteSecretLockState {
        let mut receiver = self.state.subscribe();
        let state = receiver
            .wait_for(|state| {
                matches!(
                    state,
                    LockState::Unlocked { .. } | LockState::LockedWithRemoteSecret(_)
                )
            })
            .await
            .expect("sender lives in this holder");
        match &*state {
            LockState::LockedWithRemoteSecret(lock_data) => RemoteSecretLockState {
                remote_secret_lock_data: Some(lock_data.clone()),
            },
            LockState::Unlocked {
                remote_secret_lock_data,
                ..
            } => RemoteSecretLockState {
                remote_secret_lock_data: remote_secret_lock_data.clone(),
            },
            _ => unreachable!("wait_for only admits the matched states"),
        }
    }

    /// Returns the remote-secret view of the lock state, or `None` while
    /// it is not yet known (still unknown, passphrase-locked or
    /// permanently locked).
    #[must_use]
    pub fn get_remote_secret_lock_state(&self) -> Option<RemoteSecretLockState> {
        match &*self.state.borrow() {
            LockState::LockedWithRemoteSecret(lock_data) => Some(RemoteSecretLockState {
                remote_secret_lock_data: Some(lock_data.clone()),
            }),
            LockState::Unlocked {
                remote_secret_lock_data,
                ..
            } => Some(RemoteSecretLockState {
                remote_secret_lock_data: remote_secret_lock_data.clone(),
            }),
            _ => None,
        }
    }

    /// Returns the passphrase protection data while locked with one.
    #[must_use]
    pub fn get_passphrase_lock(&self) -> Option<PassphraseProtection> {
        match &*self.state.borrow() {
            LockState::LockedWithPassphrase(protection) => Some(protection.clone()),
            _ => None,
        }
    }

    /// Returns the live master key while unlocked.
    #[must_use]
    pub fn get_master_key(&self) -> Option<MasterKey> {
        self.master_key.borrow().clone()
    }

    // -------------------------------------------------------------------------
    // Observables
    // -------------------------------------------------------------------------

    /// Observes the live master key.
    #[must_use]
    pub fn subscribe_master_key(&self) -> watch::Receiver<Option<MasterKey>> {
        self.master_key.subscribe()
    }

    /// Observes the passphrase-locked flag.
    #[must_use]
    pub fn subscribe_passphrase_locked(&self) -> watch::Receiver<bool> {
        self.passphrase_locked.subscribe()
    }

    /// Observes the currently-relevant remote-secret parameters.
    #[must_use]
    pub fn subscribe_remote_secret_parameters(
        &self,
    ) -> watch::Receiver<Option<RemoteSecretParameters>> {
        self.remote_secret_parameters.subscribe()
    }

    /// Creates a provider view over the live master key.
    #[must_use]
    pub fn provider(&self) -> MasterKeyProvider {
        MasterKeyProvider {
            master_key: self.master_key.subscribe(),
        }
    }
}

/// Read-only access to the live master key.
#[derive(Clone)]
pub struct MasterKeyProvider {
    master_key: watch::Receiver<Option<MasterKey>>,
}

impl MasterKeyProvider {
    /// Returns the master key, or `None` while locked.
    #[must_use]
    pub fn get_master_key_or_none(&self) -> Option<MasterKey> {
        self.master_key.borrow().clone()
    }

    /// Returns the master key.
    ///
    /// # Errors
    ///
    /// Returns [`MasterKeyError::Locked`] while no key is installed.
    pub fn get_master_key(&self) -> Result<MasterKey, MasterKeyError> {
        self.get_master_key_or_none().ok_or(MasterKeyError::Locked)
    }

    /// Returns whether no key is currently installed.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.master_key.borrow().is_none()
    }

    /// Suspends until a key is installed and returns it.
    ///
    /// # Panics
    ///
    /// Panics if the lock-state holder has been dropped.
    pub async fn await_unlocked(&self) -> MasterKey {
        let mut receiver = self.master_key.clone();
        let key = receiver
            .wait_for(Option::is_some)
            .await
            .expect("lock state holder dropped");
        key.clone().expect("wait_for only admits Some")
    }

    /// Suspends until no key is installed.
    ///
    /// # Panics
    ///
    /// Panics if the lock-state holder has been dropped.
    pub async fn await_locked(&self) {
        let mut receiver = self.master_key.clone();
        receiver
            .wait_for(Option::is_none)
            .await
            .expect("lock state holder dropped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::config::KEY_LENGTH;
    use crate::master_key::data::MasterKeyData;
    use crate::master_key::state::{
        RemoteSecretAuthenticationToken, RemoteSecretHash, RemoteSecretParameters,
    };

    fn test_key() -> MasterKey {
        MasterKey::new(MasterKeyData::from_bytes([0x77; KEY_LENGTH]))
    }

    fn lock_data(token_byte: u8) -> RemoteSecretLockData {
        RemoteSecretLockData {
            parameters: RemoteSecretParameters {
                authentication_token: RemoteSecretAuthenticationToken::from_bytes(
                    [token_byte; 32],
                ),
                remote_secret_hash: RemoteSecretHash::from_bytes([9u8; 32]),
            },
            encrypted_data: vec![1, 2, 3],
        }
    }

    #[test]
    fn passphrase_query_before_first_transition_errors() {
        let holder = MasterKeyLockStateHolder::new();
        assert!(matches!(
            holder.is_locked_with_passphrase(),
            Err(MasterKeyError::StateNotYetKnown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_secret_query_suspends_until_known() {
        let holder = MasterKeyLockStateHolder::new();

        // Before any transition the query never resolves.
        assert!(timeout(
            Duration::from_secs(3600),
            holder.is_locked_with_remote_secret()
        )
        .await
        .is_err());

        holder.set_unlocked(test_key(), None);
        assert!(!holder.is_locked_with_remote_secret().await);

        holder.set_locked_with_remote_secret(lock_data(1));
        assert!(holder.is_locked_with_remote_secret().await);
    }

    #[tokio::test(start_paused = true)]
    async fn await_remote_secret_lock_state_returns_none_when_unprotected() {
        let holder = MasterKeyLockStateHolder::new();

        assert!(timeout(
            Duration::from_secs(3600),
            holder.await_remote_secret_lock_state()
        )
        .await
        .is_err());

        holder.set_unlocked(test_key(), None);
        let state = holder.await_remote_secret_lock_state().await;
        assert!(state.remote_secret_lock_data.is_none());
    }

    #[tokio::test]
    async fn unlock_installs_the_key() {
        let holder = MasterKeyLockStateHolder::new();
        let provider = holder.provider();
        assert!(provider.is_locked());

        holder.set_unlocked(test_key(), None);

        let key = provider.get_master_key().unwrap();
        key.with_bytes(|bytes| assert_eq!(bytes, &[0x77; KEY_LENGTH]))
            .unwrap();
    }

    #[tokio::test]
    async fn locking_invalidates_and_zeroes_the_previous_key() {
        let holder = MasterKeyLockStateHolder::new();
        let key = test_key();
        holder.set_unlocked(key.clone(), None);

        holder.set_locked_with_passphrase(
            crate::master_key::crypto::MasterKeyCrypto::encrypt_with_passphrase_v1(
                &MasterKeyData::from_bytes([0u8; KEY_LENGTH]),
                "x",
            ),
        );

        assert!(!key.is_valid());
        assert_eq!(key.raw_bytes(), [0u8; KEY_LENGTH]);
        assert!(holder.get_master_key().is_none());
    }

    #[tokio::test]
    #[should_panic(expected = "permanently locked")]
    async fn unlock_after_permanent_lock_panics() {
        let holder = MasterKeyLockStateHolder::new();
        holder.set_unlocked(test_key(), None);
        holder.set_permanently_locked();
        holder.set_unlocked(test_key(), None);
    }

    #[tokio::test]
    async fn permanent_lock_clears_the_key() {
        let holder = MasterKeyLockStateHolder::new();
        let key = test_key();
        holder.set_unlocked(key.clone(), None);

        holder.set_permanently_locked();

        assert!(!key.is_valid());
        assert!(holder.get_master_key().is_none());
    }

    #[tokio::test]
    async fn provider_await_unlocked_resolves_on_transition() {
        let holder = std::sync::Arc::new(MasterKeyLockStateHolder::new());
        let provider = holder.provider();

        let waiter = tokio::spawn({
            let provider = provider.clone();
            async move { provider.await_unlocked().await }
        });
        holder.set_unlocked(test_key(), None);

        let key = waiter.await.unwrap();
        assert!(key.is_valid());
    }

    #[tokio::test]
    async fn remote_secret_parameters_are_deduplicated() {
        let holder = MasterKeyLockStateHolder::new();
        let mut receiver = holder.subscribe_remote_secret_parameters();

        holder.set_locked_with_remote_secret(lock_data(1));
        assert!(receiver.has_changed().unwrap());
        receiver.borrow_and_update();

        // Unlocking while keeping the same parameters publishes nothing.
        let secret_key = test_key();
        holder.set_unlocked(secret_key, Some(lock_data(1)));
        assert!(!receiver.has_changed().unwrap());

        // A different parameter set publishes.
        holder.set_unlocked(test_key(), Some(lock_data(2)));
        assert!(receiver.has_changed().unwrap());
    }
}
