//! Master-key manager: orchestration of storage, lock state, passphrase
//! lifecycle and remote-secret protection.
//!
//! The manager is the single writer of the lock-state and storage-state
//! holders. It reads (or generates) the key at startup, runs the
//! passphrase set/change/remove/lock/unlock operations with transparent
//! version 1 → 2 migration, coordinates remote-secret activation and
//! deactivation with the server, and supervises the monitoring loop with
//! last-value-wins semantics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{MasterKeyError, RemoteSecretMonitorError};
use crate::lock_state::{MasterKeyLockStateHolder, MasterKeyProvider};
use crate::master_key::crypto::MasterKeyCrypto;
use crate::master_key::data::{generate_master_key, MasterKey, MasterKeyData};
use crate::master_key::state::{
    MasterKeyEvent, MasterKeyState, PassphraseLockState,
};
use crate::remote_secret::{
    RemoteSecretCheckType, RemoteSecretClientParameters, RemoteSecretManager,
    RemoteSecretProtectionCheck,
};
use crate::storage::MasterKeyStorageManager;
use crate::storage_state::MasterKeyStorageStateHolder;

/// Transient in-memory passphrase, held only across a pending
/// remote-secret protection change and cleared everywhere else.
struct PassphraseStore {
    passphrase: Mutex<Option<SecretString>>,
}

impl PassphraseStore {
    fn new() -> Self {
        Self {
            passphrase: Mutex::new(None),
        }
    }

    fn set(&self, passphrase: &str) {
        *self.lock() = Some(SecretString::from(passphrase.to_owned()));
    }

    fn clear(&self) {
        *self.lock() = None;
    }

    fn get(&self) -> Option<Zeroizing<String>> {
        self.lock()
            .as_ref()
            .map(|passphrase| Zeroizing::new(passphrase.expose_secret().to_owned()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<SecretString>> {
        self.passphrase
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn passphrase_lock_state_from(
    storage_state: Option<&MasterKeyState>,
    locked_with_passphrase: bool,
) -> PassphraseLockState {
    match storage_state {
        Some(MasterKeyState::WithPassphrase(_)) => {
            if locked_with_passphrase {
                PassphraseLockState::Locked
            } else {
                PassphraseLockState::Unlocked
            }
        }
        _ => PassphraseLockState::NoPassphrase,
    }
}

/// Orchestrates the master-key lifecycle.
pub struct MasterKeyManager {
    storage_manager: MasterKeyStorageManager,
    crypto: MasterKeyCrypto,
    lock_state_holder: MasterKeyLockStateHolder,
    storage_state_holder: MasterKeyStorageStateHolder,
    passphrase_store: PassphraseStore,
    remote_secret_manager: RemoteSecretManager,
    provider: MasterKeyProvider,
    key_needs_writing: AtomicBool,
    /// Remote-secret protection changes at runtime are held back until a
    /// startup-time check has completed, to avoid interfering with the
    /// application's startup sequence.
    runtime_update_allowed: AtomicBool,
    remote_secret_mutex: tokio::sync::Mutex<()>,
    events: mpsc::UnboundedSender<MasterKeyEvent>,
    event_receiver: Mutex<Option<mpsc::UnboundedReceiver<MasterKeyEvent>>>,
}

impl MasterKeyManager {
    /// Creates a manager with the recommended crypto parameters.
    #[must_use]
    pub fn new(
        storage_manager: MasterKeyStorageManager,
        remote_secret_manager: RemoteSecretManager,
    ) -> Self {
        Self::with_crypto(storage_manager, remote_secret_manager, MasterKeyCrypto::new())
    }

    /// Creates a manager with explicit crypto parameters.
    #[must_use]
    pub fn with_crypto(
        storage_manager: MasterKeyStorageManager,
        remote_secret_manager: RemoteSecretManager,
        crypto: MasterKeyCrypto,
    ) -> Self {
        let lock_state_holder = MasterKeyLockStateHolder::new();
        let provider = lock_state_holder.provider();
        let storage_state_holder = MasterKeyStorageStateHolder::new(crypto.clone());
        let (events, event_receiver) = mpsc::unbounded_channel();
        Self {
            storage_manager,
            crypto,
            lock_state_holder,
            storage_state_holder,
            passphrase_store: PassphraseStore::new(),
            remote_secret_manager,
            provider,
            key_needs_writing: AtomicBool::new(false),
            runtime_update_allowed: AtomicBool::new(false),
            remote_secret_mutex: tokio::sync::Mutex::new(()),
            events,
            event_receiver: Mutex::new(Some(event_receiver)),
        }
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    /// Reads the key from storage, or generates a new one when none
    /// exists yet.
    ///
    /// An unprotected legacy key is migrated to the current format
    /// immediately; a protected one is migrated once it is unlocked. A
    /// freshly generated key is not written until
    /// [`MasterKeyManager::persist_key_data_if_needed`] is called, so
    /// nothing lands on disk before the caller confirms readiness.
    ///
    /// # Errors
    ///
    /// Propagates storage errors; they are not retried and leave the
    /// engine unusable.
    pub fn read_or_generate_key(&self) -> Result<(), MasterKeyError> {
        if self.storage_manager.key_exists() {
            info!("Master key exists");
            self.read_key()
        } else {
            info!("Master key does not exist, generating new one");
            self.generate_key();
            Ok(())
        }
    }

    fn read_key(&self) -> Result<(), MasterKeyError> {
        let storage_state = self.storage_manager.read_key()?;

        let needs_migration = match &storage_state {
            MasterKeyState::WithPassphrase(protection) => {
                self.lock_state_holder
                    .set_locked_with_passphrase(protection.clone());
                false
            }
            MasterKeyState::WithRemoteSecret(lock_data) => {
                self.lock_state_holder
                    .set_locked_with_remote_secret(lock_data.clone());
                false
            }
            MasterKeyState::Plain {
                master_key_data,
                was_migrated,
            } => {
                self.lock_state_holder
                    .set_unlocked(MasterKey::new(master_key_data.clone()), None);
                *was_migrated
            }
        };

        self.storage_state_holder.init(storage_state);
        if needs_migration {
            self.persist_key_data()?;
        }
        Ok(())
    }

    fn generate_key(&self) {
        let master_key_data = generate_master_key();
        self.lock_state_holder
            .set_unlocked(MasterKey::new(master_key_data.clone()), None);
        self.storage_state_holder
            .init(MasterKeyState::plain(master_key_data));
        self.key_needs_writing.store(true, Ordering::Relaxed);
    }

    fn persist_key_data(&self) -> Result<(), MasterKeyError> {
        let state = self.storage_state_holder.storage_state();
        match &state {
            MasterKeyState::Plain { .. } => info!("Persisting plain master key"),
            MasterKeyState::WithPassphrase(_) => {
                info!("Persisting passphrase protected master key");
            }
            MasterKeyState::WithRemoteSecret(_) => {
                info!("Persisting remote secret protected master key");
            }
        }
        self.storage_manager.write_key(&state)?;
        self.key_needs_writing.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Writes a freshly generated key if it has not been persisted yet.
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub fn persist_key_data_if_needed(&self) -> Result<(), MasterKeyError> {
        if self.key_needs_writing.load(Ordering::Relaxed) {
            self.persist_key_data()
        } else {
            Ok(())
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Provider view over the live master key.
    #[must_use]
    pub fn master_key_provider(&self) -> MasterKeyProvider {
        self.provider.clone()
    }

    /// Returns whether passphrase protection is configured in storage.
    ///
    /// # Panics
    ///
    /// Panics before the startup read/generate has initialized the
    /// storage state.
    #[must_use]
    pub fn is_protected_with_passphrase(&self) -> bool {
        matches!(
            self.storage_state_holder.storage_state(),
            MasterKeyState::WithPassphrase(_)
        )
    }

    /// Returns whether remote-secret protection is configured, or `None`
    /// when that cannot be told yet (passphrase-protected storage whose
    /// inner layer has not been decrypted).
    ///
    /// # Panics
    ///
    /// Panics before the startup read/generate has initialized the
    /// storage state.
    #[must_use]
    pub fn is_protected_with_remote_secret(&self) -> Option<bool> {
        match self.storage_state_holder.storage_state() {
            MasterKeyState::WithRemoteSecret(_) => Some(true),
            MasterKeyState::Plain { .. } => Some(false),
            MasterKeyState::WithPassphrase(_) => self
                .lock_state_holder
                .get_remote_secret_lock_state()
                .map(|state| state.remote_secret_lock_data.is_some()),
        }
    }

    /// Returns whether any protection is configured, suspending until the
    /// storage state is initialized.
    pub async fn is_protected(&self) -> bool {
        self.storage_state_holder.is_protected().await
    }

    /// Returns whether the key is locked with a passphrase.
    ///
    /// # Errors
    ///
    /// Returns [`MasterKeyError::StateNotYetKnown`] before the startup
    /// read has established the lock state.
    pub fn is_locked_with_passphrase(&self) -> Result<bool, MasterKeyError> {
        self.lock_state_holder.is_locked_with_passphrase()
    }

    /// Returns whether the key is locked with a remote secret, suspending
    /// until the lock state is known.
    pub async fn is_locked_with_remote_secret(&self) -> bool {
        self.lock_state_holder.is_locked_with_remote_secret().await
    }

    /// Returns whether no master key is currently available.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.provider.is_locked()
    }

    // -------------------------------------------------------------------------
    // Passphrase lifecycle
    // -------------------------------------------------------------------------

    /// Checks a passphrase without changing the lock state. Returns
    /// `true` when no passphrase protection is configured.
    #[must_use]
    pub fn check_passphrase(&self, passphrase: &str) -> bool {
        match self.storage_state_holder.storage_state() {
            MasterKeyState::WithPassphrase(protection) => {
                self.crypto.verify_passphrase(&protection, passphrase)
            }
            _ => {
                warn!("Tried to check a passphrase, but no passphrase protection is active");
                true
            }
        }
    }

    /// Locks the key under its configured passphrase protection, zeroing
    /// the live key. A no-op when no passphrase protection is configured.
    pub fn lock_with_passphrase(&self) {
        info!("Locking with passphrase");
        self.passphrase_store.clear();
        match self.storage_state_holder.storage_state() {
            MasterKeyState::WithPassphrase(protection) => {
                self.lock_state_holder.set_locked_with_passphrase(protection);
            }
            _ => {
                warn!("Tried to lock with passphrase, but no passphrase protection is active");
            }
        }
    }

    /// Unlocks with a passphrase.
    ///
    /// Returns `Ok(false)` on a wrong passphrase, leaving the key locked.
    /// A legacy (version 1) protected key is transparently re-encrypted
    /// and persisted in the current format. When a remote-secret
    /// protection change is pending, the passphrase is kept in memory
    /// until that change completes.
    ///
    /// # Errors
    ///
    /// Propagates storage errors from the migration write.
    pub fn unlock_with_passphrase(&self, passphrase: &str) -> Result<bool, MasterKeyError> {
        let Some(protection) = self.lock_state_holder.get_passphrase_lock() else {
            return Ok(true);
        };

        info!("Unlocking with passphrase");
        let new_state = match self.crypto.decrypt_with_passphrase(&protection, passphrase) {
            Ok(state) => state,
            Err(error) => {
                warn!(%error, "Incorrect passphrase entered");
                return Ok(false);
            }
        };

        // If remote-secret protection will need to change after this
        // unlock, keep the passphrase until that change completes.
        let pending_lock_data = match &new_state {
            MasterKeyState::WithRemoteSecret(lock_data) => Some(lock_data),
            _ => None,
        };
        match self
            .remote_secret_manager
            .check_remote_secret_protection(pending_lock_data)
        {
            RemoteSecretProtectionCheck::ShouldActivate
            | RemoteSecretProtectionCheck::ShouldDeactivate => {
                self.passphrase_store.set(passphrase);
            }
            RemoteSecretProtectionCheck::NoChangeNeeded => {}
        }

        match new_state {
            MasterKeyState::WithRemoteSecret(lock_data) => {
                self.lock_state_holder.set_locked_with_remote_secret(lock_data);
            }
            MasterKeyState::Plain {
                master_key_data,
                was_migrated,
            } => {
                self.lock_state_holder
                    .set_unlocked(MasterKey::new(master_key_data), None);
                if was_migrated {
                    // Re-encrypting under the same passphrase migrates the
                    // stored protection from version 1 to version 2.
                    self.set_passphrase(passphrase, Some(passphrase))?;
                }
            }
            MasterKeyState::WithPassphrase(_) => {
                return Err(crate::error::CryptoError::InvalidInput(
                    "nested passphrase protection in storage",
                )
                .into());
            }
        }

        Ok(true)
    }

    /// Sets or changes the passphrase. The correct `old_passphrase` is
    /// required when the key is currently locked or already
    /// passphrase-protected.
    ///
    /// # Errors
    ///
    /// Returns [`MasterKeyError::Locked`] when no key is available, a
    /// crypto error for a wrong old passphrase, or a storage error.
    pub fn set_passphrase(
        &self,
        passphrase: &str,
        old_passphrase: Option<&str>,
    ) -> Result<(), MasterKeyError> {
        if let Some(old_passphrase) = old_passphrase {
            self.unlock_with_passphrase(old_passphrase)?;
        }
        if self.lock_state_holder.get_master_key().is_none() {
            return Err(MasterKeyError::Locked);
        }

        if let Some(old_passphrase) = old_passphrase {
            self.storage_state_holder
                .remove_passphrase_protection(old_passphrase)?;
        }

        self.passphrase_store.clear();
        self.storage_state_holder.add_passphrase_protection(passphrase)?;
        self.persist_key_data()
    }

    /// Removes passphrase protection. A no-op when none is configured.
    ///
    /// # Errors
    ///
    /// Returns a crypto error for a wrong passphrase or a storage error.
    pub fn remove_passphrase(&self, passphrase: &str) -> Result<(), MasterKeyError> {
        if !self.is_protected_with_passphrase() {
            return Ok(());
        }
        info!("Removing passphrase");
        self.unlock_with_passphrase(passphrase)?;
        self.storage_state_holder
            .remove_passphrase_protection(passphrase)?;
        self.passphrase_store.clear();
        self.persist_key_data()
    }

    // -------------------------------------------------------------------------
    // Remote-secret lifecycle
    // -------------------------------------------------------------------------

    /// Unlocks with the monitored remote secret, suspending until the
    /// monitor has delivered one. A no-op when no remote-secret
    /// protection is in use.
    ///
    /// # Errors
    ///
    /// Returns a crypto error when the delivered secret cannot decrypt
    /// the stored data (rotation or corruption).
    pub async fn unlock_with_remote_secret(&self) -> Result<(), MasterKeyError> {
        let Some(lock_data) = self
            .lock_state_holder
            .await_remote_secret_lock_state()
            .await
            .remote_secret_lock_data
        else {
            return Ok(());
        };

        info!("Awaiting remote secret");
        let remote_secret = self.remote_secret_manager.await_remote_secret_and_clear().await;

        info!("Unlocking with remote secret");
        let new_state = self
            .crypto
            .decrypt_with_remote_secret(&lock_data, &remote_secret)?;
        let MasterKeyState::Plain {
            master_key_data, ..
        } = new_state
        else {
            return Err(crate::error::CryptoError::InvalidInput(
                "remote secret wrapped something other than plain key material",
            )
            .into());
        };
        self.lock_state_holder
            .set_unlocked(MasterKey::new(master_key_data), Some(lock_data));
        Ok(())
    }

    /// Locks the key under its active remote-secret protection, zeroing
    /// the live key.
    pub fn lock_with_remote_secret(&self) {
        self.passphrase_store.clear();
        let Some(lock_data) = self
            .lock_state_holder
            .get_remote_secret_lock_state()
            .and_then(|state| state.remote_secret_lock_data)
        else {
            warn!("Failed to lock with remote secret, no remote secret lock data available");
            return;
        };
        info!("Locking with remote secret");
        self.lock_state_holder.set_locked_with_remote_secret(lock_data);
    }

    /// Permanently locks the engine: clears the transient passphrase and
    /// performs the terminal lock transition. Used for irrecoverable
    /// security wipes.
    pub fn lock_permanently(&self) {
        self.passphrase_store.clear();
        self.lock_state_holder.set_permanently_locked();
    }

    /// Supervises the monitoring loop over the currently-relevant
    /// remote-secret parameters: each distinct parameter set restarts the
    /// loop, cancelling the in-flight loop for a stale value
    /// (last-value-wins, not queued).
    ///
    /// Resolves only when monitoring fails; the caller must translate the
    /// failure into a lock.
    ///
    /// # Errors
    ///
    /// Returns the [`RemoteSecretMonitorError`] that ended monitoring.
    pub async fn monitor_remote_secret(&self) -> Result<(), RemoteSecretMonitorError> {
        let mut receiver = self.lock_state_holder.subscribe_remote_secret_parameters();
        loop {
            let parameters = receiver.borrow_and_update().clone();
            match parameters {
                Some(parameters) => {
                    tokio::select! {
                        error = self.remote_secret_manager.monitor_remote_secret(&parameters) => {
                            return Err(error);
                        }
                        changed = receiver.changed() => {
                            if changed.is_err() {
                                return Ok(());
                            }
                            // The in-flight loop for the stale value was
                            // dropped by the select; restart with the
                            // latest value.
                        }
                    }
                }
                None => {
                    if receiver.changed().await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns whether a remote-secret protection update would do
    /// anything right now. Runtime checks are suppressed until a
    /// startup-time check has completed.
    #[must_use]
    pub fn should_update_remote_secret_protection_state(
        &self,
        check_type: RemoteSecretCheckType,
    ) -> bool {
        if check_type == RemoteSecretCheckType::AppRuntime
            && !self.runtime_update_allowed.load(Ordering::Relaxed)
        {
            return false;
        }
        let Some(lock_state) = self.lock_state_holder.get_remote_secret_lock_state() else {
            warn!("Protection state checked while the remote secret lock state is not yet known");
            return false;
        };
        match self
            .remote_secret_manager
            .check_remote_secret_protection(lock_state.remote_secret_lock_data.as_ref())
        {
            RemoteSecretProtectionCheck::NoChangeNeeded => {
                self.runtime_update_allowed.store(true, Ordering::Relaxed);
                false
            }
            RemoteSecretProtectionCheck::ShouldActivate
            | RemoteSecretProtectionCheck::ShouldDeactivate => true,
        }
    }

    /// Returns the current protection-change decision, or `None` while
    /// the lock state is not yet known.
    #[must_use]
    pub fn remote_secret_protection_state(&self) -> Option<RemoteSecretProtectionCheck> {
        let lock_state = self.lock_state_holder.get_remote_secret_lock_state()?;
        Some(
            self.remote_secret_manager
                .check_remote_secret_protection(lock_state.remote_secret_lock_data.as_ref()),
        )
    }

    /// Activates or deactivates remote-secret protection as the policy
    /// demands, or does nothing.
    ///
    /// Suspends until the key is unlocked or only locked with a remote
    /// secret. On activation a fresh secret is created on the server,
    /// storage is re-wrapped and persisted, the lock state keeps the new
    /// protection metadata and [`MasterKeyEvent::RemoteSecretActivated`]
    /// is emitted. On deactivation the monitored secret is consumed and
    /// cleared, storage is unwrapped back to plain (or passphrase-only)
    /// and [`MasterKeyEvent::RemoteSecretDeactivated`] carries the token
    /// the caller should revoke server-side. The transiently stored
    /// passphrase is cleared in every case.
    ///
    /// # Errors
    ///
    /// Returns [`MasterKeyError::PassphraseRequired`] when passphrase
    /// protection is active but no passphrase is held, an endpoint error
    /// from secret creation, or a crypto/storage error.
    pub async fn update_remote_secret_protection_state_if_needed(
        &self,
        client_parameters: &RemoteSecretClientParameters,
    ) -> Result<(), MasterKeyError> {
        let _guard = self.remote_secret_mutex.lock().await;
        self.runtime_update_allowed.store(false, Ordering::Relaxed);

        let remote_secret_lock_data = self
            .lock_state_holder
            .await_remote_secret_lock_state()
            .await
            .remote_secret_lock_data;
        let passphrase = self.passphrase_store.get();

        match self
            .remote_secret_manager
            .check_remote_secret_protection(remote_secret_lock_data.as_ref())
        {
            RemoteSecretProtectionCheck::NoChangeNeeded => {
                debug!("Nothing needs to be done with remote secrets");
            }

            RemoteSecretProtectionCheck::ShouldActivate => {
                info!("Adding remote secret protection");
                if self.is_protected_with_passphrase() && passphrase.is_none() {
                    // Stop before creating a remote secret that could not
                    // be used anyway.
                    return Err(MasterKeyError::PassphraseRequired);
                }
                let master_key_data = self.await_master_key_data().await?;
                let result = self
                    .remote_secret_manager
                    .create_remote_secret(client_parameters)
                    .await?;
                self.storage_state_holder.set_state_with_remote_secret_protection(
                    master_key_data.clone(),
                    passphrase.as_ref().map(|passphrase| passphrase.as_str()),
                    &result.remote_secret,
                    result.parameters.clone(),
                )?;
                self.persist_key_data()?;
                let lock_data = self.crypto.encrypt_with_remote_secret(
                    &MasterKeyState::plain(master_key_data.clone()),
                    &result.remote_secret,
                    result.parameters,
                )?;
                self.lock_state_holder
                    .set_unlocked(MasterKey::new(master_key_data), Some(lock_data));
                let _ = self.events.send(MasterKeyEvent::RemoteSecretActivated);
            }

            RemoteSecretProtectionCheck::ShouldDeactivate => {
                info!("Removing remote secret protection");
                let master_key_data = self.await_master_key_data().await?;
                // Consume the monitored secret so it does not outlive the
                // protection it belonged to.
                drop(self.remote_secret_manager.await_remote_secret_and_clear().await);
                self.storage_state_holder.set_state_without_remote_secret_protection(
                    master_key_data.clone(),
                    passphrase.as_ref().map(|passphrase| passphrase.as_str()),
                )?;
                self.persist_key_data()?;
                self.lock_state_holder
                    .set_unlocked(MasterKey::new(master_key_data), None);
                if let Some(lock_data) = remote_secret_lock_data {
                    let _ = self.events.send(MasterKeyEvent::RemoteSecretDeactivated {
                        authentication_token: lock_data.parameters.authentication_token,
                    });
                }
            }
        }

        self.passphrase_store.clear();
        self.runtime_update_allowed.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Revokes a deactivated remote secret on the server.
    ///
    /// # Errors
    ///
    /// Returns an endpoint error, notably
    /// [`crate::error::RemoteSecretEndpointError::InvalidCredentials`].
    pub async fn delete_remote_secret(
        &self,
        client_parameters: &RemoteSecretClientParameters,
        authentication_token: &crate::master_key::state::RemoteSecretAuthenticationToken,
    ) -> Result<(), MasterKeyError> {
        self.remote_secret_manager
            .delete_remote_secret(client_parameters, authentication_token)
            .await?;
        Ok(())
    }

    async fn await_master_key_data(&self) -> Result<MasterKeyData, MasterKeyError> {
        self.provider.await_unlocked().await.to_data()
    }

    // -------------------------------------------------------------------------
    // Observables
    // -------------------------------------------------------------------------

    /// Current passphrase lock state.
    ///
    /// `NoPassphrase` until the storage state is initialized.
    #[must_use]
    pub fn passphrase_lock_state(&self) -> PassphraseLockState {
        passphrase_lock_state_from(
            self.storage_state_holder.observe().borrow().as_ref(),
            *self.lock_state_holder.subscribe_passphrase_locked().borrow(),
        )
    }

    /// Observes the passphrase lock state, combining the storage-state
    /// protection flag with the lock-state passphrase flag. Remote-secret
    /// protection changes do not perturb this observable.
    ///
    /// Spawns a combiner task onto the current Tokio runtime; the task
    /// ends when the manager or all receivers are dropped.
    ///
    /// # Panics
    ///
    /// Panics outside of a Tokio runtime.
    #[must_use]
    pub fn watch_passphrase_lock_state(&self) -> watch::Receiver<PassphraseLockState> {
        let mut storage_receiver = self.storage_state_holder.observe();
        let mut locked_receiver = self.lock_state_holder.subscribe_passphrase_locked();
        let initial = passphrase_lock_state_from(
            storage_receiver.borrow().as_ref(),
            *locked_receiver.borrow(),
        );
        let (sender, receiver) = watch::channel(initial);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = storage_receiver.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = locked_receiver.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let value = passphrase_lock_state_from(
                    storage_receiver.borrow_and_update().as_ref(),
                    *locked_receiver.borrow_and_update(),
                );
                sender.send_if_modified(|current| {
                    let modified = *current != value;
                    *current = value;
                    modified
                });
                if sender.is_closed() {
                    break;
                }
            }
        });
        receiver
    }

    /// Takes the domain-event receiver. Events are buffered unbounded;
    /// only the first caller gets the receiver.
    #[must_use]
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<MasterKeyEvent>> {
        self.event_receiver
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Publishes a remote secret into the monitor handoff, as a fetch of
    /// the monitoring loop would.
    #[cfg(test)]
    pub(crate) fn publish_remote_secret_for_test(
        &self,
        secret: crate::master_key::state::RemoteSecret,
    ) {
        self.remote_secret_manager.publish_remote_secret_for_test(secret);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use mockito::Matcher;
    use tempfile::TempDir;
    use tokio::time::timeout;

    use super::*;
    use crate::config::KEY_LENGTH;
    use crate::master_key::crypto::test_crypto;
    use crate::master_key::state::{RemoteSecret, RemoteSecretParameters};
    use crate::remote_secret::{ClientKey, WorkCredentials};
    use crate::storage::MasterKeyStorageManager;

    const PATH: &str = "/api-client/v1/remote-secret";

    fn manager_with_policy(
        dir: &TempDir,
        base_url: &str,
        policy: Arc<AtomicBool>,
    ) -> MasterKeyManager {
        MasterKeyManager::with_crypto(
            MasterKeyStorageManager::new(dir.path()),
            RemoteSecretManager::new(
                base_url,
                Box::new(move || policy.load(Ordering::Relaxed)),
            ),
            test_crypto(),
        )
    }

    fn offline_manager(dir: &TempDir) -> MasterKeyManager {
        manager_with_policy(
            dir,
            "https://work.example.invalid",
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn client_parameters(base_url: String) -> RemoteSecretClientParameters {
        RemoteSecretClientParameters {
            work_server_base_url: base_url,
            user_identity: "ECHOECHO".to_string(),
            client_key: ClientKey::from_bytes([3u8; 32]),
            credentials: WorkCredentials {
                username: "license".to_string(),
                password: "hunter2".to_string(),
            },
        }
    }

    async fn mock_create_flow(server: &mut mockito::Server) -> (mockito::Mock, mockito::Mock) {
        let challenge = server
            .mock("PUT", PATH)
            .with_status(200)
            .with_body(
                serde_json::to_vec(&serde_json::json!({
                    "challengePublicKey": BASE64.encode([7u8; 32]),
                    "challenge": BASE64.encode(b"meow"),
                }))
                .unwrap(),
            )
            .create_async()
            .await;
        let create = server
            .mock("PUT", PATH)
            .match_body(Matcher::Regex("\"response\"".to_string()))
            .with_status(200)
            .with_body(
                serde_json::to_vec(&serde_json::json!({
                    "secretAuthenticationToken": BASE64.encode([2u8; 32]),
                }))
                .unwrap(),
            )
            .create_async()
            .await;
        (challenge, create)
    }

    fn master_key_bytes(manager: &MasterKeyManager) -> [u8; KEY_LENGTH] {
        manager
            .master_key_provider()
            .get_master_key()
            .unwrap()
            .with_bytes(|bytes| *bytes)
            .unwrap()
    }

    #[tokio::test]
    async fn generated_key_is_written_only_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let manager = offline_manager(&dir);

        manager.read_or_generate_key().unwrap();

        let key_file = dir.path().join(crate::storage::format::KEY_FILE_NAME);
        assert!(!key_file.exists());
        assert!(!manager.is_locked());

        manager.persist_key_data_if_needed().unwrap();
        assert!(key_file.exists());

        // A second manager reads the same key back.
        let reread = offline_manager(&dir);
        reread.read_or_generate_key().unwrap();
        assert_eq!(master_key_bytes(&manager), master_key_bytes(&reread));
    }

    #[tokio::test]
    async fn passphrase_lifecycle_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let manager = offline_manager(&dir);
        manager.read_or_generate_key().unwrap();
        let original_key = master_key_bytes(&manager);

        // All passphrases are valid when there is no passphrase.
        assert!(manager.check_passphrase("hello"));

        // Locking does nothing when there is no passphrase set.
        manager.lock_with_passphrase();
        assert!(!manager.is_locked_with_passphrase().unwrap());

        // Setting a passphrase persists but does not lock.
        manager.set_passphrase("hello", None).unwrap();
        assert!(!manager.is_locked_with_passphrase().unwrap());
        assert!(!manager.is_locked());
        assert!(matches!(
            MasterKeyStorageManager::new(dir.path()).read_key().unwrap(),
            MasterKeyState::WithPassphrase(_)
        ));

        // Locking zeroes the live key.
        let live_key = manager.master_key_provider().get_master_key().unwrap();
        manager.lock_with_passphrase();
        assert!(manager.is_locked_with_passphrase().unwrap());
        assert!(manager.is_locked());
        assert!(!live_key.is_valid());
        assert_eq!(live_key.raw_bytes(), [0u8; KEY_LENGTH]);

        // The passphrase cannot be changed while locked without the old
        // one.
        assert!(matches!(
            manager.set_passphrase("HELLO", None),
            Err(MasterKeyError::Locked)
        ));

        // Checking does not unlock.
        assert!(manager.check_passphrase("hello"));
        assert!(!manager.check_passphrase("HELLO"));
        assert!(manager.is_locked_with_passphrase().unwrap());

        // Wrong passphrase fails and leaves the key locked.
        assert!(!manager.unlock_with_passphrase("HELLO").unwrap());
        assert!(manager.is_locked_with_passphrase().unwrap());

        // The correct passphrase restores the key bit-for-bit.
        assert!(manager.unlock_with_passphrase("hello").unwrap());
        assert!(!manager.is_locked());
        assert_eq!(master_key_bytes(&manager), original_key);

        // Changing requires the correct old passphrase.
        assert!(manager.set_passphrase("HELLO", None).is_err());
        assert!(manager.set_passphrase("HELLO", Some("wrong")).is_err());
        manager.set_passphrase("HELLO", Some("hello")).unwrap();
        assert_eq!(master_key_bytes(&manager), original_key);

        // The passphrase can be removed while unlocked.
        manager.lock_with_passphrase();
        assert!(manager.unlock_with_passphrase("HELLO").unwrap());
        manager.remove_passphrase("HELLO").unwrap();
        assert!(!manager.is_protected_with_passphrase());
        assert_eq!(
            MasterKeyStorageManager::new(dir.path()).read_key().unwrap(),
            MasterKeyState::plain(MasterKeyData::from_bytes(original_key)),
        );
    }

    #[tokio::test]
    async fn version_1_key_is_migrated_after_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let key = MasterKeyData::from_bytes([0x42; KEY_LENGTH]);
        let crate::master_key::state::PassphraseProtection::Version1 {
            protected_key,
            salt,
            verification,
        } = MasterKeyCrypto::encrypt_with_passphrase_v1(&key, "passphrase")
        else {
            panic!("expected version 1 protection");
        };
        let storage = MasterKeyStorageManager::new(dir.path());
        std::fs::write(
            storage.legacy_key_file(),
            crate::storage::codec::encode(&crate::storage::codec::MasterKeyStorageData::Version1(
                crate::storage::codec::Version1StorageData::PassphraseProtected {
                    protected_key,
                    salt,
                    verification,
                },
            )),
        )
        .unwrap();

        let manager = offline_manager(&dir);
        manager.read_or_generate_key().unwrap();
        assert!(manager.is_locked_with_passphrase().unwrap());
        assert!(manager.is_protected().await);

        assert!(!manager.unlock_with_passphrase("wrong").unwrap());
        assert!(manager.unlock_with_passphrase("passphrase").unwrap());
        assert_eq!(master_key_bytes(&manager), *key.as_bytes());

        // The legacy file is gone and the rewritten protection is
        // version 2.
        assert!(!storage.legacy_key_file().exists());
        let reread = storage.read_key().unwrap();
        assert!(matches!(
            reread,
            MasterKeyState::WithPassphrase(
                crate::master_key::state::PassphraseProtection::Version2 { .. }
            )
        ));

        // The migrated file still unlocks with the same passphrase.
        manager.lock_with_passphrase();
        assert!(manager.unlock_with_passphrase("passphrase").unwrap());
        assert_eq!(master_key_bytes(&manager), *key.as_bytes());
    }

    #[tokio::test]
    async fn version_1_unprotected_key_is_migrated_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let key = MasterKeyData::from_bytes([0x24; KEY_LENGTH]);
        let storage = MasterKeyStorageManager::new(dir.path());
        std::fs::write(
            storage.legacy_key_file(),
            crate::storage::codec::encode(&crate::storage::codec::MasterKeyStorageData::Version1(
                crate::storage::codec::Version1StorageData::Unprotected {
                    master_key_data: key.clone(),
                    verification: crate::master_key::crypto::calc_v1_verification(key.as_bytes()),
                },
            )),
        )
        .unwrap();

        let manager = offline_manager(&dir);
        manager.read_or_generate_key().unwrap();

        assert_eq!(master_key_bytes(&manager), *key.as_bytes());
        assert!(!storage.legacy_key_file().exists());
        assert_eq!(
            storage.read_key().unwrap(),
            MasterKeyState::plain(key),
        );
    }

    #[tokio::test]
    async fn is_protected_can_be_called_before_key_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(offline_manager(&dir));

        let pending = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.is_protected().await }
        });
        tokio::task::yield_now().await;

        manager.read_or_generate_key().unwrap();
        assert!(!timeout(Duration::from_secs(5), pending).await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn permanent_lock_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let manager = offline_manager(&dir);
        manager.read_or_generate_key().unwrap();

        manager.lock_permanently();

        assert!(manager.is_locked());
        assert!(matches!(
            manager.set_passphrase("hello", None),
            Err(MasterKeyError::Locked)
        ));
    }

    #[tokio::test]
    async fn passphrase_lock_state_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let manager = offline_manager(&dir);
        manager.read_or_generate_key().unwrap();
        let mut state = manager.watch_passphrase_lock_state();

        assert_eq!(*state.borrow(), PassphraseLockState::NoPassphrase);

        manager.set_passphrase("hello", None).unwrap();
        timeout(
            Duration::from_secs(5),
            state.wait_for(|value| *value == PassphraseLockState::Unlocked),
        )
        .await
        .unwrap()
        .unwrap();

        manager.lock_with_passphrase();
        timeout(
            Duration::from_secs(5),
            state.wait_for(|value| *value == PassphraseLockState::Locked),
        )
        .await
        .unwrap()
        .unwrap();

        manager.unlock_with_passphrase("hello").unwrap();
        timeout(
            Duration::from_secs(5),
            state.wait_for(|value| *value == PassphraseLockState::Unlocked),
        )
        .await
        .unwrap()
        .unwrap();

        manager.remove_passphrase("hello").unwrap();
        timeout(
            Duration::from_secs(5),
            state.wait_for(|value| *value == PassphraseLockState::NoPassphrase),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn remote_secret_activation_when_unprotected() {
        let mut server = mockito::Server::new_async().await;
        let (challenge_mock, create_mock) = mock_create_flow(&mut server).await;
        let dir = tempfile::tempdir().unwrap();
        let policy = Arc::new(AtomicBool::new(true));
        let manager = manager_with_policy(&dir, &server.url(), Arc::clone(&policy));
        let mut events = manager.take_event_receiver().unwrap();
        manager.read_or_generate_key().unwrap();
        manager.persist_key_data_if_needed().unwrap();
        let original_key = master_key_bytes(&manager);
        let mut passphrase_state = manager.watch_passphrase_lock_state();

        assert_eq!(
            manager.remote_secret_protection_state(),
            Some(RemoteSecretProtectionCheck::ShouldActivate)
        );
        manager
            .update_remote_secret_protection_state_if_needed(&client_parameters(server.url()))
            .await
            .unwrap();

        challenge_mock.assert_async().await;
        create_mock.assert_async().await;
        assert_eq!(events.try_recv().unwrap(), MasterKeyEvent::RemoteSecretActivated);
        assert_eq!(manager.is_protected_with_remote_secret(), Some(true));
        assert_eq!(
            manager.remote_secret_protection_state(),
            Some(RemoteSecretProtectionCheck::NoChangeNeeded)
        );
        // Still unlocked with the same key.
        assert_eq!(master_key_bytes(&manager), original_key);
        // Persisted as remote-secret protected.
        assert!(matches!(
            MasterKeyStorageManager::new(dir.path()).read_key().unwrap(),
            MasterKeyState::WithRemoteSecret(_)
        ));
        // Remote-secret changes do not perturb the passphrase lock state.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!passphrase_state.has_changed().unwrap());
        assert_eq!(*passphrase_state.borrow(), PassphraseLockState::NoPassphrase);
    }

    #[tokio::test]
    async fn remote_secret_activation_keeps_passphrase_outermost() {
        let mut server = mockito::Server::new_async().await;
        let (_challenge_mock, _create_mock) = mock_create_flow(&mut server).await;
        let dir = tempfile::tempdir().unwrap();
        let policy = Arc::new(AtomicBool::new(true));
        let manager = manager_with_policy(&dir, &server.url(), Arc::clone(&policy));
        manager.read_or_generate_key().unwrap();
        manager.set_passphrase("hello", None).unwrap();
        manager.lock_with_passphrase();

        // The unlock notices the pending activation and keeps the
        // passphrase in memory for the re-wrap.
        assert!(manager.unlock_with_passphrase("hello").unwrap());
        manager
            .update_remote_secret_protection_state_if_needed(&client_parameters(server.url()))
            .await
            .unwrap();

        // The stored outer layer is still the passphrase; unwrapping it
        // exposes the remote-secret layer.
        let MasterKeyState::WithPassphrase(protection) =
            MasterKeyStorageManager::new(dir.path()).read_key().unwrap()
        else {
            panic!("expected passphrase protection to stay outermost");
        };
        let inner = test_crypto()
            .decrypt_with_passphrase(&protection, "hello")
            .unwrap();
        assert!(matches!(inner, MasterKeyState::WithRemoteSecret(_)));
        assert_eq!(manager.is_protected_with_remote_secret(), Some(true));
    }

    #[tokio::test]
    async fn remote_secret_activation_requires_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let policy = Arc::new(AtomicBool::new(true));
        let manager =
            manager_with_policy(&dir, "https://work.example.invalid", Arc::clone(&policy));
        manager.read_or_generate_key().unwrap();
        // set_passphrase clears the transient store, so the activation
        // has no passphrase to re-wrap the outer layer with.
        manager.set_passphrase("hello", None).unwrap();

        let result = manager
            .update_remote_secret_protection_state_if_needed(&client_parameters(
                "https://work.example.invalid".to_string(),
            ))
            .await;
        assert!(matches!(result, Err(MasterKeyError::PassphraseRequired)));
    }

    #[tokio::test]
    async fn remote_secret_deactivation() {
        let mut server = mockito::Server::new_async().await;
        let (_challenge_mock, _create_mock) = mock_create_flow(&mut server).await;
        let dir = tempfile::tempdir().unwrap();
        let policy = Arc::new(AtomicBool::new(true));
        let manager = manager_with_policy(&dir, &server.url(), Arc::clone(&policy));
        let mut events = manager.take_event_receiver().unwrap();
        manager.read_or_generate_key().unwrap();
        let original_key = master_key_bytes(&manager);
        manager
            .update_remote_secret_protection_state_if_needed(&client_parameters(server.url()))
            .await
            .unwrap();
        assert_eq!(events.try_recv().unwrap(), MasterKeyEvent::RemoteSecretActivated);

        policy.store(false, Ordering::Relaxed);
        assert_eq!(
            manager.remote_secret_protection_state(),
            Some(RemoteSecretProtectionCheck::ShouldDeactivate)
        );
        // Simulate the monitoring loop having fetched the secret.
        manager.publish_remote_secret_for_test(RemoteSecret::from_bytes([9u8; 32]));

        manager
            .update_remote_secret_protection_state_if_needed(&client_parameters(server.url()))
            .await
            .unwrap();

        let event = events.try_recv().unwrap();
        assert_eq!(
            event,
            MasterKeyEvent::RemoteSecretDeactivated {
                authentication_token:
                    crate::master_key::state::RemoteSecretAuthenticationToken::from_bytes(
                        [2u8; 32]
                    ),
            }
        );
        assert_eq!(manager.is_protected_with_remote_secret(), Some(false));
        assert_eq!(master_key_bytes(&manager), original_key);
        assert_eq!(
            MasterKeyStorageManager::new(dir.path()).read_key().unwrap(),
            MasterKeyState::plain(MasterKeyData::from_bytes(original_key)),
        );
    }

    #[tokio::test]
    async fn no_change_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = offline_manager(&dir);
        let mut events = manager.take_event_receiver().unwrap();
        manager.read_or_generate_key().unwrap();
        manager.persist_key_data_if_needed().unwrap();

        manager
            .update_remote_secret_protection_state_if_needed(&client_parameters(
                "https://work.example.invalid".to_string(),
            ))
            .await
            .unwrap();

        assert!(events.try_recv().is_err());
        assert_eq!(manager.is_protected_with_remote_secret(), Some(false));
    }

    #[tokio::test]
    async fn runtime_checks_are_gated_until_startup_check_passes() {
        let dir = tempfile::tempdir().unwrap();
        let policy = Arc::new(AtomicBool::new(false));
        let manager =
            manager_with_policy(&dir, "https://work.example.invalid", Arc::clone(&policy));
        manager.read_or_generate_key().unwrap();

        // Runtime checks are suppressed before any startup check.
        policy.store(true, Ordering::Relaxed);
        assert!(!manager.should_update_remote_secret_protection_state(
            RemoteSecretCheckType::AppRuntime
        ));
        // A startup check is always evaluated.
        assert!(manager
            .should_update_remote_secret_protection_state(RemoteSecretCheckType::Startup));

        // Once a check concluded nothing needs to change, runtime checks
        // are allowed.
        policy.store(false, Ordering::Relaxed);
        assert!(!manager
            .should_update_remote_secret_protection_state(RemoteSecretCheckType::Startup));
        policy.store(true, Ordering::Relaxed);
        assert!(manager.should_update_remote_secret_protection_state(
            RemoteSecretCheckType::AppRuntime
        ));
    }

    #[tokio::test]
    async fn unlock_via_monitored_remote_secret() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let crypto = test_crypto();
        let key = MasterKeyData::from_bytes([0x42; KEY_LENGTH]);
        let secret = RemoteSecret::from_bytes([2u8; 32]);
        let parameters = RemoteSecretParameters {
            authentication_token:
                crate::master_key::state::RemoteSecretAuthenticationToken::from_bytes([1u8; 32]),
            remote_secret_hash: secret.derive_hash(),
        };
        let lock_data = crypto
            .encrypt_with_remote_secret(&MasterKeyState::plain(key.clone()), &secret, parameters)
            .unwrap();
        MasterKeyStorageManager::new(dir.path())
            .write_key(&MasterKeyState::WithRemoteSecret(lock_data))
            .unwrap();
        server
            .mock("POST", PATH)
            .with_status(200)
            .with_body(
                serde_json::to_vec(&serde_json::json!({
                    "secret": BASE64.encode([2u8; 32]),
                    "checkIntervalS": 3600,
                    "nMissedChecksMax": 3,
                }))
                .unwrap(),
            )
            .expect_at_least(1)
            .create_async()
            .await;

        let policy = Arc::new(AtomicBool::new(true));
        let manager = Arc::new(manager_with_policy(&dir, &server.url(), policy));
        manager.read_or_generate_key().unwrap();
        assert!(manager.is_locked_with_remote_secret().await);

        let monitor = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.monitor_remote_secret().await }
        });

        timeout(Duration::from_secs(10), manager.unlock_with_remote_secret())
            .await
            .unwrap()
            .unwrap();

        assert!(!manager.is_locked());
        assert_eq!(master_key_bytes(&manager), *key.as_bytes());
        monitor.abort();
    }

    #[tokio::test]
    async fn monitor_failure_propagates_to_the_supervisor() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let crypto = test_crypto();
        let key = MasterKeyData::from_bytes([0x42; KEY_LENGTH]);
        let secret = RemoteSecret::from_bytes([2u8; 32]);
        let parameters = RemoteSecretParameters {
            authentication_token:
                crate::master_key::state::RemoteSecretAuthenticationToken::from_bytes([1u8; 32]),
            remote_secret_hash: secret.derive_hash(),
        };
        let lock_data = crypto
            .encrypt_with_remote_secret(&MasterKeyState::plain(key), &secret, parameters)
            .unwrap();
        MasterKeyStorageManager::new(dir.path())
            .write_key(&MasterKeyState::WithRemoteSecret(lock_data))
            .unwrap();
        server
            .mock("POST", PATH)
            .with_status(404)
            .create_async()
            .await;

        let policy = Arc::new(AtomicBool::new(true));
        let manager = manager_with_policy(&dir, &server.url(), policy);
        manager.read_or_generate_key().unwrap();

        let result = timeout(Duration::from_secs(10), manager.monitor_remote_secret())
            .await
            .unwrap();
        assert!(matches!(result, Err(RemoteSecretMonitorError::NotFound)));
    }

    #[tokio::test]
    async fn lock_with_remote_secret_relocks_the_key() {
        let mut server = mockito::Server::new_async().await;
        let (_challenge_mock, _create_mock) = mock_create_flow(&mut server).await;
        let dir = tempfile::tempdir().unwrap();
        let policy = Arc::new(AtomicBool::new(true));
        let manager = manager_with_policy(&dir, &server.url(), policy);
        manager.read_or_generate_key().unwrap();
        manager
            .update_remote_secret_protection_state_if_needed(&client_parameters(server.url()))
            .await
            .unwrap();
        assert!(!manager.is_locked());

        manager.lock_with_remote_secret();

        assert!(manager.is_locked());
        assert!(manager.is_locked_with_remote_secret().await);
    }
}
