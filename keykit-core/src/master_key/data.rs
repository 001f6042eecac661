//! Master key value and live key objects.
//!
//! [`MasterKeyData`] is the immutable 32-byte value used while transforming
//! protection state. [`MasterKey`] is the live, shareable key handed to the
//! rest of the application: all clones alias one buffer, and invalidating
//! any clone zeroes that buffer for every holder.

use std::fmt;
use std::sync::{Arc, Mutex};

use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::KEY_LENGTH;
use crate::error::MasterKeyError;

/// Raw master key bytes.
///
/// Zeroized on drop. The value is fixed at creation; changing the
/// passphrase or remote-secret protection never changes the key itself.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MasterKeyData(pub(crate) [u8; KEY_LENGTH]);

impl MasterKeyData {
    /// Creates master key data from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns a reference to the raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for MasterKeyData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKeyData")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Generates a new random master key.
///
/// # Panics
///
/// Panics if the system's random number generator fails.
#[must_use]
pub fn generate_master_key() -> MasterKeyData {
    let mut bytes = [0u8; KEY_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    MasterKeyData(bytes)
}

struct MasterKeySlot {
    bytes: [u8; KEY_LENGTH],
    valid: bool,
}

/// The live master key.
///
/// Constructed by taking ownership of [`MasterKeyData`]; no defensive copy
/// is made, so after [`MasterKey::invalidate`] every holder of a clone
/// observes the same zeroed buffer. Cloning shares the underlying buffer.
///
/// Once invalidated, all key access fails; cipher operations built on this
/// key fail loudly instead of silently operating on zero bytes.
#[derive(Clone)]
pub struct MasterKey {
    slot: Arc<Mutex<MasterKeySlot>>,
}

impl MasterKey {
    /// Creates a live key, taking ownership of the key data.
    #[must_use]
    pub fn new(data: MasterKeyData) -> Self {
        Self {
            slot: Arc::new(Mutex::new(MasterKeySlot {
                bytes: data.0,
                valid: true,
            })),
        }
    }

    /// Returns whether the key is still valid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.lock_slot().valid
    }

    /// Zeroes the shared key buffer and marks the key invalid.
    ///
    /// Every clone of this key observes the invalidation; subsequent key
    /// access and cipher operations fail.
    pub fn invalidate(&self) {
        let mut slot = self.lock_slot();
        slot.bytes.zeroize();
        slot.valid = false;
    }

    /// Runs `f` with the raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`MasterKeyError::Locked`] if the key has been invalidated.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8; KEY_LENGTH]) -> R) -> Result<R, MasterKeyError> {
        let slot = self.lock_slot();
        if !slot.valid {
            return Err(MasterKeyError::Locked);
        }
        Ok(f(&slot.bytes))
    }

    /// Copies the key into a fresh [`MasterKeyData`] value.
    ///
    /// # Errors
    ///
    /// Returns [`MasterKeyError::Locked`] if the key has been invalidated.
    pub fn to_data(&self) -> Result<MasterKeyData, MasterKeyError> {
        self.with_bytes(|bytes| MasterKeyData(*bytes))
    }

    /// Raw access to the shared buffer regardless of validity.
    #[cfg(test)]
    pub(crate) fn raw_bytes(&self) -> [u8; KEY_LENGTH] {
        self.lock_slot().bytes
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, MasterKeySlot> {
        // A panic while the short-lived guard is held would already be a
        // bug elsewhere; recover the data rather than propagating poison.
        self.slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("key", &"[REDACTED]")
            .field("valid", &self.is_valid())
            .finish()
    }
}
