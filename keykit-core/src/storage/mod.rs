//! Key file storage: versioned codec and the storage manager.
//!
//! The storage manager prefers the version 2 file, falls back to the
//! legacy version 1 file, and always writes version 2, deleting the
//! legacy file as a side effect, a one-way, idempotent migration.

pub mod codec;
pub mod format;

use std::fs;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::error::StorageError;
use crate::master_key::state::MasterKeyState;

use format::{KEY_FILE_NAME, LEGACY_KEY_FILE_NAME};

/// Reads and writes the master key file in a given directory.
///
/// Writes fully replace the file contents via a temp-file rename, so a
/// torn write never leaves a half-written key file behind.
#[derive(Debug)]
pub struct MasterKeyStorageManager {
    key_file: PathBuf,
    legacy_key_file: PathBuf,
}

impl MasterKeyStorageManager {
    /// Creates a storage manager for the key files in `directory`.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        Self {
            key_file: directory.join(KEY_FILE_NAME),
            legacy_key_file: directory.join(LEGACY_KEY_FILE_NAME),
        }
    }

    /// Returns whether any key file (current or legacy) exists.
    #[must_use]
    pub fn key_exists(&self) -> bool {
        self.key_file.exists() || self.legacy_key_file.exists()
    }

    /// Reads the stored key state.
    ///
    /// Prefers the version 2 file; if absent, falls back to the legacy
    /// version 1 file, whose contents are flagged for migration.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NoKeyFile`] when neither file exists, or a
    /// decoding/I/O error. I/O errors are not retried; the engine is
    /// unusable if the key file cannot be read.
    pub fn read_key(&self) -> Result<MasterKeyState, StorageError> {
        if self.key_file.exists() {
            debug!("Reading version 2 key file");
            let bytes = fs::read(&self.key_file).map_err(|source| StorageError::Io {
                context: "reading key file",
                source,
            })?;
            return codec::to_key_state(codec::decode(&bytes)?);
        }

        if self.legacy_key_file.exists() {
            info!("Reading legacy version 1 key file");
            let bytes = fs::read(&self.legacy_key_file).map_err(|source| StorageError::Io {
                context: "reading legacy key file",
                source,
            })?;
            return codec::to_key_state(codec::decode_v1(&bytes)?);
        }

        Err(StorageError::NoKeyFile)
    }

    /// Writes the key state, always in the version 2 format, and deletes
    /// any legacy version 1 file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the file cannot be written or renamed.
    ///
    /// # Panics
    ///
    /// Panics when called with legacy version 1 passphrase protection,
    /// which is never written back (see [`codec::to_storage_data`]).
    pub fn write_key(&self, state: &MasterKeyState) -> Result<(), StorageError> {
        let bytes = codec::encode(&codec::to_storage_data(state));

        let temp_file = self.key_file.with_extension("tmp");
        fs::write(&temp_file, &bytes).map_err(|source| StorageError::Io {
            context: "writing key file",
            source,
        })?;
        fs::rename(&temp_file, &self.key_file).map_err(|source| StorageError::Io {
            context: "replacing key file",
            source,
        })?;

        if self.legacy_key_file.exists() {
            info!("Deleting legacy version 1 key file");
            fs::remove_file(&self.legacy_key_file).map_err(|source| StorageError::Io {
                context: "deleting legacy key file",
                source,
            })?;
        }
        Ok(())
    }

    /// Path of the legacy key file, for tests that seed version 1 data.
    #[cfg(test)]
    pub(crate) fn legacy_key_file(&self) -> &std::path::Path {
        &self.legacy_key_file
    }
}
