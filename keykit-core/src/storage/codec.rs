//! Binary encode/decode of key storage data.
//!
//! Encoding is purely structural (tagged variants, `u32`-length-prefixed
//! variable fields, little-endian integers) and lossless:
//! `decode(encode(x)) == x` for every variant, including remote-secret
//! protection nested inside passphrase protection.

use crate::config::{
    ARGON2_SALT_LENGTH, AUTHENTICATION_TOKEN_LENGTH, KEY_LENGTH, NONCE_LENGTH,
    REMOTE_SECRET_HASH_LENGTH, V1_SALT_LENGTH, V1_VERIFICATION_LENGTH,
};
use crate::error::StorageError;
use crate::master_key::crypto::calc_v1_verification;
use crate::master_key::data::MasterKeyData;
use crate::master_key::state::{
    Argon2Parameters, Argon2Version, MasterKeyState, PassphraseProtection,
    RemoteSecretAuthenticationToken, RemoteSecretHash, RemoteSecretLockData, RemoteSecretParameters,
};

use super::format::{
    FILE_MAGIC, FORMAT_VERSION, INNER_TAG_REMOTE_SECRET_PROTECTED, INNER_TAG_UNPROTECTED,
    OUTER_TAG_NOT_PASSPHRASE_PROTECTED, OUTER_TAG_PASSPHRASE_PROTECTED, V1_FILE_SIZE,
};

/// Version 1 (legacy) flat record contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Version1StorageData {
    /// Unprotected key plus its verification tag.
    Unprotected {
        /// The raw master key.
        master_key_data: MasterKeyData,
        /// Truncated hash of the key, checked on read.
        verification: [u8; V1_VERIFICATION_LENGTH],
    },
    /// Passphrase-protected key.
    PassphraseProtected {
        /// The master key XORed with the passphrase-derived wrapping key.
        protected_key: [u8; KEY_LENGTH],
        /// KDF salt.
        salt: [u8; V1_SALT_LENGTH],
        /// Truncated hash of the un-wrapped key.
        verification: [u8; V1_VERIFICATION_LENGTH],
    },
}

/// Version 2 inner layer: the data under any passphrase protection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Version2InnerData {
    /// Unprotected master key.
    Unprotected {
        /// The raw master key.
        master_key_data: MasterKeyData,
    },
    /// Remote-secret-protected master key.
    RemoteSecretProtected(RemoteSecretLockData),
}

/// Version 2 outer layer: passphrase protection composes over the inner
/// layer, so a key may be remote-secret-protected *and* additionally
/// passphrase-protected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Version2OuterData {
    /// No passphrase protection; the inner layer is stored directly.
    NotPassphraseProtected {
        /// The inner layer.
        inner: Version2InnerData,
    },
    /// Passphrase protection wrapping the serialized inner layer.
    PassphraseProtected {
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

/// The serialized on-disk shape of the master key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterKeyStorageData {
    /// Legacy flat layout.
    Version1(Version1StorageData),
    /// Current layered layout.
    Version2 {
        /// The outer layer.
        outer: Version2OuterData,
    },
}

// =============================================================================
// Encoding
// =============================================================================

/// Encodes storage data to its on-disk byte representation.
#[must_use]
pub fn encode(data: &MasterKeyStorageData) -> Vec<u8> {
    match data {
        MasterKeyStorageData::Version1(data) => encode_v1(data),
        MasterKeyStorageData::Version2 { outer } => encode_v2(outer),
    }
}

fn encode_v1(data: &Version1StorageData) -> Vec<u8> {
    let mut buf = Vec::with_capacity(V1_FILE_SIZE);
    match data {
        Version1StorageData::Unprotected {
            master_key_data,
            verification,
        } => {
            buf.push(0);
            buf.extend_from_slice(master_key_data.as_bytes());
            // Filler keeps both variants the same size.
            buf.extend_from_slice(&[0u8; V1_SALT_LENGTH]);
            buf.extend_from_slice(verification);
        }
        Version1StorageData::PassphraseProtected {
            protected_key,
            salt,
            verification,
        } => {
            buf.push(1);
            buf.extend_from_slice(protected_key);
            buf.extend_from_slice(salt);
            buf.extend_from_slice(verification);
        }
    }
    buf
}

fn encode_v2(outer: &Version2OuterData) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(FILE_MAGIC);
    buf.push(FORMAT_VERSION);
    match outer {
        Version2OuterData::NotPassphraseProtected { inner } => {
            buf.push(OUTER_TAG_NOT_PASSPHRASE_PROTECTED);
            buf.extend_from_slice(&encode_inner(inner));
        }
        Version2OuterData::PassphraseProtected {
            argon2,
            salt,
            nonce,
            encrypted_data,
        } => {
            buf.push(OUTER_TAG_PASSPHRASE_PROTECTED);
            buf.push(argon2.version.to_byte());
            buf.extend_from_slice(&argon2.memory_kib.to_le_bytes());
            buf.extend_from_slice(&argon2.iterations.to_le_bytes());
            buf.extend_from_slice(&argon2.parallelism.to_le_bytes());
            buf.extend_from_slice(salt);
            buf.extend_from_slice(nonce);
            push_prefixed(&mut buf, encrypted_data);
        }
    }
    buf
}

/// Encodes an inner layer on its own.
///
/// This is exactly the byte sequence the passphrase AEAD wraps, so the
/// outer layer stays oblivious to what it protects.
#[must_use]
pub fn encode_inner(inner: &Version2InnerData) -> Vec<u8> {
    let mut buf = Vec::new();
    match inner {
        Version2InnerData::Unprotected { master_key_data } => {
            buf.push(INNER_TAG_UNPROTECTED);
            buf.extend_from_slice(master_key_data.as_bytes());
        }
        Version2InnerData::RemoteSecretProtected(lock_data) => {
            buf.push(INNER_TAG_REMOTE_SECRET_PROTECTED);
            buf.extend_from_slice(lock_data.parameters.authentication_token.as_bytes());
            buf.extend_from_slice(lock_data.parameters.remote_secret_hash.as_bytes());
            push_prefixed(&mut buf, &lock_data.encrypted_data);
        }
    }
    buf
}

fn push_prefixed(buf: &mut Vec<u8>, data: &[u8]) {
    let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(data);
}

// =============================================================================
// Decoding
// =============================================================================

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8], StorageError> {
        if self.data.len() < n {
            return Err(StorageError::UnexpectedEof { context });
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self, context: &'static str) -> Result<u8, StorageError> {
        Ok(self.take(1, context)?[0])
    }

    fn u32(&mut self, context: &'static str) -> Result<u32, StorageError> {
        let bytes = self.take(4, context)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn array<const N: usize>(&mut self, context: &'static str) -> Result<[u8; N], StorageError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, context)?);
        Ok(out)
    }

    fn prefixed(&mut self, context: &'static str) -> Result<Vec<u8>, StorageError> {
        let len = self.u32(context)? as usize;
        Ok(self.take(len, context)?.to_vec())
    }

    fn finish(&self, context: &'static str) -> Result<(), StorageError> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(StorageError::CorruptedData { context })
        }
    }
}

/// Decodes a version 2 key file.
///
/// # Errors
///
/// Returns [`StorageError`] when the magic bytes, format version or any
/// field is invalid or truncated.
pub fn decode(bytes: &[u8]) -> Result<MasterKeyStorageData, StorageError> {
    let mut reader = Reader::new(bytes);
    if reader.take(FILE_MAGIC.len(), "magic")? != FILE_MAGIC {
        return Err(StorageError::InvalidMagic);
    }
    let version = reader.u8("format version")?;
    if version != FORMAT_VERSION {
        return Err(StorageError::InvalidVersion { found: version });
    }

    let outer = match reader.u8("outer tag")? {
        OUTER_TAG_NOT_PASSPHRASE_PROTECTED => {
            let inner = decode_inner_reader(&mut reader)?;
            Version2OuterData::NotPassphraseProtected { inner }
        }
        OUTER_TAG_PASSPHRASE_PROTECTED => {
            let version_byte = reader.u8("argon2 version")?;
            let version = Argon2Version::from_byte(version_byte).ok_or(StorageError::CorruptedData {
                context: "unknown argon2 version",
            })?;
            let memory_kib = reader.u32("argon2 memory")?;
            let iterations = reader.u32("argon2 iterations")?;
            let parallelism = reader.u32("argon2 parallelism")?;
            let salt = reader.array::<ARGON2_SALT_LENGTH>("argon2 salt")?;
            let nonce = reader.array::<NONCE_LENGTH>("nonce")?;
            let encrypted_data = reader.prefixed("encrypted data")?;
            Version2OuterData::PassphraseProtected {
                argon2: Argon2Parameters {
                    version,
                    memory_kib,
                    iterations,
                    parallelism,
                },
                salt,
                nonce,
                encrypted_data,
            }
        }
        _ => {
            return Err(StorageError::CorruptedData {
                context: "unknown outer tag",
            })
        }
    };
    reader.finish("trailing bytes after outer layer")?;
    Ok(MasterKeyStorageData::Version2 { outer })
}

/// Decodes a legacy version 1 key file.
///
/// # Errors
///
/// Returns [`StorageError`] when the record is truncated or malformed.
pub fn decode_v1(bytes: &[u8]) -> Result<MasterKeyStorageData, StorageError> {
    let mut reader = Reader::new(bytes);
    let protected = reader.u8("protected flag")?;
    let key = reader.array::<KEY_LENGTH>("key")?;
    let salt = reader.array::<V1_SALT_LENGTH>("salt")?;
    let verification = reader.array::<V1_VERIFICATION_LENGTH>("verification")?;
    reader.finish("trailing bytes after version 1 record")?;

    let data = match protected {
        0 => Version1StorageData::Unprotected {
            master_key_data: MasterKeyData::from_bytes(key),
            verification,
        },
        1 => Version1StorageData::PassphraseProtected {
            protected_key: key,
            salt,
            verification,
        },
        _ => {
            return Err(StorageError::CorruptedData {
                context: "invalid protected flag",
            })
        }
    };
    Ok(MasterKeyStorageData::Version1(data))
}

/// Decodes an inner layer produced by [`encode_inner`].
///
/// # Errors
///
/// Returns [`StorageError`] when the data is truncated or malformed.
pub fn decode_inner(bytes: &[u8]) -> Result<Version2InnerData, StorageError> {
    let mut reader = Reader::new(bytes);
    let inner = decode_inner_reader(&mut reader)?;
    reader.finish("trailing bytes after inner layer")?;
    Ok(inner)
}

fn decode_inner_reader(reader: &mut Reader<'_>) -> Result<Version2InnerData, StorageError> {
    match reader.u8("inner tag")? {
        INNER_TAG_UNPROTECTED => Ok(Version2InnerData::Unprotected {
            master_key_data: MasterKeyData::from_bytes(reader.array::<KEY_LENGTH>("key")?),
        }),
        INNER_TAG_REMOTE_SECRET_PROTECTED => {
            let authentication_token =
                reader.array::<AUTHENTICATION_TOKEN_LENGTH>("authentication token")?;
            let remote_secret_hash = reader.array::<REMOTE_SECRET_HASH_LENGTH>("remote secret hash")?;
            let encrypted_data = reader.prefixed("encrypted data")?;
            Ok(Version2InnerData::RemoteSecretProtected(RemoteSecretLockData {
                parameters: RemoteSecretParameters {
                    authentication_token: RemoteSecretAuthenticationToken::from_bytes(
                        authentication_token,
                    ),
                    remote_secret_hash: RemoteSecretHash::from_bytes(remote_secret_hash),
                },
                encrypted_data,
            }))
        }
        _ => Err(StorageError::CorruptedData {
            context: "unknown inner tag",
        }),
    }
}

// =============================================================================
// Storage data ⇄ logical state
// =============================================================================

/// Converts decoded storage data into the logical state.
///
/// Anything decoded from a version 1 file carries `was_migrated = true` so
/// the next write rewrites it as version 2. The verification tag of an
/// unprotected version 1 record is checked here.
///
/// # Errors
///
/// Returns [`StorageError::CorruptedData`] when a version 1 verification
/// tag does not match its key.
pub fn to_key_state(data: MasterKeyStorageData) -> Result<MasterKeyState, StorageError> {
    match data {
        MasterKeyStorageData::Version1(Version1StorageData::Unprotected {
            master_key_data,
            verification,
        }) => {
            if calc_v1_verification(master_key_data.as_bytes()) != verification {
                return Err(StorageError::CorruptedData {
                    context: "version 1 key verification failed",
                });
            }
            Ok(MasterKeyState::Plain {
                master_key_data,
                was_migrated: true,
            })
        }
        MasterKeyStorageData::Version1(Version1StorageData::PassphraseProtected {
            protected_key,
            salt,
            verification,
        }) => Ok(MasterKeyState::WithPassphrase(PassphraseProtection::Version1 {
            protected_key,
            salt,
            verification,
        })),
        MasterKeyStorageData::Version2 { outer } => Ok(match outer {
            Version2OuterData::NotPassphraseProtected { inner } => inner_to_key_state(inner),
            Version2OuterData::PassphraseProtected {
                argon2,
                salt,
                nonce,
                encrypted_data,
            } => MasterKeyState::WithPassphrase(PassphraseProtection::Version2 {
                argon2,
                salt,
                nonce,
                encrypted_data,
            }),
        }),
    }
}

/// Converts a decrypted inner layer into the logical state.
#[must_use]
pub fn inner_to_key_state(inner: Version2InnerData) -> MasterKeyState {
    match inner {
        Version2InnerData::Unprotected { master_key_data } => MasterKeyState::Plain {
            master_key_data,
            was_migrated: false,
        },
        Version2InnerData::RemoteSecretProtected(lock_data) => {
            MasterKeyState::WithRemoteSecret(lock_data)
        }
    }
}

/// Converts a logical state into the inner layer it serializes to.
///
/// Returns `None` for passphrase-protected states: the passphrase is the
/// outermost transform and never appears inside another wrap.
#[must_use]
pub fn key_state_to_inner(state: &MasterKeyState) -> Option<Version2InnerData> {
    match state {
        MasterKeyState::Plain {
            master_key_data, ..
        } => Some(Version2InnerData::Unprotected {
            master_key_data: master_key_data.clone(),
        }),
        MasterKeyState::WithRemoteSecret(lock_data) => {
            Some(Version2InnerData::RemoteSecretProtected(lock_data.clone()))
        }
        MasterKeyState::WithPassphrase(_) => None,
    }
}

/// Converts the logical state into version 2 storage data.
///
/// # Panics
///
/// Panics when called with legacy version 1 passphrase protection. Such a
/// state is never written back; it is migrated to version 2 on unlock.
#[must_use]
pub fn to_storage_data(state: &MasterKeyState) -> MasterKeyStorageData {
    let outer = match state {
        MasterKeyState::Plain {
            master_key_data, ..
        } => Version2OuterData::NotPassphraseProtected {
            inner: Version2InnerData::Unprotected {
                master_key_data: master_key_data.clone(),
            },
        },
        MasterKeyState::WithRemoteSecret(lock_data) => Version2OuterData::NotPassphraseProtected {
            inner: Version2InnerData::RemoteSecretProtected(lock_data.clone()),
        },
        MasterKeyState::WithPassphrase(PassphraseProtection::Version2 {
            argon2,
            salt,
            nonce,
            encrypted_data,
        }) => Version2OuterData::PassphraseProtected {
            argon2: *argon2,
            salt: *salt,
            nonce: *nonce,
            encrypted_data: encrypted_data.clone(),
        },
        MasterKeyState::WithPassphrase(PassphraseProtection::Version1 { .. }) => {
            panic!("version 1 passphrase protection is never serialized back to storage")
        }
    };
    MasterKeyStorageData::Version2 { outer }
}
