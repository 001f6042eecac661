//! Engine constants.
//!
//! Key and nonce sizes, Argon2 cost parameters and the monitoring loop
//! budgets live here so that the storage codec, the crypto transforms and
//! the remote-secret monitor agree on a single source of truth.

use std::ops::RangeInclusive;
use std::time::Duration;

/// Length of the master key in bytes.
///
/// The master key is generated once and never changes, not even when the
/// passphrase changes, so that locally stored data never needs to be
/// re-encrypted.
pub const KEY_LENGTH: usize = 32;

/// Length of the XChaCha20-Poly1305 nonce in bytes.
pub const NONCE_LENGTH: usize = 24;

/// Length of the Poly1305 authentication tag in bytes.
pub const TAG_LENGTH: usize = 16;

/// Length of the Argon2id salt in bytes (version 2 passphrase protection).
pub const ARGON2_SALT_LENGTH: usize = 16;

/// Argon2id memory cost in KiB used when newly protecting a key.
pub const ARGON2_MEMORY_KIB: u32 = 65536;

/// Argon2id iteration count used when newly protecting a key.
pub const ARGON2_ITERATIONS: u32 = 3;

/// Argon2id lane count used when newly protecting a key.
pub const ARGON2_PARALLELISM: u32 = 2;

/// Length of the legacy (version 1) KDF salt in bytes.
pub const V1_SALT_LENGTH: usize = 8;

/// Length of the legacy (version 1) verification tag in bytes.
pub const V1_VERIFICATION_LENGTH: usize = 4;

/// PBKDF2 iteration count of the legacy (version 1) passphrase KDF.
pub const V1_KDF_ITERATIONS: u32 = 10_000;

/// Length of the CBC initialization vector of the application-data cipher.
pub const CIPHER_IV_LENGTH: usize = 16;

/// Length of the remote secret in bytes.
pub const REMOTE_SECRET_LENGTH: usize = 32;

/// Length of the remote secret authentication token in bytes.
pub const AUTHENTICATION_TOKEN_LENGTH: usize = 32;

/// Length of the remote secret hash in bytes.
pub const REMOTE_SECRET_HASH_LENGTH: usize = 32;

/// Retry interval of the monitor loop before the first successful fetch.
pub const RETRY_INTERVAL_WHILE_LOCKED: Duration = Duration::from_secs(10);

/// Consecutive-failure budget of the monitor loop before the first
/// successful fetch.
pub const MAX_FAILED_ATTEMPTS_WHILE_LOCKED: u16 = 5;

/// Valid range for the server-provided check interval: 10 s up to 24 h.
pub const VALID_CHECK_INTERVAL_RANGE_S: RangeInclusive<u32> = 10..=86_400;
