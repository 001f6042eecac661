//! Key file format constants and layout definitions.
//!
//! Two on-disk formats exist. Version 1 is the legacy flat record without
//! magic bytes; it is read for migration only. Version 2 is the current
//! self-describing layered format.

/// Magic bytes at the start of every version 2 key file.
pub const FILE_MAGIC: &[u8; 4] = b"KKMK";

/// Current key file format version.
pub const FORMAT_VERSION: u8 = 2;

/// Outer layer tag: no passphrase protection, inner layer follows.
pub const OUTER_TAG_NOT_PASSPHRASE_PROTECTED: u8 = 0x00;

/// Outer layer tag: passphrase protection, Argon2 parameters and AEAD
/// blob follow.
pub const OUTER_TAG_PASSPHRASE_PROTECTED: u8 = 0x01;

/// Inner layer tag: unprotected master key.
pub const INNER_TAG_UNPROTECTED: u8 = 0x00;

/// Inner layer tag: remote-secret-protected master key.
pub const INNER_TAG_REMOTE_SECRET_PROTECTED: u8 = 0x01;

/// File name of the version 2 key file.
pub const KEY_FILE_NAME: &str = "key2.dat";

/// File name of the legacy version 1 key file.
pub const LEGACY_KEY_FILE_NAME: &str = "key.dat";

/// Size of a version 1 key file.
/// Layout: protected(1) + key(32) + salt(8) + verification(4) = 45
pub const V1_FILE_SIZE: usize =
    1 + crate::config::KEY_LENGTH + crate::config::V1_SALT_LENGTH + crate::config::V1_VERIFICATION_LENGTH;
