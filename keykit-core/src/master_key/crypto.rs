//! Passphrase and remote-secret wrapping transforms.
//!
//! Version 1 (legacy) passphrase protection XORs the key with a
//! PBKDF2-derived wrapping key and keeps a short verification tag; it is
//! decrypt-only. Version 2 derives an Argon2id key that
//! authenticated-encrypts the serialized inner layer with
//! XChaCha20-Poly1305; a failed authentication tag is the only
//! wrong-passphrase signal. The remote secret is used directly as the AEAD
//! key, without a KDF step, since it already has adequate entropy and a
//! server-controlled lifetime.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::config::{
    ARGON2_SALT_LENGTH, KEY_LENGTH, NONCE_LENGTH, V1_KDF_ITERATIONS, V1_SALT_LENGTH,
    V1_VERIFICATION_LENGTH,
};
use crate::error::CryptoError;
use crate::master_key::data::MasterKeyData;
use crate::master_key::state::{
    Argon2Parameters, Argon2Version, MasterKeyState, PassphraseProtection, RemoteSecret,
    RemoteSecretLockData, RemoteSecretParameters,
};
use crate::storage::codec::{
    decode_inner, encode_inner, inner_to_key_state, key_state_to_inner, Version2InnerData,
};

/// Computes the version 1 verification tag: the truncated SHA-256 of the
/// un-wrapped key. Lets the engine cheaply confirm a candidate passphrase
/// without decrypting downstream structure.
pub(crate) fn calc_v1_verification(key: &[u8; KEY_LENGTH]) -> [u8; V1_VERIFICATION_LENGTH] {
    let digest = Sha256::digest(key);
    let mut verification = [0u8; V1_VERIFICATION_LENGTH];
    verification.copy_from_slice(&digest[..V1_VERIFICATION_LENGTH]);
    verification
}

fn derive_v1_key(passphrase: &str, salt: &[u8; V1_SALT_LENGTH]) -> Zeroizing<[u8; KEY_LENGTH]> {
    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, V1_KDF_ITERATIONS, key.as_mut());
    key
}

fn derive_argon2_key(
    passphrase: &str,
    salt: &[u8; ARGON2_SALT_LENGTH],
    parameters: &Argon2Parameters,
) -> Result<Zeroizing<[u8; KEY_LENGTH]>, CryptoError> {
    let params = Params::new(
        parameters.memory_kib,
        parameters.iterations,
        parameters.parallelism,
        Some(KEY_LENGTH),
    )
    .map_err(|_| CryptoError::KeyDerivationFailed {
        context: "invalid argon2 parameters",
    })?;
    let version = match parameters.version {
        Argon2Version::Version10 => Version::V0x10,
        Argon2Version::Version13 => Version::V0x13,
    };
    let argon2 = Argon2::new(Algorithm::Argon2id, version, params);

    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, key.as_mut())
        .map_err(|_| CryptoError::KeyDerivationFailed {
            context: "argon2 derivation failed",
        })?;
    Ok(key)
}

/// Encrypts with XChaCha20-Poly1305.
///
/// The `expect`s cover conditions that cannot fail: the key length is
/// fixed and the plaintext cannot approach the cipher's length limit.
fn aead_seal(key: &[u8; KEY_LENGTH], nonce: &[u8; NONCE_LENGTH], plaintext: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).expect("key length is always 32");
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .expect("encryption cannot fail with valid inputs")
}

fn aead_open(
    key: &[u8; KEY_LENGTH],
    nonce: &[u8; NONCE_LENGTH],
    ciphertext: &[u8],
    context: &'static str,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).expect("key length is always 32");
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::DecryptionFailed { context })
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// The key wrapping and unwrapping transforms.
#[derive(Debug, Clone)]
pub struct MasterKeyCrypto {
    argon2: Argon2Parameters,
}

impl Default for MasterKeyCrypto {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterKeyCrypto {
    /// Creates transforms with the recommended Argon2id cost parameters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            argon2: Argon2Parameters::recommended(),
        }
    }

    /// Creates transforms with explicit Argon2id cost parameters.
    ///
    /// Reduced costs keep test suites fast; stored data records whatever
    /// parameters were used, so decryption is unaffected.
    #[must_use]
    pub const fn with_argon2_parameters(argon2: Argon2Parameters) -> Self {
        Self { argon2 }
    }

    /// Wraps the given state with passphrase protection (version 2).
    ///
    /// The state becomes the inner layer: plain key material or
    /// remote-secret-protected data. Passphrase protection is always the
    /// outermost transform.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidInput`] when the state is already
    /// passphrase-protected, or a derivation error for invalid parameters.
    pub fn encrypt_with_passphrase(
        &self,
        state: &MasterKeyState,
        passphrase: &str,
    ) -> Result<MasterKeyState, CryptoError> {
        let inner = key_state_to_inner(state).ok_or(CryptoError::InvalidInput(
            "passphrase protection must be the outermost layer",
        ))?;

        let salt = random_bytes::<ARGON2_SALT_LENGTH>();
        let nonce = random_bytes::<NONCE_LENGTH>();
        let key = derive_argon2_key(passphrase, &salt, &self.argon2)?;
        let plaintext = Zeroizing::new(encode_inner(&inner));
        let encrypted_data = aead_seal(&key, &nonce, &plaintext);

        Ok(MasterKeyState::WithPassphrase(PassphraseProtection::Version2 {
            argon2: self.argon2,
            salt,
            nonce,
            encrypted_data,
        }))
    }

    /// Unwraps passphrase protection, exposing whatever inner state was
    /// wrapped. Version 1 data always yields `Plain` with
    /// `was_migrated = true`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] when the passphrase is
    /// wrong or the data is corrupted. Never partially decrypts.
    pub fn decrypt_with_passphrase(
        &self,
        protection: &PassphraseProtection,
        passphrase: &str,
    ) -> Result<MasterKeyState, CryptoError> {
        match protection {
            PassphraseProtection::Version1 {
                protected_key,
                salt,
                verification,
            } => {
                let wrapping_key = derive_v1_key(passphrase, salt);
                let mut master_key = Zeroizing::new([0u8; KEY_LENGTH]);
                for (out, (wrapped, derived)) in master_key
                    .iter_mut()
                    .zip(protected_key.iter().zip(wrapping_key.iter()))
                {
                    *out = wrapped ^ derived;
                }

                // Tag comparison is not constant-time; legacy format.
                if calc_v1_verification(&master_key) != *verification {
                    return Err(CryptoError::DecryptionFailed {
                        context: "version 1 verification tag mismatch",
                    });
                }
                Ok(MasterKeyState::Plain {
                    master_key_data: MasterKeyData::from_bytes(*master_key),
                    was_migrated: true,
                })
            }
            PassphraseProtection::Version2 {
                argon2,
                salt,
                nonce,
                encrypted_data,
            } => {
                let key = derive_argon2_key(passphrase, salt, argon2)?;
                let plaintext = aead_open(&key, nonce, encrypted_data, "wrong passphrase")?;
                let inner = decode_inner(&plaintext)?;
                Ok(inner_to_key_state(inner))
            }
        }
    }

    /// Checks whether a passphrase matches the given protection data,
    /// without exposing the decrypted state.
    #[must_use]
    pub fn verify_passphrase(&self, protection: &PassphraseProtection, passphrase: &str) -> bool {
        self.decrypt_with_passphrase(protection, passphrase).is_ok()
    }

    /// Wraps plain key material with the remote secret.
    ///
    /// A pure function of `(remote_secret, inner_data)`: the secret's raw
    /// bytes are the AEAD key and the nonce is carried inside the blob.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidInput`] when the state is not plain
    /// key material.
    pub fn encrypt_with_remote_secret(
        &self,
        state: &MasterKeyState,
        remote_secret: &RemoteSecret,
        parameters: RemoteSecretParameters,
    ) -> Result<RemoteSecretLockData, CryptoError> {
        let MasterKeyState::Plain {
            master_key_data, ..
        } = state
        else {
            return Err(CryptoError::InvalidInput(
                "only plain key material can be wrapped with a remote secret",
            ));
        };

        let nonce = random_bytes::<NONCE_LENGTH>();
        let plaintext = Zeroizing::new(encode_inner(&Version2InnerData::Unprotected {
            master_key_data: master_key_data.clone(),
        }));
        let ciphertext = aead_seal(remote_secret.as_bytes(), &nonce, &plaintext);

        let mut encrypted_data = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        encrypted_data.extend_from_slice(&nonce);
        encrypted_data.extend_from_slice(&ciphertext);

        Ok(RemoteSecretLockData {
            parameters,
            encrypted_data,
        })
    }

    /// Unwraps remote-secret protection back to plain key material.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] for a corrupted blob or a
    /// foreign/rotated remote secret.
    pub fn decrypt_with_remote_secret(
        &self,
        lock_data: &RemoteSecretLockData,
        remote_secret: &RemoteSecret,
    ) -> Result<MasterKeyState, CryptoError> {
        if lock_data.encrypted_data.len() < NONCE_LENGTH {
            return Err(CryptoError::DecryptionFailed {
                context: "remote secret blob too short",
            });
        }
        let (nonce, ciphertext) = lock_data.encrypted_data.split_at(NONCE_LENGTH);
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        nonce_bytes.copy_from_slice(nonce);

        let plaintext = aead_open(
            remote_secret.as_bytes(),
            &nonce_bytes,
            ciphertext,
            "wrong or rotated remote secret",
        )?;
        let inner = decode_inner(&plaintext)?;
        Ok(inner_to_key_state(inner))
    }

    /// Builds version 1 protection data for migration tests.
    #[cfg(test)]
    pub(crate) fn encrypt_with_passphrase_v1(
        master_key_data: &MasterKeyData,
        passphrase: &str,
    ) -> PassphraseProtection {
        let salt = random_bytes::<V1_SALT_LENGTH>();
        let wrapping_key = derive_v1_key(passphrase, &salt);
        let mut protected_key = [0u8; KEY_LENGTH];
        for (out, (plain, derived)) in protected_key
            .iter_mut()
            .zip(master_key_data.as_bytes().iter().zip(wrapping_key.iter()))
        {
            *out = plain ^ derived;
        }
        PassphraseProtection::Version1 {
            protected_key,
            salt,
            verification: calc_v1_verification(master_key_data.as_bytes()),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_crypto() -> MasterKeyCrypto {
    // Minimal Argon2 costs keep the suite fast; the parameters are
    // recorded in the protection data so decryption still works.
    MasterKeyCrypto::with_argon2_parameters(Argon2Parameters {
        version: Argon2Version::Version13,
        memory_kib: 8,
        iterations: 1,
        parallelism: 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master_key::state::{RemoteSecretAuthenticationToken, RemoteSecretHash};

    fn key() -> MasterKeyData {
        MasterKeyData::from_bytes([0x42; KEY_LENGTH])
    }

    fn parameters() -> RemoteSecretParameters {
        RemoteSecretParameters {
            authentication_token: RemoteSecretAuthenticationToken::from_bytes([1u8; 32]),
            remote_secret_hash: RemoteSecretHash::from_bytes([2u8; 32]),
        }
    }

    #[test]
    fn passphrase_roundtrip_restores_plain_state() {
        let crypto = test_crypto();
        let plain = MasterKeyState::plain(key());

        let protected = crypto.encrypt_with_passphrase(&plain, "hunter2").unwrap();
        let MasterKeyState::WithPassphrase(protection) = &protected else {
            panic!("expected passphrase protection");
        };
        let decrypted = crypto.decrypt_with_passphrase(protection, "hunter2").unwrap();

        assert_eq!(decrypted, plain);
    }

    #[test]
    fn wrong_passphrase_fails_closed() {
        let crypto = test_crypto();
        let protected = crypto
            .encrypt_with_passphrase(&MasterKeyState::plain(key()), "hello")
            .unwrap();
        let MasterKeyState::WithPassphrase(protection) = protected else {
            panic!("expected passphrase protection");
        };

        let result = crypto.decrypt_with_passphrase(&protection, "HELLO");
        assert!(matches!(
            result,
            Err(CryptoError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn verify_passphrase_version_2() {
        let crypto = test_crypto();
        let MasterKeyState::WithPassphrase(protection) = crypto
            .encrypt_with_passphrase(&MasterKeyState::plain(key()), "correct")
            .unwrap()
        else {
            panic!("expected passphrase protection");
        };

        assert!(crypto.verify_passphrase(&protection, "correct"));
        assert!(!crypto.verify_passphrase(&protection, "wrong"));
    }

    #[test]
    fn verify_passphrase_version_1() {
        let crypto = test_crypto();
        let protection = MasterKeyCrypto::encrypt_with_passphrase_v1(&key(), "legacy");

        assert!(crypto.verify_passphrase(&protection, "legacy"));
        assert!(!crypto.verify_passphrase(&protection, "modern"));
    }

    #[test]
    fn version_1_decryption_marks_migration() {
        let crypto = test_crypto();
        let protection = MasterKeyCrypto::encrypt_with_passphrase_v1(&key(), "legacy");

        let state = crypto.decrypt_with_passphrase(&protection, "legacy").unwrap();
        assert_eq!(
            state,
            MasterKeyState::Plain {
                master_key_data: key(),
                was_migrated: true,
            }
        );
    }

    #[test]
    fn cannot_wrap_passphrase_protection_again() {
        let crypto = test_crypto();
        let protected = crypto
            .encrypt_with_passphrase(&MasterKeyState::plain(key()), "outer")
            .unwrap();

        let result = crypto.encrypt_with_passphrase(&protected, "another");
        assert!(matches!(result, Err(CryptoError::InvalidInput(_))));
    }

    #[test]
    fn remote_secret_roundtrip() {
        let crypto = test_crypto();
        let secret = RemoteSecret::from_bytes([7u8; 32]);

        let lock_data = crypto
            .encrypt_with_remote_secret(&MasterKeyState::plain(key()), &secret, parameters())
            .unwrap();
        let state = crypto.decrypt_with_remote_secret(&lock_data, &secret).unwrap();

        assert_eq!(state, MasterKeyState::plain(key()));
    }

    #[test]
    fn foreign_remote_secret_fails_closed() {
        let crypto = test_crypto();
        let secret = RemoteSecret::from_bytes([7u8; 32]);
        let other = RemoteSecret::from_bytes([8u8; 32]);

        let lock_data = crypto
            .encrypt_with_remote_secret(&MasterKeyState::plain(key()), &secret, parameters())
            .unwrap();
        let result = crypto.decrypt_with_remote_secret(&lock_data, &other);

        assert!(matches!(
            result,
            Err(CryptoError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn passphrase_wraps_remote_secret_protection() {
        let crypto = test_crypto();
        let secret = RemoteSecret::from_bytes([7u8; 32]);
        let lock_data = crypto
            .encrypt_with_remote_secret(&MasterKeyState::plain(key()), &secret, parameters())
            .unwrap();
        let composed = MasterKeyState::WithRemoteSecret(lock_data.clone());

        let protected = crypto.encrypt_with_passphrase(&composed, "outer").unwrap();
        let MasterKeyState::WithPassphrase(protection) = &protected else {
            panic!("expected passphrase protection");
        };
        let unwrapped = crypto.decrypt_with_passphrase(protection, "outer").unwrap();

        // The passphrase layer exposes the remote-secret layer unchanged.
        assert_eq!(unwrapped, MasterKeyState::WithRemoteSecret(lock_data));
    }
}
