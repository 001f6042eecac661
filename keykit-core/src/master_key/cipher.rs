//! Application-data encryption under the master key.
//!
//! The unwrapped master key operates as a standalone AES-256-CBC key for
//! arbitrary application data. Streams start with magic bytes and a random
//! IV; both are validated before any decryption happens, so a corrupted or
//! foreign stream fails with an I/O error instead of producing garbage.
//! After the key has been invalidated, every operation fails with an I/O
//! error as well.

use std::io::{self, Read, Write};

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::config::CIPHER_IV_LENGTH;
use crate::master_key::data::MasterKey;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Magic bytes at the start of every encrypted data stream.
const STREAM_MAGIC: &[u8; 4] = b"KKC1";

fn locked_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "master key is invalidated")
}

impl MasterKey {
    /// Encrypts `plaintext` and writes `magic || iv || ciphertext` to the
    /// given writer.
    ///
    /// # Errors
    ///
    /// Fails with an I/O error when the key has been invalidated or the
    /// writer fails.
    pub fn encrypt_to_writer(&self, plaintext: &[u8], writer: &mut impl Write) -> io::Result<()> {
        let key = Zeroizing::new(self.with_bytes(|bytes| *bytes).map_err(|_| locked_error())?);

        let mut iv = [0u8; CIPHER_IV_LENGTH];
        OsRng.fill_bytes(&mut iv);

        let cipher = Aes256CbcEnc::new_from_slices(key.as_slice(), &iv)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad key or IV length"))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        writer.write_all(STREAM_MAGIC)?;
        writer.write_all(&iv)?;
        writer.write_all(&ciphertext)?;
        Ok(())
    }

    /// Reads a stream written by [`MasterKey::encrypt_to_writer`] and
    /// returns the decrypted plaintext.
    ///
    /// # Errors
    ///
    /// Fails with an I/O error when the key has been invalidated, the
    /// stream header is missing or foreign, or the ciphertext does not
    /// decrypt to validly padded data.
    pub fn decrypt_from_reader(&self, reader: &mut impl Read) -> io::Result<Vec<u8>> {
        let key = Zeroizing::new(self.with_bytes(|bytes| *bytes).map_err(|_| locked_error())?);

        let mut magic = [0u8; STREAM_MAGIC.len()];
        reader.read_exact(&mut magic).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "bad encrypted stream (empty or short)")
        })?;
        if &magic != STREAM_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad encrypted stream (foreign header)",
            ));
        }

        let mut iv = [0u8; CIPHER_IV_LENGTH];
        reader.read_exact(&mut iv).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "bad encrypted stream (missing IV)")
        })?;

        let mut ciphertext = Vec::new();
        reader.read_to_end(&mut ciphertext)?;

        let cipher = Aes256CbcDec::new_from_slices(key.as_slice(), &iv)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad key or IV length"))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "bad encrypted stream (corrupt ciphertext)",
                )
            })
    }
}
