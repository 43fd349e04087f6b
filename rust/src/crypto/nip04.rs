//! Legacy scheme: ECDH x-coordinate as an AES-256-CBC key (NIP-04)
//!
//! Kept for reading and writing kind 4 direct messages. New conversations use
//! [`super::nip44`].
//!
//! There is no MAC: a flipped IV bit flips the same plaintext bit. Only
//! decrypt payloads taken from an event whose signature was checked.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use zeroize::Zeroize;

use super::shared_x;
use crate::event::{PublicKey, SecretKey};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_SEPARATOR: &str = "?iv=";

/// NIP-04 error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("payload is not in `<ciphertext>?iv=<iv>` form")]
    InvalidFormat,
    #[error("payload is not base64")]
    Base64,
    #[error("iv must be 16 bytes")]
    InvalidIv,
    #[error("decryption failed")]
    Decrypt,
    #[error("plaintext is not utf-8")]
    Utf8,
}

/// True when `payload` has the legacy `?iv=` shape.
pub fn is_legacy_payload(payload: &str) -> bool {
    payload.contains(IV_SEPARATOR)
}

pub fn encrypt(secret_key: &SecretKey, public_key: &PublicKey, plaintext: &str) -> Result<String, Error> {
    let mut iv = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    encrypt_with_iv(secret_key, public_key, plaintext, iv)
}

fn encrypt_with_iv(
    secret_key: &SecretKey,
    public_key: &PublicKey,
    plaintext: &str,
    iv: [u8; 16],
) -> Result<String, Error> {
    let mut key = shared_x(secret_key, public_key);
    let ciphertext =
        Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    key.zeroize();
    Ok(format!(
        "{}{IV_SEPARATOR}{}",
        BASE64.encode(ciphertext),
        BASE64.encode(iv)
    ))
}

pub fn decrypt(secret_key: &SecretKey, public_key: &PublicKey, payload: &str) -> Result<String, Error> {
    let (ciphertext, iv) = payload.split_once(IV_SEPARATOR).ok_or(Error::InvalidFormat)?;
    let ciphertext = BASE64.decode(ciphertext).map_err(|_| Error::Base64)?;
    let iv: [u8; 16] = BASE64
        .decode(iv)
        .map_err(|_| Error::Base64)?
        .try_into()
        .map_err(|_| Error::InvalidIv)?;

    let mut key = shared_x(secret_key, public_key);
    let result = Aes256CbcDec::new(&key.into(), &iv.into()).decrypt_padded_vec_mut::<Pkcs7>(&ciphertext);
    key.zeroize();
    let plaintext = result.map_err(|_| Error::Decrypt)?;
    String::from_utf8(plaintext).map_err(|_| Error::Utf8)
}
