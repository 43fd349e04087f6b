//! Current scheme: versioned conversation keys + ChaCha20/HMAC-SHA256 (NIP-44 v2)

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use super::shared_x;
use crate::event::{PublicKey, SecretKey};

const VERSION: u8 = 2;
const SALT: &[u8] = b"nip44-v2";
const MIN_PLAINTEXT_LEN: usize = 1;
const MAX_PLAINTEXT_LEN: usize = 65535;
const MIN_PAYLOAD_LEN: usize = 132;
const MAX_PAYLOAD_LEN: usize = 87472;
const MIN_DECODED_LEN: usize = 99;
const MAX_DECODED_LEN: usize = 65603;

type HmacSha256 = Hmac<Sha256>;

/// NIP-44 error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("plaintext must be between 1 and 65535 bytes, got {0}")]
    PlaintextLength(usize),
    #[error("payload has invalid length")]
    PayloadLength,
    #[error("unknown payload version {0}")]
    UnknownVersion(u8),
    #[error("payload is not base64")]
    Base64,
    #[error("message authentication failed")]
    InvalidMac,
    #[error("invalid padding")]
    InvalidPadding,
    #[error("plaintext is not utf-8")]
    Utf8,
    #[error("key derivation failed")]
    KeyDerivation,
}

/// Long-lived symmetric key for a pair of identities.
///
/// Symmetric: `derive(a_sk, b_pk) == derive(b_sk, a_pk)`.
#[derive(Clone, PartialEq, Eq)]
pub struct ConversationKey([u8; 32]);

impl ConversationKey {
    pub fn derive(secret_key: &SecretKey, public_key: &PublicKey) -> Self {
        let mut shared = shared_x(secret_key, public_key);
        let (prk, _) = Hkdf::<Sha256>::extract(Some(SALT), &shared);
        shared.zeroize();
        Self(prk.into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for ConversationKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConversationKey(<redacted>)")
    }
}

struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

impl Drop for MessageKeys {
    fn drop(&mut self) {
        self.chacha_key.zeroize();
        self.chacha_nonce.zeroize();
        self.hmac_key.zeroize();
    }
}

fn message_keys(conversation_key: &ConversationKey, nonce: &[u8; 32]) -> Result<MessageKeys, Error> {
    let hk = Hkdf::<Sha256>::from_prk(conversation_key.as_bytes()).map_err(|_| Error::KeyDerivation)?;
    let mut okm = [0u8; 76];
    hk.expand(nonce, &mut okm).map_err(|_| Error::KeyDerivation)?;

    let mut keys = MessageKeys {
        chacha_key: [0u8; 32],
        chacha_nonce: [0u8; 12],
        hmac_key: [0u8; 32],
    };
    keys.chacha_key.copy_from_slice(&okm[0..32]);
    keys.chacha_nonce.copy_from_slice(&okm[32..44]);
    keys.hmac_key.copy_from_slice(&okm[44..76]);
    okm.zeroize();
    Ok(keys)
}

/// Padded size for a plaintext of `len` bytes (excluding the 2-byte length prefix).
pub fn calc_padded_len(len: usize) -> usize {
    if len <= 32 {
        return 32;
    }
    let next_power = 1usize << (usize::BITS - (len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((len - 1) / chunk + 1)
}

fn pad(plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    let len = plaintext.len();
    if !(MIN_PLAINTEXT_LEN..=MAX_PLAINTEXT_LEN).contains(&len) {
        return Err(Error::PlaintextLength(len));
    }
    let mut padded = Vec::with_capacity(2 + calc_padded_len(len));
    padded.extend_from_slice(&(len as u16).to_be_bytes());
    padded.extend_from_slice(plaintext);
    padded.resize(2 + calc_padded_len(len), 0);
    Ok(padded)
}

fn unpad(padded: &[u8]) -> Result<Vec<u8>, Error> {
    if padded.len() < 2 {
        return Err(Error::InvalidPadding);
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len < MIN_PLAINTEXT_LEN || padded.len() != 2 + calc_padded_len(len) {
        return Err(Error::InvalidPadding);
    }
    Ok(padded[2..2 + len].to_vec())
}

fn mac(hmac_key: &[u8; 32], nonce: &[u8; 32], ciphertext: &[u8]) -> Result<HmacSha256, Error> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(hmac_key).map_err(|_| Error::KeyDerivation)?;
    mac.update(nonce);
    mac.update(ciphertext);
    Ok(mac)
}

/// Encrypt with a caller-chosen nonce. Only for reproducible test vectors.
pub fn encrypt_with_nonce(
    conversation_key: &ConversationKey,
    plaintext: &[u8],
    nonce: [u8; 32],
) -> Result<String, Error> {
    let keys = message_keys(conversation_key, &nonce)?;
    let mut buffer = pad(plaintext)?;

    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut buffer);

    let tag = mac(&keys.hmac_key, &nonce, &buffer)?.finalize().into_bytes();

    let mut payload = Vec::with_capacity(1 + 32 + buffer.len() + 32);
    payload.push(VERSION);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&buffer);
    payload.extend_from_slice(&tag);
    Ok(BASE64.encode(payload))
}

/// Encrypt with a fresh random nonce.
pub fn encrypt_with_key(conversation_key: &ConversationKey, plaintext: &[u8]) -> Result<String, Error> {
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    encrypt_with_nonce(conversation_key, plaintext, nonce)
}

pub fn decrypt_to_bytes(conversation_key: &ConversationKey, payload: &str) -> Result<Vec<u8>, Error> {
    if payload.starts_with('#') {
        return Err(Error::UnknownVersion(0));
    }
    if !(MIN_PAYLOAD_LEN..=MAX_PAYLOAD_LEN).contains(&payload.len()) {
        return Err(Error::PayloadLength);
    }
    let data = BASE64.decode(payload).map_err(|_| Error::Base64)?;
    if !(MIN_DECODED_LEN..=MAX_DECODED_LEN).contains(&data.len()) {
        return Err(Error::PayloadLength);
    }
    if data[0] != VERSION {
        return Err(Error::UnknownVersion(data[0]));
    }

    let mut nonce = [0u8; 32];
    nonce.copy_from_slice(&data[1..33]);
    let (ciphertext, tag) = data[33..].split_at(data.len() - 33 - 32);

    let keys = message_keys(conversation_key, &nonce)?;
    mac(&keys.hmac_key, &nonce, ciphertext)?
        .verify_slice(tag)
        .map_err(|_| Error::InvalidMac)?;

    let mut buffer = ciphertext.to_vec();
    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut buffer);
    let plaintext = unpad(&buffer);
    buffer.zeroize();
    plaintext
}

pub fn encrypt(secret_key: &SecretKey, public_key: &PublicKey, plaintext: &str) -> Result<String, Error> {
    encrypt_with_key(&ConversationKey::derive(secret_key, public_key), plaintext.as_bytes())
}

pub fn decrypt(secret_key: &SecretKey, public_key: &PublicKey, payload: &str) -> Result<String, Error> {
    let bytes = decrypt_to_bytes(&ConversationKey::derive(secret_key, public_key), payload)?;
    String::from_utf8(bytes).map_err(|_| Error::Utf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Keys;

    fn hex32(s: &str) -> [u8; 32] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn padded_len_matches_reference_table() {
        let cases = [
            (16, 32),
            (32, 32),
            (33, 64),
            (37, 64),
            (45, 64),
            (49, 64),
            (64, 64),
            (65, 96),
            (100, 128),
            (111, 128),
            (200, 224),
            (250, 256),
            (320, 320),
            (383, 384),
            (384, 384),
            (400, 448),
            (500, 512),
            (512, 512),
            (515, 640),
            (700, 768),
            (800, 896),
            (900, 1024),
            (1020, 1024),
            (65536, 65536),
        ];
        for (len, expected) in cases {
            assert_eq!(calc_padded_len(len), expected, "len {len}");
        }
    }

    // Published NIP-44 v2 vector: sec1=1, sec2=2, nonce=0..01, plaintext "a".
    #[test]
    fn known_vector_encrypts_and_decrypts() {
        let sec1 = SecretKey::from_hex(
            "0000000000000000000000000000000000000000000000000000000000000001",
        )
        .unwrap();
        let sec2 = Keys::parse("0000000000000000000000000000000000000000000000000000000000000002")
            .unwrap();
        let conversation_key = ConversationKey::derive(&sec1, &sec2.public_key());
        assert_eq!(
            hex::encode(conversation_key.as_bytes()),
            "c41c775356fd92eadc63ff5a0dc1da211b268cbea22316767095b2871ea1412d"
        );

        let nonce = hex32("0000000000000000000000000000000000000000000000000000000000000001");
        let payload = encrypt_with_nonce(&conversation_key, b"a", nonce).unwrap();
        assert_eq!(
            payload,
            "AgAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAABee0G5VSK0/9YypIObAtDKfYEAjD35uVkHyB0F4DwrcNaCXlCWZKaArsGrY6M9wnuTMxWfp1RTN9Xga8no+kF5Vsb"
        );
        assert_eq!(decrypt_to_bytes(&conversation_key, &payload).unwrap(), b"a");
    }

    #[test]
    fn conversation_key_is_symmetric() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        assert_eq!(
            ConversationKey::derive(alice.secret_key(), &bob.public_key()),
            ConversationKey::derive(bob.secret_key(), &alice.public_key())
        );
    }

    #[test]
    fn roundtrip_between_two_identities() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let payload = encrypt(alice.secret_key(), &bob.public_key(), "hello bob ⚡").unwrap();
        let plaintext = decrypt(bob.secret_key(), &alice.public_key(), &payload).unwrap();
        assert_eq!(plaintext, "hello bob ⚡");
    }

    #[test]
    fn wrong_key_fails_mac() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let eve = Keys::generate();
        let payload = encrypt(alice.secret_key(), &bob.public_key(), "secret").unwrap();
        assert_eq!(
            decrypt(eve.secret_key(), &alice.public_key(), &payload),
            Err(Error::InvalidMac)
        );
    }

    #[test]
    fn tampered_ciphertext_fails_mac() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let payload = encrypt(alice.secret_key(), &bob.public_key(), "secret").unwrap();
        let mut raw = BASE64.decode(&payload).unwrap();
        raw[40] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert_eq!(
            decrypt(bob.secret_key(), &alice.public_key(), &tampered),
            Err(Error::InvalidMac)
        );
    }

    #[test]
    fn rejects_bad_lengths_and_versions() {
        let key = ConversationKey::from_bytes([7u8; 32]);
        assert_eq!(encrypt_with_key(&key, b""), Err(Error::PlaintextLength(0)));
        assert_eq!(
            encrypt_with_key(&key, &vec![b'x'; 65536]),
            Err(Error::PlaintextLength(65536))
        );
        assert_eq!(decrypt_to_bytes(&key, "#abc"), Err(Error::UnknownVersion(0)));
        assert_eq!(decrypt_to_bytes(&key, "short"), Err(Error::PayloadLength));

        let payload = encrypt_with_key(&key, b"hello").unwrap();
        let mut raw = BASE64.decode(&payload).unwrap();
        raw[0] = 1;
        assert_eq!(
            decrypt_to_bytes(&key, &BASE64.encode(raw)),
            Err(Error::UnknownVersion(1))
        );
    }

    #[test]
    fn ciphertext_length_hides_small_differences() {
        let key = ConversationKey::from_bytes([9u8; 32]);
        let a = encrypt_with_key(&key, b"hi").unwrap();
        let b = encrypt_with_key(&key, b"hello there").unwrap();
        assert_eq!(a.len(), b.len());
        assert_ne!(a, encrypt_with_key(&key, b"hi").unwrap());
    }
}
