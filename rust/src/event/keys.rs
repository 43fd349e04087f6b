//! secp256k1 identities (BIP-340 x-only keys)

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use secp256k1::{Keypair, Parity, XOnlyPublicKey, SECP256K1};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Key error
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KeyError {
    /// Hex error
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
    /// Not a valid x-only public key
    #[error("invalid public key")]
    InvalidPublicKey,
    /// Not a valid secret key
    #[error("invalid secret key")]
    InvalidSecretKey,
}

/// x-only public key, rendered as 64 lowercase hex chars on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(XOnlyPublicKey);

impl PublicKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        XOnlyPublicKey::from_slice(bytes)
            .map(Self)
            .map_err(|_| KeyError::InvalidPublicKey)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str)?;
        Self::from_slice(&bytes)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.serialize()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub(crate) fn xonly(&self) -> &XOnlyPublicKey {
        &self.0
    }

    /// Full point with even y, as BIP-340 defines for x-only keys. Used for ECDH.
    pub(crate) fn to_even_point(self) -> secp256k1::PublicKey {
        self.0.public_key(Parity::Even)
    }
}

// Byte order, so sorting keys matches sorting their hex form.
impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

/// Secret key. `Debug` never prints the key material.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SecretKey(secp256k1::SecretKey);

impl SecretKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        secp256k1::SecretKey::from_slice(bytes)
            .map(Self)
            .map_err(|_| KeyError::InvalidSecretKey)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = zeroize::Zeroizing::new(hex::decode(hex_str)?);
        Self::from_slice(&bytes)
    }

    pub fn to_secret_hex(&self) -> String {
        hex::encode(self.0.secret_bytes())
    }

    pub(crate) fn inner(&self) -> &secp256k1::SecretKey {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// A signing identity.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
    public_key: PublicKey,
    secret_key: SecretKey,
}

impl Keys {
    pub fn new(secret_key: SecretKey) -> Self {
        let keypair = Keypair::from_secret_key(SECP256K1, secret_key.inner());
        let (xonly, _) = keypair.x_only_public_key();
        Self {
            keypair,
            public_key: PublicKey(xonly),
            secret_key,
        }
    }

    /// Fresh random keys from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let keypair = Keypair::new_global(&mut rand::thread_rng());
        let (xonly, _) = keypair.x_only_public_key();
        Self {
            keypair,
            public_key: PublicKey(xonly),
            secret_key: SecretKey(keypair.secret_key()),
        }
    }

    /// Parse a hex-encoded secret key.
    pub fn parse(secret_hex: &str) -> Result<Self, KeyError> {
        Ok(Self::new(SecretKey::from_hex(secret_hex.trim())?))
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    pub(crate) fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrips_secret_and_derives_public_key() {
        let keys = Keys::generate();
        let again = Keys::parse(&keys.secret_key().to_secret_hex()).unwrap();
        assert_eq!(keys.public_key(), again.public_key());
        assert_eq!(keys.public_key().to_hex().len(), 64);
    }

    #[test]
    fn public_key_hex_roundtrip() {
        let pk = Keys::generate().public_key();
        assert_eq!(PublicKey::from_hex(&pk.to_hex()).unwrap(), pk);
        assert!(PublicKey::from_hex("zz").is_err());
        assert_eq!(
            PublicKey::from_hex(&"00".repeat(32)),
            Err(KeyError::InvalidPublicKey)
        );
    }

    #[test]
    fn ordering_matches_hex_ordering() {
        let mut keys: Vec<PublicKey> = (0..8).map(|_| Keys::generate().public_key()).collect();
        let mut hexes: Vec<String> = keys.iter().map(PublicKey::to_hex).collect();
        keys.sort();
        hexes.sort();
        assert_eq!(keys.iter().map(PublicKey::to_hex).collect::<Vec<_>>(), hexes);
    }

    #[test]
    fn debug_redacts_secret() {
        let keys = Keys::generate();
        let rendered = format!("{keys:?} {:?}", keys.secret_key());
        assert!(!rendered.contains(&keys.secret_key().to_secret_hex()));
    }
}
