//! Signed events and their building blocks

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use secp256k1::{schnorr, Message, SECP256K1};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

pub mod filter;
pub mod keys;
pub mod tag;

pub use self::filter::{Filter, FilterError, SingleLetterTag};
pub use self::keys::{KeyError, Keys, PublicKey, SecretKey};
pub use self::tag::Tag;

/// Event error
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// JSON error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Key error
    #[error(transparent)]
    Key(#[from] KeyError),
    /// Hex error
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
    /// Stored id does not match the content hash
    #[error("event id mismatch: expected {expected}, found {found}")]
    InvalidId { expected: EventId, found: EventId },
    /// Signature does not verify against the author key
    #[error("invalid event signature")]
    InvalidSignature,
    /// Signing keys differ from the declared author
    #[error("signing keys do not match event author")]
    KeyMismatch,
    /// Malformed fixed-size field
    #[error("invalid {0} length")]
    InvalidLength(&'static str),
}

/// Event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(u16);

impl Kind {
    pub const METADATA: Kind = Kind(0);
    pub const TEXT_NOTE: Kind = Kind(1);
    /// Legacy (NIP-04) encrypted direct message
    pub const ENCRYPTED_DIRECT_MESSAGE: Kind = Kind(4);
    pub const SEAL: Kind = Kind(13);
    pub const PRIVATE_DIRECT_MESSAGE: Kind = Kind(14);
    pub const PRIVATE_FILE_MESSAGE: Kind = Kind(15);
    pub const GIFT_WRAP: Kind = Kind(1059);

    pub const fn new(kind: u16) -> Self {
        Self(kind)
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// Kinds allowed as the inner message of a gift wrap.
    pub fn is_private_message(&self) -> bool {
        *self == Self::PRIVATE_DIRECT_MESSAGE || *self == Self::PRIVATE_FILE_MESSAGE
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unix timestamp in seconds
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self(secs)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub const fn as_secs(&self) -> u64 {
        self.0
    }

    /// `now` moved a uniformly random amount, up to `max_past_secs`, into the past.
    pub fn tweaked(max_past_secs: u64) -> Self {
        let offset = rand::thread_rng().gen_range(0..=max_past_secs);
        Self(Self::now().0.saturating_sub(offset))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// sha256 of the canonical event serialization
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId([u8; 32]);

impl EventId {
    pub fn from_byte_array(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, EventError> {
        let bytes = hex::decode(hex_str)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| EventError::InvalidLength("event id"))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Hash of `[0, pubkey, created_at, kind, tags, content]`.
    pub fn compute(
        pubkey: &PublicKey,
        created_at: Timestamp,
        kind: Kind,
        tags: &[Tag],
        content: &str,
    ) -> Self {
        let canonical = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        Self(digest.into())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.to_hex())
    }
}

impl FromStr for EventId {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for EventId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

/// BIP-340 signature over the event id
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(schnorr::Signature);

impl Signature {
    pub fn from_hex(hex_str: &str) -> Result<Self, EventError> {
        let bytes = hex::decode(hex_str)?;
        schnorr::Signature::from_slice(&bytes)
            .map(Self)
            .map_err(|_| EventError::InvalidLength("signature"))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.serialize())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

/// Event without a signature. Used for private message "rumors", which are
/// deliberately never signed so they cannot be republished as proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EventId>,
    pub pubkey: PublicKey,
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    pub fn compute_id(&self) -> EventId {
        EventId::compute(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Stored id, or the computed one.
    pub fn id(&self) -> EventId {
        self.id.unwrap_or_else(|| self.compute_id())
    }

    pub fn ensure_id(&mut self) -> EventId {
        let id = self.id();
        self.id = Some(id);
        id
    }

    /// An absent id is accepted; a present one must match the content.
    pub fn verify_id(&self) -> Result<(), EventError> {
        if let Some(found) = self.id {
            let expected = self.compute_id();
            if expected != found {
                return Err(EventError::InvalidId { expected, found });
            }
        }
        Ok(())
    }

    pub fn sign_with_keys(self, keys: &Keys) -> Result<Event, EventError> {
        if keys.public_key() != self.pubkey {
            return Err(EventError::KeyMismatch);
        }
        let id = self.compute_id();
        let message = Message::from_digest(*id.as_bytes());
        let sig = SECP256K1.sign_schnorr(&message, keys.keypair());
        Ok(Event {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: Signature(sig),
        })
    }

    pub fn as_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Signed event. Any change after signing is caught by [`Event::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: Signature,
}

impl Event {
    pub fn verify_id(&self) -> Result<(), EventError> {
        let expected =
            EventId::compute(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content);
        if expected != self.id {
            return Err(EventError::InvalidId {
                expected,
                found: self.id,
            });
        }
        Ok(())
    }

    pub fn verify_signature(&self) -> Result<(), EventError> {
        let message = Message::from_digest(*self.id.as_bytes());
        SECP256K1
            .verify_schnorr(&self.sig.0, &message, self.pubkey.xonly())
            .map_err(|_| EventError::InvalidSignature)
    }

    /// Id and signature.
    pub fn verify(&self) -> Result<(), EventError> {
        self.verify_id()?;
        self.verify_signature()
    }

    pub fn as_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.tags.iter().filter(move |t| t.name() == Some(name))
    }

    /// Keys referenced by `p` tags, skipping malformed ones.
    pub fn tagged_public_keys(&self) -> impl Iterator<Item = PublicKey> + '_ {
        self.tags_named(tag::TAG_PUBLIC_KEY)
            .filter_map(|t| t.content())
            .filter_map(|v| PublicKey::from_hex(v).ok())
    }
}

/// Builder for signed and unsigned events.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    kind: Kind,
    content: String,
    tags: Vec<Tag>,
    created_at: Option<Timestamp>,
}

impl EventBuilder {
    pub fn new(kind: Kind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            tags: Vec::new(),
            created_at: None,
        }
    }

    pub fn text_note(content: impl Into<String>) -> Self {
        Self::new(Kind::TEXT_NOTE, content)
    }

    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn tags<I>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = Tag>,
    {
        self.tags.extend(tags);
        self
    }

    pub fn custom_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Unsigned event with its id filled in.
    pub fn build(self, pubkey: PublicKey) -> UnsignedEvent {
        let mut unsigned = UnsignedEvent {
            id: None,
            pubkey,
            created_at: self.created_at.unwrap_or_else(Timestamp::now),
            kind: self.kind,
            tags: self.tags,
            content: self.content,
        };
        unsigned.ensure_id();
        unsigned
    }

    pub fn sign_with_keys(self, keys: &Keys) -> Result<Event, EventError> {
        self.build(keys.public_key()).sign_with_keys(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_event_verifies_and_survives_json() {
        let keys = Keys::generate();
        let event = EventBuilder::text_note("hello \"relay\"\n")
            .tag(Tag::subject("greeting"))
            .sign_with_keys(&keys)
            .unwrap();
        event.verify().unwrap();

        let parsed = Event::from_json(&event.as_json()).unwrap();
        assert_eq!(parsed, event);
        parsed.verify().unwrap();
    }

    #[test]
    fn tampered_content_fails_verification() {
        let keys = Keys::generate();
        let mut event = EventBuilder::text_note("original")
            .sign_with_keys(&keys)
            .unwrap();
        event.content = "edited".to_string();
        assert!(matches!(event.verify(), Err(EventError::InvalidId { .. })));
    }

    #[test]
    fn foreign_signature_fails_verification() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let a = EventBuilder::text_note("x").sign_with_keys(&alice).unwrap();
        let b = EventBuilder::text_note("x")
            .custom_created_at(a.created_at)
            .sign_with_keys(&bob)
            .unwrap();
        let forged = Event {
            sig: b.sig,
            ..a.clone()
        };
        assert!(matches!(
            forged.verify(),
            Err(EventError::InvalidSignature)
        ));
    }

    #[test]
    fn unsigned_event_rejects_foreign_keys() {
        let alice = Keys::generate();
        let rumor = EventBuilder::text_note("x").build(alice.public_key());
        assert!(matches!(
            rumor.sign_with_keys(&Keys::generate()),
            Err(EventError::KeyMismatch)
        ));
    }

    #[test]
    fn event_id_matches_canonical_serialization() {
        let keys = Keys::generate();
        let rumor = EventBuilder::new(Kind::TEXT_NOTE, "hi")
            .custom_created_at(Timestamp::from_secs(1_700_000_000))
            .tag(Tag::custom("t", ["nostr"]))
            .build(keys.public_key());
        let canonical = format!(
            r#"[0,"{}",1700000000,1,[["t","nostr"]],"hi"]"#,
            keys.public_key().to_hex()
        );
        let expected: [u8; 32] = Sha256::digest(canonical.as_bytes()).into();
        assert_eq!(rumor.id(), EventId::from_byte_array(expected));
        rumor.verify_id().unwrap();
    }

    #[test]
    fn tweaked_timestamp_stays_in_window() {
        for _ in 0..100 {
            let before = Timestamp::now().as_secs();
            let t = Timestamp::tweaked(60).as_secs();
            let after = Timestamp::now().as_secs();
            assert!(t <= after);
            assert!(before.saturating_sub(t) <= 60);
        }
    }

    #[test]
    fn tagged_public_keys_skip_malformed() {
        let keys = Keys::generate();
        let peer = Keys::generate().public_key();
        let event = EventBuilder::text_note("x")
            .tag(Tag::public_key(peer))
            .tag(Tag::custom("p", ["not-hex"]))
            .sign_with_keys(&keys)
            .unwrap();
        assert_eq!(event.tagged_public_keys().collect::<Vec<_>>(), vec![peer]);
    }
}
