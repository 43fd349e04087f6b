//! Scheme selection, conversation-key caching and direct message construction

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use super::nip44::ConversationKey;
use super::{nip04, nip44};
use crate::conversation;
use crate::event::tag::TAG_PUBLIC_KEY;
use crate::event::{Event, EventBuilder, EventError, EventId, Keys, Kind, PublicKey, SecretKey, Tag, Timestamp};

const DEFAULT_CONVERSATION_KEY_CACHE: usize = 256;

/// Which payload encryption to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionScheme {
    /// AES-256-CBC (NIP-04). Kind 4 only.
    Legacy,
    /// Padded ChaCha20 + HMAC-SHA256 (NIP-44 v2).
    Current,
}

impl EncryptionScheme {
    pub fn for_kind(kind: Kind) -> Self {
        if kind == Kind::ENCRYPTED_DIRECT_MESSAGE {
            Self::Legacy
        } else {
            Self::Current
        }
    }

    /// Guess the scheme from the payload shape.
    pub fn detect(payload: &str) -> Self {
        if nip04::is_legacy_payload(payload) {
            Self::Legacy
        } else {
            Self::Current
        }
    }
}

/// Codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Plaintext rejected by the scheme (e.g. empty or too long)
    #[error("encryption failed ({scheme:?}): {reason}")]
    Encryption {
        scheme: EncryptionScheme,
        reason: String,
    },
    /// Wrong key or tampered ciphertext
    #[error("decryption failed ({scheme:?}): {reason}")]
    Decryption {
        scheme: EncryptionScheme,
        reason: String,
    },
    /// Event is not a direct message this identity can read
    #[error("not a direct message for this identity: {0}")]
    NotForUs(String),
    /// Event error
    #[error(transparent)]
    Event(#[from] EventError),
}

impl CodecError {
    pub fn is_decryption(&self) -> bool {
        matches!(self, Self::Decryption { .. })
    }
}

pub fn encrypt_with(
    scheme: EncryptionScheme,
    secret_key: &SecretKey,
    peer: &PublicKey,
    plaintext: &str,
) -> Result<String, CodecError> {
    let result = match scheme {
        EncryptionScheme::Legacy => nip04::encrypt(secret_key, peer, plaintext).map_err(|e| e.to_string()),
        EncryptionScheme::Current => nip44::encrypt(secret_key, peer, plaintext).map_err(|e| e.to_string()),
    };
    result.map_err(|reason| CodecError::Encryption { scheme, reason })
}

const UNSIGNED_LEGACY: &str = "legacy payloads are only read from signed kind 4 events";

/// Decrypt a standalone payload. Legacy payloads carry no MAC and are refused
/// here; read them with [`MessageCodec::read_direct_message`].
pub fn decrypt_with(
    scheme: EncryptionScheme,
    secret_key: &SecretKey,
    peer: &PublicKey,
    payload: &str,
) -> Result<String, CodecError> {
    let result = match scheme {
        EncryptionScheme::Legacy => Err(UNSIGNED_LEGACY.to_string()),
        EncryptionScheme::Current => nip44::decrypt(secret_key, peer, payload).map_err(|e| e.to_string()),
    };
    result.map_err(|reason| CodecError::Decryption { scheme, reason })
}

/// Optional plaintext metadata for a direct message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectMessageOptions {
    /// Sent in the clear as a `subject` tag.
    pub subject: Option<String>,
    /// Referenced with an `e` tag.
    pub reply_to: Option<EventId>,
}

/// A decrypted kind 4 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectMessage {
    pub id: EventId,
    pub sender: PublicKey,
    pub recipient: PublicKey,
    pub created_at: Timestamp,
    pub content: String,
    pub subject: Option<String>,
    pub reply_to: Option<EventId>,
}

/// Encryption bound to one local identity.
///
/// NIP-44 conversation keys are cached per peer; the cache is bounded and
/// evicts least recently used entries.
pub struct MessageCodec {
    keys: Keys,
    conversation_keys: Mutex<LruCache<PublicKey, ConversationKey>>,
}

impl MessageCodec {
    pub fn new(keys: Keys) -> Self {
        let capacity = NonZeroUsize::new(DEFAULT_CONVERSATION_KEY_CACHE).unwrap_or(NonZeroUsize::MIN);
        Self::with_cache_capacity(keys, capacity)
    }

    pub fn with_cache_capacity(keys: Keys, capacity: NonZeroUsize) -> Self {
        Self {
            keys,
            conversation_keys: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    fn conversation_key(&self, peer: &PublicKey) -> ConversationKey {
        let mut cache = self.conversation_keys.lock();
        cache
            .get_or_insert(*peer, || ConversationKey::derive(self.keys.secret_key(), peer))
            .clone()
    }

    pub fn encrypt(&self, scheme: EncryptionScheme, peer: &PublicKey, plaintext: &str) -> Result<String, CodecError> {
        match scheme {
            EncryptionScheme::Legacy => encrypt_with(scheme, self.keys.secret_key(), peer, plaintext),
            EncryptionScheme::Current => {
                let key = self.conversation_key(peer);
                nip44::encrypt_with_key(&key, plaintext.as_bytes()).map_err(|e| CodecError::Encryption {
                    scheme,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Legacy payloads are refused; see [`decrypt_with`].
    pub fn decrypt(&self, scheme: EncryptionScheme, peer: &PublicKey, payload: &str) -> Result<String, CodecError> {
        match scheme {
            EncryptionScheme::Legacy => decrypt_with(scheme, self.keys.secret_key(), peer, payload),
            EncryptionScheme::Current => {
                let key = self.conversation_key(peer);
                let failed = |reason: String| CodecError::Decryption { scheme, reason };
                let bytes = nip44::decrypt_to_bytes(&key, payload).map_err(|e| failed(e.to_string()))?;
                String::from_utf8(bytes).map_err(|_| failed(nip44::Error::Utf8.to_string()))
            }
        }
    }

    /// Decrypt without knowing the scheme up front.
    pub fn decrypt_auto(&self, peer: &PublicKey, payload: &str) -> Result<String, CodecError> {
        self.decrypt(EncryptionScheme::detect(payload), peer, payload)
    }

    /// Signed kind 4 message to `receiver`.
    pub fn direct_message(
        &self,
        receiver: &PublicKey,
        content: &str,
        opts: DirectMessageOptions,
    ) -> Result<Event, CodecError> {
        let kind = Kind::ENCRYPTED_DIRECT_MESSAGE;
        let encrypted = self.encrypt(EncryptionScheme::for_kind(kind), receiver, content)?;

        let mut builder = EventBuilder::new(kind, encrypted).tag(Tag::public_key(*receiver));
        if let Some(subject) = opts.subject {
            builder = builder.tag(Tag::subject(subject));
        }
        if let Some(reply_to) = opts.reply_to {
            builder = builder.tag(Tag::event(reply_to));
        }
        Ok(builder.sign_with_keys(&self.keys)?)
    }

    /// Decrypt a kind 4 message we sent or received.
    ///
    /// The signature covers the ciphertext, so a failed check is reported as
    /// a decryption failure.
    pub fn read_direct_message(&self, event: &Event) -> Result<DirectMessage, CodecError> {
        if event.kind != Kind::ENCRYPTED_DIRECT_MESSAGE {
            return Err(CodecError::NotForUs(format!("kind {}", event.kind)));
        }
        let scheme = EncryptionScheme::detect(&event.content);
        event.verify().map_err(|e| CodecError::Decryption {
            scheme,
            reason: e.to_string(),
        })?;

        let me = self.keys.public_key();
        let recipient = event
            .tags_named(TAG_PUBLIC_KEY)
            .filter_map(|t| t.content())
            .find_map(|v| PublicKey::from_hex(v).ok())
            .ok_or_else(|| CodecError::NotForUs("missing recipient tag".to_string()))?;
        let peer = if event.pubkey == me {
            recipient
        } else if recipient == me {
            event.pubkey
        } else {
            return Err(CodecError::NotForUs(format!("addressed to {recipient}")));
        };

        let content = match scheme {
            EncryptionScheme::Legacy => nip04::decrypt(self.keys.secret_key(), &peer, &event.content)
                .map_err(|e| CodecError::Decryption {
                    scheme,
                    reason: e.to_string(),
                })?,
            EncryptionScheme::Current => self.decrypt(scheme, &peer, &event.content)?,
        };
        Ok(DirectMessage {
            id: event.id,
            sender: event.pubkey,
            recipient,
            created_at: event.created_at,
            content,
            subject: conversation::extract_subject(&event.tags).map(str::to_string),
            reply_to: conversation::extract_reply_to(&event.tags),
        })
    }
}

impl std::fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCodec")
            .field("public_key", &self.keys.public_key())
            .finish_non_exhaustive()
    }
}
