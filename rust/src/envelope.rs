//! Three-layer private messages: rumor → seal → gift wrap (NIP-59)
//!
//! The rumor is never signed. The seal is signed by the real sender and hides
//! the rumor from everyone but the recipient. The gift wrap is signed by a
//! single-use key so relays only see the recipient.

use pika_relay_profiles::RelayUrl;

use crate::conversation::conversation_participants;
use crate::crypto::{decrypt_with, encrypt_with, CodecError, EncryptionScheme};
use crate::event::{
    Event, EventBuilder, EventError, EventId, Keys, Kind, PublicKey, Tag, Timestamp, UnsignedEvent,
};

/// Seal and gift wrap timestamps are drawn from `[now - 2 days, now]`.
pub const TIMESTAMP_WINDOW_SECS: u64 = 2 * 24 * 60 * 60;

/// Envelope error
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Seal signer differs from the rumor author. The message must be dropped.
    #[error("seal signed by {seal} but message claims author {rumor}")]
    Impersonation { seal: PublicKey, rumor: PublicKey },
    /// Codec error (includes decryption failures)
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("expected kind {expected}, found {found}")]
    UnexpectedKind { expected: Kind, found: Kind },
    #[error("unsupported private message kind {0}")]
    UnsupportedMessageKind(Kind),
    #[error("seal must not carry tags")]
    SealHasTags,
    #[error("malformed {layer}: {source}")]
    Malformed {
        layer: &'static str,
        source: EventError,
    },
    /// Event error
    #[error(transparent)]
    Event(#[from] EventError),
}

impl EnvelopeError {
    pub fn is_impersonation(&self) -> bool {
        matches!(self, Self::Impersonation { .. })
    }

    pub fn is_decryption(&self) -> bool {
        matches!(self, Self::Codec(e) if e.is_decryption())
    }
}

/// Plaintext extras for [`private_message_rumor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessageOptions {
    pub subject: Option<String>,
    pub reply_to: Option<EventId>,
    /// Kind 14 (chat) or 15 (file).
    pub kind: Kind,
}

impl Default for PrivateMessageOptions {
    fn default() -> Self {
        Self {
            subject: None,
            reply_to: None,
            kind: Kind::PRIVATE_DIRECT_MESSAGE,
        }
    }
}

/// Result of a successful unwrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwrappedGift {
    /// Seal signer, checked to equal the rumor author.
    pub sender: PublicKey,
    pub rumor: UnsignedEvent,
}

/// Unsigned inner message with one `p` tag per recipient.
pub fn private_message_rumor(
    sender: PublicKey,
    recipients: &[PublicKey],
    content: impl Into<String>,
    opts: PrivateMessageOptions,
) -> Result<UnsignedEvent, EnvelopeError> {
    if !opts.kind.is_private_message() {
        return Err(EnvelopeError::UnsupportedMessageKind(opts.kind));
    }
    let mut builder =
        EventBuilder::new(opts.kind, content).tags(recipients.iter().copied().map(Tag::public_key));
    if let Some(reply_to) = opts.reply_to {
        builder = builder.tag(Tag::event(reply_to));
    }
    if let Some(subject) = opts.subject {
        builder = builder.tag(Tag::subject(subject));
    }
    Ok(builder.build(sender))
}

/// Kind 13 seal of `rumor`, readable only by `recipient`.
pub fn seal(sender: &Keys, recipient: &PublicKey, rumor: &UnsignedEvent) -> Result<Event, EnvelopeError> {
    if rumor.pubkey != sender.public_key() {
        return Err(EventError::KeyMismatch.into());
    }
    let mut rumor = rumor.clone();
    rumor.ensure_id();

    let content = encrypt_with(
        EncryptionScheme::Current,
        sender.secret_key(),
        recipient,
        &rumor.as_json(),
    )?;
    Ok(EventBuilder::new(Kind::SEAL, content)
        .custom_created_at(Timestamp::tweaked(TIMESTAMP_WINDOW_SECS))
        .sign_with_keys(sender)?)
}

/// Wrap an already signed seal under a fresh single-use key.
pub fn gift_wrap_seal(
    seal: &Event,
    recipient: &PublicKey,
    relay_hint: Option<&RelayUrl>,
) -> Result<Event, EnvelopeError> {
    if seal.kind != Kind::SEAL {
        return Err(EnvelopeError::UnexpectedKind {
            expected: Kind::SEAL,
            found: seal.kind,
        });
    }
    let ephemeral = Keys::generate();
    let content = encrypt_with(
        EncryptionScheme::Current,
        ephemeral.secret_key(),
        recipient,
        &seal.as_json(),
    )?;
    let recipient_tag = match relay_hint {
        Some(relay) => Tag::public_key_with_relay(*recipient, relay.as_str()),
        None => Tag::public_key(*recipient),
    };
    Ok(EventBuilder::new(Kind::GIFT_WRAP, content)
        .tag(recipient_tag)
        .custom_created_at(Timestamp::tweaked(TIMESTAMP_WINDOW_SECS))
        .sign_with_keys(&ephemeral)?)
}

/// Seal `rumor` for `recipient` and gift wrap the seal.
pub fn gift_wrap(
    sender: &Keys,
    recipient: &PublicKey,
    rumor: &UnsignedEvent,
    relay_hint: Option<&RelayUrl>,
) -> Result<Event, EnvelopeError> {
    let seal = seal(sender, recipient, rumor)?;
    gift_wrap_seal(&seal, recipient, relay_hint)
}

/// One gift wrap per participant of `rumor`, the sender included.
pub fn wrap_for_participants(
    sender: &Keys,
    rumor: &UnsignedEvent,
) -> Result<Vec<(PublicKey, Event)>, EnvelopeError> {
    conversation_participants(rumor)
        .into_iter()
        .map(|participant| Ok((participant, gift_wrap(sender, &participant, rumor, None)?)))
        .collect()
}

pub fn unwrap_gift_wrap(receiver: &Keys, gift_wrap: &Event) -> Result<UnwrappedGift, EnvelopeError> {
    expect_kind(gift_wrap, Kind::GIFT_WRAP)?;
    gift_wrap.verify()?;

    let seal_json = decrypt_with(
        EncryptionScheme::Current,
        receiver.secret_key(),
        &gift_wrap.pubkey,
        &gift_wrap.content,
    )?;
    let seal = Event::from_json(&seal_json).map_err(|source| EnvelopeError::Malformed {
        layer: "seal",
        source,
    })?;
    expect_kind(&seal, Kind::SEAL)?;
    if !seal.tags.is_empty() {
        return Err(EnvelopeError::SealHasTags);
    }
    seal.verify()?;

    let rumor_json = decrypt_with(
        EncryptionScheme::Current,
        receiver.secret_key(),
        &seal.pubkey,
        &seal.content,
    )?;
    let mut rumor = UnsignedEvent::from_json(&rumor_json).map_err(|source| EnvelopeError::Malformed {
        layer: "rumor",
        source,
    })?;
    rumor.verify_id().map_err(|source| EnvelopeError::Malformed {
        layer: "rumor",
        source,
    })?;

    if seal.pubkey != rumor.pubkey {
        return Err(EnvelopeError::Impersonation {
            seal: seal.pubkey,
            rumor: rumor.pubkey,
        });
    }
    rumor.ensure_id();

    Ok(UnwrappedGift {
        sender: seal.pubkey,
        rumor,
    })
}

/// Unwrap a batch. Each result is independent of the others.
pub fn unwrap_many<'a, I>(receiver: &Keys, gift_wraps: I) -> Vec<(EventId, Result<UnwrappedGift, EnvelopeError>)>
where
    I: IntoIterator<Item = &'a Event>,
{
    gift_wraps
        .into_iter()
        .map(|wrap| {
            let result = unwrap_gift_wrap(receiver, wrap);
            if let Err(e) = &result {
                tracing::warn!(id = %wrap.id, "dropping gift wrap: {e}");
            }
            (wrap.id, result)
        })
        .collect()
}

fn expect_kind(event: &Event, expected: Kind) -> Result<(), EnvelopeError> {
    if event.kind == expected {
        Ok(())
    } else {
        Err(EnvelopeError::UnexpectedKind {
            expected,
            found: event.kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{extract_reply_to, extract_subject};

    fn rumor_from(sender: &Keys, recipient: PublicKey, content: &str) -> UnsignedEvent {
        private_message_rumor(
            sender.public_key(),
            &[recipient],
            content,
            PrivateMessageOptions {
                subject: Some("plans".to_string()),
                reply_to: Some(EventId::from_byte_array([9u8; 32])),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn round_trip_preserves_content_and_tags() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let rumor = rumor_from(&alice, bob.public_key(), "dinner at 8?");

        let relay: RelayUrl = "wss://relay.example.com".parse().unwrap();
        let wrapped = gift_wrap(&alice, &bob.public_key(), &rumor, Some(&relay)).unwrap();
        assert_eq!(wrapped.kind, Kind::GIFT_WRAP);
        assert_ne!(wrapped.pubkey, alice.public_key());
        assert_eq!(
            wrapped.tags,
            vec![Tag::public_key_with_relay(bob.public_key(), "wss://relay.example.com")]
        );
        assert!(!wrapped.content.contains("dinner"));

        let unwrapped = unwrap_gift_wrap(&bob, &wrapped).unwrap();
        assert_eq!(unwrapped.sender, alice.public_key());
        assert_eq!(unwrapped.rumor.content, "dinner at 8?");
        assert_eq!(unwrapped.rumor.tags, rumor.tags);
        assert_eq!(unwrapped.rumor.id(), rumor.id());
        assert_eq!(extract_subject(&unwrapped.rumor.tags), Some("plans"));
        assert_eq!(
            extract_reply_to(&unwrapped.rumor.tags),
            Some(EventId::from_byte_array([9u8; 32]))
        );
    }

    #[test]
    fn every_wrap_uses_a_fresh_key() {
        let alice = Keys::generate();
        let bob = Keys::generate().public_key();
        let rumor = rumor_from(&alice, bob, "x");
        let a = gift_wrap(&alice, &bob, &rumor, None).unwrap();
        let b = gift_wrap(&alice, &bob, &rumor, None).unwrap();
        assert_ne!(a.pubkey, b.pubkey);
        assert_ne!(a.content, b.content);
    }

    #[test]
    fn forged_seal_is_impersonation() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let mallory = Keys::generate();

        // Rumor claims Alice wrote it, but Mallory seals it.
        let rumor = rumor_from(&alice, bob.public_key(), "send me your keys");
        let content = encrypt_with(
            EncryptionScheme::Current,
            mallory.secret_key(),
            &bob.public_key(),
            &rumor.as_json(),
        )
        .unwrap();
        let forged_seal = EventBuilder::new(Kind::SEAL, content)
            .sign_with_keys(&mallory)
            .unwrap();
        let wrapped = gift_wrap_seal(&forged_seal, &bob.public_key(), None).unwrap();

        let err = unwrap_gift_wrap(&bob, &wrapped).unwrap_err();
        assert!(err.is_impersonation(), "{err}");
    }

    #[test]
    fn seal_refuses_foreign_rumor() {
        let alice = Keys::generate();
        let mallory = Keys::generate();
        let bob = Keys::generate().public_key();
        let rumor = rumor_from(&alice, bob, "x");
        assert!(matches!(
            seal(&mallory, &bob, &rumor),
            Err(EnvelopeError::Event(EventError::KeyMismatch))
        ));
    }

    #[test]
    fn timestamps_are_hidden_within_window() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let rumor = rumor_from(&alice, bob.public_key(), "x");

        for _ in 0..20 {
            let before = Timestamp::now().as_secs();
            let s = seal(&alice, &bob.public_key(), &rumor).unwrap();
            let wrapped = gift_wrap_seal(&s, &bob.public_key(), None).unwrap();
            let after = Timestamp::now().as_secs();
            for t in [s.created_at.as_secs(), wrapped.created_at.as_secs()] {
                assert!(t <= after);
                assert!(before.saturating_sub(t) <= TIMESTAMP_WINDOW_SECS);
            }
        }
    }

    #[test]
    fn seal_and_wrap_draw_timestamps_separately() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let rumor = rumor_from(&alice, bob.public_key(), "x");

        let pairs: Vec<(u64, u64)> = (0..20)
            .map(|_| {
                let s = seal(&alice, &bob.public_key(), &rumor).unwrap();
                let wrapped = gift_wrap_seal(&s, &bob.public_key(), None).unwrap();
                (s.created_at.as_secs(), wrapped.created_at.as_secs())
            })
            .collect();
        assert!(pairs.iter().any(|(sealed, wrapped)| sealed != wrapped));

        let seals: std::collections::HashSet<u64> = pairs.iter().map(|(s, _)| *s).collect();
        assert!(seals.len() > 1, "seal timestamps are not redrawn");
    }

    #[test]
    fn wrong_recipient_cannot_unwrap() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let eve = Keys::generate();
        let rumor = rumor_from(&alice, bob.public_key(), "x");
        let wrapped = gift_wrap(&alice, &bob.public_key(), &rumor, None).unwrap();
        let err = unwrap_gift_wrap(&eve, &wrapped).unwrap_err();
        assert!(err.is_decryption(), "{err}");
    }

    #[test]
    fn rejects_wrong_kinds_and_tagged_seals() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let note = EventBuilder::text_note("x").sign_with_keys(&alice).unwrap();
        assert!(matches!(
            unwrap_gift_wrap(&bob, &note),
            Err(EnvelopeError::UnexpectedKind { .. })
        ));
        assert!(matches!(
            gift_wrap_seal(&note, &bob.public_key(), None),
            Err(EnvelopeError::UnexpectedKind { .. })
        ));

        let rumor = rumor_from(&alice, bob.public_key(), "x");
        let content = encrypt_with(
            EncryptionScheme::Current,
            alice.secret_key(),
            &bob.public_key(),
            &rumor.as_json(),
        )
        .unwrap();
        let tagged_seal = EventBuilder::new(Kind::SEAL, content)
            .tag(Tag::public_key(bob.public_key()))
            .sign_with_keys(&alice)
            .unwrap();
        let wrapped = gift_wrap_seal(&tagged_seal, &bob.public_key(), None).unwrap();
        assert!(matches!(
            unwrap_gift_wrap(&bob, &wrapped),
            Err(EnvelopeError::SealHasTags)
        ));
    }

    #[test]
    fn tampered_gift_wrap_fails_verification() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let rumor = rumor_from(&alice, bob.public_key(), "x");
        let mut wrapped = gift_wrap(&alice, &bob.public_key(), &rumor, None).unwrap();
        wrapped.created_at = Timestamp::from_secs(wrapped.created_at.as_secs() + 1);
        assert!(matches!(
            unwrap_gift_wrap(&bob, &wrapped),
            Err(EnvelopeError::Event(EventError::InvalidId { .. }))
        ));
    }

    #[test]
    fn rumor_kind_must_be_private_message() {
        let alice = Keys::generate().public_key();
        let err = private_message_rumor(
            alice,
            &[],
            "x",
            PrivateMessageOptions {
                kind: Kind::TEXT_NOTE,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, EnvelopeError::UnsupportedMessageKind(_)));
    }

    #[test]
    fn participants_each_get_a_copy_and_bad_entries_stay_isolated() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let carol = Keys::generate();
        let rumor = private_message_rumor(
            alice.public_key(),
            &[bob.public_key(), carol.public_key()],
            "group hello",
            PrivateMessageOptions::default(),
        )
        .unwrap();

        let wraps = wrap_for_participants(&alice, &rumor).unwrap();
        assert_eq!(wraps.len(), 3);
        assert!(wraps.iter().any(|(pk, _)| *pk == alice.public_key()));

        let for_bob = wraps
            .iter()
            .find(|(pk, _)| *pk == bob.public_key())
            .map(|(_, e)| e.clone())
            .unwrap();
        let for_carol = wraps
            .iter()
            .find(|(pk, _)| *pk == carol.public_key())
            .map(|(_, e)| e.clone())
            .unwrap();

        let results = unwrap_many(&bob, [&for_carol, &for_bob]);
        assert_eq!(results.len(), 2);
        assert!(results[0].1.as_ref().unwrap_err().is_decryption());
        assert_eq!(results[1].1.as_ref().unwrap().rumor.content, "group hello");
        assert_eq!(results[1].0, for_bob.id);
    }
}
