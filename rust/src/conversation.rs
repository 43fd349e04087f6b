//! Conversation identity derived from participant sets

use std::collections::BTreeSet;

use crate::event::tag::{TAG_EVENT, TAG_PUBLIC_KEY, TAG_SUBJECT};
use crate::event::{EventId, PublicKey, Tag, UnsignedEvent};

/// Stable id for a set of participants: sorted, deduplicated hex keys joined by `,`.
///
/// Independent of input order, so every participant computes the same id.
pub fn conversation_id<'a, I>(participants: I) -> String
where
    I: IntoIterator<Item = &'a PublicKey>,
{
    let unique: BTreeSet<String> = participants.into_iter().map(PublicKey::to_hex).collect();
    unique.into_iter().collect::<Vec<_>>().join(",")
}

/// Author plus every `p`-tagged recipient of a rumor, sorted and deduplicated.
pub fn conversation_participants(rumor: &UnsignedEvent) -> Vec<PublicKey> {
    let mut participants = BTreeSet::new();
    participants.insert(rumor.pubkey);
    participants.extend(
        rumor
            .tags
            .iter()
            .filter(|t| t.name() == Some(TAG_PUBLIC_KEY))
            .filter_map(|t| t.content())
            .filter_map(|v| PublicKey::from_hex(v).ok()),
    );
    participants.into_iter().collect()
}

pub fn extract_subject(tags: &[Tag]) -> Option<&str> {
    tags.iter()
        .find(|t| t.name() == Some(TAG_SUBJECT))
        .and_then(Tag::content)
}

/// Id in the first `e` tag, if that tag holds a valid one.
pub fn extract_reply_to(tags: &[Tag]) -> Option<EventId> {
    tags.iter()
        .find(|t| t.name() == Some(TAG_EVENT))
        .and_then(Tag::content)
        .and_then(|v| EventId::from_hex(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBuilder, Keys, Kind};

    #[test]
    fn id_ignores_order_and_duplicates() {
        let a = Keys::generate().public_key();
        let b = Keys::generate().public_key();
        let c = Keys::generate().public_key();

        let id = conversation_id([&a, &b, &c]);
        assert_eq!(id, conversation_id([&c, &a, &b]));
        assert_eq!(id, conversation_id([&b, &b, &c, &a, &a]));
        assert_eq!(id.split(',').count(), 3);

        let mut hexes = vec![a.to_hex(), b.to_hex(), c.to_hex()];
        hexes.sort();
        assert_eq!(id, hexes.join(","));
    }

    #[test]
    fn both_sides_of_a_dm_agree() {
        let alice = Keys::generate().public_key();
        let bob = Keys::generate().public_key();
        assert_eq!(conversation_id([&alice, &bob]), conversation_id([&bob, &alice]));
        assert_ne!(conversation_id([&alice, &bob]), conversation_id([&alice]));
    }

    #[test]
    fn empty_set_is_empty_string() {
        assert_eq!(conversation_id(std::iter::empty::<&PublicKey>()), "");
    }

    #[test]
    fn participants_include_author_and_recipients() {
        let alice = Keys::generate();
        let bob = Keys::generate().public_key();
        let rumor = EventBuilder::new(Kind::PRIVATE_DIRECT_MESSAGE, "hi")
            .tag(Tag::public_key(bob))
            .tag(Tag::public_key(alice.public_key()))
            .tag(Tag::custom("p", ["garbage"]))
            .build(alice.public_key());

        let mut expected = vec![alice.public_key(), bob];
        expected.sort();
        assert_eq!(conversation_participants(&rumor), expected);
    }

    #[test]
    fn extracts_subject_and_reply() {
        let parent = EventId::from_byte_array([7u8; 32]);
        let other = EventId::from_byte_array([8u8; 32]);
        let tags = vec![
            Tag::subject("lunch"),
            Tag::event(parent),
            Tag::event(other),
            Tag::subject("dinner"),
        ];
        assert_eq!(extract_subject(&tags), Some("lunch"));
        assert_eq!(extract_reply_to(&tags), Some(parent));
        assert_eq!(extract_subject(&[]), None);
        assert_eq!(extract_reply_to(&[]), None);
    }

    #[test]
    fn reply_comes_from_the_first_e_tag_only() {
        let parent = EventId::from_byte_array([7u8; 32]);
        let tags = vec![Tag::custom("e", ["nope"]), Tag::event(parent)];
        assert_eq!(extract_reply_to(&tags), None);
    }
}
