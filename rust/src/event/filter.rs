//! Subscription filters

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::{Event, EventId, Kind, PublicKey, Timestamp};

/// Filter error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    /// Tag filters are keyed by a single ASCII letter
    #[error("invalid tag filter letter {0:?}")]
    InvalidTagLetter(String),
}

/// Tag name usable in a filter (`#e`, `#p`, `#t`, ...): one ASCII letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SingleLetterTag(char);

impl SingleLetterTag {
    pub const E: SingleLetterTag = SingleLetterTag('e');
    pub const P: SingleLetterTag = SingleLetterTag('p');

    pub fn from_char(c: char) -> Result<Self, FilterError> {
        if c.is_ascii_alphabetic() {
            Ok(Self(c))
        } else {
            Err(FilterError::InvalidTagLetter(c.to_string()))
        }
    }

    pub fn as_char(&self) -> char {
        self.0
    }

    fn parse_key(key: &str) -> Result<Self, FilterError> {
        let mut chars = key.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::from_char(c),
            _ => Err(FilterError::InvalidTagLetter(key.to_string())),
        }
    }

    /// True when a tag named `name` is indexed under this letter.
    fn is_name_of(&self, name: &str) -> bool {
        let mut chars = name.chars();
        chars.next() == Some(self.0) && chars.next().is_none()
    }
}

impl fmt::Display for SingleLetterTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// REQ filter. Every populated field must match for an event to match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<BTreeSet<EventId>>,
    pub authors: Option<BTreeSet<PublicKey>>,
    pub kinds: Option<BTreeSet<Kind>>,
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
    pub limit: Option<usize>,
    pub generic_tags: BTreeMap<SingleLetterTag, BTreeSet<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: EventId) -> Self {
        self.ids.get_or_insert_with(BTreeSet::new).insert(id);
        self
    }

    pub fn ids<I: IntoIterator<Item = EventId>>(mut self, ids: I) -> Self {
        self.ids.get_or_insert_with(BTreeSet::new).extend(ids);
        self
    }

    pub fn author(mut self, author: PublicKey) -> Self {
        self.authors.get_or_insert_with(BTreeSet::new).insert(author);
        self
    }

    pub fn authors<I: IntoIterator<Item = PublicKey>>(mut self, authors: I) -> Self {
        self.authors.get_or_insert_with(BTreeSet::new).extend(authors);
        self
    }

    pub fn kind(mut self, kind: Kind) -> Self {
        self.kinds.get_or_insert_with(BTreeSet::new).insert(kind);
        self
    }

    pub fn kinds<I: IntoIterator<Item = Kind>>(mut self, kinds: I) -> Self {
        self.kinds.get_or_insert_with(BTreeSet::new).extend(kinds);
        self
    }

    /// Inclusive lower bound on `created_at`.
    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    /// Inclusive upper bound on `created_at`.
    pub fn until(mut self, until: Timestamp) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn custom_tag<I, S>(mut self, tag: SingleLetterTag, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.generic_tags
            .entry(tag)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// `#p` filter.
    pub fn pubkey(self, pubkey: PublicKey) -> Self {
        self.custom_tag(SingleLetterTag::P, [pubkey.to_hex()])
    }

    /// `#e` filter.
    pub fn event(self, id: EventId) -> Self {
        self.custom_tag(SingleLetterTag::E, [id.to_hex()])
    }

    pub fn match_event(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        self.generic_tags.iter().all(|(letter, values)| {
            event
                .tags
                .iter()
                .filter(|t| t.name().is_some_and(|name| letter.is_name_of(name)))
                .filter_map(|t| t.content())
                .any(|v| values.contains(v))
        })
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(ids) = &self.ids {
            map.serialize_entry("ids", ids)?;
        }
        if let Some(authors) = &self.authors {
            map.serialize_entry("authors", authors)?;
        }
        if let Some(kinds) = &self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        for (letter, values) in &self.generic_tags {
            map.serialize_entry(&format!("#{letter}"), values)?;
        }
        if let Some(since) = &self.since {
            map.serialize_entry("since", since)?;
        }
        if let Some(until) = &self.until {
            map.serialize_entry("until", until)?;
        }
        if let Some(limit) = &self.limit {
            map.serialize_entry("limit", limit)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Map::<String, Value>::deserialize(deserializer)?;
        let mut filter = Filter::new();
        for (key, value) in raw {
            match key.as_str() {
                "ids" => filter.ids = Some(serde_json::from_value(value).map_err(D::Error::custom)?),
                "authors" => {
                    filter.authors = Some(serde_json::from_value(value).map_err(D::Error::custom)?)
                }
                "kinds" => {
                    filter.kinds = Some(serde_json::from_value(value).map_err(D::Error::custom)?)
                }
                "since" => {
                    filter.since = Some(serde_json::from_value(value).map_err(D::Error::custom)?)
                }
                "until" => {
                    filter.until = Some(serde_json::from_value(value).map_err(D::Error::custom)?)
                }
                "limit" => {
                    filter.limit = Some(serde_json::from_value(value).map_err(D::Error::custom)?)
                }
                other => {
                    if let Some(letter) = other.strip_prefix('#') {
                        let tag = SingleLetterTag::parse_key(letter).map_err(D::Error::custom)?;
                        let values: BTreeSet<String> =
                            serde_json::from_value(value).map_err(D::Error::custom)?;
                        filter.generic_tags.insert(tag, values);
                    }
                    // Unknown keys (e.g. NIP-50 `search`) are ignored.
                }
            }
        }
        Ok(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBuilder, Keys, Tag};

    #[test]
    fn single_letter_tag_rejects_non_letters() {
        assert!(SingleLetterTag::from_char('t').is_ok());
        assert!(SingleLetterTag::from_char('Z').is_ok());
        assert!(SingleLetterTag::from_char('1').is_err());
        assert!(SingleLetterTag::from_char('é').is_err());
    }

    #[test]
    fn serializes_tag_filters_with_hash_keys() {
        let pk = Keys::generate().public_key();
        let filter = Filter::new()
            .kind(Kind::GIFT_WRAP)
            .pubkey(pk)
            .since(Timestamp::from_secs(10))
            .limit(5);
        let v = serde_json::to_value(&filter).unwrap();
        assert_eq!(v["kinds"], serde_json::json!([1059]));
        assert_eq!(v["#p"], serde_json::json!([pk.to_hex()]));
        assert_eq!(v["since"], 10);
        assert_eq!(v["limit"], 5);
        assert!(v.get("authors").is_none());

        let back: Filter = serde_json::from_value(v).unwrap();
        assert_eq!(back, filter);
    }

    #[test]
    fn deserialize_rejects_multi_letter_tag_keys() {
        let err = serde_json::from_str::<Filter>(r##"{"#pp": ["x"]}"##);
        assert!(err.is_err());
        let ok = serde_json::from_str::<Filter>(r#"{"search": "x", "kinds": [1]}"#).unwrap();
        assert_eq!(ok, Filter::new().kind(Kind::TEXT_NOTE));
    }

    #[test]
    fn match_event_checks_every_field() {
        let keys = Keys::generate();
        let peer = Keys::generate().public_key();
        let event = EventBuilder::text_note("hi")
            .custom_created_at(Timestamp::from_secs(100))
            .tag(Tag::public_key(peer))
            .sign_with_keys(&keys)
            .unwrap();

        assert!(Filter::new().match_event(&event));
        assert!(Filter::new()
            .author(keys.public_key())
            .kind(Kind::TEXT_NOTE)
            .pubkey(peer)
            .since(Timestamp::from_secs(100))
            .until(Timestamp::from_secs(100))
            .match_event(&event));
        assert!(!Filter::new().kind(Kind::METADATA).match_event(&event));
        assert!(!Filter::new().author(peer).match_event(&event));
        assert!(!Filter::new().since(Timestamp::from_secs(101)).match_event(&event));
        assert!(!Filter::new().pubkey(keys.public_key()).match_event(&event));
        assert!(Filter::new().id(event.id).match_event(&event));
    }

    #[test]
    fn tag_filters_match_single_letter_names_only() {
        let keys = Keys::generate();
        let t = SingleLetterTag::from_char('t').unwrap();
        let event = EventBuilder::text_note("hi")
            .tag(Tag::custom("title", ["rust"]))
            .tag(Tag::custom("t", ["nostr"]))
            .sign_with_keys(&keys)
            .unwrap();

        assert!(Filter::new().custom_tag(t, ["nostr"]).match_event(&event));
        assert!(!Filter::new().custom_tag(t, ["rust"]).match_event(&event));
        assert!(t.is_name_of("t"));
        assert!(!t.is_name_of("title"));
        assert!(!t.is_name_of(""));
    }
}
