use serde::{Deserialize, Serialize};

use super::{EventId, PublicKey};

pub const TAG_PUBLIC_KEY: &str = "p";
pub const TAG_EVENT: &str = "e";
pub const TAG_SUBJECT: &str = "subject";

/// One event tag: a name followed by its values, e.g. `["p", <hex>, <relay>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(Vec<String>);

impl Tag {
    pub fn custom<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parts = vec![name.into()];
        parts.extend(values.into_iter().map(Into::into));
        Self(parts)
    }

    pub fn public_key(pubkey: PublicKey) -> Self {
        Self::custom(TAG_PUBLIC_KEY, [pubkey.to_hex()])
    }

    /// `p` tag carrying a relay hint.
    pub fn public_key_with_relay(pubkey: PublicKey, relay: impl Into<String>) -> Self {
        Self::custom(TAG_PUBLIC_KEY, [pubkey.to_hex(), relay.into()])
    }

    pub fn event(id: EventId) -> Self {
        Self::custom(TAG_EVENT, [id.to_hex()])
    }

    pub fn subject(subject: impl Into<String>) -> Self {
        Self::custom(TAG_SUBJECT, [subject.into()])
    }

    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the name.
    pub fn content(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}
