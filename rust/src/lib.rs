//! Relay connection pool and gift-wrapped private messaging for pika.

pub mod conversation;
pub mod crypto;
pub mod envelope;
mod error;
pub mod event;
mod logging;
pub mod message;
mod options;
pub mod relay;

pub use pika_relay_profiles::{parse_relay_configs, RelayConfig, RelayUrl, RelayUrlError};

pub use crate::conversation::{
    conversation_id, conversation_participants, extract_reply_to, extract_subject,
};
pub use crate::crypto::{
    CodecError, DirectMessage, DirectMessageOptions, EncryptionScheme, MessageCodec,
};
pub use crate::envelope::{
    gift_wrap, private_message_rumor, unwrap_gift_wrap, unwrap_many, wrap_for_participants,
    EnvelopeError, PrivateMessageOptions, UnwrappedGift,
};
pub use crate::error::{Error, Result};
pub use crate::event::{
    Event, EventBuilder, EventId, Filter, Keys, Kind, PublicKey, SecretKey, Tag, Timestamp,
    UnsignedEvent,
};
pub use crate::logging::init_logging;
pub use crate::message::SubscriptionId;
pub use crate::options::PoolOptions;
pub use crate::relay::{
    ConnectionStatus, PublishOptions, PublishOutput, PublishResult, QueryOptions, QueryOutput,
    ReconcileReport, RelayError, RelayEvent, RelayInfo, RelayPool, RelaySubscription,
    StatusChange, StatusSubscription,
};

/// Pin the rustls crypto provider before any `wss://` connection is made.
pub fn init_rustls_crypto_provider() {
    pika_tls::init_rustls_crypto_provider();
}
