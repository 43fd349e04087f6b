use pika_relay_profiles::RelayUrlError;

use crate::crypto::CodecError;
use crate::envelope::EnvelopeError;
use crate::event::{EventError, FilterError, KeyError};
use crate::message::MessageError;
use crate::relay::RelayError;

/// Any error this crate can produce
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Relay(#[from] RelayError),
    /// Malformed wire frame
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    InvalidEndpoint(#[from] RelayUrlError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
