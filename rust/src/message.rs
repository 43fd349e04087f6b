//! Client/relay wire frames (JSON arrays over websocket text messages)

use std::fmt;

use serde_json::{json, Value};

use crate::event::{Event, EventId, Filter};

/// Subscription id, unique per connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// 16 random bytes, hex encoded.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Malformed relay frame. Logged and dropped; never fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("frame is not json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a non-empty json array")]
    NotAnArray,
    #[error("unknown frame type {0:?}")]
    UnknownType(String),
    #[error("{frame} frame is missing field {field}")]
    MissingField {
        frame: &'static str,
        field: &'static str,
    },
    #[error("{frame} frame has invalid {field}: {reason}")]
    InvalidField {
        frame: &'static str,
        field: &'static str,
        reason: String,
    },
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Req {
        subscription_id: SubscriptionId,
        filters: Vec<Filter>,
    },
    Close(SubscriptionId),
    Event(Box<Event>),
}

impl ClientMessage {
    pub fn req(subscription_id: SubscriptionId, filters: Vec<Filter>) -> Self {
        Self::Req {
            subscription_id,
            filters,
        }
    }

    pub fn close(subscription_id: SubscriptionId) -> Self {
        Self::Close(subscription_id)
    }

    pub fn event(event: Event) -> Self {
        Self::Event(Box::new(event))
    }

    pub fn as_json(&self) -> String {
        let value = match self {
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = vec![json!("REQ"), json!(subscription_id.as_str())];
                frame.extend(filters.iter().map(|f| json!(f)));
                Value::Array(frame)
            }
            Self::Close(subscription_id) => json!(["CLOSE", subscription_id.as_str()]),
            Self::Event(event) => json!(["EVENT", event]),
        };
        value.to_string()
    }
}

/// Frames received from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: SubscriptionId,
        event: Box<Event>,
    },
    EndOfStoredEvents(SubscriptionId),
    Closed {
        subscription_id: SubscriptionId,
        message: String,
    },
    Notice(String),
    Ok {
        event_id: EventId,
        accepted: bool,
        message: String,
    },
    Auth {
        challenge: String,
    },
}

impl RelayMessage {
    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(text)?;
        let frame = value
            .as_array()
            .filter(|a| !a.is_empty())
            .ok_or(MessageError::NotAnArray)?;
        let kind = frame[0].as_str().ok_or(MessageError::NotAnArray)?;

        match kind {
            "EVENT" => {
                let subscription_id = str_at(frame, 1, "EVENT", "subscription id")?;
                let raw = frame.get(2).ok_or(MessageError::MissingField {
                    frame: "EVENT",
                    field: "event",
                })?;
                let event: Event =
                    serde_json::from_value(raw.clone()).map_err(|e| MessageError::InvalidField {
                        frame: "EVENT",
                        field: "event",
                        reason: e.to_string(),
                    })?;
                Ok(Self::Event {
                    subscription_id: SubscriptionId::new(subscription_id),
                    event: Box::new(event),
                })
            }
            "EOSE" => {
                let subscription_id = str_at(frame, 1, "EOSE", "subscription id")?;
                Ok(Self::EndOfStoredEvents(SubscriptionId::new(subscription_id)))
            }
            "CLOSED" => {
                let subscription_id = str_at(frame, 1, "CLOSED", "subscription id")?;
                let message = frame.get(2).and_then(Value::as_str).unwrap_or_default();
                Ok(Self::Closed {
                    subscription_id: SubscriptionId::new(subscription_id),
                    message: message.to_string(),
                })
            }
            "NOTICE" => Ok(Self::Notice(str_at(frame, 1, "NOTICE", "message")?.to_string())),
            "OK" => {
                let raw_id = str_at(frame, 1, "OK", "event id")?;
                let event_id = EventId::from_hex(raw_id).map_err(|e| MessageError::InvalidField {
                    frame: "OK",
                    field: "event id",
                    reason: e.to_string(),
                })?;
                let accepted = frame
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or(MessageError::MissingField {
                        frame: "OK",
                        field: "accepted",
                    })?;
                let message = frame.get(3).and_then(Value::as_str).unwrap_or_default();
                Ok(Self::Ok {
                    event_id,
                    accepted,
                    message: message.to_string(),
                })
            }
            "AUTH" => Ok(Self::Auth {
                challenge: str_at(frame, 1, "AUTH", "challenge")?.to_string(),
            }),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

fn str_at<'a>(
    frame: &'a [Value],
    index: usize,
    name: &'static str,
    field: &'static str,
) -> Result<&'a str, MessageError> {
    frame
        .get(index)
        .and_then(Value::as_str)
        .ok_or(MessageError::MissingField { frame: name, field })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBuilder, Keys, Kind};

    #[test]
    fn req_frame_lists_every_filter() {
        let sub = SubscriptionId::new("abc");
        let msg = ClientMessage::req(
            sub,
            vec![
                Filter::new().kind(Kind::TEXT_NOTE),
                Filter::new().limit(1),
            ],
        );
        let v: Value = serde_json::from_str(&msg.as_json()).unwrap();
        assert_eq!(v, json!(["REQ", "abc", {"kinds": [1]}, {"limit": 1}]));
    }

    #[test]
    fn close_and_event_frames() {
        let close = ClientMessage::close(SubscriptionId::new("abc"));
        assert_eq!(close.as_json(), r#"["CLOSE","abc"]"#);

        let event = EventBuilder::text_note("x")
            .sign_with_keys(&Keys::generate())
            .unwrap();
        let v: Value = serde_json::from_str(&ClientMessage::event(event.clone()).as_json()).unwrap();
        assert_eq!(v[0], "EVENT");
        assert_eq!(v[1]["id"], event.id.to_hex());
    }

    #[test]
    fn parses_relay_frames() {
        let event = EventBuilder::text_note("x")
            .sign_with_keys(&Keys::generate())
            .unwrap();
        let text = json!(["EVENT", "s1", event]).to_string();
        match RelayMessage::from_json(&text).unwrap() {
            RelayMessage::Event {
                subscription_id,
                event: parsed,
            } => {
                assert_eq!(subscription_id.as_str(), "s1");
                assert_eq!(*parsed, event);
            }
            other => panic!("unexpected frame {other:?}"),
        }

        assert_eq!(
            RelayMessage::from_json(r#"["EOSE","s1"]"#).unwrap(),
            RelayMessage::EndOfStoredEvents(SubscriptionId::new("s1"))
        );
        assert_eq!(
            RelayMessage::from_json(r#"["CLOSED","s1","auth-required: nope"]"#).unwrap(),
            RelayMessage::Closed {
                subscription_id: SubscriptionId::new("s1"),
                message: "auth-required: nope".to_string(),
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["NOTICE","slow down"]"#).unwrap(),
            RelayMessage::Notice("slow down".to_string())
        );

        let ok = json!(["OK", event.id, false, "blocked: spam"]).to_string();
        assert_eq!(
            RelayMessage::from_json(&ok).unwrap(),
            RelayMessage::Ok {
                event_id: event.id,
                accepted: false,
                message: "blocked: spam".to_string(),
            }
        );
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(matches!(
            RelayMessage::from_json("not json"),
            Err(MessageError::Json(_))
        ));
        assert!(matches!(
            RelayMessage::from_json("{}"),
            Err(MessageError::NotAnArray)
        ));
        assert!(matches!(
            RelayMessage::from_json("[]"),
            Err(MessageError::NotAnArray)
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["WAT"]"#),
            Err(MessageError::UnknownType(_))
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["EOSE"]"#),
            Err(MessageError::MissingField { .. })
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["EVENT","s1",{"id":"zz"}]"#),
            Err(MessageError::InvalidField { .. })
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["OK","abcd",true,""]"#),
            Err(MessageError::InvalidField { .. })
        ));
    }
}
