//! Typed view of `signal-cli receive --json` output and the inbound filter.

use std::fmt;

use serde::Deserialize;

use nicobot_core::{
    domain::{Destination, Identity},
    messaging::types::InboundEvent,
    utils::epoch_millis,
};

/// One line of relay output.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RelayEvent {
    #[serde(default)]
    pub envelope: Option<Envelope>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub source: Option<String>,
    // Newer relays split the number out of `source`.
    #[serde(default)]
    pub source_number: Option<String>,
    #[serde(default)]
    pub data_message: Option<DataMessage>,
}

impl Envelope {
    pub fn sender(&self) -> Option<&str> {
        non_empty(&self.source).or_else(|| non_empty(&self.source_number))
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub group_info: Option<GroupInfo>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    #[serde(default)]
    pub group_id: Option<String>,
}

/// Session start, in relay timestamp units (ms since the epoch).
///
/// Anything stamped at or before it predates the listener, including echoes
/// of our own sends through the same account. Two messages sharing a
/// timestamp or a skewed relay clock defeat this guard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionClock(pub i64);

impl SessionClock {
    pub fn now() -> Self {
        Self(epoch_millis())
    }

    pub fn admits(self, timestamp: i64) -> bool {
        timestamp > self.0
    }
}

impl fmt::Display for SessionClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why an event did not reach the bot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Discard {
    NoEnvelope,
    NoData,
    NoText,
    BeforeSession { timestamp: i64 },
    NotFromRecipient { source: Option<String> },
    NotFromGroup { group: Option<String> },
}

impl fmt::Display for Discard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discard::NoEnvelope => f.write_str("event without envelope"),
            Discard::NoData => f.write_str("message without data"),
            Discard::NoText => f.write_str("message without text"),
            Discard::BeforeSession { timestamp } => {
                write!(f, "message sent before the session started ({timestamp})")
            }
            Discard::NotFromRecipient { source } => {
                write!(f, "message not from recipient (source {source:?})")
            }
            Discard::NotFromGroup { group } => {
                write!(f, "message not from group (group {group:?})")
            }
        }
    }
}

/// Filter pipeline: data with text, then timestamp, then addressing.
pub fn filter_event(
    event: &RelayEvent,
    clock: SessionClock,
    destination: &Destination,
) -> Result<InboundEvent, Discard> {
    let envelope = event.envelope.as_ref().ok_or(Discard::NoEnvelope)?;
    let data = envelope.data_message.as_ref().ok_or(Discard::NoData)?;
    let text = data
        .message
        .as_deref()
        .filter(|m| !m.is_empty())
        .ok_or(Discard::NoText)?;

    if !clock.admits(envelope.timestamp) {
        return Err(Discard::BeforeSession {
            timestamp: envelope.timestamp,
        });
    }

    let source = envelope.sender();
    match destination {
        Destination::Recipient(recipient) => {
            if source != Some(recipient.as_str()) {
                return Err(Discard::NotFromRecipient {
                    source: source.map(str::to_string),
                });
            }
        }
        Destination::Group(group) => {
            let got = data
                .group_info
                .as_ref()
                .and_then(|g| g.group_id.as_deref());
            if got != Some(group.0.as_str()) {
                return Err(Discard::NotFromGroup {
                    group: got.map(str::to_string),
                });
            }
        }
    }

    Ok(InboundEvent::new(
        text,
        Identity::new(source.unwrap_or_default()),
    ))
}
