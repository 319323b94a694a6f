//! Minimal stanza model: just what the session needs to route messages.

use std::fmt;

use nicobot_core::{errors::Error, Result};

/// Jabber identifier (`local@domain/resource`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid(String);

impl Jid {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(Error::Config(format!("invalid JID: {s:?}")));
        }
        if s.starts_with('@') || s.starts_with('/') {
            return Err(Error::Config(format!("invalid JID: {s:?}")));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// JID without its resource part.
    pub fn bare(&self) -> Jid {
        match self.0.split_once('/') {
            Some((bare, _)) => Jid(bare.to_string()),
            None => self.clone(),
        }
    }

    pub fn resource(&self) -> Option<&str> {
        self.0.split_once('/').map(|(_, r)| r)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `type` attribute of a message stanza.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Chat,
    Normal,
    Groupchat,
    Headline,
    Error,
}

impl MessageKind {
    /// Direct and group chat messages; everything else is not for the bot.
    pub fn is_conversational(self) -> bool {
        matches!(
            self,
            MessageKind::Chat | MessageKind::Normal | MessageKind::Groupchat
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Chat => "chat",
            MessageKind::Normal => "normal",
            MessageKind::Groupchat => "groupchat",
            MessageKind::Headline => "headline",
            MessageKind::Error => "error",
        }
    }
}

/// OMEMO device id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One per-device key of an `<encrypted/>` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedKey {
    pub rid: DeviceId,
    pub prekey: bool,
    pub data: Vec<u8>,
}

/// Contents of an `<encrypted xmlns='eu.siacs.conversations.axolotl'/>` element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedPayload {
    /// Sending device.
    pub sid: DeviceId,
    pub keys: Vec<EncryptedKey>,
    pub iv: Vec<u8>,
    /// Absent for key-transport messages.
    pub payload: Option<Vec<u8>>,
}

/// Explicit message encryption marker (XEP-0380).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Eme {
    pub namespace: &'static str,
    pub name: &'static str,
}

pub const OMEMO_EME: Eme = Eme {
    namespace: "eu.siacs.conversations.axolotl",
    name: "OMEMO",
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: Jid,
    pub kind: MessageKind,
    pub body: Option<String>,
    pub encrypted: Option<EncryptedPayload>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub to: Jid,
    pub kind: MessageKind,
    pub body: Option<String>,
    pub encrypted: Option<EncryptedPayload>,
    pub eme: Option<Eme>,
}

impl OutboundMessage {
    pub fn plain(to: Jid, kind: MessageKind, body: impl Into<String>) -> Self {
        Self {
            to,
            kind,
            body: Some(body.into()),
            encrypted: None,
            eme: None,
        }
    }

    pub fn encrypted(to: Jid, kind: MessageKind, payload: EncryptedPayload) -> Self {
        Self {
            to,
            kind,
            body: None,
            encrypted: Some(payload),
            eme: Some(OMEMO_EME),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stanza {
    Message(InboundMessage),
    Presence { from: Jid },
    Iq { from: Option<Jid> },
}

impl Stanza {
    pub fn describe(&self) -> String {
        match self {
            Stanza::Message(m) => format!("message of type {} from {}", m.kind.as_str(), m.from),
            Stanza::Presence { from } => format!("presence from {from}"),
            Stanza::Iq { from } => match from {
                Some(f) => format!("iq from {f}"),
                None => "iq".to_string(),
            },
        }
    }
}

/// Failure of an iq request/response (roster, device list, bundle fetch).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IqFailure {
    #[error("iq error: {0}")]
    Error(String),
    #[error("iq timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_strips_resource() {
        let j = Jid::parse("bot@conversations.im/Conversations.7Z6J").unwrap();
        assert_eq!(j.bare().as_str(), "bot@conversations.im");
        assert_eq!(j.resource(), Some("Conversations.7Z6J"));

        let bare = Jid::parse("bot@conversations.im").unwrap();
        assert_eq!(bare.bare(), bare);
        assert_eq!(bare.resource(), None);
    }

    #[test]
    fn rejects_malformed_jids() {
        assert!(Jid::parse("").is_err());
        assert!(Jid::parse("a b@example.org").is_err());
        assert!(Jid::parse("@example.org").is_err());
    }

    #[test]
    fn only_chat_like_messages_are_conversational() {
        assert!(MessageKind::Chat.is_conversational());
        assert!(MessageKind::Normal.is_conversational());
        assert!(MessageKind::Groupchat.is_conversational());
        assert!(!MessageKind::Error.is_conversational());
        assert!(!MessageKind::Headline.is_conversational());
    }
}
