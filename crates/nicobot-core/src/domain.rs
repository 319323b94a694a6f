use std::fmt;

use crate::{errors::Error, Result};

/// Transport identity: a phone number for Signal, a JID for XMPP.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity(pub String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Group identifier (base64 for Signal).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupId(pub String);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where outbound messages go. Recipient and group are mutually exclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    Recipient(Identity),
    Group(GroupId),
}

impl Destination {
    /// Validate a raw recipient/group pair: exactly one must be set.
    pub fn from_parts(recipient: Option<String>, group: Option<String>) -> Result<Self> {
        let recipient = recipient.filter(|r| !r.trim().is_empty());
        let group = group.filter(|g| !g.trim().is_empty());
        match (recipient, group) {
            (Some(_), Some(_)) => Err(Error::Config(
                "only one of recipient and group may be given".to_string(),
            )),
            (None, None) => Err(Error::Config(
                "either a recipient or a group must be given".to_string(),
            )),
            (Some(r), None) => Ok(Destination::Recipient(Identity(r))),
            (None, Some(g)) => Ok(Destination::Group(GroupId(g))),
        }
    }

    pub fn recipient(&self) -> Option<&Identity> {
        match self {
            Destination::Recipient(r) => Some(r),
            Destination::Group(_) => None,
        }
    }

    pub fn group(&self) -> Option<&GroupId> {
        match self {
            Destination::Group(g) => Some(g),
            Destination::Recipient(_) => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Recipient(r) => write!(f, "recipient {r}"),
            Destination::Group(g) => write!(f, "group {g}"),
        }
    }
}
