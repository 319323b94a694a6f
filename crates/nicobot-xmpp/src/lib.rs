//! XMPP chatter with OMEMO end-to-end encryption.
//!
//! The wire stack and the encryption library are ports
//! (`XmppConnection`, `OmemoEngine`). `client::TokioXmppConnection` is the
//! network implementation of the first. This crate owns the policy around
//! them: which stanzas reach the bot, how decrypt failures are handled, and
//! how an outbound message resolves device trust and missing bundles.

pub mod client;
pub mod connection;
pub mod decrypt;
pub mod encrypt;
pub mod loopback;
pub mod omemo;
pub mod session;
pub mod stanza;
pub mod trust;

#[cfg(test)]
mod fakes;

pub use client::TokioXmppConnection;
pub use connection::{XmppConnection, XmppEvent};
pub use omemo::{DisabledOmemo, OmemoEngine, OmemoError};
pub use session::EncryptedXmppSession;
pub use stanza::{Jid, MessageKind};
