use async_trait::async_trait;

use nicobot_core::Result;

use crate::stanza::{IqFailure, Jid, OutboundMessage, Stanza};

/// Events produced by an XMPP client stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XmppEvent {
    /// Authentication finished and the session is bound.
    SessionStart,
    Stanza(Stanza),
    Disconnected,
}

/// Port over an authenticated client-to-server stream.
///
/// Implementations own the socket, TLS and SASL; request/response timeouts
/// are theirs too and surface as `IqFailure::Timeout`.
#[async_trait]
pub trait XmppConnection: Send + Sync {
    /// Begin connecting. Completion is signalled by `XmppEvent::SessionStart`,
    /// not by this call returning.
    async fn open(&self) -> Result<()>;

    /// Next stream event. Errors here are connection-level (auth, stream).
    async fn next_event(&self) -> Result<XmppEvent>;

    async fn send_presence(&self) -> Result<()>;

    async fn fetch_roster(&self) -> std::result::Result<Vec<Jid>, IqFailure>;

    async fn send_message(&self, msg: OutboundMessage) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}
