//! `XmppConnection` over a real client stream (`tokio-xmpp`).
//!
//! One driver task owns the split client. Commands (stanzas, iq requests,
//! stream end) come in over a channel; parsed events go out over another.
//! Iq responses are matched to their request by id.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_xmpp::{AsyncClient, Event, Packet};
use xmpp_parsers::{
    eme::ExplicitMessageEncryption,
    iq::{Iq, IqType},
    jid::{BareJid, Jid as XmppJid},
    legacy_omemo,
    message::{Body, Message, MessageType},
    minidom::Element,
    ns,
    presence::{self, Presence},
    roster::Roster,
    stanza_error::{DefinedCondition, ErrorType, StanzaError},
};

use nicobot_core::{config::XmppConfig, errors::Error, Result};

use crate::{
    connection::{XmppConnection, XmppEvent},
    stanza::{
        DeviceId, EncryptedKey, EncryptedPayload, InboundMessage, IqFailure, Jid, MessageKind,
        OutboundMessage, Stanza,
    },
};

/// How long an iq request waits for its response.
pub const DEFAULT_IQ_TIMEOUT: Duration = Duration::from_secs(30);

type Client = AsyncClient<tokio_xmpp::starttls::ServerConfig>;
type IqReply = std::result::Result<Option<Element>, IqFailure>;

enum Command {
    Stanza(Element),
    Iq {
        id: String,
        request: Element,
        reply: oneshot::Sender<IqReply>,
    },
    End,
}

pub struct TokioXmppConnection {
    jid: BareJid,
    password: String,
    iq_timeout: Duration,
    next_id: AtomicU64,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    events: AsyncMutex<Option<mpsc::UnboundedReceiver<Result<XmppEvent>>>>,
}

impl TokioXmppConnection {
    pub fn new(cfg: &XmppConfig) -> Result<Self> {
        let jid = BareJid::new(cfg.jid.as_str())
            .map_err(|e| Error::Config(format!("invalid JID {}: {e}", cfg.jid)))?;
        if cfg.password.is_empty() {
            return Err(Error::Config("missing XMPP password".to_string()));
        }
        Ok(Self {
            jid,
            password: cfg.password.clone(),
            iq_timeout: DEFAULT_IQ_TIMEOUT,
            next_id: AtomicU64::new(1),
            commands: Mutex::new(None),
            events: AsyncMutex::new(None),
        })
    }

    fn command(&self, cmd: Command) -> Result<()> {
        let commands = self.commands.lock().unwrap_or_else(|p| p.into_inner());
        let Some(tx) = commands.as_ref() else {
            return Err(Error::Connection(format!("{} is not connected", self.jid)));
        };
        tx.send(cmd)
            .map_err(|_| Error::Connection(format!("{} stream is closed", self.jid)))
    }

    async fn request(&self, id: String, request: Element) -> IqReply {
        let (reply, response) = oneshot::channel();
        self.command(Command::Iq { id, request, reply })
            .map_err(|e| IqFailure::Error(e.to_string()))?;
        match tokio::time::timeout(self.iq_timeout, response).await {
            Err(_) => Err(IqFailure::Timeout),
            Ok(Err(_)) => Err(IqFailure::Error("stream closed".to_string())),
            Ok(Ok(reply)) => reply,
        }
    }
}

#[async_trait]
impl XmppConnection for TokioXmppConnection {
    async fn open(&self) -> Result<()> {
        let ev_rx = {
            let mut commands = self.commands.lock().unwrap_or_else(|p| p.into_inner());
            if commands.is_some() {
                return Ok(());
            }

            let mut client: Client = AsyncClient::new(self.jid.clone(), self.password.clone());
            client.set_reconnect(false);
            let (sink, stream) = client.split();

            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let (ev_tx, ev_rx) = mpsc::unbounded_channel();
            tokio::spawn(drive(sink, stream, cmd_rx, ev_tx));
            *commands = Some(cmd_tx);
            ev_rx
        };
        *self.events.lock().await = Some(ev_rx);
        tracing::debug!("Connecting to the server of {}", self.jid);
        Ok(())
    }

    async fn next_event(&self) -> Result<XmppEvent> {
        let mut events = self.events.lock().await;
        let Some(rx) = events.as_mut() else {
            return Err(Error::Connection(format!("{} is not connected", self.jid)));
        };
        rx.recv().await.unwrap_or(Ok(XmppEvent::Disconnected))
    }

    async fn send_presence(&self) -> Result<()> {
        self.command(Command::Stanza(Presence::new(presence::Type::None).into()))
    }

    async fn fetch_roster(&self) -> std::result::Result<Vec<Jid>, IqFailure> {
        let id = format!("nicobot-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = Iq::from_get(
            id.clone(),
            Roster {
                ver: None,
                items: Vec::new(),
            },
        );
        let Some(payload) = self.request(id, request.into()).await? else {
            return Ok(Vec::new());
        };
        let roster = Roster::try_from(payload)
            .map_err(|e| IqFailure::Error(format!("bad roster: {e:?}")))?;
        Ok(roster
            .items
            .iter()
            .filter_map(|item| Jid::parse(&item.jid.to_string()).ok())
            .collect())
    }

    async fn send_message(&self, msg: OutboundMessage) -> Result<()> {
        self.command(Command::Stanza(outbound_element(msg)?))
    }

    async fn disconnect(&self) -> Result<()> {
        let tx = self
            .commands
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(Command::End);
        }
        Ok(())
    }
}

async fn drive(
    mut sink: SplitSink<Client, Packet>,
    mut stream: SplitStream<Client>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Result<XmppEvent>>,
) {
    let mut online = false;
    let mut pending: HashMap<String, oneshot::Sender<IqReply>> = HashMap::new();

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Stanza(el)) => {
                    if let Err(e) = sink.send(Packet::Stanza(el)).await {
                        tracing::warn!("Could not write stanza: {e}");
                    }
                }
                Some(Command::Iq { id, request, reply }) => {
                    match sink.send(Packet::Stanza(request)).await {
                        Ok(()) => {
                            pending.insert(id, reply);
                        }
                        Err(e) => {
                            let _ = reply.send(Err(IqFailure::Error(e.to_string())));
                        }
                    }
                }
                Some(Command::End) | None => {
                    let _ = sink.send(Packet::StreamEnd).await;
                    let _ = events.send(Ok(XmppEvent::Disconnected));
                    break;
                }
            },
            event = stream.next() => match event {
                Some(Event::Online { bound_jid, .. }) => {
                    online = true;
                    tracing::debug!("Bound as {bound_jid}");
                    let _ = events.send(Ok(XmppEvent::SessionStart));
                }
                Some(Event::Stanza(el)) => {
                    if el.name() == "iq" {
                        if let Some(answer) = handle_iq(el.clone(), &mut pending) {
                            if let Err(e) = sink.send(Packet::Stanza(answer)).await {
                                tracing::warn!("Could not answer iq: {e}");
                            }
                        }
                    }
                    match inbound_stanza(el) {
                        Some(stanza) => {
                            let _ = events.send(Ok(XmppEvent::Stanza(stanza)));
                        }
                        None => tracing::trace!("Ignoring unparsable stanza"),
                    }
                }
                Some(Event::Disconnected(e)) => {
                    let event = if online {
                        tracing::info!("Stream closed: {e}");
                        Ok(XmppEvent::Disconnected)
                    } else {
                        Err(Error::Connection(format!("could not log in: {e}")))
                    };
                    let _ = events.send(event);
                    break;
                }
                None => {
                    let _ = events.send(Ok(XmppEvent::Disconnected));
                    break;
                }
            },
        }
    }
    // Dropping the senders wakes every pending iq with a closed-channel error.
    pending.clear();
}

/// Resolve a pending request, or build the answer to a server request.
fn handle_iq(
    el: Element,
    pending: &mut HashMap<String, oneshot::Sender<IqReply>>,
) -> Option<Element> {
    let iq = Iq::try_from(el).ok()?;
    match iq.payload {
        IqType::Result(payload) => {
            if let Some(reply) = pending.remove(&iq.id) {
                let _ = reply.send(Ok(payload));
            }
            None
        }
        IqType::Error(err) => {
            if let Some(reply) = pending.remove(&iq.id) {
                let _ = reply.send(Err(IqFailure::Error(format!("{:?}", err.defined_condition))));
            }
            None
        }
        IqType::Get(payload) | IqType::Set(payload) => {
            let to = iq.from?;
            if payload.is("ping", ns::PING) {
                return Some(Iq::empty_result(to, iq.id).into());
            }
            let refusal = StanzaError::new(
                ErrorType::Cancel,
                DefinedCondition::ServiceUnavailable,
                "en",
                "not supported",
            );
            Some(Iq::from_error(iq.id, refusal).with_to(to).into())
        }
    }
}

fn message_kind(t: &MessageType) -> MessageKind {
    match t {
        MessageType::Chat => MessageKind::Chat,
        MessageType::Error => MessageKind::Error,
        MessageType::Groupchat => MessageKind::Groupchat,
        MessageType::Headline => MessageKind::Headline,
        MessageType::Normal => MessageKind::Normal,
    }
}

fn message_type(kind: MessageKind) -> MessageType {
    match kind {
        MessageKind::Chat => MessageType::Chat,
        MessageKind::Error => MessageType::Error,
        MessageKind::Groupchat => MessageType::Groupchat,
        MessageKind::Headline => MessageType::Headline,
        MessageKind::Normal => MessageType::Normal,
    }
}

fn own_jid(jid: &XmppJid) -> Option<Jid> {
    Jid::parse(jid.as_str()).ok()
}

/// Map a received element onto the stanza model. `None` for anything that
/// is not a message, presence or iq, or that lacks a sender.
fn inbound_stanza(el: Element) -> Option<Stanza> {
    match el.name() {
        "message" => {
            let mut message = Message::try_from(el).ok()?;
            let encrypted = match message.extract_payload::<legacy_omemo::Encrypted>() {
                Ok(found) => found.map(encrypted_payload),
                Err(e) => {
                    tracing::debug!("Malformed OMEMO element: {e}");
                    None
                }
            };
            let body = message
                .get_best_body(Vec::new())
                .map(|(_, body)| body.0.clone());
            Some(Stanza::Message(InboundMessage {
                from: own_jid(message.from.as_ref()?)?,
                kind: message_kind(&message.type_),
                body,
                encrypted,
            }))
        }
        "presence" => {
            let presence = Presence::try_from(el).ok()?;
            Some(Stanza::Presence {
                from: own_jid(presence.from.as_ref()?)?,
            })
        }
        "iq" => {
            let from = el.attr("from").and_then(|f| Jid::parse(f).ok());
            Some(Stanza::Iq { from })
        }
        _ => None,
    }
}

fn encrypted_payload(enc: legacy_omemo::Encrypted) -> EncryptedPayload {
    EncryptedPayload {
        sid: DeviceId(enc.header.sid),
        keys: enc
            .header
            .keys
            .into_iter()
            .map(|k| EncryptedKey {
                rid: DeviceId(k.rid),
                prekey: k.prekey == legacy_omemo::IsPreKey::True,
                data: k.data,
            })
            .collect(),
        iv: enc.header.iv.data,
        payload: enc.payload.map(|p| p.data),
    }
}

fn legacy_encrypted(p: EncryptedPayload) -> legacy_omemo::Encrypted {
    legacy_omemo::Encrypted {
        header: legacy_omemo::Header {
            sid: p.sid.0,
            keys: p
                .keys
                .into_iter()
                .map(|k| legacy_omemo::Key {
                    rid: k.rid.0,
                    prekey: if k.prekey {
                        legacy_omemo::IsPreKey::True
                    } else {
                        legacy_omemo::IsPreKey::False
                    },
                    data: k.data,
                })
                .collect(),
            iv: legacy_omemo::IV { data: p.iv },
        },
        payload: p.payload.map(|data| legacy_omemo::Payload { data }),
    }
}

fn outbound_element(msg: OutboundMessage) -> Result<Element> {
    let to = XmppJid::new(msg.to.as_str())
        .map_err(|e| Error::Config(format!("invalid recipient {}: {e}", msg.to)))?;
    let mut message = Message::new_with_type(message_type(msg.kind), Some(to));
    if let Some(body) = msg.body {
        message.bodies.insert(String::new(), Body(body));
    }
    if let Some(payload) = msg.encrypted {
        message = message.with_payload(legacy_encrypted(payload));
    }
    if let Some(eme) = msg.eme {
        message = message.with_payload(ExplicitMessageEncryption {
            namespace: eme.namespace.to_string(),
            name: Some(eme.name.to_string()),
        });
    }
    Ok(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::OMEMO_EME;
    use nicobot_core::domain::Identity;

    fn el(xml: &str) -> Element {
        xml.parse().unwrap()
    }

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    #[test]
    fn chat_message_maps_to_inbound() {
        let stanza = inbound_stanza(el(
            "<message xmlns='jabber:client' from='alice@example.org/phone' to='bot@example.org' type='chat'>\
               <body>Hello</body>\
             </message>",
        ));
        assert_eq!(
            stanza,
            Some(Stanza::Message(InboundMessage {
                from: jid("alice@example.org/phone"),
                kind: MessageKind::Chat,
                body: Some("Hello".to_string()),
                encrypted: None,
            }))
        );
    }

    #[test]
    fn omemo_element_is_extracted() {
        let stanza = inbound_stanza(el(
            "<message xmlns='jabber:client' from='alice@example.org/phone' type='chat'>\
               <body>I sent you an OMEMO encrypted message</body>\
               <encrypted xmlns='eu.siacs.conversations.axolotl'>\
                 <header sid='27183'>\
                   <key rid='31415' prekey='true'>AQID</key>\
                   <iv>BAUG</iv>\
                 </header>\
                 <payload>BwgJ</payload>\
               </encrypted>\
               <encryption xmlns='urn:xmpp:eme:0' namespace='eu.siacs.conversations.axolotl' name='OMEMO'/>\
             </message>",
        ));
        let Some(Stanza::Message(msg)) = stanza else {
            panic!("expected a message, got {stanza:?}");
        };
        let payload = msg.encrypted.unwrap();
        assert_eq!(payload.sid, DeviceId(27183));
        assert_eq!(payload.keys.len(), 1);
        assert_eq!(payload.keys[0].rid, DeviceId(31415));
        assert!(payload.keys[0].prekey);
        assert_eq!(payload.keys[0].data, vec![1, 2, 3]);
        assert_eq!(payload.iv, vec![4, 5, 6]);
        assert_eq!(payload.payload, Some(vec![7, 8, 9]));
    }

    #[test]
    fn message_without_sender_is_ignored() {
        let stanza = inbound_stanza(el(
            "<message xmlns='jabber:client' type='chat'><body>x</body></message>",
        ));
        assert_eq!(stanza, None);
    }

    #[test]
    fn presence_and_iq_keep_their_sender() {
        assert_eq!(
            inbound_stanza(el("<presence xmlns='jabber:client' from='alice@example.org/phone'/>")),
            Some(Stanza::Presence {
                from: jid("alice@example.org/phone")
            })
        );
        assert_eq!(
            inbound_stanza(el("<iq xmlns='jabber:client' type='result' id='r1'/>")),
            Some(Stanza::Iq { from: None })
        );
    }

    #[test]
    fn encrypted_outbound_carries_eme_and_no_body() {
        let msg = OutboundMessage::encrypted(
            jid("alice@example.org"),
            MessageKind::Chat,
            EncryptedPayload {
                sid: DeviceId(1),
                keys: vec![EncryptedKey {
                    rid: DeviceId(2),
                    prekey: false,
                    data: vec![1, 2, 3],
                }],
                iv: vec![4, 5, 6],
                payload: Some(vec![7, 8, 9]),
            },
        );
        let element = outbound_element(msg).unwrap();
        assert_eq!(element.attr("to"), Some("alice@example.org"));
        assert_eq!(element.attr("type"), Some("chat"));
        assert!(element.get_child("body", ns::DEFAULT_NS).is_none());

        let eme = element.get_child("encryption", ns::EME).unwrap();
        assert_eq!(eme.attr("namespace"), Some(OMEMO_EME.namespace));
        assert_eq!(eme.attr("name"), Some(OMEMO_EME.name));

        let encrypted = element.get_child("encrypted", ns::LEGACY_OMEMO).unwrap();
        let parsed = legacy_omemo::Encrypted::try_from(encrypted.clone()).unwrap();
        assert_eq!(parsed.header.sid, 1);
        assert_eq!(parsed.payload.unwrap().data, vec![7, 8, 9]);
    }

    #[test]
    fn plain_outbound_has_a_body() {
        let element =
            outbound_element(OutboundMessage::plain(jid("alice@example.org"), MessageKind::Chat, "hi"))
                .unwrap();
        let body = element.get_child("body", ns::DEFAULT_NS).unwrap();
        assert_eq!(body.text(), "hi");
        assert!(element.get_child("encryption", ns::EME).is_none());
    }

    #[test]
    fn iq_result_resolves_its_request() {
        let mut pending = HashMap::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert("r1".to_string(), tx);

        let answer = handle_iq(
            el("<iq xmlns='jabber:client' type='result' id='r1'>\
                  <query xmlns='jabber:iq:roster'><item jid='alice@example.org'/></query>\
                </iq>"),
            &mut pending,
        );
        assert!(answer.is_none());
        assert!(pending.is_empty());
        let payload = rx.try_recv().unwrap().unwrap().unwrap();
        let roster = Roster::try_from(payload).unwrap();
        assert_eq!(roster.items[0].jid.to_string(), "alice@example.org");
    }

    #[test]
    fn iq_error_fails_its_request() {
        let mut pending = HashMap::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert("r2".to_string(), tx);

        handle_iq(
            el("<iq xmlns='jabber:client' type='error' id='r2'>\
                  <error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error>\
                </iq>"),
            &mut pending,
        );
        assert!(matches!(rx.try_recv().unwrap(), Err(IqFailure::Error(_))));
    }

    #[test]
    fn server_ping_is_answered() {
        let mut pending = HashMap::new();
        let answer = handle_iq(
            el("<iq xmlns='jabber:client' type='get' id='p1' from='example.org'>\
                  <ping xmlns='urn:xmpp:ping'/>\
                </iq>"),
            &mut pending,
        )
        .unwrap();
        assert_eq!(answer.attr("type"), Some("result"));
        assert_eq!(answer.attr("id"), Some("p1"));
        assert_eq!(answer.attr("to"), Some("example.org"));
    }

    #[test]
    fn unknown_server_request_is_refused() {
        let mut pending = HashMap::new();
        let answer = handle_iq(
            el("<iq xmlns='jabber:client' type='get' id='v1' from='example.org'>\
                  <query xmlns='jabber:iq:version'/>\
                </iq>"),
            &mut pending,
        )
        .unwrap();
        assert_eq!(answer.attr("type"), Some("error"));
        assert_eq!(answer.attr("id"), Some("v1"));
    }

    #[tokio::test]
    async fn commands_before_open_are_connection_errors() {
        let conn = TokioXmppConnection::new(&XmppConfig {
            jid: Identity::new("bot@example.org"),
            password: "secret".to_string(),
            recipient: Identity::new("alice@example.org"),
            encryption: false,
        })
        .unwrap();

        assert!(matches!(
            conn.send_presence().await,
            Err(Error::Connection(_))
        ));
        assert!(matches!(conn.next_event().await, Err(Error::Connection(_))));
        assert!(matches!(
            conn.fetch_roster().await,
            Err(IqFailure::Error(_))
        ));
        conn.disconnect().await.unwrap();
    }

    #[test]
    fn invalid_jid_is_a_config_error() {
        let err = TokioXmppConnection::new(&XmppConfig {
            jid: Identity::new("@example.org"),
            password: "secret".to_string(),
            recipient: Identity::new("alice@example.org"),
            encryption: false,
        })
        .err()
        .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
