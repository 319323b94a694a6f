use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use nicobot_core::{
    config::XmppConfig,
    domain::Identity,
    errors::Error,
    messaging::{
        port::{Bot, Chatter},
        types::InboundEvent,
    },
    Result,
};

use crate::{
    connection::{XmppConnection, XmppEvent},
    decrypt::{decrypt_inbound, Received},
    encrypt::encrypt_for,
    omemo::OmemoEngine,
    stanza::{Jid, MessageKind, OutboundMessage, Stanza},
    trust::TrustLedger,
};

/// End-to-end encrypted XMPP chatter.
///
/// Owns one connection exclusively. `Chatter::send` hands the message to a
/// single outbound worker, so it returns immediately while messages still
/// leave in call order.
pub struct EncryptedXmppSession {
    jid: Jid,
    recipient: Jid,
    encryption: bool,
    outbox: Outbox,
    stop: CancellationToken,
    pending: Mutex<VecDeque<Stanza>>,
    jobs: Mutex<Option<mpsc::UnboundedSender<OutboundJob>>>,
    connected: AtomicBool,
    disconnected: AtomicBool,
}

struct OutboundJob {
    body: String,
    to: Jid,
    kind: MessageKind,
    encrypt: bool,
}

/// The parts of the session the outbound worker needs.
#[derive(Clone)]
struct Outbox {
    conn: Arc<dyn XmppConnection>,
    omemo: Arc<dyn OmemoEngine>,
    ledger: Arc<TrustLedger>,
}

impl Outbox {
    async fn plain(&self, body: &str, to: Jid, kind: MessageKind) -> Result<()> {
        tracing::info!(">>> {body}");
        self.conn
            .send_message(OutboundMessage::plain(to, kind, body))
            .await
    }

    async fn encrypted(&self, body: &str, to: Jid, kind: MessageKind) -> Result<()> {
        let payload = encrypt_for(self.omemo.as_ref(), &self.ledger, &to, body)
            .await
            .map_err(|e| Error::Crypto(format!("could not encrypt message for {to}: {e}")))?;
        tracing::info!(">>> (encrypted) {body}");
        self.conn
            .send_message(OutboundMessage::encrypted(to, kind, payload))
            .await
    }

    async fn run(self, mut jobs: mpsc::UnboundedReceiver<OutboundJob>, stop: CancellationToken) {
        loop {
            let job = tokio::select! {
                _ = stop.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            let sent = if job.encrypt {
                self.encrypted(&job.body, job.to, job.kind).await
            } else {
                self.plain(&job.body, job.to, job.kind).await
            };
            if let Err(e) = sent {
                tracing::error!("Could not send message: {e}");
            }
        }
        tracing::debug!("Outbound worker stopped");
    }
}

impl EncryptedXmppSession {
    pub fn new(
        cfg: &XmppConfig,
        conn: Arc<dyn XmppConnection>,
        omemo: Arc<dyn OmemoEngine>,
    ) -> Result<Self> {
        if cfg.password.is_empty() {
            return Err(Error::Config("missing XMPP password".to_string()));
        }
        Ok(Self {
            jid: Jid::parse(cfg.jid.as_str())?,
            recipient: Jid::parse(cfg.recipient.as_str())?,
            encryption: cfg.encryption,
            outbox: Outbox {
                conn,
                omemo,
                ledger: Arc::new(TrustLedger::new()),
            },
            stop: CancellationToken::new(),
            pending: Mutex::new(VecDeque::new()),
            jobs: Mutex::new(None),
            connected: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        })
    }

    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    pub fn trust_ledger(&self) -> &TrustLedger {
        &self.outbox.ledger
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn plain_send(&self, body: &str, to: &Jid, kind: MessageKind) -> Result<()> {
        self.outbox.plain(body, to.clone(), kind).await
    }

    pub async fn plain_reply(&self, source: &InboundEvent, body: &str) -> Result<()> {
        let to = Jid::parse(source.source.as_str())?;
        self.outbox.plain(body, to, MessageKind::Chat).await
    }

    /// Encrypt for every known device of `to` and send. Failures are scoped
    /// to this message.
    pub async fn encrypted_send(&self, body: &str, to: &Jid, kind: MessageKind) -> Result<()> {
        self.outbox.encrypted(body, to.clone(), kind).await
    }

    pub async fn encrypted_reply(&self, source: &InboundEvent, body: &str) -> Result<()> {
        let to = Jid::parse(source.source.as_str())?;
        self.outbox.encrypted(body, to, MessageKind::Chat).await
    }

    fn enqueue(&self, body: &str, to: Jid) -> Result<()> {
        let jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        let Some(tx) = jobs.as_ref() else {
            return Err(Error::Connection(format!("{} is not connected", self.jid)));
        };
        tx.send(OutboundJob {
            body: body.to_string(),
            to,
            kind: MessageKind::Chat,
            encrypt: self.encryption,
        })
        .map_err(|_| Error::Connection(format!("{} is shutting down", self.jid)))
    }

    async fn handle_stanza(&self, stanza: Stanza, bot: &mut (dyn Bot + Send)) -> Result<()> {
        tracing::trace!("Stanza: {stanza:?}");
        let msg = match stanza {
            Stanza::Message(msg) if msg.kind.is_conversational() => msg,
            other => {
                tracing::debug!("Discarding {}", other.describe());
                return Ok(());
            }
        };

        match decrypt_inbound(self.outbox.omemo.as_ref(), &self.outbox.ledger, &msg).await {
            Ok(Received::Deliver(text)) => {
                tracing::info!("<<< {text}");
                bot.on_message(InboundEvent::new(text, Identity::new(msg.from.as_str())))
                    .await
            }
            Ok(Received::Dropped(reason)) => {
                tracing::error!("Dropping message from {}: {reason:?}", msg.from);
                Ok(())
            }
            Err(e) => Err(Error::Crypto(format!(
                "could not decrypt message from {}: {e}",
                msg.from
            ))),
        }
    }

    async fn next_stanza(&self) -> Result<Option<Stanza>> {
        loop {
            let buffered = self
                .pending
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .pop_front();
            if buffered.is_some() {
                return Ok(buffered);
            }

            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(None),
                event = self.outbox.conn.next_event() => event?,
            };
            match event {
                XmppEvent::Stanza(stanza) => return Ok(Some(stanza)),
                XmppEvent::SessionStart => continue,
                XmppEvent::Disconnected => {
                    tracing::info!("Disconnected from server");
                    return Ok(None);
                }
            }
        }
    }

    async fn pump(&self, bot: &mut (dyn Bot + Send)) -> Result<()> {
        while !self.stop.is_cancelled() {
            let Some(stanza) = self.next_stanza().await? else {
                break;
            };
            if self.stop.is_cancelled() {
                break;
            }
            match self.handle_stanza(stanza, bot).await {
                Ok(()) => {}
                Err(e) if e.is_message_scoped() => tracing::error!("{e}"),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn disconnect_once(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.jobs.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Err(e) = self.outbox.conn.disconnect().await {
            tracing::warn!("Disconnect failed: {e}");
        }
    }
}

#[async_trait]
impl Chatter for EncryptedXmppSession {
    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        tracing::debug!("Connecting as {}", self.jid);
        self.outbox.conn.open().await?;

        loop {
            match self.outbox.conn.next_event().await? {
                XmppEvent::SessionStart => break,
                XmppEvent::Stanza(stanza) => {
                    tracing::trace!("Buffering early {}", stanza.describe());
                    self.pending
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .push_back(stanza);
                }
                XmppEvent::Disconnected => {
                    return Err(Error::Connection(format!(
                        "{} disconnected before the session started",
                        self.jid
                    )));
                }
            }
        }

        self.outbox.conn.send_presence().await?;
        match self.outbox.conn.fetch_roster().await {
            Ok(roster) => tracing::debug!("Roster has {} contact(s)", roster.len()),
            Err(e) => tracing::warn!("Could not fetch roster: {e}"),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.outbox.clone().run(rx, self.stop.clone()));
        *self.jobs.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!("Session started for {}", self.jid);
        Ok(())
    }

    async fn start(&self, bot: &mut (dyn Bot + Send)) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Connection(format!(
                "{} must connect before start",
                self.jid
            )));
        }
        let outcome = self.pump(bot).await;
        self.disconnect_once().await;
        outcome
    }

    async fn send(&self, text: &str) -> Result<()> {
        self.enqueue(text, self.recipient.clone())
    }

    async fn reply(&self, source: &InboundEvent, text: &str) -> Result<()> {
        self.enqueue(text, Jid::parse(source.source.as_str())?)
    }

    fn stop(&self) {
        if !self.stop.is_cancelled() {
            tracing::debug!("Stopping XMPP session");
        }
        self.stop.cancel();
    }
}
