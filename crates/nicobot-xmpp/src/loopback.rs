//! In-memory `XmppConnection`.
//!
//! Stands in for a server: inbound events are injected with `push`, outbound
//! messages are recorded, and in echo mode they come back as if the account
//! had messaged itself.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

use nicobot_core::{errors::Error, Result};

use crate::{
    connection::{XmppConnection, XmppEvent},
    stanza::{InboundMessage, IqFailure, Jid, OutboundMessage, Stanza},
};

pub struct LoopbackConnection {
    own_jid: Jid,
    echo: bool,
    reject_auth: bool,
    roster: Vec<Jid>,
    tx: mpsc::UnboundedSender<XmppEvent>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<XmppEvent>>,
    sent: Mutex<Vec<OutboundMessage>>,
    sent_notify: Notify,
    opened: AtomicBool,
    presences: AtomicUsize,
    disconnects: AtomicUsize,
}

impl LoopbackConnection {
    pub fn new(own_jid: Jid) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            own_jid,
            echo: false,
            reject_auth: false,
            roster: Vec::new(),
            tx,
            rx: AsyncMutex::new(rx),
            sent: Mutex::new(Vec::new()),
            sent_notify: Notify::new(),
            opened: AtomicBool::new(false),
            presences: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    /// Route every outbound message back in as an inbound one.
    pub fn echoing(mut self) -> Self {
        self.echo = true;
        self
    }

    /// Fail authentication after `open`.
    pub fn rejecting_auth(mut self) -> Self {
        self.reject_auth = true;
        self
    }

    pub fn with_roster(mut self, roster: Vec<Jid>) -> Self {
        self.roster = roster;
        self
    }

    /// Inject an inbound event.
    pub fn push(&self, event: XmppEvent) {
        let _ = self.tx.send(event);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Wait until at least `n` messages went out.
    pub async fn wait_for_sent(&self, n: usize) -> Vec<OutboundMessage> {
        loop {
            let notified = self.sent_notify.notified();
            let sent = self.sent();
            if sent.len() >= n {
                return sent;
            }
            notified.await;
        }
    }

    pub fn presences(&self) -> usize {
        self.presences.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl XmppConnection for LoopbackConnection {
    async fn open(&self) -> Result<()> {
        self.opened.store(true, Ordering::SeqCst);
        if !self.reject_auth {
            self.push(XmppEvent::SessionStart);
        }
        Ok(())
    }

    async fn next_event(&self) -> Result<XmppEvent> {
        if !self.opened.load(Ordering::SeqCst) {
            return Err(Error::Connection("stream is not open".to_string()));
        }
        if self.reject_auth {
            return Err(Error::Connection(format!(
                "authentication failed for {}",
                self.own_jid
            )));
        }
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await.unwrap_or(XmppEvent::Disconnected))
    }

    async fn send_presence(&self) -> Result<()> {
        self.presences.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_roster(&self) -> std::result::Result<Vec<Jid>, IqFailure> {
        Ok(self.roster.clone())
    }

    async fn send_message(&self, msg: OutboundMessage) -> Result<()> {
        if self.disconnects.load(Ordering::SeqCst) > 0 {
            return Err(Error::Connection("not connected".to_string()));
        }
        if self.echo {
            self.push(XmppEvent::Stanza(Stanza::Message(InboundMessage {
                from: self.own_jid.clone(),
                kind: msg.kind,
                body: msg.body.clone(),
                encrypted: msg.encrypted.clone(),
            })));
        }
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(msg);
        self.sent_notify.notify_waiters();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.push(XmppEvent::Disconnected);
        Ok(())
    }
}
