use async_trait::async_trait;

use crate::{messaging::types::InboundEvent, Result};

/// Cross-backend chat transport.
///
/// Console, Signal and XMPP implement the same surface so bot logic can be
/// driven by any of them (optionally wrapped in `StealthChatter`).
#[async_trait]
pub trait Chatter: Send + Sync {
    /// Acquire the underlying resources (connection, session).
    ///
    /// Backends without long-lived resources keep the default no-op.
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Deliver inbound events to `bot` until `stop()` is observed.
    ///
    /// Events reach the bot in transport order.
    async fn start(&self, bot: &mut (dyn Bot + Send)) -> Result<()>;

    /// Send `text` to the configured destination.
    async fn send(&self, text: &str) -> Result<()>;

    /// Answer a specific inbound message.
    async fn reply(&self, source: &InboundEvent, text: &str) -> Result<()> {
        let _ = source;
        self.send(text).await
    }

    /// Ask `start` to return. Idempotent and callable from any task.
    fn stop(&self);
}

/// Conversation logic driven by a `Chatter`.
#[async_trait]
pub trait Bot: Send {
    /// Called for every inbound message, in order.
    async fn on_message(&mut self, event: InboundEvent) -> Result<()>;

    /// Called once the receive loop has returned; the chatter is still usable.
    async fn on_exit(&mut self) {
        tracing::debug!("Exiting...");
    }
}

/// Standard bot control flow: connect, optionally send an opening message,
/// block in `start` until the chatter is stopped, then run `on_exit`.
pub async fn run_bot(
    chatter: &dyn Chatter,
    bot: &mut (dyn Bot + Send),
    opening: Option<&str>,
) -> Result<()> {
    chatter.connect().await?;

    if let Some(text) = opening {
        chatter.send(text).await?;
    }

    tracing::debug!("Bot reading answers...");
    let outcome = chatter.start(&mut *bot).await;
    bot.on_exit().await;
    tracing::debug!("Bot done.");
    outcome
}
