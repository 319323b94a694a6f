use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

use crate::{
    messaging::{
        port::{Bot, Chatter},
        types::InboundEvent,
    },
    Result,
};

/// Chatter decorator that prints outbound messages instead of sending them.
///
/// Inbound traffic, connection and shutdown go through the wrapped chatter
/// untouched; only the outbound path is redirected.
pub struct StealthChatter {
    inner: Arc<dyn Chatter>,
    output: Mutex<Box<dyn AsyncWrite + Unpin + Send>>,
}

impl StealthChatter {
    pub fn new(inner: Arc<dyn Chatter>, output: impl AsyncWrite + Unpin + Send + 'static) -> Self {
        Self {
            inner,
            output: Mutex::new(Box::new(output)),
        }
    }

    /// Prints to stdout.
    pub fn stdout(inner: Arc<dyn Chatter>) -> Self {
        Self::new(inner, tokio::io::stdout())
    }

    async fn print(&self, text: &str) -> Result<()> {
        tracing::info!("(stealth) >>> {text}");
        let mut out = self.output.lock().await;
        out.write_all(text.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Chatter for StealthChatter {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn start(&self, bot: &mut (dyn Bot + Send)) -> Result<()> {
        tracing::debug!("Stealth mode: will not send messages");
        self.inner.start(bot).await
    }

    async fn send(&self, text: &str) -> Result<()> {
        self.print(text).await
    }

    async fn reply(&self, _source: &InboundEvent, text: &str) -> Result<()> {
        self.print(text).await
    }

    fn stop(&self) {
        self.inner.stop();
    }
}
