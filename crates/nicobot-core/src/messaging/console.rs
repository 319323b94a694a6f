use async_trait::async_trait;

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::{
    domain::Identity,
    messaging::{
        port::{Bot, Chatter},
        types::InboundEvent,
    },
    Result,
};

type Input = Box<dyn AsyncBufRead + Unpin + Send>;
type Output = Box<dyn AsyncWrite + Unpin + Send>;

/// Line-oriented backend: one inbound message per input line, one outbound
/// message per output line.
pub struct ConsoleChatter {
    input: Mutex<Input>,
    output: Mutex<Output>,
    source: Identity,
    stop: CancellationToken,
}

impl ConsoleChatter {
    pub fn new(
        input: impl AsyncRead + Unpin + Send + 'static,
        output: impl AsyncWrite + Unpin + Send + 'static,
    ) -> Self {
        Self {
            input: Mutex::new(Box::new(BufReader::new(input))),
            output: Mutex::new(Box::new(output)),
            source: Identity::new("console"),
            stop: CancellationToken::new(),
        }
    }

    /// Reads stdin, writes stdout.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

#[async_trait]
impl Chatter for ConsoleChatter {
    async fn start(&self, bot: &mut (dyn Bot + Send)) -> Result<()> {
        let mut input = self.input.lock().await;
        let mut line = String::new();

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            line.clear();
            let read = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                read = input.read_line(&mut line) => read?,
            };
            if read == 0 {
                tracing::debug!("Console input exhausted");
                break;
            }

            // The bot may have stopped us while this line was being read.
            if self.stop.is_cancelled() {
                break;
            }

            let text = line.trim_end_matches(['\n', '\r']).to_string();
            tracing::debug!("<<< {text}");
            match bot
                .on_message(InboundEvent::new(text, self.source.clone()))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_message_scoped() => tracing::error!("{e}"),
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    async fn send(&self, text: &str) -> Result<()> {
        let mut out = self.output.lock().await;
        out.write_all(text.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        Ok(())
    }

    fn stop(&self) {
        tracing::debug!("Stopping console chatter...");
        self.stop.cancel();
    }
}
