//! Signal adapter driven through the `signal-cli` relay.
//!
//! Every operation is a one-shot relay invocation: `send` spawns
//! `signal-cli send`, and the receive loop polls `signal-cli receive --json`,
//! turning its NDJSON output into `InboundEvent`s.

use std::{sync::Mutex, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use nicobot_core::{
    config::SignalConfig,
    errors::Error,
    messaging::port::{Bot, Chatter},
    utils::truncate_text,
    Result,
};

pub mod envelope;
pub mod relay;

use envelope::{filter_event, RelayEvent, SessionClock};
use relay::{RelayInvocation, RelayOutput};

/// Bridge lifecycle. `Stopped` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeState {
    Initialized,
    Listening,
    Stopped,
}

pub struct SignalBridge {
    cfg: SignalConfig,
    state: Mutex<BridgeState>,
    clock: Mutex<Option<SessionClock>>,
    receive_grace: Duration,
    stop: CancellationToken,
}

impl SignalBridge {
    /// Validates the configuration (identity, relay executable).
    pub fn new(cfg: SignalConfig) -> Result<Self> {
        cfg.validate()?;
        if cfg.stealth {
            tracing::debug!("Stealth mode: will not send messages");
        }
        Ok(Self {
            cfg,
            state: Mutex::new(BridgeState::Initialized),
            clock: Mutex::new(None),
            receive_grace: RECEIVE_GRACE,
            stop: CancellationToken::new(),
        })
    }

    /// Extra time a bounded `receive` gets beyond its own `-t` before it is
    /// treated as hung.
    pub fn with_receive_grace(mut self, grace: Duration) -> Self {
        self.receive_grace = grace;
        self
    }

    pub fn config(&self) -> &SignalConfig {
        &self.cfg
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Clock captured by the current (or last) `start`.
    pub fn session_clock(&self) -> Option<SessionClock> {
        *self.clock.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, next: BridgeState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = next;
    }

    /// Initialized -> Listening. `Ok(false)` when already stopped.
    fn enter_listening(&self) -> Result<bool> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        match *state {
            BridgeState::Initialized if !self.stop.is_cancelled() => {
                *state = BridgeState::Listening;
                Ok(true)
            }
            BridgeState::Listening => Err(Error::External(
                "signal bridge is already listening".to_string(),
            )),
            _ => {
                *state = BridgeState::Stopped;
                Ok(false)
            }
        }
    }

    /// One receive poll. Returns the raw NDJSON lines.
    async fn poll(&self) -> Result<Vec<String>> {
        let inv = RelayInvocation::receive(&self.cfg);
        // Verbose every few seconds; keep it at trace.
        tracing::trace!(args = ?inv.args, "signal-cli receive");

        let out = match self.cfg.receive_timeout {
            // The relay bounds itself with `-t`; the grace only catches a hung relay.
            Some(t) => relay::run(&inv, "signal-cli receive", Some(t + self.receive_grace)).await?,
            // Unbounded polls can block forever, so stop must be able to cut them short.
            None => {
                tokio::select! {
                    out = relay::run(&inv, "signal-cli receive", None) => out?,
                    _ = self.stop.cancelled() => return Ok(Vec::new()),
                }
            }
        };

        let RelayOutput {
            status,
            stdout_lines,
            stderr,
        } = out;
        if !status.success() {
            return Err(Error::Receive { status, stderr });
        }
        Ok(stdout_lines)
    }

    /// Parse and filter one batch, delivering survivors in relay order.
    async fn deliver(
        &self,
        lines: Vec<String>,
        clock: SessionClock,
        bot: &mut (dyn Bot + Send),
    ) -> Result<()> {
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            if self.stop.is_cancelled() {
                tracing::debug!("Discarding message received after stop: {}", truncate_text(&line, 200));
                continue;
            }

            let event: RelayEvent = match serde_json::from_str(&line) {
                Ok(ev) => ev,
                Err(e) => {
                    tracing::warn!(
                        "Skipping unparsable signal-cli line ({e}): {}",
                        truncate_text(&line, 500)
                    );
                    continue;
                }
            };

            match filter_event(&event, clock, &self.cfg.destination) {
                Ok(inbound) => {
                    tracing::info!("<<< {}", inbound.text);
                    match bot.on_message(inbound).await {
                        Ok(()) => {}
                        Err(e) if e.is_message_scoped() => tracing::error!("{e}"),
                        Err(e) => return Err(e),
                    }
                }
                Err(reason) => tracing::debug!("Discarding {reason}"),
            }
        }
        Ok(())
    }

    async fn listen(&self, clock: SessionClock, bot: &mut (dyn Bot + Send)) -> Result<()> {
        while !self.stop.is_cancelled() {
            let lines = match self.poll().await {
                Ok(lines) => lines,
                Err(e @ Error::Timeout { .. }) => {
                    tracing::warn!("{e}; polling again");
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.deliver(lines, clock, bot).await?;
        }
        Ok(())
    }
}

const RECEIVE_GRACE: Duration = Duration::from_secs(10);

#[async_trait]
impl Chatter for SignalBridge {
    async fn connect(&self) -> Result<()> {
        // Nothing long-lived to open; just make sure the relay is still there.
        if !self.cfg.cli_path.is_file() {
            return Err(Error::Connection(format!(
                "signal-cli executable not found: {}",
                self.cfg.cli_path.display()
            )));
        }
        Ok(())
    }

    async fn start(&self, bot: &mut (dyn Bot + Send)) -> Result<()> {
        if !self.enter_listening()? {
            tracing::debug!("Signal bridge already stopped; not listening");
            return Ok(());
        }

        let clock = SessionClock::now();
        *self.clock.lock().unwrap_or_else(|p| p.into_inner()) = Some(clock);
        tracing::debug!("Started at {clock}");

        let outcome = self.listen(clock, bot).await;
        self.set_state(BridgeState::Stopped);
        outcome
    }

    async fn send(&self, text: &str) -> Result<()> {
        let inv = RelayInvocation::send(&self.cfg, text);
        tracing::debug!(args = ?inv.redacted_args(), "signal-cli send");

        if self.cfg.stealth {
            tracing::info!("(stealth) >>> {text}");
            return Ok(());
        }

        let out = relay::run(&inv, "signal-cli send", Some(self.cfg.send_timeout)).await?;
        if !out.status.success() {
            return Err(Error::Send {
                status: out.status,
                stderr: out.stderr,
            });
        }
        if !out.stdout_lines.is_empty() {
            tracing::debug!("Sent message: {}", out.stdout_lines.join("\n"));
        }
        tracing::info!(">>> {text}");
        Ok(())
    }

    fn stop(&self) {
        tracing::debug!("Stopping signal bridge...");
        self.stop.cancel();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state == BridgeState::Initialized {
            *state = BridgeState::Stopped;
        }
    }
}
