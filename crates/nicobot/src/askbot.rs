use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use nicobot_core::{
    messaging::{
        port::{run_bot, Bot, Chatter},
        types::InboundEvent,
    },
    Result,
};

/// Final outcome of an `AskBot` run, printed as JSON.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AskStatus {
    /// The run ended because `max_count` answers arrived.
    pub max_count: bool,
    pub events: Vec<StatusEvent>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub message: String,
}

/// Sends an optional message, then records answers until stopped or until
/// `max_count` of them arrived (`max_count <= 0` waits for `stop()`).
pub struct AskBot {
    chatter: Arc<dyn Chatter>,
    message: Option<String>,
    max_count: i64,
    status: AskStatus,
}

impl AskBot {
    pub fn new(chatter: Arc<dyn Chatter>, message: Option<String>, max_count: i64) -> Self {
        Self {
            chatter,
            message,
            max_count,
            status: AskStatus::default(),
        }
    }

    pub async fn run(mut self) -> Result<AskStatus> {
        tracing::debug!("Bot ready.");
        let chatter = self.chatter.clone();
        let message = self.message.take();
        run_bot(chatter.as_ref(), &mut self, message.as_deref()).await?;
        Ok(self.status)
    }
}

#[async_trait]
impl Bot for AskBot {
    async fn on_message(&mut self, event: InboundEvent) -> Result<()> {
        self.status.events.push(StatusEvent {
            message: event.text,
        });

        let received = self.status.events.len() as i64;
        if self.max_count > 0 && received >= self.max_count {
            tracing::debug!("Max amount of messages reached");
            self.status.max_count = true;
            self.chatter.stop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nicobot_core::{
        messaging::{console::ConsoleChatter, stealth::StealthChatter},
        utils::SharedBuffer,
    };

    fn console(input: &'static str, out: &SharedBuffer) -> Arc<dyn Chatter> {
        Arc::new(ConsoleChatter::new(input.as_bytes(), out.clone()))
    }

    #[tokio::test]
    async fn sends_message_and_stops_after_max_count() {
        let out = SharedBuffer::new();
        let chatter = console("yes\nno\nmaybe\n", &out);

        let status = AskBot::new(chatter, Some("Is it working ?".to_string()), 2)
            .run()
            .await
            .unwrap();

        assert!(status.max_count);
        let answers: Vec<_> = status.events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(answers, vec!["yes", "no"]);
        assert_eq!(out.lines(), vec!["Is it working ?"]);
    }

    #[tokio::test]
    async fn reads_until_input_ends_without_max_count() {
        let out = SharedBuffer::new();
        let chatter = console("a\nb\nc\n", &out);

        let status = AskBot::new(chatter, None, -1).run().await.unwrap();

        assert!(!status.max_count);
        assert_eq!(status.events.len(), 3);
        assert!(out.contents().is_empty());
    }

    #[tokio::test]
    async fn stealth_keeps_the_question_off_the_transport() {
        let transport = SharedBuffer::new();
        let local = SharedBuffer::new();
        let chatter: Arc<dyn Chatter> = Arc::new(StealthChatter::new(
            console("ok\n", &transport),
            local.clone(),
        ));

        let status = AskBot::new(chatter, Some("ping".to_string()), 1)
            .run()
            .await
            .unwrap();

        assert!(status.max_count);
        assert!(transport.contents().is_empty());
        assert_eq!(local.lines(), vec!["ping"]);
    }

    #[test]
    fn status_serializes_as_flat_json() {
        let status = AskStatus {
            max_count: true,
            events: vec![StatusEvent {
                message: "Yes".to_string(),
            }],
        };
        assert_eq!(
            serde_json::to_string(&status).unwrap(),
            r#"{"max_count":true,"events":[{"message":"Yes"}]}"#
        );
    }
}
