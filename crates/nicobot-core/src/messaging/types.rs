use crate::domain::Identity;

/// Normalized inbound message handed to the bot.
///
/// Backends parse their envelopes/stanzas into this shape; bots never see
/// transport payloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundEvent {
    pub text: String,
    pub source: Identity,
}

impl InboundEvent {
    pub fn new(text: impl Into<String>, source: Identity) -> Self {
        Self {
            text: text.into(),
            source,
        }
    }
}
