//! Receive-side policy for encrypted messages.

use crate::{
    omemo::{OmemoEngine, OmemoError},
    stanza::InboundMessage,
    trust::{TrustDecision, TrustLedger},
};

/// What happened to one inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Received {
    Deliver(String),
    Dropped(DropReason),
}

/// Unrecoverable, message-scoped outcomes. Logged, never surfaced to the bot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Plain message without a body (chat states, markers, receipts).
    NoBody,
    /// Not encrypted for this device.
    MissingOwnKey,
    /// Unknown session; the sender has to start a new one.
    NoAvailableSession,
    /// Still refused after retrying with untrusted devices allowed.
    UntrustedAfterRetry,
    /// The library gave up preparing the session.
    EncryptionPrepare,
}

/// Decrypt (or pass through) one message.
///
/// An undecided/untrusted sender device gets exactly one retry with
/// `allow_untrusted`. Failures outside the known taxonomy are returned as
/// errors for the caller to log against this message.
pub async fn decrypt_inbound(
    engine: &dyn OmemoEngine,
    ledger: &TrustLedger,
    msg: &InboundMessage,
) -> Result<Received, OmemoError> {
    let Some(payload) = &msg.encrypted else {
        tracing::debug!("This message was not encrypted");
        return Ok(match &msg.body {
            Some(body) if !body.is_empty() => Received::Deliver(body.clone()),
            _ => Received::Dropped(DropReason::NoBody),
        });
    };

    let mut allow_untrusted = false;
    loop {
        let err = match engine.decrypt(&msg.from, payload, allow_untrusted).await {
            Ok(plain) => {
                return Ok(Received::Deliver(
                    String::from_utf8_lossy(&plain).into_owned(),
                ));
            }
            Err(e) => e,
        };

        match err {
            OmemoError::Undecided { jid, device, .. } => {
                ledger.observe(&jid, device, TrustDecision::Undecided);
                if allow_untrusted {
                    return Ok(Received::Dropped(DropReason::UntrustedAfterRetry));
                }
                tracing::warn!("Device {device} of {jid} is not in my trusted devices; decrypting anyway");
                allow_untrusted = true;
            }
            OmemoError::Untrusted { jid, device, .. } => {
                ledger.observe(&jid, device, TrustDecision::Untrusted);
                if allow_untrusted {
                    return Ok(Received::Dropped(DropReason::UntrustedAfterRetry));
                }
                tracing::warn!("Device {device} of {jid} is untrusted; decrypting anyway");
                allow_untrusted = true;
            }
            OmemoError::MissingOwnKey => {
                return Ok(Received::Dropped(DropReason::MissingOwnKey));
            }
            OmemoError::NoAvailableSession => {
                return Ok(Received::Dropped(DropReason::NoAvailableSession));
            }
            OmemoError::EncryptionPrepare(_) => {
                return Ok(Received::Dropped(DropReason::EncryptionPrepare));
            }
            other => return Err(other),
        }
    }
}
