//! Port over the OMEMO library: sessions, bundles and trust live there.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::stanza::{DeviceId, EncryptedPayload, IqFailure, Jid};

/// Public identity key of a device, as reported by the library.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityKey(pub Vec<u8>);

/// Devices to leave out of an encryption, per bare JID.
pub type ExpectedProblems = BTreeMap<Jid, BTreeSet<DeviceId>>;

/// One problem reported by a failed encryption preparation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrepareProblem {
    MissingBundle { jid: Jid, device: DeviceId },
    Other(String),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OmemoError {
    #[error("message was not encrypted for this device")]
    MissingOwnKey,

    #[error("no session with the sending device")]
    NoAvailableSession,

    #[error("device {device} of {jid} is undecided")]
    Undecided {
        jid: Jid,
        device: DeviceId,
        identity_key: IdentityKey,
    },

    #[error("device {device} of {jid} is untrusted")]
    Untrusted {
        jid: Jid,
        device: DeviceId,
        identity_key: IdentityKey,
    },

    #[error("could not prepare encryption ({} problem(s))", .0.len())]
    EncryptionPrepare(Vec<PrepareProblem>),

    #[error(transparent)]
    Iq(#[from] IqFailure),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait OmemoEngine: Send + Sync {
    /// Decrypt `payload` sent by `from`. With `allow_untrusted`, devices that
    /// are undecided or untrusted are accepted for this message.
    async fn decrypt(
        &self,
        from: &Jid,
        payload: &EncryptedPayload,
        allow_untrusted: bool,
    ) -> Result<Vec<u8>, OmemoError>;

    /// Encrypt for every known device of `recipients`, minus `expect_problems`.
    async fn encrypt(
        &self,
        plaintext: &str,
        recipients: &[Jid],
        expect_problems: &ExpectedProblems,
    ) -> Result<EncryptedPayload, OmemoError>;

    /// Mark a device as trusted.
    async fn trust(
        &self,
        jid: &Jid,
        device: DeviceId,
        identity_key: &IdentityKey,
    ) -> Result<(), OmemoError>;
}

/// Engine for builds without an OMEMO library. Every operation fails, so an
/// encrypted message is refused on its own and the session keeps running.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledOmemo;

impl DisabledOmemo {
    fn unavailable() -> OmemoError {
        OmemoError::Other("no OMEMO engine is available".to_string())
    }
}

#[async_trait]
impl OmemoEngine for DisabledOmemo {
    async fn decrypt(
        &self,
        _from: &Jid,
        _payload: &EncryptedPayload,
        _allow_untrusted: bool,
    ) -> Result<Vec<u8>, OmemoError> {
        Err(Self::unavailable())
    }

    async fn encrypt(
        &self,
        _plaintext: &str,
        _recipients: &[Jid],
        _expect_problems: &ExpectedProblems,
    ) -> Result<EncryptedPayload, OmemoError> {
        Err(Self::unavailable())
    }

    async fn trust(
        &self,
        _jid: &Jid,
        _device: DeviceId,
        _identity_key: &IdentityKey,
    ) -> Result<(), OmemoError> {
        Err(Self::unavailable())
    }
}
