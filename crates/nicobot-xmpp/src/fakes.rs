//! Scripted OMEMO engine for unit tests.

use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;

use crate::{
    omemo::{ExpectedProblems, IdentityKey, OmemoEngine, OmemoError},
    stanza::{DeviceId, EncryptedKey, EncryptedPayload, InboundMessage, Jid, MessageKind},
};

/// Replays queued results. An empty decrypt queue fails; an empty encrypt
/// queue succeeds with `payload(1)`.
#[derive(Default)]
pub struct ScriptedOmemo {
    decrypts: Mutex<VecDeque<Result<Vec<u8>, OmemoError>>>,
    encrypts: Mutex<VecDeque<Result<EncryptedPayload, OmemoError>>>,
    decrypt_calls: Mutex<Vec<bool>>,
    encrypt_calls: Mutex<Vec<ExpectedProblems>>,
    trusted: Mutex<Vec<(Jid, DeviceId)>>,
    trust_error: Mutex<Option<OmemoError>>,
}

impl ScriptedOmemo {
    pub fn push_decrypt(&self, r: Result<Vec<u8>, OmemoError>) {
        self.decrypts.lock().unwrap().push_back(r);
    }

    pub fn push_encrypt(&self, r: Result<EncryptedPayload, OmemoError>) {
        self.encrypts.lock().unwrap().push_back(r);
    }

    pub fn fail_trust(&self, e: OmemoError) {
        *self.trust_error.lock().unwrap() = Some(e);
    }

    /// `allow_untrusted` of every decrypt call.
    pub fn decrypt_calls(&self) -> Vec<bool> {
        self.decrypt_calls.lock().unwrap().clone()
    }

    /// `expect_problems` of every encrypt call.
    pub fn encrypt_calls(&self) -> Vec<ExpectedProblems> {
        self.encrypt_calls.lock().unwrap().clone()
    }

    pub fn trusted(&self) -> Vec<(Jid, DeviceId)> {
        self.trusted.lock().unwrap().clone()
    }
}

#[async_trait]
impl OmemoEngine for ScriptedOmemo {
    async fn decrypt(
        &self,
        _from: &Jid,
        _payload: &EncryptedPayload,
        allow_untrusted: bool,
    ) -> Result<Vec<u8>, OmemoError> {
        self.decrypt_calls.lock().unwrap().push(allow_untrusted);
        self.decrypts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(OmemoError::Other("no scripted decrypt".to_string())))
    }

    async fn encrypt(
        &self,
        _plaintext: &str,
        _recipients: &[Jid],
        expect_problems: &ExpectedProblems,
    ) -> Result<EncryptedPayload, OmemoError> {
        self.encrypt_calls
            .lock()
            .unwrap()
            .push(expect_problems.clone());
        self.encrypts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(payload(1)))
    }

    async fn trust(
        &self,
        jid: &Jid,
        device: DeviceId,
        _identity_key: &IdentityKey,
    ) -> Result<(), OmemoError> {
        if let Some(e) = self.trust_error.lock().unwrap().clone() {
            return Err(e);
        }
        self.trusted.lock().unwrap().push((jid.bare(), device));
        Ok(())
    }
}

pub fn payload(sid: u32) -> EncryptedPayload {
    EncryptedPayload {
        sid: DeviceId(sid),
        keys: vec![EncryptedKey {
            rid: DeviceId(1929813965),
            prekey: false,
            data: vec![0x33, 0x0a, 0x21],
        }],
        iv: b"5eM9IHpWSbKfLJj6".to_vec(),
        payload: Some(b"pX7D+54c".to_vec()),
    }
}

pub fn undecided(jid: &str, device: u32) -> OmemoError {
    OmemoError::Undecided {
        jid: Jid::parse(jid).unwrap(),
        device: DeviceId(device),
        identity_key: IdentityKey(vec![5; 33]),
    }
}

pub fn encrypted_from(from: &str) -> InboundMessage {
    InboundMessage {
        from: Jid::parse(from).unwrap(),
        kind: MessageKind::Chat,
        body: Some(
            "I sent you an OMEMO encrypted message but your client doesn't seem to support that."
                .to_string(),
        ),
        encrypted: Some(payload(307701646)),
    }
}
