//! Send-side encryption as an explicit state machine.
//!
//! One `EncryptPlan` per outbound message. Each encryption attempt's outcome
//! is fed to `step`, which says what to do next:
//!
//! ```text
//!  encrypt-attempt --Ok-----------------------------> Send
//!        |  \--Undecided (first time for device)---> Trust -> encrypt-attempt
//!        |  \--MissingBundle (new devices)---------> Retry -> encrypt-attempt
//!        \--anything else / no progress------------> Abort
//! ```
//!
//! The loop is bounded by progress, not by a counter: every `Trust` or
//! `Retry` adds a device to a set that only grows, and a repeat aborts.

use std::collections::BTreeSet;

use crate::{
    omemo::{ExpectedProblems, IdentityKey, OmemoEngine, OmemoError, PrepareProblem},
    stanza::{DeviceId, EncryptedPayload, Jid},
    trust::{TrustDecision, TrustLedger},
};

/// Next action for an outbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendStep {
    Send(EncryptedPayload),
    Trust {
        jid: Jid,
        device: DeviceId,
        identity_key: IdentityKey,
    },
    Retry,
    Abort(OmemoError),
}

#[derive(Clone, Debug)]
pub struct EncryptPlan {
    recipient: Jid,
    expect_problems: ExpectedProblems,
    trusted: BTreeSet<(Jid, DeviceId)>,
}

impl EncryptPlan {
    pub fn new(recipient: &Jid) -> Self {
        Self {
            recipient: recipient.bare(),
            expect_problems: ExpectedProblems::new(),
            trusted: BTreeSet::new(),
        }
    }

    pub fn recipients(&self) -> Vec<Jid> {
        vec![self.recipient.clone()]
    }

    /// Devices excluded so far.
    pub fn expect_problems(&self) -> &ExpectedProblems {
        &self.expect_problems
    }

    pub fn step(&mut self, outcome: Result<EncryptedPayload, OmemoError>) -> SendStep {
        let err = match outcome {
            Ok(payload) => return SendStep::Send(payload),
            Err(e) => e,
        };

        match err {
            OmemoError::Undecided {
                jid,
                device,
                identity_key,
            } => {
                // Trust on first use; a device still undecided after that is stuck.
                if self.trusted.insert((jid.bare(), device)) {
                    SendStep::Trust {
                        jid,
                        device,
                        identity_key,
                    }
                } else {
                    SendStep::Abort(OmemoError::Undecided {
                        jid,
                        device,
                        identity_key,
                    })
                }
            }
            OmemoError::EncryptionPrepare(problems) => {
                let mut excluded = false;
                for problem in &problems {
                    if let PrepareProblem::MissingBundle { jid, device } = problem {
                        let newly = self
                            .expect_problems
                            .entry(jid.bare())
                            .or_default()
                            .insert(*device);
                        if newly {
                            tracing::warn!(
                                "Could not find keys for device {device} of recipient {jid}. Skipping."
                            );
                            excluded = true;
                        }
                    }
                }
                if excluded {
                    SendStep::Retry
                } else {
                    SendStep::Abort(OmemoError::EncryptionPrepare(problems))
                }
            }
            other => SendStep::Abort(other),
        }
    }
}

/// Drive a plan against the engine until it sends or aborts.
pub async fn encrypt_for(
    engine: &dyn OmemoEngine,
    ledger: &TrustLedger,
    recipient: &Jid,
    body: &str,
) -> Result<EncryptedPayload, OmemoError> {
    let mut plan = EncryptPlan::new(recipient);
    loop {
        let outcome = engine
            .encrypt(body, &plan.recipients(), plan.expect_problems())
            .await;
        if let Err(OmemoError::Undecided { jid, device, .. }) = &outcome {
            ledger.observe(jid, *device, TrustDecision::Undecided);
        }
        if let Err(OmemoError::Untrusted { jid, device, .. }) = &outcome {
            ledger.observe(jid, *device, TrustDecision::Untrusted);
        }

        match plan.step(outcome) {
            SendStep::Send(payload) => return Ok(payload),
            SendStep::Trust {
                jid,
                device,
                identity_key,
            } => {
                tracing::info!("Trusting undecided device {device} of {jid} (first use)");
                engine.trust(&jid, device, &identity_key).await?;
                ledger.mark_trusted(&jid, device);
            }
            SendStep::Retry => {}
            SendStep::Abort(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{payload, undecided, ScriptedOmemo};
    use crate::stanza::IqFailure;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    fn missing_bundle(j: &str, d: u32) -> PrepareProblem {
        PrepareProblem::MissingBundle {
            jid: jid(j),
            device: DeviceId(d),
        }
    }

    #[test]
    fn success_sends() {
        let mut plan = EncryptPlan::new(&jid("bob@example.org/pc"));
        assert_eq!(plan.recipients(), vec![jid("bob@example.org")]);
        assert_eq!(plan.step(Ok(payload(1))), SendStep::Send(payload(1)));
    }

    #[test]
    fn undecided_device_is_trusted_once_then_aborts() {
        let mut plan = EncryptPlan::new(&jid("bob@example.org"));
        assert!(matches!(
            plan.step(Err(undecided("bob@example.org", 9))),
            SendStep::Trust { device: DeviceId(9), .. }
        ));
        assert!(matches!(
            plan.step(Err(undecided("bob@example.org", 9))),
            SendStep::Abort(OmemoError::Undecided { .. })
        ));
    }

    #[test]
    fn missing_bundles_are_excluded_then_retried() {
        let mut plan = EncryptPlan::new(&jid("bob@example.org"));
        let step = plan.step(Err(OmemoError::EncryptionPrepare(vec![
            missing_bundle("bob@example.org", 11),
            missing_bundle("bob@example.org", 12),
        ])));
        assert_eq!(step, SendStep::Retry);
        let excluded = plan.expect_problems().get(&jid("bob@example.org")).unwrap();
        assert_eq!(
            excluded.iter().copied().collect::<Vec<_>>(),
            vec![DeviceId(11), DeviceId(12)]
        );

        // Same problems again: no progress, give up.
        let step = plan.step(Err(OmemoError::EncryptionPrepare(vec![missing_bundle(
            "bob@example.org",
            11,
        )])));
        assert!(matches!(step, SendStep::Abort(OmemoError::EncryptionPrepare(_))));
    }

    #[test]
    fn prepare_without_bundle_problems_aborts() {
        let mut plan = EncryptPlan::new(&jid("bob@example.org"));
        let step = plan.step(Err(OmemoError::EncryptionPrepare(vec![PrepareProblem::Other(
            "no eligible devices".to_string(),
        )])));
        assert!(matches!(step, SendStep::Abort(_)));
    }

    #[test]
    fn fetch_failures_abort() {
        let mut plan = EncryptPlan::new(&jid("bob@example.org"));
        assert_eq!(
            plan.step(Err(OmemoError::Iq(IqFailure::Timeout))),
            SendStep::Abort(OmemoError::Iq(IqFailure::Timeout))
        );
    }

    #[tokio::test]
    async fn drives_trust_and_exclusion_to_a_payload() {
        let engine = ScriptedOmemo::default();
        engine.push_encrypt(Err(undecided("bob@example.org", 9)));
        engine.push_encrypt(Err(OmemoError::EncryptionPrepare(vec![missing_bundle(
            "bob@example.org",
            12,
        )])));
        engine.push_encrypt(Ok(payload(77)));
        let ledger = TrustLedger::new();

        let got = encrypt_for(&engine, &ledger, &jid("bob@example.org/pc"), "hi")
            .await
            .unwrap();

        assert_eq!(got, payload(77));
        assert_eq!(engine.trusted(), vec![(jid("bob@example.org"), DeviceId(9))]);
        assert_eq!(
            ledger.decision(&jid("bob@example.org"), DeviceId(9)),
            Some(TrustDecision::Trusted)
        );

        let calls = engine.encrypt_calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].is_empty());
        assert!(calls[2]
            .get(&jid("bob@example.org"))
            .is_some_and(|d| d.contains(&DeviceId(12))));
    }

    #[tokio::test]
    async fn failed_trust_aborts() {
        let engine = ScriptedOmemo::default();
        engine.push_encrypt(Err(undecided("bob@example.org", 9)));
        engine.fail_trust(OmemoError::Other("store is read-only".to_string()));
        let ledger = TrustLedger::new();

        let err = encrypt_for(&engine, &ledger, &jid("bob@example.org"), "hi")
            .await
            .unwrap_err();
        assert_eq!(err, OmemoError::Other("store is read-only".to_string()));
        assert_eq!(engine.encrypt_calls().len(), 1);
    }
}
