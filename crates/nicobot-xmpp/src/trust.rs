use std::{collections::HashMap, sync::Mutex};

use crate::stanza::{DeviceId, Jid};

/// Trust state of a remote device as seen by this session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrustDecision {
    Trusted,
    Undecided,
    Untrusted,
}

/// Per-(bare JID, device) trust decisions observed during a session.
///
/// Entries are created on first encounter and never removed.
#[derive(Debug, Default)]
pub struct TrustLedger {
    devices: Mutex<HashMap<(Jid, DeviceId), TrustDecision>>,
}

impl TrustLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record what the library reported. A first sighting creates the entry;
    /// `Undecided` never downgrades a decision already taken.
    pub fn observe(&self, jid: &Jid, device: DeviceId, reported: TrustDecision) {
        let mut devices = self.devices.lock().unwrap_or_else(|p| p.into_inner());
        let entry = devices.entry((jid.bare(), device)).or_insert(reported);
        if reported != TrustDecision::Undecided {
            *entry = reported;
        }
    }

    /// Trust on first use.
    pub fn mark_trusted(&self, jid: &Jid, device: DeviceId) {
        self.observe(jid, device, TrustDecision::Trusted);
    }

    pub fn decision(&self, jid: &Jid, device: DeviceId) -> Option<TrustDecision> {
        let devices = self.devices.lock().unwrap_or_else(|p| p.into_inner());
        devices.get(&(jid.bare(), device)).copied()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
