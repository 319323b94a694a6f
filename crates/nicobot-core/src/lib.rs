//! Core contract + shared plumbing for the nicobot message-bot runtime.
//!
//! This crate is intentionally transport-agnostic. Signal (relay process) and
//! XMPP/OMEMO live behind the `Chatter` port in adapter crates.

pub mod config;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod messaging;
pub mod utils;

pub use errors::{Error, Result};
