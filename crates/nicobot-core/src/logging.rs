use tracing_subscriber::{fmt, EnvFilter};

use crate::{errors::Error, Result};

/// Initialize logging/tracing for the bot.
///
/// Logs go to stderr: stdout carries chat output and the final status line.
pub fn init(service_name: &str) -> Result<()> {
    let level = if debug_requested() { "debug" } else { "info" };

    // Default: info for our crates, warn for everything else.
    // Can be overridden with `RUST_LOG`.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,nicobot={level},nicobot_core={level},nicobot_signal_cli={level},nicobot_xmpp={level},{service_name}={level}"
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .try_init()
        .map_err(|e| Error::External(format!("failed to install tracing subscriber: {e}")))
}

fn debug_requested() -> bool {
    std::env::var("NICOBOT_DEBUG")
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
