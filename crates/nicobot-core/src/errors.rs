use std::process::ExitStatus;
use std::time::Duration;

/// Core error type for the runtime.
///
/// Adapter crates map their specific failures into this type so the driver can
/// tell message-scoped failures (logged, loop continues) from fatal ones.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("send failed ({status}){}", stderr_suffix(.stderr))]
    Send { status: ExitStatus, stderr: String },

    #[error("receive failed ({status}){}", stderr_suffix(.stderr))]
    Receive { status: ExitStatus, stderr: String },

    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// True when the failure only concerns a single message attempt.
    ///
    /// Receive loops log these and keep going; everything else tears the
    /// loop down and reaches the process boundary.
    pub fn is_message_scoped(&self) -> bool {
        matches!(
            self,
            Error::Send { .. } | Error::Timeout { .. } | Error::Crypto(_) | Error::Json(_)
        )
    }
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!("\nstderr (tail):\n{stderr}")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
