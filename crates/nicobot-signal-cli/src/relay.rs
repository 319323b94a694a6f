//! `signal-cli` invocations: argument building and bounded process runs.

use std::{collections::VecDeque, path::PathBuf, process::ExitStatus, process::Stdio, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::Mutex,
};

use nicobot_core::{config::SignalConfig, domain::Destination, errors::Error, Result};

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;

/// A concrete relay invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl RelayInvocation {
    /// `<relay> -u <user> send -m <text> (<recipient> | -g <group>)`
    pub fn send(cfg: &SignalConfig, text: &str) -> Self {
        let mut args = vec![
            "-u".to_string(),
            cfg.username.0.clone(),
            "send".to_string(),
            "-m".to_string(),
            text.to_string(),
        ];
        match &cfg.destination {
            Destination::Recipient(r) => args.push(r.0.clone()),
            Destination::Group(g) => {
                args.push("-g".to_string());
                args.push(g.0.clone());
            }
        }
        Self {
            program: cfg.cli_path.clone(),
            args,
        }
    }

    /// `<relay> -u <user> receive --json [-t <secs>]`
    pub fn receive(cfg: &SignalConfig) -> Self {
        let mut args = vec![
            "-u".to_string(),
            cfg.username.0.clone(),
            "receive".to_string(),
            "--json".to_string(),
        ];
        if let Some(t) = cfg.receive_timeout {
            args.push("-t".to_string());
            args.push(t.as_secs().to_string());
        }
        Self {
            program: cfg.cli_path.clone(),
            args,
        }
    }

    /// Args with the message text masked, for logs.
    pub fn redacted_args(&self) -> Vec<String> {
        let mut out = self.args.clone();
        if let Some(i) = out.iter().position(|a| a == "-m") {
            if let Some(text) = out.get_mut(i + 1) {
                *text = format!("<{} chars>", text.chars().count());
            }
        }
        out
    }
}

/// Captured result of one relay run.
#[derive(Debug)]
pub struct RelayOutput {
    pub status: ExitStatus,
    pub stdout_lines: Vec<String>,
    pub stderr: String,
}

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        // +1 for the '\n' we join with later.
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            if let Some(front) = self.lines.pop_front() {
                self.bytes = self.bytes.saturating_sub(front.len() + 1);
            } else {
                break;
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Run the relay to completion, collecting stdout lines.
///
/// With a `limit`, a run that has not exited in time is killed and reported
/// as `Error::Timeout`. Spawn failures (missing or non-executable relay) are
/// connection errors.
pub async fn run(
    inv: &RelayInvocation,
    operation: &'static str,
    limit: Option<Duration>,
) -> Result<RelayOutput> {
    let fut = run_to_completion(inv);
    match limit {
        // Dropping the future drops the child, which kills it.
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .map_err(|_| Error::Timeout { operation, after })?,
        None => fut.await,
    }
}

async fn run_to_completion(inv: &RelayInvocation) -> Result<RelayOutput> {
    let mut cmd = Command::new(&inv.program);
    cmd.args(&inv.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        Error::Connection(format!(
            "failed to spawn {}: {e}",
            inv.program.display()
        ))
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::External("signal-cli stdout was not captured".to_string()))?;
    let stderr_tail: Arc<Mutex<StderrTail>> = Arc::new(Mutex::new(StderrTail::default()));

    // Drain stderr in background to avoid blocking on a full pipe.
    let stderr_task = child.stderr.take().map(|stderr| {
        let tail = stderr_tail.clone();
        tokio::spawn(async move {
            let mut r = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = r.next_line().await {
                tail.lock().await.push_line(line);
            }
        })
    });

    let mut stdout_lines = Vec::new();
    let mut reader = BufReader::new(stdout).lines();
    while let Some(line) = reader.next_line().await? {
        tracing::trace!("Read line: {line}");
        stdout_lines.push(line);
    }

    let status = child.wait().await?;
    if let Some(task) = stderr_task {
        let _ = task.await;
    }
    let stderr = stderr_tail.lock().await.snapshot();

    Ok(RelayOutput {
        status,
        stdout_lines,
        stderr,
    })
}
