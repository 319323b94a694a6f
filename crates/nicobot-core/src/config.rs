use std::{
    env,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    domain::{Destination, Identity},
    errors::Error,
    Result,
};

/// Relay `send` bound (the `receive` call carries its own `-t`).
pub const DEFAULT_SIGNAL_SEND_TIMEOUT: Duration = Duration::from_secs(30);
/// Relay `receive` poll; short so the stop flag is re-read promptly.
pub const DEFAULT_SIGNAL_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Chat backend selected for a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Console,
    Signal,
    Jabber,
}

impl Backend {
    fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "console" => Ok(Backend::Console),
            "signal" => Ok(Backend::Signal),
            "jabber" | "xmpp" => Ok(Backend::Jabber),
            other => Err(Error::Config(format!(
                "unknown backend {other:?} (expected console, signal or jabber)"
            ))),
        }
    }
}

/// Typed configuration, finished before any chatter is built.
#[derive(Clone, Debug)]
pub struct Config {
    // Generic
    pub backend: Backend,
    pub username: Option<String>,
    pub recipient: Option<String>,
    pub stealth: bool,
    pub input_file: Option<PathBuf>,
    pub message: Option<String>,
    pub max_count: i64,

    // Signal relay
    pub signal_cli_path: Option<PathBuf>,
    pub signal_username: Option<String>,
    pub signal_recipient: Option<String>,
    pub signal_group: Option<String>,
    pub signal_stealth: bool,
    pub signal_send_timeout: Duration,
    pub signal_receive_timeout: Option<Duration>,

    // Jabber / XMPP
    pub jabber_username: Option<String>,
    pub jabber_recipient: Option<String>,
    pub jabber_password: Option<String>,
    pub jabber_encryption: bool,
}

impl Config {
    /// Load from `.env` (if present) and the process environment.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);
        let get_bool = |key: &str| get(key).map(|s| parse_bool(&s));

        let backend = Backend::parse(&get("NICOBOT_BACKEND").unwrap_or_default())?;

        let max_count = match get("NICOBOT_MAX_COUNT") {
            Some(v) => v.trim().parse::<i64>().map_err(|_| {
                Error::Config(format!("NICOBOT_MAX_COUNT must be an integer, got {v:?}"))
            })?,
            None => -1,
        };

        let signal_send_timeout = match get("SIGNAL_SEND_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(v.trim().parse::<u64>().map_err(|_| {
                Error::Config(format!(
                    "SIGNAL_SEND_TIMEOUT_SECS must be a positive integer, got {v:?}"
                ))
            })?),
            None => DEFAULT_SIGNAL_SEND_TIMEOUT,
        };

        // Negative values disable the bound; zero falls back to the default poll.
        let signal_receive_timeout = match get("SIGNAL_RECEIVE_TIMEOUT_SECS") {
            Some(v) => {
                let secs = v.trim().parse::<i64>().map_err(|_| {
                    Error::Config(format!(
                        "SIGNAL_RECEIVE_TIMEOUT_SECS must be an integer, got {v:?}"
                    ))
                })?;
                match secs {
                    s if s < 0 => None,
                    0 => Some(DEFAULT_SIGNAL_RECEIVE_TIMEOUT),
                    s => Some(Duration::from_secs(s as u64)),
                }
            }
            None => Some(DEFAULT_SIGNAL_RECEIVE_TIMEOUT),
        };

        let signal_cli_path = get("SIGNAL_CLI_PATH")
            .map(PathBuf::from)
            .or_else(|| which_in_path("signal-cli"));

        Ok(Self {
            backend,
            username: get("NICOBOT_USERNAME"),
            recipient: get("NICOBOT_RECIPIENT"),
            stealth: get_bool("NICOBOT_STEALTH").unwrap_or(false),
            input_file: get("NICOBOT_INPUT_FILE").map(PathBuf::from),
            message: get("NICOBOT_MESSAGE"),
            max_count,
            signal_cli_path,
            signal_username: get("SIGNAL_USERNAME"),
            signal_recipient: get("SIGNAL_RECIPIENT"),
            signal_group: get("SIGNAL_GROUP"),
            signal_stealth: get_bool("SIGNAL_STEALTH").unwrap_or(false),
            signal_send_timeout,
            signal_receive_timeout,
            jabber_username: get("JABBER_USERNAME"),
            jabber_recipient: get("JABBER_RECIPIENT"),
            jabber_password: get("JABBER_PASSWORD"),
            jabber_encryption: get_bool("JABBER_ENCRYPTION").unwrap_or(true),
        })
    }

    /// Signal settings; backend-specific values override the generic ones.
    pub fn signal(&self) -> Result<SignalConfig> {
        let cli_path = self.signal_cli_path.clone().ok_or_else(|| {
            Error::Config(
                "could not find the 'signal-cli' command in PATH and SIGNAL_CLI_PATH is not set"
                    .to_string(),
            )
        })?;
        let username = self
            .signal_username
            .clone()
            .or_else(|| self.username.clone())
            .ok_or_else(|| Error::Config("missing SIGNAL_USERNAME".to_string()))?;
        let recipient = self
            .signal_recipient
            .clone()
            .or_else(|| self.recipient.clone());

        let cfg = SignalConfig {
            cli_path,
            username: Identity(username),
            destination: Destination::from_parts(recipient, self.signal_group.clone())?,
            stealth: self.signal_stealth,
            send_timeout: self.signal_send_timeout,
            receive_timeout: self.signal_receive_timeout,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// XMPP settings; backend-specific values override the generic ones.
    pub fn xmpp(&self) -> Result<XmppConfig> {
        let jid = self
            .jabber_username
            .clone()
            .or_else(|| self.username.clone())
            .ok_or_else(|| Error::Config("missing JABBER_USERNAME".to_string()))?;
        let password = self
            .jabber_password
            .clone()
            .ok_or_else(|| Error::Config("missing JABBER_PASSWORD".to_string()))?;
        let recipient = self
            .jabber_recipient
            .clone()
            .or_else(|| self.recipient.clone())
            .ok_or_else(|| Error::Config("missing JABBER_RECIPIENT".to_string()))?;

        Ok(XmppConfig {
            jid: Identity(jid),
            password,
            recipient: Identity(recipient),
            encryption: self.jabber_encryption,
        })
    }
}

/// Settings for the Signal relay bridge.
#[derive(Clone, Debug)]
pub struct SignalConfig {
    pub cli_path: PathBuf,
    pub username: Identity,
    pub destination: Destination,
    /// Log sends instead of spawning the relay.
    pub stealth: bool,
    pub send_timeout: Duration,
    /// `None` lets the relay block until a message arrives.
    pub receive_timeout: Option<Duration>,
}

impl SignalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.username.0.trim().is_empty() {
            return Err(Error::Config("signal username must not be empty".to_string()));
        }
        if !is_executable_file(&self.cli_path) {
            return Err(Error::Config(format!(
                "signal-cli executable not found: {}",
                self.cli_path.display()
            )));
        }
        Ok(())
    }
}

/// Settings for the XMPP/OMEMO session.
#[derive(Clone, Debug)]
pub struct XmppConfig {
    pub jid: Identity,
    pub password: String,
    pub recipient: Identity,
    /// Encrypt outbound messages with OMEMO (plain otherwise).
    pub encryption: bool,
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn which_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(binary);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(p: &Path) -> bool {
    if !p.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(md) = fs::metadata(p) {
            return (md.permissions().mode() & 0o111) != 0;
        }
    }
    true
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_to_console_backend() {
        let cfg = cfg_from(&[]).unwrap();
        assert_eq!(cfg.backend, Backend::Console);
        assert_eq!(cfg.max_count, -1);
        assert!(!cfg.stealth);
        assert_eq!(cfg.signal_send_timeout, DEFAULT_SIGNAL_SEND_TIMEOUT);
        assert_eq!(
            cfg.signal_receive_timeout,
            Some(DEFAULT_SIGNAL_RECEIVE_TIMEOUT)
        );
        assert!(cfg.jabber_encryption);
    }

    #[test]
    fn unknown_backend_is_a_config_error() {
        let err = cfg_from(&[("NICOBOT_BACKEND", "irc")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn negative_receive_timeout_disables_bound() {
        let cfg = cfg_from(&[("SIGNAL_RECEIVE_TIMEOUT_SECS", "-1")]).unwrap();
        assert_eq!(cfg.signal_receive_timeout, None);

        let cfg = cfg_from(&[("SIGNAL_RECEIVE_TIMEOUT_SECS", "12")]).unwrap();
        assert_eq!(cfg.signal_receive_timeout, Some(Duration::from_secs(12)));
    }

    #[test]
    fn signal_rejects_recipient_and_group_together() {
        let cfg = cfg_from(&[
            ("NICOBOT_BACKEND", "signal"),
            ("SIGNAL_CLI_PATH", "/bin/sh"),
            ("SIGNAL_USERNAME", "+33123456789"),
            ("SIGNAL_RECIPIENT", "+100"),
            ("SIGNAL_GROUP", "mPC9JNVoKDGz0YeZMsbL1Q=="),
        ])
        .unwrap();
        assert!(matches!(cfg.signal(), Err(Error::Config(_))));
    }

    #[test]
    fn signal_requires_existing_executable() {
        let cfg = cfg_from(&[
            ("SIGNAL_CLI_PATH", "/nonexistent/signal-cli"),
            ("SIGNAL_USERNAME", "+33123456789"),
            ("SIGNAL_RECIPIENT", "+100"),
        ])
        .unwrap();
        let err = cfg.signal().unwrap_err();
        assert!(err.to_string().contains("not found"), "got: {err}");
    }

    #[cfg(unix)]
    #[test]
    fn signal_specific_values_override_generic_ones() {
        let cfg = cfg_from(&[
            ("SIGNAL_CLI_PATH", "/bin/sh"),
            ("NICOBOT_USERNAME", "+1"),
            ("SIGNAL_USERNAME", "+2"),
            ("NICOBOT_RECIPIENT", "+100"),
        ])
        .unwrap();
        let sig = cfg.signal().unwrap();
        assert_eq!(sig.username, Identity::new("+2"));
        assert_eq!(sig.destination, Destination::Recipient(Identity::new("+100")));
    }

    #[test]
    fn xmpp_requires_password() {
        let cfg = cfg_from(&[
            ("JABBER_USERNAME", "bot@example.org"),
            ("JABBER_RECIPIENT", "me@example.org"),
        ])
        .unwrap();
        assert!(matches!(cfg.xmpp(), Err(Error::Config(_))));

        let cfg = cfg_from(&[
            ("JABBER_USERNAME", "bot@example.org"),
            ("JABBER_RECIPIENT", "me@example.org"),
            ("JABBER_PASSWORD", "secret"),
            ("JABBER_ENCRYPTION", "no"),
        ])
        .unwrap();
        let x = cfg.xmpp().unwrap();
        assert_eq!(x.jid, Identity::new("bot@example.org"));
        assert!(!x.encryption);
    }
}
