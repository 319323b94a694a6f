use std::sync::Arc;

use anyhow::Context;

use nicobot_core::{
    config::{Backend, Config},
    messaging::{console::ConsoleChatter, port::Chatter, stealth::StealthChatter},
};
use nicobot_signal_cli::SignalBridge;
use nicobot_xmpp::{DisabledOmemo, EncryptedXmppSession, TokioXmppConnection};

mod askbot;

use askbot::AskBot;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    nicobot_core::logging::init("nicobot")?;

    let cfg = Config::load()?;
    let chatter = build_chatter(&cfg).await?;

    let stopper = chatter.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(name) => {
                tracing::info!("Received {name}, stopping...");
                stopper.stop();
            }
            Err(e) => tracing::warn!("Cannot listen for shutdown signals: {e}"),
        }
    });

    let status = AskBot::new(chatter, cfg.message.clone(), cfg.max_count)
        .run()
        .await?;
    println!("{}", serde_json::to_string(&status)?);
    Ok(())
}

async fn build_chatter(cfg: &Config) -> anyhow::Result<Arc<dyn Chatter>> {
    let chatter: Arc<dyn Chatter> = match cfg.backend {
        Backend::Console => match &cfg.input_file {
            Some(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("cannot open input file {}", path.display()))?;
                Arc::new(ConsoleChatter::new(file, tokio::io::stdout()))
            }
            None => Arc::new(ConsoleChatter::stdio()),
        },
        Backend::Signal => Arc::new(SignalBridge::new(cfg.signal()?)?),
        Backend::Jabber => {
            let xmpp = cfg.xmpp()?;
            if xmpp.encryption {
                tracing::warn!(
                    "No OMEMO engine is linked in: encrypted messages will be refused one by one; \
                     set JABBER_ENCRYPTION=false to talk in clear"
                );
            }
            let conn = Arc::new(TokioXmppConnection::new(&xmpp)?);
            Arc::new(EncryptedXmppSession::new(&xmpp, conn, Arc::new(DisabledOmemo))?)
        }
    };

    if cfg.stealth {
        tracing::debug!("Stealth mode: outbound messages are printed locally");
        return Ok(Arc::new(StealthChatter::stdout(chatter)));
    }
    Ok(chatter)
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    Ok(tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
    })
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
