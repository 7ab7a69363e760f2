//! PAGI Talk: hands-free voice conversation with a PAGI gateway.
//!
//! Usage: `pagi-talk [--forget-pin] [--text "message"]`
//!
//! `--forget-pin` drops the pinned certificate for the configured host so the next TLS
//! connection pins afresh. `--text` sends one typed message instead of speaking the first turn.

mod config;
mod context;

use crate::config::TalkConfig;
use crate::context::TalkContext;
use pagi_session::ConnectionState;
use pagi_voice::VoiceState;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONNECT_WAIT: Duration = Duration::from_secs(20);

#[derive(Debug, Default)]
struct Args {
    forget_pin: bool,
    text: Option<String>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--forget-pin" => parsed.forget_pin = true,
            "--text" => {
                let text = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--text needs a message"))?;
                parsed.text = Some(text);
            }
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[pagi-talk] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    let config = TalkConfig::load()?;
    let context = TalkContext::build(config)?;

    if args.forget_pin {
        context.session.forget_pin(&context.endpoint.host)?;
        tracing::info!(host = %context.endpoint.host, "🔓 Forgot pinned certificate");
    }

    tracing::info!(
        endpoint = %context.endpoint,
        storage_path = %context.config.storage_path,
        "PAGI Talk starting"
    );
    context.session.connect(context.endpoint.clone()).await;
    tokio::spawn(log_connection(context.session.watch_state()));
    tokio::spawn(log_voice(context.orchestrator.watch_state()));
    tokio::spawn(log_status(context.orchestrator.watch_status()));

    let mut connection = context.session.watch_state();
    let connected =
        match tokio::time::timeout(CONNECT_WAIT, connection.wait_for(|s| s.is_connected())).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => anyhow::bail!("gateway session closed"),
            Err(_) => {
                tracing::warn!("Gateway not connected yet; continuing while it retries");
                false
            }
        };
    if connected {
        match context.chat.history(10).await {
            Ok(messages) => {
                for message in messages {
                    tracing::debug!(role = %message.role, "📜 {}", message.text);
                }
            }
            Err(e) => tracing::warn!("Could not load chat history: {}", e),
        }
    }

    context.orchestrator.start().await?;
    if let Some(text) = args.text {
        context.orchestrator.submit_text(text).await?;
    }

    let mut conversation = context.orchestrator.watch_conversation();
    let mut shown = 0;
    loop {
        tokio::select! {
            changed = conversation.changed() => {
                if changed.is_err() {
                    break;
                }
                let entries = conversation.borrow_and_update().clone();
                for entry in entries.iter().skip(shown) {
                    tracing::info!(role = ?entry.role, "💬 {}", entry.text);
                }
                shown = entries.len();
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down");
                break;
            }
        }
    }

    context.orchestrator.stop().await?;
    context.session.disconnect().await;
    Ok(())
}

async fn log_connection(mut state: watch::Receiver<ConnectionState>) {
    loop {
        let current = state.borrow_and_update().clone();
        match &current {
            ConnectionState::Connected { session_key } => {
                tracing::info!(session_key = ?session_key, "🟢 Gateway connected")
            }
            ConnectionState::WaitingForPairing => {
                tracing::warn!("Waiting for this device to be approved on the gateway")
            }
            ConnectionState::Error(message) => tracing::warn!("Gateway error: {}", message),
            other => tracing::debug!("Gateway {:?}", other),
        }
        if state.changed().await.is_err() {
            break;
        }
    }
}

async fn log_voice(mut state: watch::Receiver<VoiceState>) {
    while state.changed().await.is_ok() {
        let current = *state.borrow_and_update();
        tracing::debug!("Voice {:?}", current);
    }
}

async fn log_status(mut status: watch::Receiver<Option<String>>) {
    while status.changed().await.is_ok() {
        if let Some(message) = status.borrow_and_update().clone() {
            tracing::info!("ℹ️ {}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> anyhow::Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_flags() {
        let parsed = args(&["--forget-pin", "--text", "what's the weather"]).unwrap();
        assert!(parsed.forget_pin);
        assert_eq!(parsed.text.as_deref(), Some("what's the weather"));

        let empty = args(&[]).unwrap();
        assert!(!empty.forget_pin);
        assert!(empty.text.is_none());
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(args(&["--text"]).is_err());
        assert!(args(&["--loud"]).is_err());
    }
}
