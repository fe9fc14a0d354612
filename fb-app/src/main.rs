//! feedback-bridge binary.
//!
//! Relays feedback requests from local sessions into a Telegram chat and
//! routes the replies back.

mod config;
mod feedback;
mod init;
mod routes;
mod server;
mod state;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(
    name = "feedback-bridge",
    version,
    about = "Bridge local feedback requests to a Telegram chat"
)]
struct Cli {
    /// Config file (default: ~/.feedback-bridge/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the bridge server (default).
    Serve,
    /// Write a template config under ~/.feedback-bridge (idempotent).
    Init,
    /// Validate config and check the bot credentials against Telegram.
    Doctor,
    /// Send a feedback request and wait for the reply.
    Ask {
        summary: String,
        /// Seconds to wait for a reply.
        #[arg(long, default_value_t = 600)]
        timeout: u64,
    },
    /// One-shot message to the configured chat.
    Send { text: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let config_path = cli.config;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(config_path).await,
        Command::Init => {
            let report = init::initialize(config_path).await?;
            if report.created.is_empty() {
                println!(
                    "feedback-bridge init: already initialized at {}",
                    report.root.display()
                );
            } else {
                println!(
                    "feedback-bridge init: initialized {}",
                    report.root.display()
                );
                for path in &report.created {
                    println!("created {}", path.display());
                }
            }
            println!(
                "next: set telegram.bot_token and telegram.chat_id (or TELEGRAM_BOT_TOKEN / TELEGRAM_CHAT_ID)"
            );
            Ok(())
        }
        Command::Doctor => server::doctor(config_path).await,
        Command::Ask { summary, timeout } => {
            server::ask(config_path, &summary, Duration::from_secs(timeout)).await
        }
        Command::Send { text } => server::send_one_shot(config_path, &text).await,
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,feedback_bridge=debug,fb_app=debug,fb_bridge=debug,fb_channels=debug,tower_http=info",
        ),
    };
    let log_format = std::env::var("FEEDBACK_BRIDGE_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    // stdout is reserved for command output.
    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported FEEDBACK_BRIDGE_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        tracing::error!(
            panic_location = %location,
            panic_payload = %panic_payload_to_string(panic_info.payload()),
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command, panic_payload_to_string};
    use clap::Parser;

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["feedback-bridge"]).expect("parse");
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn ask_takes_summary_timeout_and_global_config() {
        let cli = Cli::try_parse_from([
            "feedback-bridge",
            "ask",
            "Refactor finished, ok to merge?",
            "--timeout",
            "30",
            "--config",
            "/tmp/fb.toml",
        ])
        .expect("parse");
        assert_eq!(
            cli.config.as_deref(),
            Some(std::path::Path::new("/tmp/fb.toml"))
        );
        match cli.command {
            Some(Command::Ask { summary, timeout }) => {
                assert_eq!(summary, "Refactor finished, ok to merge?");
                assert_eq!(timeout, 30);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn panic_payloads_render_as_text() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_payload_to_string(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_payload_to_string(boxed.as_ref()), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_payload_to_string(boxed.as_ref()), "non-string panic payload");
    }
}
