//! `socialchat`: line-oriented chat client.
//!
//! Connects to the backend chat socket, loads the first page of the
//! conversation with `--peer`, prints incoming messages, and sends every
//! typed line as a text message. Configuration via CLI flags, environment
//! variables, or config file (`~/.config/socialchat/config.toml`).
//!
//! ```bash
//! cargo run --bin socialchat -- --backend-url https://api.example.com \
//!     --token "$TOKEN" --user-id 7 --peer 9
//!
//! # Or via environment variables
//! SOCIALCHAT_BACKEND_URL=http://localhost:3000 SOCIALCHAT_TOKEN=... \
//!     SOCIALCHAT_USER_ID=7 SOCIALCHAT_PEER=9 cargo run
//! ```
//!
//! Commands: `/history <page>`, `/show`, `/clear`, `/quit`.

use std::path::Path;
use std::process::ExitCode;

use chrono::Local;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use socialchat::client::{ChatClient, ClientEvent};
use socialchat::config::{CliArgs, ClientConfig, SessionConfig};
use socialchat::store::Message;
use socialchat::transport::Connector;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::from_cli(&cli)
        }
    };

    // Logs go to a file; stdout belongs to the conversation.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let Some(session) = config.session() else {
        eprintln!("A token, --user-id and --peer are required to start a chat.");
        return ExitCode::from(2);
    };

    tracing::info!(user = %session.user_id, peer = %session.peer_id, "socialchat starting");

    let (client, events) =
        ChatClient::over_websocket(config.chat_settings(), config.connect_timeout);
    if let Err(e) = client.connect(&session.token) {
        eprintln!("Cannot connect: {e}");
        return ExitCode::FAILURE;
    }

    let result = run_chat(&client, events, &session, config.history_page_size).await;
    client.disconnect();
    tracing::info!("socialchat exiting");

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("stdin error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("socialchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// A line typed by the user.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Send(String),
    History(u32),
    Show,
    Clear,
    Quit,
    Invalid(String),
    Empty,
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Send(line.to_string());
    };

    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("quit" | "q"), None) => Input::Quit,
        (Some("show"), None) => Input::Show,
        (Some("clear"), None) => Input::Clear,
        (Some("history"), Some(page)) => match page.parse::<u32>() {
            Ok(page) if page > 0 => Input::History(page),
            _ => Input::Invalid(format!("not a page number: {page}")),
        },
        _ => Input::Invalid(format!("unknown command: /{command}")),
    }
}

async fn run_chat<C: Connector>(
    client: &ChatClient<C>,
    mut events: tokio::sync::mpsc::Receiver<ClientEvent>,
    session: &SessionConfig,
    page_size: u32,
) -> std::io::Result<()> {
    let me = &session.user_id;
    let peer = &session.peer_id;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("* connecting...");
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { return Ok(()) };
                match event {
                    ClientEvent::Connected => {
                        println!("* connected");
                        client.get_message_history(peer, 1, page_size, Some(me));
                    }
                    ClientEvent::Disconnected { code, retry_in: Some(delay) } => {
                        println!("* disconnected ({code}), retrying in {}s", delay.as_secs());
                    }
                    ClientEvent::Disconnected { code, retry_in: None } => {
                        println!("* disconnected ({code})");
                    }
                    ClientEvent::MessageReceived(message) => {
                        let involves_peer = message
                            .conversation_key()
                            .is_some_and(|key| key.involves(peer) && key.involves(me));
                        if involves_peer {
                            print_message(&message, me);
                        }
                    }
                    ClientEvent::TransportFailed { .. } | ClientEvent::FrameRejected { .. } => {}
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { return Ok(()) };
                match parse_input(&line) {
                    Input::Send(text) => {
                        if !client.send_text_message(peer, &text) {
                            println!("! not connected, message not sent");
                        }
                    }
                    Input::History(page) => {
                        if !client.get_message_history(peer, page, page_size, Some(me)) {
                            println!("! not connected, history not requested");
                        }
                    }
                    Input::Show => {
                        for message in client.get_conversation_messages(Some(peer), Some(me)) {
                            print_message(&message, me);
                        }
                    }
                    Input::Clear => {
                        client.clear_conversation_messages(Some(peer), Some(me));
                        client.clear_loaded_conversations();
                        println!("* conversation cleared");
                    }
                    Input::Quit => return Ok(()),
                    Input::Invalid(reason) => println!("! {reason}"),
                    Input::Empty => {}
                }
            }
        }
    }
}

fn print_message(message: &Message, me: &socialchat_proto::id::UserId) {
    let when = message.timestamp.with_timezone(&Local).format("%H:%M");
    let who = match &message.sender_id {
        Some(sender) if sender == me => "you".to_string(),
        Some(sender) => sender.to_string(),
        None => "?".to_string(),
    };
    println!(
        "[{when}] {who}: {}",
        message.content.as_deref().unwrap_or_default()
    );
}
