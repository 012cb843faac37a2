//! `RentWire` — headless conversation client.
//!
//! Connects to a messaging backend, joins the requested conversations, and
//! prints everything the sync engine publishes. Lines typed on stdin are
//! sent to the active conversation; lines starting with `/` are commands.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/rentwire/config.toml`).
//!
//! ```bash
//! cargo run --bin rentwire -- --url ws://127.0.0.1:9000/ws \
//!     --token alice --join listing-42
//!
//! # Or via environment variables
//! RENTWIRE_URL=ws://127.0.0.1:9000/ws RENTWIRE_TOKEN=alice cargo run --bin rentwire
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use rentwire::bus::Subscription;
use rentwire::client::SyncClient;
use rentwire::config::{CliArgs, ClientConfig};
use rentwire::event::{ConnectionEvent, MessageEvent, RoomEvent, SyncEvent, TypingEvent};
use rentwire::transport::Credential;
use rentwire::transport::ws::WsConnector;
use rentwire_proto::message::{ConversationId, UserId};

const HELP: &str = "\
commands:
  /join <conversation>    join a room and make it active
  /leave [conversation]   leave a room (default: active)
  /switch <conversation>  make a joined room active
  /typing                 signal typing in the active room
  /read                   mark the active room read
  /who                    show online and typing users
  /rooms                  list joined rooms
  /quit                   disconnect and exit
anything else is sent to the active room";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // Load and resolve configuration (CLI args > env > config file > defaults).
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("rentwire starting");

    let (Some(url), Some(token)) = (config.url.as_deref(), config.token.as_deref()) else {
        eprintln!("error: --url and --token (or RENTWIRE_URL / RENTWIRE_TOKEN) are required");
        return ExitCode::FAILURE;
    };

    let connector = match WsConnector::new(url) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let client = SyncClient::new(connector, config.to_sync_config());
    let printer = tokio::spawn(print_events(client.subscribe()));

    if let Err(e) = client.connect(Credential::new(token)).await {
        eprintln!("error: failed to connect: {e}");
        printer.abort();
        return ExitCode::FAILURE;
    }

    let mut active = None;
    for room in config.room_ids() {
        client.join(room.clone());
        active = Some(room);
    }

    println!("{HELP}");
    run_repl(&client, active).await;

    client.shutdown().await;
    printer.abort();
    tracing::info!("rentwire exiting");
    ExitCode::SUCCESS
}

/// Initialize file-based logging.
///
/// Logs go to a file so they don't interleave with the event feed on stdout.
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("rentwire.log");
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

/// Reads stdin until EOF or `/quit`.
async fn run_repl(client: &SyncClient<WsConnector>, mut active: Option<ConversationId>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some(command) = line.strip_prefix('/') else {
            match &active {
                Some(room) => {
                    client.stop_typing(room);
                    if let Err(e) = client.send(room, line) {
                        println!("! {e}");
                    }
                }
                None => println!("! no active conversation, /join one first"),
            }
            continue;
        };

        let (name, arg) = command
            .split_once(' ')
            .map_or((command, None), |(n, a)| (n, Some(a.trim())));

        match (name, arg) {
            ("quit" | "q", _) => break,
            ("join", Some(room)) => {
                let room = ConversationId::new(room);
                client.join(room.clone());
                active = Some(room);
            }
            ("leave", arg) => {
                let room = arg.map(ConversationId::new).or_else(|| active.clone());
                if let Some(room) = room {
                    client.leave(&room);
                    if active.as_ref() == Some(&room) {
                        active = None;
                    }
                }
            }
            ("switch", Some(room)) => {
                let room = ConversationId::new(room);
                if client.rooms().contains(&room) {
                    active = Some(room);
                } else {
                    println!("! not joined to {room}");
                }
            }
            ("typing", _) => {
                if let Some(room) = &active {
                    client.start_typing(room);
                }
            }
            ("read", _) => {
                if let Some(room) = &active {
                    client.mark_read(room);
                }
            }
            ("who", _) => {
                let online = join_users(&client.online_users());
                println!("online: {online}");
                if let Some(room) = &active {
                    let typing = join_users(&client.typing_users(room));
                    println!("typing in {room}: {typing}");
                }
            }
            ("rooms", _) => {
                for room in client.rooms() {
                    let marker = if active.as_ref() == Some(&room) { "*" } else { " " };
                    println!("{marker} {room}");
                }
            }
            _ => println!("{HELP}"),
        }
    }
}

/// Prints bus events until the bus closes.
async fn print_events(mut events: Subscription) {
    while let Some(event) = events.recv().await {
        if let Some(line) = describe(&event) {
            println!("{line}");
        }
    }
}

/// One-line rendering of an event, or `None` for events not worth printing.
fn describe(event: &SyncEvent) -> Option<String> {
    let line = match event {
        SyncEvent::Connection(ConnectionEvent::Status { state, .. }) => {
            format!("-- {state}")
        }
        SyncEvent::Connection(ConnectionEvent::Connected { user_id }) => {
            format!("-- signed in as {user_id}")
        }
        SyncEvent::Connection(ConnectionEvent::Reconnecting { attempt, delay }) => {
            format!("-- reconnecting (attempt {attempt}, in {}s)", delay.as_secs())
        }
        SyncEvent::Connection(ConnectionEvent::ReconnectionFailed { attempts }) => {
            format!("-- gave up after {attempts} attempts")
        }
        SyncEvent::Connection(ConnectionEvent::ConnectionError { error }) => {
            format!("-- connection error: {error}")
        }
        SyncEvent::Connection(ConnectionEvent::ServerError { message }) => {
            format!("! {message}")
        }
        SyncEvent::Connection(ConnectionEvent::DispatchFailed { operation, error }) => {
            format!("! dropped {operation}: {error}")
        }
        SyncEvent::Message(MessageEvent::Received(msg)) => {
            format!("[{}] {}: {}", msg.conversation_id, msg.sender_id, msg.content)
        }
        SyncEvent::Message(MessageEvent::Edited(msg)) => {
            format!("[{}] {} (edited): {}", msg.conversation_id, msg.sender_id, msg.content)
        }
        SyncEvent::Message(MessageEvent::Read(receipt)) => {
            format!("[{}] read by {}", receipt.conversation_id, receipt.read_by)
        }
        SyncEvent::Typing(TypingEvent::Started(notice)) => {
            format!("[{}] {} is typing", notice.conversation_id, notice.user_id)
        }
        SyncEvent::Room(RoomEvent::Joined(room)) => format!("-- joined {room}"),
        SyncEvent::Room(RoomEvent::Left(room)) => format!("-- left {room}"),
        SyncEvent::Room(RoomEvent::MemberJoined(m)) => {
            format!("[{}] {} joined", m.conversation_id, m.user_id)
        }
        SyncEvent::Room(RoomEvent::MemberLeft(m)) => {
            format!("[{}] {} left", m.conversation_id, m.user_id)
        }
        SyncEvent::Presence(_)
        | SyncEvent::Typing(_)
        | SyncEvent::Connection(ConnectionEvent::Disconnected { .. })
        | SyncEvent::Message(MessageEvent::ListChanged { .. }) => return None,
    };
    Some(line)
}

fn join_users(users: &[UserId]) -> String {
    if users.is_empty() {
        return "nobody".to_string();
    }
    users
        .iter()
        .map(UserId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
