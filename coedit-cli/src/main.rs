//! coedit: headless collaborative editing client and development relay.
//!
//! ```text
//! coedit-cli relay   --bind 127.0.0.1:8765 [--seed FILE]
//! coedit-cli connect --relay ws://127.0.0.1:8765 --group 1 --project 1 --token 7
//! ```
//!
//! In `connect` mode every stdin line is appended to the shared document.
//! `:undo`, `:redo`, `:chat <message>` and `:quit` are commands.

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::LocalSet;

use coedit_session::{
    ClientHandle, Credential, DevRelay, RelayConfig, Session, SessionConfig, SessionEvent,
    SyncClient,
};

#[derive(Debug, Parser)]
#[command(name = "coedit-cli", version, about = "Collaborative editing session client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the in-memory development relay.
    Relay {
        #[arg(long, default_value = "127.0.0.1:8765")]
        bind: String,
        /// File whose content seeds every new room
        #[arg(long)]
        seed: Option<PathBuf>,
        #[arg(long, default_value_t = 512 * 1024)]
        max_message_size: usize,
    },
    /// Join a session and edit from stdin.
    Connect(ConnectArgs),
}

#[derive(Debug, Args)]
struct ConnectArgs {
    #[arg(long, default_value = "ws://127.0.0.1:8765")]
    relay: String,
    #[arg(long)]
    group: u64,
    #[arg(long)]
    project: u64,
    #[arg(long, conflicts_with = "share_token")]
    token: Option<String>,
    #[arg(long)]
    share_token: Option<String>,
    /// Local user id as reported in the relay roster (defaults to the token)
    #[arg(long)]
    user: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Relay {
            bind,
            seed,
            max_message_size,
        } => {
            let seed = match seed {
                Some(path) => Some(tokio::fs::read_to_string(&path).await?),
                None => None,
            };
            let relay = DevRelay::new(RelayConfig {
                bind_addr: bind,
                seed,
                max_message_size,
                ..RelayConfig::default()
            });
            relay.run().await?;
            Ok(())
        }
        Command::Connect(args) => LocalSet::new().run_until(connect(args)).await,
    }
}

async fn connect(args: ConnectArgs) -> Result<(), Box<dyn Error>> {
    let credential = match (args.token, args.share_token) {
        (Some(token), _) => Some(Credential::Token(token)),
        (None, Some(share)) => Some(Credential::Share(share)),
        (None, None) => None,
    };
    let mut builder = Session::builder(args.relay)
        .group(args.group)
        .project(args.project);
    if let Some(credential) = credential {
        builder = builder.credential(credential);
    }
    if let Some(user) = args.user {
        builder = builder.user(user);
    }
    let session = builder.build()?;

    let (client, handle, mut events) = SyncClient::new(session, SessionConfig::default());
    let driver = tokio::task::spawn_local(client.run());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut doc_len: u32 = 0;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => run_line(&handle, &line, &mut doc_len)?,
                None => {
                    stdin_open = false;
                    handle.close()?;
                }
            },
            event = events.recv() => match event {
                Some(event) => report(event, &mut doc_len),
                None => break,
            },
        }
    }

    driver.await??;
    Ok(())
}

fn run_line(handle: &ClientHandle, line: &str, doc_len: &mut u32) -> Result<(), Box<dyn Error>> {
    match line.trim() {
        ":quit" => handle.close()?,
        ":undo" => handle.undo()?,
        ":redo" => handle.redo()?,
        command if command.starts_with(":chat ") => handle.chat(&command[":chat ".len()..])?,
        _ => {
            let text = format!("{line}\n");
            let units = text.encode_utf16().count() as u32;
            handle.insert(*doc_len, text)?;
            *doc_len += units;
        }
    }
    Ok(())
}

fn report(event: SessionEvent, doc_len: &mut u32) {
    match event {
        SessionEvent::StateChanged(state) => info!("Session {state}"),
        SessionEvent::TextChanged(text) => {
            *doc_len = text.encode_utf16().count() as u32;
            println!("────────\n{text}");
        }
        SessionEvent::PresenceChanged(peers) => {
            let names: Vec<String> = peers.into_iter().map(|p| p.user.name).collect();
            info!("Present: {}", names.join(", "));
        }
        SessionEvent::Roster(users) => {
            let names: Vec<String> = users.iter().map(|u| u.display_name()).collect();
            info!("Connected users: {}", names.join(", "));
        }
        SessionEvent::Chat(chat) => println!(
            "[{}] {}",
            chat.user_email.as_deref().unwrap_or("?"),
            chat.message
        ),
        SessionEvent::VoiceRoomUpdate(participants) => {
            debug!("Voice room: {} participants", participants.len())
        }
        SessionEvent::VoiceSignal(signal) => debug!("Voice signal from {:?}", signal.from_user),
        SessionEvent::RelayError(message) => warn!("Relay error: {message}"),
        SessionEvent::Latency(rtt) => debug!("Round trip {rtt:?}"),
        SessionEvent::Evicted => warn!("Session ended by the relay; your work was saved"),
        SessionEvent::Rejected { code, reason } => error!("Access denied (code {code}): {reason}"),
        SessionEvent::Crashed(reason) => error!("Editor crashed: {reason}"),
        SessionEvent::ReconnectFailed => error!("Could not reconnect to the relay"),
        SessionEvent::Closed => info!("Session closed"),
    }
}
