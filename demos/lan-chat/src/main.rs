use std::path::Path;

use lanlink::prelude::*;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage:
  lan-chat host <port>
  lan-chat join <address> <port> <nickname>

Lines typed on stdin are sent to everyone. Commands:
  /me <action>          send an action line
  /to <nick> <text>     send to one peer
  /who                  list connected peers
  /quit                 leave

Set LAN_CHAT_CONFIG to a JSON file to override HostConfig / PeerConfig.";

/// App tag for plain chat lines.
const SAY: u8 = 0;
/// App tag for `/me` lines.
const ACTION: u8 = 1;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Say(&'a str),
    Action(&'a str),
    Whisper { to: &'a str, text: &'a str },
    Who,
    Quit,
    Empty,
}

fn parse(line: &str) -> Command<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    match line.split_once(' ') {
        Some(("/me", action)) => Command::Action(action.trim()),
        Some(("/to", rest)) => match rest.trim().split_once(' ') {
            Some((to, text)) => Command::Whisper {
                to,
                text: text.trim(),
            },
            None => Command::Empty,
        },
        _ if line == "/who" => Command::Who,
        _ if line == "/quit" => Command::Quit,
        _ => Command::Say(line),
    }
}

fn render(msg: &Incoming) -> String {
    let from = msg.from_nickname.as_deref().unwrap_or("host");
    let text = match &msg.payload {
        Payload::Text(text) => text.clone(),
        Payload::Binary(bytes) => format!("<{} bytes>", bytes.len()),
    };
    let private = matches!(
        msg.routing_tag,
        RoutingTag::ClientToClient | RoutingTag::ServerToClient
    );
    match (msg.app_tag, private) {
        (ACTION, _) => format!("* {from} {text}"),
        (_, true) => format!("[{from} → you] {text}"),
        _ => format!("<{from}> {text}"),
    }
}

fn print_directory(directory: &PeerDirectory) {
    for (id, nickname) in directory.iter() {
        println!("  {id}: {nickname}");
    }
}

/// Loads `LAN_CHAT_CONFIG` if set, defaults otherwise.
fn load_config<T: DeserializeOwned + Default>() -> Result<T, Box<dyn std::error::Error>> {
    match std::env::var_os("LAN_CHAT_CONFIG") {
        Some(path) => {
            let raw = std::fs::read_to_string(Path::new(&path))?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(T::default()),
    }
}

// ---------------------------------------------------------------------------
// Host and peer loops
// ---------------------------------------------------------------------------

async fn run_host(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let host = Host::builder()
        .config(load_config()?)
        .on_client_connect(|nick| println!("-- {nick} joined"))
        .on_client_disconnect(|nick| println!("-- {nick} left"))
        .on_receive(|msg| println!("{}", render(msg)))
        .on_error(|e| tracing::warn!(error = %e, "session error"))
        .start(port)
        .await?;
    println!("-- hosting on {}", host.local_addr()?);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let result = match parse(&line) {
            Command::Say(text) => host.send_to_all(text, SAY),
            Command::Action(text) => host.send_to_all(text, ACTION),
            Command::Whisper { to, text } => host.send_to_client(to, text, SAY),
            Command::Who => {
                print_directory(&host.peers());
                Ok(())
            }
            Command::Quit => break,
            Command::Empty => Ok(()),
        };
        if let Err(e) = result {
            println!("-- {e}");
        }
    }

    host.stop();
    Ok(())
}

async fn run_peer(address: &str, port: u16, nickname: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut config: PeerConfig = load_config()?;
    config.nickname = nickname.to_string();

    let peer = Peer::builder()
        .config(config)
        .on_client_connect(|nick| println!("-- {nick} joined"))
        .on_client_disconnect(|nick| println!("-- {nick} left"))
        .on_receive(|msg| println!("{}", render(msg)))
        .on_error(|e| tracing::debug!(error = %e, "session error"))
        .on_lost_connection(|| println!("-- lost connection to host"))
        .on_reconnection_attempt(|n| println!("-- reconnecting (attempt {n})"))
        .build();
    peer.connect(address, port).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let result = match parse(&line) {
            Command::Say(text) => peer.send_to_all(text, SAY),
            Command::Action(text) => peer.send_to_all(text, ACTION),
            Command::Whisper { to, text } => peer.send_to_client(to, text, SAY),
            Command::Who => {
                println!("-- you are {} ({})", peer.nickname(), peer.local_id());
                print_directory(&peer.directory());
                Ok(())
            }
            Command::Quit => break,
            Command::Empty => Ok(()),
        };
        if let Err(e) = result {
            println!("-- {e}");
        }
    }

    peer.disconnect();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["host", port] => run_host(port.parse()?).await,
        ["join", address, port, nickname] => run_peer(address, port.parse()?, nickname).await,
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}
