mod core;
mod utils;

use crate::core::engine::{AppEvent, Command, Engine};
use crate::core::transfer::session::Direction;
use crate::utils::format::{format_file_size, percent, short_peer_id};
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Roomdrop - room-based P2P file transfer.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// WebSocket URL of the signaling relay.
    #[clap(long, default_value = "ws://127.0.0.1:8080")]
    relay: String,

    /// Room to join. Everyone in the same room can exchange files.
    #[clap(long)]
    room: String,

    /// Display name announced to the room.
    #[clap(long)]
    name: String,

    /// Directory received files are written to.
    #[clap(long, default_value = "downloads")]
    downloads: PathBuf,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Note: webrtc_ice generates many "unknown TransactionID" warnings for
    // late-arriving STUN responses, which are normal. Filter these out.
    let filter = match args.verbose {
        0 => "warn,roomdrop=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let relay = url::Url::parse(&args.relay).context("invalid relay URL")?;
    if relay.scheme() != "ws" && relay.scheme() != "wss" {
        bail!("relay URL must use ws:// or wss://, got {}", relay.scheme());
    }

    tokio::fs::create_dir_all(&args.downloads)
        .await
        .with_context(|| format!("creating download dir {}", args.downloads.display()))?;

    let (engine, handle, mut events) = Engine::connect(
        relay.as_str(),
        &args.room,
        &args.name,
        args.downloads.clone(),
    )
    .await
    .context("joining room")?;
    let engine_task = tokio::spawn(engine.run());

    println!(
        "joined room '{}' as '{}' (downloads: {})",
        args.room,
        args.name,
        args.downloads.display()
    );
    println!("commands: send <peer> <path> | accept <peer> | cancel <peer> | peers | quit");

    // App events print independently of the prompt loop.
    tokio::spawn(async move {
        while let Some(ev) = events.recv().await {
            println!("{}", describe_event(&ev));
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                handle.send(Command::Quit);
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    handle.send(Command::Quit);
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Some(Command::Quit) => {
                        handle.send(Command::Quit);
                        break;
                    }
                    Some(cmd) => {
                        handle.send(cmd);
                    }
                    None => {
                        println!("unrecognized command: {line}");
                        println!("commands: send <peer> <path> | accept <peer> | cancel <peer> | peers | quit");
                    }
                }
            }
        }
    }

    engine_task.await.ok();
    Ok(())
}

/// Parse one prompt line into an engine command.
fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    match parts.next()? {
        "send" => {
            let peer_id = parts.next()?.to_string();
            let rest: Vec<&str> = parts.collect();
            if rest.is_empty() {
                return None;
            }
            Some(Command::SendFile {
                peer_id,
                path: PathBuf::from(rest.join(" ")),
            })
        }
        "accept" => Some(Command::AcceptRequest {
            peer_id: parts.next()?.to_string(),
        }),
        "cancel" => Some(Command::CancelRequest {
            peer_id: parts.next()?.to_string(),
        }),
        "peers" => Some(Command::ListPeers),
        "quit" | "exit" => Some(Command::Quit),
        _ => None,
    }
}

/// One-line, human-readable rendering of an app event.
fn describe_event(ev: &AppEvent) -> String {
    match ev {
        AppEvent::PeerJoined {
            peer_id,
            display_name,
        } => format!("* {} joined ({})", display_name, short_peer_id(peer_id)),
        AppEvent::PeerLeft {
            peer_id,
            display_name,
        } => format!("* {} left ({})", display_name, short_peer_id(peer_id)),
        AppEvent::PeerReady { peer_id } => {
            format!("* channel open to {}", short_peer_id(peer_id))
        }
        AppEvent::IncomingRequest {
            peer_id,
            file_name,
            file_size,
        } => format!(
            "* {} offers '{}' ({}) - accept {} or cancel {}",
            short_peer_id(peer_id),
            file_name,
            format_file_size(*file_size),
            short_peer_id(peer_id),
            short_peer_id(peer_id),
        ),
        AppEvent::Progress {
            peer_id,
            direction,
            file_name,
            bytes_transferred,
            file_size,
        } => {
            let verb = match direction {
                Direction::Send => "sending",
                Direction::Receive => "receiving",
            };
            format!(
                "  {} '{}' {}/{} ({}%) [{}]",
                verb,
                file_name,
                format_file_size(*bytes_transferred),
                format_file_size(*file_size),
                percent(*bytes_transferred, *file_size),
                short_peer_id(peer_id),
            )
        }
        AppEvent::SendComplete { peer_id, file_name } => format!(
            "* '{}' delivered to {}",
            file_name,
            short_peer_id(peer_id)
        ),
        AppEvent::FileSaved {
            peer_id,
            file_name,
            path,
        } => format!(
            "* '{}' from {} saved to {}",
            file_name,
            short_peer_id(peer_id),
            path.display()
        ),
        AppEvent::TransferCancelled { peer_id } => {
            format!("* transfer with {} cancelled", short_peer_id(peer_id))
        }
        AppEvent::TransferFailed { peer_id, reason } => {
            format!("* transfer with {} failed: {}", short_peer_id(peer_id), reason)
        }
        AppEvent::Roster(peers) => {
            if peers.is_empty() {
                "* room is empty".to_string()
            } else {
                let mut out = String::from("* room members:");
                for p in peers {
                    out.push_str(&format!("\n    {} ({})", p.display_name, p.peer_id));
                }
                out
            }
        }
        AppEvent::RelayClosed => "* relay connection closed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prompt_commands() {
        assert!(matches!(
            parse_command("send p1 /tmp/report.pdf"),
            Some(Command::SendFile { peer_id, path })
                if peer_id == "p1" && path == PathBuf::from("/tmp/report.pdf")
        ));
        assert!(matches!(
            parse_command("send p1 /tmp/with space.bin"),
            Some(Command::SendFile { path, .. }) if path == PathBuf::from("/tmp/with space.bin")
        ));
        assert!(matches!(
            parse_command("accept p2"),
            Some(Command::AcceptRequest { peer_id }) if peer_id == "p2"
        ));
        assert!(matches!(parse_command("peers"), Some(Command::ListPeers)));
        assert!(matches!(parse_command("quit"), Some(Command::Quit)));
    }

    #[test]
    fn incomplete_or_unknown_commands_are_rejected() {
        assert!(parse_command("send p1").is_none());
        assert!(parse_command("accept").is_none());
        assert!(parse_command("frobnicate").is_none());
    }

    #[test]
    fn events_render_one_line_summaries() {
        let line = describe_event(&AppEvent::Progress {
            peer_id: "peer-1234567890ab".into(),
            direction: Direction::Receive,
            file_name: "a.bin".into(),
            bytes_transferred: 524_288,
            file_size: 1_048_576,
        });
        assert!(line.contains("receiving"));
        assert!(line.contains("50%"));
        assert!(line.contains("512.00 KB"));
    }
}
