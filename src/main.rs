use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use dropsync::utils::room::generate_room_id;
use dropsync::{DirectorySink, SessionConfig, SessionEngine, SessionEvent};

#[derive(Parser, Debug)]
#[command(name = "dropsync", about = "Peer-to-peer file transfer and chat")]
struct Args {
    /// Signaling relay URL.
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
    relay: String,

    /// Room id; a fresh one is minted when omitted.
    #[arg(long)]
    room: Option<String>,

    /// Optional room password (end-to-end encryption + peer auth).
    #[arg(long)]
    password: Option<String>,

    /// Directory accepted files are written to.
    #[arg(long, default_value = "downloads")]
    save_dir: PathBuf,

    /// Files queued for sending once the peer is admitted.
    #[arg(long = "send")]
    send: Vec<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let room = args.room.clone().unwrap_or_else(generate_room_id);
    println!("room: {room}");

    let mut config = SessionConfig::new(
        args.relay.clone(),
        room,
        Arc::new(DirectorySink::new(&args.save_dir)),
    );
    config.password = args.password.clone();

    let (engine, mut events) = SessionEngine::start(config).await?;
    let mut queued = args.send.clone();

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                engine.leave().await;
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                report(&event);
                if let SessionEvent::AuthState { state } = event {
                    if state.is_admitted() {
                        for path in queued.drain(..) {
                            match engine.send_file(&path).await {
                                Ok(id) => println!("sending {} as {id}", path.display()),
                                Err(e) => eprintln!("cannot send {}: {e}", path.display()),
                            }
                        }
                    }
                }
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    engine.leave().await;
                    break;
                };
                if let Err(e) = handle_command(&engine, line.trim()).await {
                    eprintln!("error: {e}");
                }
            }
        }
    }

    Ok(())
}

async fn handle_command(engine: &Arc<SessionEngine>, line: &str) -> Result<()> {
    if line.is_empty() {
        return Ok(());
    }

    let (command, rest) = match line.split_once(' ') {
        Some((c, r)) => (c, r.trim()),
        None => (line, ""),
    };

    match command {
        "/send" => {
            let id = engine.send_file(rest).await?;
            println!("sending {rest} as {id}");
        }
        "/accept" => engine.accept_file(rest.parse::<Uuid>()?).await?,
        "/decline" => engine.decline_file(rest.parse::<Uuid>()?).await?,
        "/cancel" => engine.cancel_transfer(rest.parse::<Uuid>()?).await,
        "/retry" => engine.retry_transfer(rest.parse::<Uuid>()?).await?,
        "/password" => {
            let password = (!rest.is_empty()).then(|| rest.to_owned());
            engine.set_password(password).await;
            println!("password updated");
        }
        "/transfers" => {
            for t in engine.transfers().await {
                println!(
                    "{} {:?} {:?} {}% {} ({} bytes){}",
                    t.id,
                    t.direction,
                    t.status,
                    t.progress,
                    t.name,
                    t.size,
                    t.error.map(|k| format!(" [{k}]")).unwrap_or_default(),
                );
            }
        }
        "/inspect" => {
            let snapshot = engine.inspect().await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        "/quit" => {
            engine.leave().await;
            std::process::exit(0);
        }
        _ if command.starts_with('/') => {
            eprintln!("unknown command: {command}");
        }
        // Anything else is chat.
        _ => {
            engine.send_chat(line).await?;
        }
    }
    Ok(())
}

fn report(event: &SessionEvent) {
    match event {
        SessionEvent::PeerJoined { peer_id } => println!("* peer joined: {peer_id}"),
        SessionEvent::PeerLeft { peer_id } => println!("* peer left: {peer_id}"),
        SessionEvent::ConnectionState { state } => println!("* connection: {state}"),
        SessionEvent::PeerStats { latency_ms, remote_ip } => {
            if let (Some(ms), Some(ip)) = (latency_ms, remote_ip) {
                println!("* peer {ip} rtt {ms:.1} ms");
            }
        }
        SessionEvent::AuthState { state } => println!("* auth: {state:?}"),
        SessionEvent::AuthFailed { kind } => println!("* auth failed: {kind}"),
        SessionEvent::TransferStarted { transfer } => {
            println!("* transfer {}: {} ({} bytes)", transfer.id, transfer.name, transfer.size);
        }
        SessionEvent::TransferProgress { id, progress } => println!("* {id}: {progress}%"),
        SessionEvent::TransferCompleted { id } => println!("* {id}: completed"),
        SessionEvent::TransferFailed { id, kind } => println!("* {id}: error [{kind}]"),
        SessionEvent::TransferCancelled { id, kind } => println!("* {id}: cancelled [{kind}]"),
        SessionEvent::FilePending { id, name, size } => {
            println!("* incoming file {name} ({size} bytes) — /accept {id} or /decline {id}");
        }
        SessionEvent::FileAccepted { id } => println!("* {id}: saved"),
        SessionEvent::Chat { message } => println!("<{:?}> {}", message.origin, message.text),
        SessionEvent::Reconnected => println!("* signaling reconnected"),
        SessionEvent::LeftRoom => println!("* left room"),
        SessionEvent::Error { message } => eprintln!("* error: {message}"),
    }
}
