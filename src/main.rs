use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Parser, Subcommand};
use fear::calls::direct::dial;
use fear::config::{ClientConfig, DirectDialConfig};
use fear::crypto::SessionKey;
use fear::media::{AudioTransportConfig, CpalBackend, MediaEvent};
use fear::protocol::DEFAULT_PORT;
use fear::{ControlSession, Relay};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

// Usage:
//   fear genkey
//   fear relay --listen 0.0.0.0:8888
//   fear connect --host 127.0.0.1 --room r1 --name alice --key <base64>
//   fear connect --config alice.json
//   fear dial --server-ip 10.0.0.2 --server-port 40000 --key-hex <64 hex>

#[derive(Parser)]
#[command(name = "fear")]
#[command(about = "Encrypted room chat, file transfer and voice calls", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a room and chat interactively
    Connect {
        /// JSON file with host, port, room, name, key and optional download_dir, udp_port
        #[arg(short, long, conflicts_with_all = ["host", "room", "name", "key"])]
        config: Option<PathBuf>,
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        #[arg(short, long)]
        room: Option<String>,
        #[arg(short, long)]
        name: Option<String>,
        /// Room key, URL-safe base64 of 32 bytes
        #[arg(short, long)]
        key: Option<String>,
        #[arg(long)]
        download_dir: Option<PathBuf>,
        /// Preferred local UDP port for calls
        #[arg(long)]
        udp_port: Option<u16>,
    },
    /// Call a known UDP endpoint directly with a pre-shared key
    Dial {
        #[arg(long)]
        server_ip: String,
        #[arg(long)]
        server_port: u16,
        #[arg(long)]
        local_port: Option<u16>,
        /// 64 hex characters
        #[arg(long)]
        key_hex: String,
    },
    /// Run a relay that forwards frames between clients
    Relay {
        #[arg(short, long, default_value = "0.0.0.0:8888")]
        listen: String,
    },
    /// Print a fresh room key
    Genkey,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(cli.command)) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Genkey => {
            println!("{}", SessionKey::generate().to_base64());
            Ok(())
        }
        Commands::Relay { listen } => {
            let relay = Relay::bind(&listen)
                .await
                .with_context(|| format!("could not listen on {listen}"))?;
            tokio::select! {
                res = relay.run() => res.context("relay stopped")?,
                _ = tokio::signal::ctrl_c() => info!("Shutting down relay"),
            }
            Ok(())
        }
        Commands::Dial {
            server_ip,
            server_port,
            local_port,
            key_hex,
        } => {
            let target = DirectDialConfig {
                server_ip,
                server_port,
                local_port,
                key_hex,
            }
            .validate()?;
            run_dial(target).await
        }
        Commands::Connect {
            config,
            host,
            port,
            room,
            name,
            key,
            download_dir,
            udp_port,
        } => {
            let raw = match config {
                Some(path) => ClientConfig::from_json_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => ClientConfig {
                    host: host.context("--host is required without --config")?,
                    port,
                    room: room.context("--room is required without --config")?,
                    name: name.context("--name is required without --config")?,
                    key: key.context("--key is required without --config")?,
                    download_dir,
                    udp_port,
                },
            };
            run_connect(raw).await
        }
    }
}

async fn run_dial(target: fear::calls::DirectDial) -> Result<()> {
    let (transport, mut events) = dial(&target, AudioTransportConfig::default(), &CpalBackend).await?;
    info!("Listening for audio on {}", transport.local_addr());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(MediaEvent::PeerReady { addr, .. }) => info!("Peer {addr} is ready, audio flowing"),
                Some(MediaEvent::PeerSwitched { addr, .. }) => info!("Peer moved to {addr}"),
                Some(MediaEvent::Failed(reason)) => {
                    warn!("Media failure: {reason}");
                    break;
                }
                Some(MediaEvent::Stopped) | None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    transport.stop().await;
    let stats = transport.stats();
    info!(
        "Call ended: {} packets sent, {} received, {} rejected",
        stats.packets_sent, stats.packets_received, stats.decrypt_failures
    );
    Ok(())
}

async fn run_connect(raw: ClientConfig) -> Result<()> {
    let config = raw.validate()?;
    let session = ControlSession::new(config, Arc::new(CpalBackend));
    spawn_event_printer(&session);
    session.connect().await?;
    println!("Commands: /file <path>, /call <name>, /accept, /reject, /hangup, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut disconnected = session.events().disconnected.subscribe();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = disconnected.recv() => break,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else { break };
        match handle_line(&session, line.trim()).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("! {e:#}"),
        }
    }

    let _ = session.calls().hang_up().await;
    session.disconnect().await;
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn handle_line(session: &Arc<ControlSession>, line: &str) -> Result<bool> {
    let (command, arg) = match line.split_once(' ') {
        Some((c, a)) => (c, a.trim()),
        None => (line, ""),
    };
    match command {
        "" => {}
        "/quit" => return Ok(false),
        "/file" => {
            if arg.is_empty() {
                bail!("usage: /file <path>");
            }
            session.send_file(Path::new(arg)).await?;
        }
        "/call" => {
            if arg.is_empty() {
                bail!("usage: /call <name>");
            }
            session.calls().request_call(arg).await?;
        }
        "/accept" => session.calls().accept().await?,
        "/reject" => session.calls().reject().await?,
        "/hangup" => session.calls().hang_up().await?,
        _ if command.starts_with('/') => bail!("unknown command {command}"),
        _ => session.send_text(line).await?,
    }
    Ok(true)
}

fn spawn_event_printer(session: &Arc<ControlSession>) {
    let bus = session.events();
    let mut chat = bus.chat_message.subscribe();
    let mut progress = bus.file_progress.subscribe();
    let mut complete = bus.file_complete.subscribe();
    let mut failed = bus.file_failed.subscribe();
    let mut incoming = bus.incoming_call.subscribe();
    let mut started = bus.call_started.subscribe();
    let mut ended = bus.call_ended.subscribe();
    let mut call_failed = bus.call_failed.subscribe();
    let mut errors = bus.error.subscribe();
    let mut disconnected = bus.disconnected.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Ok(m) = chat.recv() => {
                    if !m.is_local {
                        println!("[{}] {}: {}", m.timestamp.with_timezone(&Local).format("%H:%M"), m.sender, m.content);
                    }
                }
                Ok(p) = progress.recv() => {
                    if p.bytes == p.total {
                        println!("* {} {}/{} bytes", p.file_name, p.bytes, p.total);
                    }
                }
                Ok(c) = complete.recv() => match &c.path {
                    Some(path) => println!("* received {} ({} bytes) -> {}", c.file_name, c.size, path.display()),
                    None => println!("* sent {} ({} bytes)", c.file_name, c.size),
                },
                Ok(f) = failed.recv() => {
                    println!("* transfer of {} failed: {}", f.file_name.as_deref().unwrap_or("file"), f.message);
                }
                Ok(c) = incoming.recv() => println!("* {} is calling, /accept or /reject", c.from),
                Ok(c) = started.recv() => println!("* call with {} connected", c.peer),
                Ok(c) = ended.recv() => {
                    println!("* call with {} ended ({:?})", c.peer.as_deref().unwrap_or("peer"), c.reason);
                }
                Ok(c) = call_failed.recv() => {
                    println!("* call with {} failed: {}", c.peer.as_deref().unwrap_or("peer"), c.message);
                }
                Ok(e) = errors.recv() => println!("! {}", e.message),
                Ok(d) = disconnected.recv() => {
                    println!("* disconnected: {}", d.reason);
                    break;
                }
                else => break,
            }
        }
    });
}
