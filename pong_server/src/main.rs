//! Standalone relay binary.
//!
//! Usage:
//!   cargo run -p pong_server -- [--addr 127.0.0.1:40000] [--tick-hz 50] [--config game.json]
//!
//! The relay accepts peers, grants ownership and fans snapshots out to every
//! other ready peer.
//!
//! Console commands:
//!   status       - Show relay status
//!   reset        - Put the ball back at its spawn point
//!   say <text>   - Print a message on every client
//!   kick <peer>  - Disconnect a peer
//!   quit         - Shutdown relay

use std::env;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use pong_server::server::{GameServer, ServerState};
use pong_shared::config::GameConfig;
use tokio::sync::mpsc;
use tracing::{info, warn};

fn parse_args() -> anyhow::Result<GameConfig> {
    let args: Vec<String> = env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut addr = None;
    let mut tick_hz = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                addr = Some(args[i + 1].clone());
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                tick_hz = Some(
                    args[i + 1]
                        .parse::<u32>()
                        .with_context(|| format!("bad --tick-hz {}", args[i + 1]))?,
                );
                i += 2;
            }
            "--config" if i + 1 < args.len() => {
                config_path = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            _ => i += 1,
        }
    }

    let mut cfg = match config_path {
        Some(path) => GameConfig::load(&path)?,
        None => GameConfig::default(),
    };
    if let Some(addr) = addr {
        cfg.server_addr = addr;
    }
    if let Some(tick_hz) = tick_hz {
        cfg.tick_hz = tick_hz;
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(addr = %cfg.server_addr, tick_hz = cfg.tick_hz, "Starting relay");

    let mut server = GameServer::new(cfg.clone()).await.context("create relay")?;
    let local = server.local_addr()?;
    info!(%local, "Relay listening");

    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Relay ready. Type 'status' for info, 'reset' to reset the ball, 'quit' to exit.");
    println!();

    let tick_interval = Duration::from_secs_f32(cfg.tick_dt());
    let mut next_tick = tokio::time::Instant::now();

    while *server.state() == ServerState::Running {
        match server.try_accept(Duration::from_millis(1)).await {
            Ok(Some(peer)) => info!(peer_id = ?peer, "New peer accepted"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Handshake failed"),
        }

        server.step().await?;

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }

    Ok(())
}
