//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p pong_client -- [--addr 127.0.0.1:40000] [--name Player] [--config game.json]
//!
//! The client connects to the relay, announces itself ready, then runs the
//! fixed tick: input, correction of remote bodies, physics, snapshot publishing.
//!
//! Console commands:
//!   status        - Show client status and per-body sync stats
//!   take <entity> - Request ownership of a body
//!   serve         - Hit the ball and take ownership of it
//!   disconnect    - Disconnect from relay
//!   quit          - Exit client

use std::env;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use pong_client::client::{ClientState, GameClient};
use pong_client::input::InputState;
use pong_shared::config::GameConfig;
use tokio::sync::mpsc;
use tracing::{info, warn};

fn parse_args() -> anyhow::Result<GameConfig> {
    let args: Vec<String> = env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut addr = None;
    let mut name = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                addr = Some(args[i + 1].clone());
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                name = Some(args[i + 1].clone());
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
    if let Some(name) = name {
        cfg.player_name = name;
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(server = %cfg.server_addr, name = %cfg.player_name, "Starting client");

    let mut client = GameClient::connect(&cfg).await.context("connect")?;

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

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

    println!("Client connected. Type 'status' for info, 'quit' to exit.");
    println!();

    // Spawns for bodies already in the session arrive right after Welcome.
    client.wait_reliable(Duration::from_millis(100)).await;
    client.send_ready().await?;

    let mut interval = tokio::time::interval(Duration::from_secs_f32(cfg.tick_dt()));

    loop {
        interval.tick().await;

        while let Ok(line) = console_rx.try_recv() {
            if line == "quit" {
                info!("Quitting");
                return Ok(());
            }
            match client.exec_console(&line).await {
                Ok(output) => {
                    for line in output {
                        println!("{}", line);
                    }
                }
                Err(e) => println!("Error: {}", e),
            }
        }

        client.poll_reliable();

        if client.state == ClientState::Disconnected {
            println!("Disconnected from relay.");
            break;
        }

        client.drain_snapshots();

        // No input device in the console client; the avatar stands still.
        if let Err(e) = client.tick(InputState::default()).await {
            warn!(error = %e, "Tick failed");
        }
    }

    Ok(())
}
