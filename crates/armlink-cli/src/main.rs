//! `armlink` – leader/follower teleoperation for SO-101 arms.
//!
//! ```text
//! armlink setup                      discover arms, assign roles, calibrate
//! armlink teleoperate [--hz N] [--mirror]
//! armlink info --port /dev/ttyACM0   list servos on one bus
//! ```
//!
//! Ports named `sim:<anything>` use an in-process simulated arm.
//! Ctrl-C stops the running command gracefully; a second Ctrl-C exits
//! immediately.

mod config;
mod connector;
mod setup;
mod teleop;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use armlink_hal::bus::BusConnector;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::watch;
use tracing::warn;

use crate::connector::PortConnector;

#[derive(Debug, Parser)]
#[command(name = "armlink", version, about = "Leader/follower teleoperation for SO-101 arms")]
struct Cli {
    /// Config file (default `~/.armlink/armlink.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Discover arms, assign leader/follower roles and record calibrations.
    Setup {
        #[arg(long)]
        leader_port: Option<String>,
        #[arg(long)]
        follower_port: Option<String>,
    },
    /// Mirror the leader arm's motion on the follower until Ctrl-C.
    #[command(alias = "teleop")]
    Teleoperate {
        /// Loop rate; overrides the config file.
        #[arg(long)]
        hz: Option<i64>,
        /// Mirror left/right (negates shoulder pan and wrist roll).
        #[arg(long)]
        mirror: bool,
    },
    /// Scan addresses 1–6 on one port and print what answers.
    Info {
        #[arg(long)]
        port: String,
    },
}

fn main() {
    let _telemetry = armlink_runtime::init_tracing("armlink");
    let cli = Cli::parse();

    print_banner();

    // ── Ctrl-C ────────────────────────────────────────────────────────────
    let (stop_tx, stop_rx) = watch::channel(false);
    let requested = Arc::new(AtomicBool::new(false));
    if let Err(e) = ctrlc::set_handler(move || {
        if requested.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping …".yellow().bold());
        let _ = stop_tx.send(true);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; arms will not be released on Ctrl-C");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => fail(format!("Failed to start async runtime: {e}")),
    };

    let config_path = cli.config.unwrap_or_else(config::config_path);
    let result = match cli.command {
        Command::Setup {
            leader_port,
            follower_port,
        } => setup::run(&runtime, &config_path, leader_port, follower_port, stop_rx),
        Command::Teleoperate { hz, mirror } => {
            teleop::run(&runtime, &config_path, hz, mirror, stop_rx)
        }
        Command::Info { port } => info(&port),
    };

    if let Err(e) = result {
        fail(e);
    }
}

fn fail(message: String) -> ! {
    eprintln!("{} {}", "Error:".red().bold(), message);
    std::process::exit(1);
}

/// Resolves once Ctrl-C was pressed.
pub(crate) async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

// ─────────────────────────────────────────────────────────────────────────────
// info
// ─────────────────────────────────────────────────────────────────────────────

fn info(port: &str) -> Result<(), String> {
    let mut bus = PortConnector::new()
        .connect(port)
        .map_err(|e| e.to_string())?;
    let found = bus.scan(1, 6).map_err(|e| e.to_string())?;

    println!("  Servos on {}:", port.bold());
    if found.is_empty() {
        println!("    {}", "none answered".yellow());
    }
    for servo in &found {
        let position = match bus.position(servo.address) {
            Ok(raw) => raw.to_string(),
            Err(e) => format!("{}", e.to_string().red()),
        };
        println!(
            "    id {:<2}  model {:<5}  position {}",
            servo.address, servo.model, position
        );
    }
    if setup::is_so_arm(&found) {
        println!("  {} looks like an SO-101 arm", "✓".green().bold());
    }
    bus.close().map_err(|e| e.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!(
        "  {} {}",
        "armlink".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!();
}

pub(crate) fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
