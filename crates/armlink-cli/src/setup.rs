//! `armlink setup` – find the arms, assign roles and record calibrations.
//!
//! 1. Discover SO-101 arms: serial ports whose bus answers on exactly
//!    addresses 1–6. Skipped when both ports are given on the command line.
//! 2. Wiggle servo 1 of each arm so the operator can tell them apart and ask
//!    for its role.
//! 3. Record the range of motion of the leader, then the follower. The
//!    config is saved after each arm so a later failure keeps earlier work.

use std::io::Write;
use std::path::Path;
use std::thread;
use std::time::Duration;

use armlink_hal::Calibration;
use armlink_hal::bus::{BusConnector, BusError, FoundServo, ServoBus};
use armlink_hal::feetech::available_ports;
use armlink_runtime::recorder::{
    CalibrationRecorder, DEFAULT_SAMPLE_PERIOD, MotorRange, RECOMMENDED_MIN_SPAN, RangeTable,
};
use armlink_types::MotorName;
use colored::Colorize;
use tokio::runtime::Runtime;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::{self, ArmConfig};
use crate::connector::PortConnector;
use crate::{prompt_line, stopped};

/// Raw units servo 1 is nudged each way while identifying an arm.
const WIGGLE_DELTA: i32 = 30;
const WIGGLE_MOVE_MS: u16 = 500;

// ─────────────────────────────────────────────────────────────────────────────
// Roles
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
    Skip,
}

impl Role {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "l" | "leader" => Some(Role::Leader),
            "f" | "follower" => Some(Role::Follower),
            "s" | "skip" => Some(Role::Skip),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
            Role::Skip => "skipped",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry point
// ─────────────────────────────────────────────────────────────────────────────

pub fn run(
    runtime: &Runtime,
    config_path: &Path,
    leader_port: Option<String>,
    follower_port: Option<String>,
    stop: watch::Receiver<bool>,
) -> Result<(), String> {
    let connector = PortConnector::new();
    let mut cfg = config::load_from(config_path)?.unwrap_or_default();
    if cfg.is_ready() {
        println!(
            "  Existing calibrations in {} will be replaced.",
            config_path.display().to_string().bold()
        );
    }

    let (leader_port, follower_port) = match (leader_port, follower_port) {
        (Some(leader), Some(follower)) => (leader, follower),
        (leader, follower) => assign_roles(&connector, leader, follower, &stop)?,
    };
    if leader_port == follower_port {
        return Err(format!("leader and follower cannot share port {leader_port}"));
    }

    for (role, port) in [(Role::Leader, leader_port), (Role::Follower, follower_port)] {
        if *stop.borrow() {
            return Err("setup interrupted".to_string());
        }
        let calibration = calibrate(runtime, &connector, role, &port, stop.clone())?;
        let mut arm = ArmConfig::new(port);
        arm.calibration = Some(calibration);
        match role {
            Role::Leader => cfg.leader = Some(arm),
            _ => cfg.follower = Some(arm),
        }
        config::save_to(&cfg, config_path)?;
        println!(
            "  {} {} calibration saved to {}\n",
            "✓".green().bold(),
            role.label(),
            config_path.display().to_string().bold()
        );
    }

    println!(
        "  Setup complete. Run `{}` to start.",
        "armlink teleoperate".bold().cyan()
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Discovery
// ─────────────────────────────────────────────────────────────────────────────

/// `true` when the bus answered on exactly addresses 1–6.
pub fn is_so_arm(found: &[FoundServo]) -> bool {
    let mut addresses: Vec<u8> = found.iter().map(|s| s.address).collect();
    addresses.sort_unstable();
    addresses == [1, 2, 3, 4, 5, 6]
}

/// Ports among `ports` that host an SO-101 arm.
pub fn discover(connector: &dyn BusConnector, ports: &[String]) -> Vec<String> {
    ports
        .iter()
        .filter(|port| match connector.connect(port) {
            Ok(mut bus) => {
                let found = bus.scan(1, 6);
                if let Err(e) = bus.close() {
                    debug!(port = %port, error = %e, "close after scan failed");
                }
                match found {
                    Ok(found) => is_so_arm(&found),
                    Err(e) => {
                        debug!(port = %port, error = %e, "scan failed");
                        false
                    }
                }
            }
            Err(e) => {
                debug!(port = %port, error = %e, "cannot open port");
                false
            }
        })
        .cloned()
        .collect()
}

fn assign_roles(
    connector: &PortConnector,
    mut leader: Option<String>,
    mut follower: Option<String>,
    stop: &watch::Receiver<bool>,
) -> Result<(String, String), String> {
    println!("  Scanning serial ports for SO-101 arms …");
    let ports = available_ports().map_err(|e| format!("Failed to list serial ports: {e}"))?;
    let arms: Vec<String> = discover(connector, &ports)
        .into_iter()
        .filter(|p| Some(p) != leader.as_ref() && Some(p) != follower.as_ref())
        .collect();
    println!("  Found {} arm(s).", arms.len().to_string().bold());

    for port in arms {
        if leader.is_some() && follower.is_some() {
            break;
        }
        if *stop.borrow() {
            return Err("setup interrupted".to_string());
        }
        println!("\n  Wiggling servo 1 of the arm on {} …", port.bold());
        if let Err(e) = connector.connect(&port).and_then(|mut bus| wiggle(bus.as_mut())) {
            warn!(port = %port, error = %e, "wiggle failed");
            println!("  {} could not move servo 1: {}", "!".yellow(), e);
        }
        let role = loop {
            let answer = prompt_line("  Which arm moved? [l]eader / [f]ollower / [s]kip: ", "s");
            match Role::parse(&answer) {
                Some(role) => break role,
                None => println!("  Please answer l, f or s."),
            }
        };
        info!(port = %port, role = role.label(), "role assigned");
        match role {
            Role::Leader => leader = Some(port),
            Role::Follower => follower = Some(port),
            Role::Skip => {}
        }
    }

    match (leader, follower) {
        (Some(leader), Some(follower)) => Ok((leader, follower)),
        _ => Err("setup needs one leader and one follower arm".to_string()),
    }
}

/// Nudge servo 1 back and forth, then release it.
fn wiggle(bus: &mut dyn ServoBus) -> Result<(), BusError> {
    let home = bus.position(1)?;
    bus.enable(1)?;
    let pause = Duration::from_millis(u64::from(WIGGLE_MOVE_MS));
    let moves = [home + WIGGLE_DELTA, home - WIGGLE_DELTA, home];
    let result = moves.iter().try_for_each(|&target| {
        bus.set_position(1, target, Some(WIGGLE_MOVE_MS))?;
        thread::sleep(pause);
        Ok::<(), BusError>(())
    });
    let released = bus.disable(1);
    let closed = bus.close();
    result.and(released).and(closed)
}

// ─────────────────────────────────────────────────────────────────────────────
// Calibration
// ─────────────────────────────────────────────────────────────────────────────

fn calibrate(
    runtime: &Runtime,
    connector: &PortConnector,
    role: Role,
    port: &str,
    stop: watch::Receiver<bool>,
) -> Result<Calibration, String> {
    let mut bus = connector
        .connect(port)
        .map_err(|e| format!("Failed to open {port}: {e}"))?;

    println!();
    println!(
        "  {} {} arm on {}",
        "Calibrating".bold().cyan(),
        role.label().bold(),
        port.bold()
    );
    println!("  Torque is off. Move every joint through its full range, then press Enter.\n");

    let mut recorder = CalibrationRecorder::begin(bus.as_mut());
    let enter = enter_pressed();
    let finish = async move {
        tokio::select! {
            _ = enter => {}
            () = stopped(stop) => {}
        }
    };

    let mut drawn = false;
    let result = runtime.block_on(recorder.run_with(
        bus.as_mut(),
        DEFAULT_SAMPLE_PERIOD,
        finish,
        |table| {
            draw_table(table, drawn);
            drawn = true;
        },
    ));
    if let Err(e) = bus.close() {
        warn!(port = %port, error = %e, "failed to close bus after calibration");
    }
    let calibration = result.map_err(|e| e.to_string())?;

    let suspects = recorder.suspect_motors(RECOMMENDED_MIN_SPAN);
    if !suspects.is_empty() {
        let names: Vec<&str> = suspects.iter().map(|m| m.as_str()).collect();
        println!(
            "\n  {} small range on {}; teleoperation of these joints may be coarse.",
            "!".yellow().bold(),
            names.join(", ")
        );
    }
    Ok(calibration)
}

/// Resolves once the operator presses Enter.
fn enter_pressed() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        let _ = tx.send(());
    });
    rx
}

/// One table row: name, current, min, max and span.
pub fn format_range_row(motor: MotorName, range: &MotorRange) -> String {
    format!(
        "{:<14} {:>6} {:>6} {:>6} {:>6}",
        motor.as_str(),
        range.current,
        range.min,
        range.max,
        range.span()
    )
}

fn draw_table(table: &RangeTable, redraw: bool) {
    let mut out = std::io::stdout().lock();
    if redraw {
        // Cursor up over the header and one row per motor.
        let _ = write!(out, "\x1b[{}A", MotorName::ALL.len() + 1);
    }
    let _ = writeln!(
        out,
        "\x1b[2K  {}",
        format!("{:<14} {:>6} {:>6} {:>6} {:>6}", "motor", "now", "min", "max", "range").dimmed()
    );
    for motor in MotorName::ALL {
        let row = match table.get(&motor) {
            Some(range) if range.span() > RECOMMENDED_MIN_SPAN => {
                format_range_row(motor, range).green().to_string()
            }
            Some(range) => format_range_row(motor, range),
            None => format!("{:<14} {:>6}", motor.as_str(), "-").yellow().to_string(),
        };
        let _ = writeln!(out, "\x1b[2K  {row}");
    }
    let _ = out.flush();
}
