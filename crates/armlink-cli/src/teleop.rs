//! `armlink teleoperate` – run the controller until Ctrl-C.
//!
//! The controller runs on the main task. A second task drains the log
//! stream and redraws a one-line status of the leader pose at most every
//! 100 ms.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use armlink_runtime::teleop::{Controller, TeleopConfig};
use armlink_types::State;
use colored::Colorize;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tracing::info;

use crate::config::{self, ArmConfig};
use crate::connector::PortConnector;
use crate::stopped;

const STATUS_PERIOD: Duration = Duration::from_millis(100);

pub fn run(
    runtime: &Runtime,
    config_path: &Path,
    hz: Option<i64>,
    mirror: bool,
    stop: watch::Receiver<bool>,
) -> Result<(), String> {
    let cfg = config::load_from(config_path)?.ok_or_else(|| {
        format!(
            "No config at {}; run `armlink setup` first",
            config_path.display()
        )
    })?;
    let base_dir = config_path.parent().unwrap_or(Path::new("."));
    let leader = required(cfg.leader.as_ref(), "leader")?;
    let follower = required(cfg.follower.as_ref(), "follower")?;

    let teleop = TeleopConfig {
        leader_port: leader.port.clone(),
        follower_port: follower.port.clone(),
        leader_calibration: leader.resolve_calibration(base_dir)?,
        follower_calibration: follower.resolve_calibration(base_dir)?,
        hz: hz.unwrap_or(cfg.teleop.hz),
        mirror: mirror || cfg.teleop.mirror,
    };
    info!(leader = %teleop.leader_port, follower = %teleop.follower_port, "connecting arms");

    let controller = Arc::new(
        Controller::new(teleop, &PortConnector::new()).map_err(|e| e.to_string())?,
    );
    println!(
        "  Leader {}  →  follower {}{}",
        leader.port.bold(),
        follower.port.bold(),
        if controller.mirror() {
            " (mirrored)".cyan().to_string()
        } else {
            String::new()
        }
    );
    println!("  Press {} to stop.\n", "Ctrl-C".bold());

    let result = runtime.block_on(async {
        let printer = tokio::spawn(print_status(Arc::clone(&controller)));
        let result = controller.start(stopped(stop)).await;
        printer.abort();
        result
    });

    for line in controller.logs().drain() {
        println!("\r\x1b[2K  {line}");
    }
    let closed = controller.close();
    result.map_err(|e| e.to_string())?;
    closed.map_err(|e| e.to_string())
}

fn required<'a>(arm: Option<&'a ArmConfig>, role: &str) -> Result<&'a ArmConfig, String> {
    match arm {
        Some(arm) if arm.is_calibrated() => Ok(arm),
        Some(arm) => Err(format!(
            "{role} arm on {} is not calibrated; run `armlink setup`",
            arm.port
        )),
        None => Err(format!("{role} arm is not configured; run `armlink setup`")),
    }
}

async fn print_status(controller: Arc<Controller>) {
    let logs = controller.logs();
    let states = controller.states();
    let mut ticker = tokio::time::interval(STATUS_PERIOD);
    loop {
        ticker.tick().await;
        let mut out = std::io::stdout().lock();
        for line in logs.drain() {
            let _ = writeln!(out, "\r\x1b[2K  {line}");
        }
        if let Some(state) = states.try_take() {
            let _ = write!(out, "\r\x1b[2K  {}", status_line(&state));
        }
        let _ = out.flush();
    }
}

/// Compact one-line rendering of a state snapshot.
pub fn status_line(state: &State) -> String {
    if let Some(error) = &state.error {
        return format!("{} {}", "read error:".red(), error);
    }
    state
        .positions
        .iter()
        .map(|(motor, value)| format!("{} {:>6.1}", motor.as_str(), value))
        .collect::<Vec<_>>()
        .join("  ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use armlink_types::{MotorName, Positions};

    #[test]
    fn status_line_lists_positions_in_motor_order() {
        let mut positions = Positions::new();
        positions.insert(MotorName::Gripper, 12.345);
        positions.insert(MotorName::ShoulderPan, -50.0);
        let line = status_line(&State::with_positions(positions));
        assert_eq!(line, "shoulder_pan  -50.0  gripper   12.3");
    }

    #[test]
    fn status_line_shows_errors() {
        let line = status_line(&State::with_error("servo 3 timed out"));
        assert!(line.contains("servo 3 timed out"));
    }

    #[test]
    fn missing_arm_is_reported() {
        let err = required(None, "leader").unwrap_err();
        assert!(err.contains("leader arm is not configured"));
        let arm = ArmConfig::new("/dev/ttyACM1");
        let err = required(Some(&arm), "follower").unwrap_err();
        assert!(err.contains("not calibrated"));
    }
}
