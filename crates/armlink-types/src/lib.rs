//! `armlink-types` – shared vocabulary for the leader/follower stack.
//!
//! Every other crate speaks in these types: the six [`MotorName`]s of an
//! SO-101 arm, normalized [`Positions`], the per-tick [`State`] snapshot
//! handed to observers, the [`BatchOutcome`] of best-effort torque commands,
//! and the global [`ArmError`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Logical motor of a six-axis arm.
///
/// Variant order is the canonical enumeration order and matches the servo
/// addresses 1–6, so a `BTreeMap<MotorName, _>` always iterates base → gripper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorName {
    /// Base rotation.
    ShoulderPan,
    ShoulderLift,
    ElbowFlex,
    /// Wrist pitch.
    WristFlex,
    WristRoll,
    Gripper,
}

impl MotorName {
    /// All motors in canonical order.
    pub const ALL: [MotorName; 6] = [
        MotorName::ShoulderPan,
        MotorName::ShoulderLift,
        MotorName::ElbowFlex,
        MotorName::WristFlex,
        MotorName::WristRoll,
        MotorName::Gripper,
    ];

    /// Snake-case identifier used in calibration files and log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            MotorName::ShoulderPan => "shoulder_pan",
            MotorName::ShoulderLift => "shoulder_lift",
            MotorName::ElbowFlex => "elbow_flex",
            MotorName::WristFlex => "wrist_flex",
            MotorName::WristRoll => "wrist_roll",
            MotorName::Gripper => "gripper",
        }
    }

    /// Zero-based position in [`MotorName::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Factory servo address of this motor (its 1-based canonical index).
    pub fn default_address(self) -> u8 {
        self.index() as u8 + 1
    }
}

impl fmt::Display for MotorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MotorName {
    type Err = ArmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MotorName::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ArmError::Calibration(format!("unknown motor '{s}'")))
    }
}

/// Normalized motor positions in `[-100, 100]`, keyed by motor.
pub type Positions = BTreeMap<MotorName, f64>;

/// Snapshot published once per control tick.
///
/// A tick whose leader read failed carries only `error` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub positions: Positions,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

impl State {
    /// Snapshot of freshly read leader positions.
    pub fn with_positions(positions: Positions) -> Self {
        Self {
            positions,
            timestamp: Utc::now(),
            error: None,
        }
    }

    /// Snapshot of a failed tick.
    pub fn with_error(error: impl fmt::Display) -> Self {
        Self {
            positions: Positions::new(),
            timestamp: Utc::now(),
            error: Some(error.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A single motor that failed during a batch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorFault {
    pub address: u8,
    pub motor: Option<MotorName>,
    pub details: String,
}

impl fmt::Display for MotorFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.motor {
            Some(motor) => write!(f, "{motor} (id {}): {}", self.address, self.details),
            None => write!(f, "id {}: {}", self.address, self.details),
        }
    }
}

/// Aggregate result of a best-effort per-motor batch command.
///
/// Every motor is attempted; failures are collected instead of aborting the
/// batch, so callers decide whether partial failure is acceptable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub attempted: usize,
    pub failures: Vec<MotorFault>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of motors that accepted the command.
    pub fn succeeded(&self) -> usize {
        self.attempted.saturating_sub(self.failures.len())
    }

    /// Convert into a `Result`, folding all failures into one error message.
    pub fn into_result(self) -> Result<(), ArmError> {
        if self.is_success() {
            return Ok(());
        }
        let details = self
            .failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(ArmError::PartialFailure {
            failed: self.failures.len(),
            attempted: self.attempted,
            details,
        })
    }
}

/// Global error type for arm construction, bus I/O and controller lifecycle.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArmError {
    #[error("open bus on {port}: {details}")]
    Connection { port: String, details: String },

    #[error("calibration: {0}")]
    Calibration(String),

    #[error("read positions: {0}")]
    Read(String),

    #[error("write positions: {0}")]
    Write(String),

    #[error("{failed} of {attempted} motors failed: {details}")]
    PartialFailure {
        failed: usize,
        attempted: usize,
        details: String,
    },

    #[error("already running")]
    AlreadyRunning,

    #[error("arm connection is closed")]
    Closed,

    #[error("close errors: {0}")]
    Close(String),
}
