//! Generic `ServoBus` capability for serial-bus position servos.
//!
//! Drivers implement this trait; the [`Arm`][crate::arm::Arm] and the
//! calibration recorder only ever talk to the trait, so the Feetech driver,
//! the simulator, or a test double can be swapped without touching the
//! control loop.

use std::collections::BTreeMap;

use armlink_types::{BatchOutcome, MotorFault};
use thiserror::Error;

/// Errors raised by a servo bus driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("cannot open {port}: {details}")]
    Open { port: String, details: String },

    #[error("servo {address} timed out")]
    Timeout { address: u8 },

    #[error("servo {address} did not respond")]
    NoResponse { address: u8 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("bus is closed")]
    Closed,
}

impl From<std::io::Error> for BusError {
    fn from(e: std::io::Error) -> Self {
        BusError::Io(e.to_string())
    }
}

/// A servo found by [`ServoBus::scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoundServo {
    pub address: u8,
    pub model: u16,
}

/// One connection to a chain of position servos.
///
/// Single-servo operations are required; the batched variants default to a
/// per-address loop and may be overridden with bus-level sync instructions.
pub trait ServoBus: Send {
    /// Name of the port this bus is bound to, e.g. `"/dev/ttyACM0"`.
    fn port(&self) -> &str;

    /// Probe every address in `low..=high` and return the servos that answer.
    fn scan(&mut self, low: u8, high: u8) -> Result<Vec<FoundServo>, BusError>;

    /// Present position of `address` in raw actuator units.
    fn position(&mut self, address: u8) -> Result<i32, BusError>;

    /// Command `address` to `raw`, optionally over `duration_ms`.
    fn set_position(
        &mut self,
        address: u8,
        raw: i32,
        duration_ms: Option<u16>,
    ) -> Result<(), BusError>;

    /// Enable holding torque on `address`.
    fn enable(&mut self, address: u8) -> Result<(), BusError>;

    /// Disable torque on `address` so it can be moved by hand.
    fn disable(&mut self, address: u8) -> Result<(), BusError>;

    /// Release the underlying connection. Must be idempotent.
    fn close(&mut self) -> Result<(), BusError>;

    /// Read every address in one batch.
    ///
    /// # Errors
    ///
    /// Fails as a whole when any address cannot be read.
    fn positions(&mut self, addresses: &[u8]) -> Result<BTreeMap<u8, i32>, BusError> {
        let mut out = BTreeMap::new();
        for &address in addresses {
            out.insert(address, self.position(address)?);
        }
        Ok(out)
    }

    /// Write every target in one batch.
    fn set_positions(&mut self, targets: &BTreeMap<u8, i32>) -> Result<(), BusError> {
        for (&address, &raw) in targets {
            self.set_position(address, raw, None)?;
        }
        Ok(())
    }

    /// Enable torque on every address, attempting all of them.
    fn enable_all(&mut self, addresses: &[u8]) -> BatchOutcome {
        batch(addresses, |a| self.enable(a))
    }

    /// Disable torque on every address, attempting all of them.
    fn disable_all(&mut self, addresses: &[u8]) -> BatchOutcome {
        batch(addresses, |a| self.disable(a))
    }
}

/// Opens [`ServoBus`] connections by port name.
pub trait BusConnector: Send + Sync {
    fn connect(&self, port: &str) -> Result<Box<dyn ServoBus>, BusError>;
}

fn batch(addresses: &[u8], mut op: impl FnMut(u8) -> Result<(), BusError>) -> BatchOutcome {
    let failures = addresses
        .iter()
        .filter_map(|&address| {
            op(address).err().map(|e| MotorFault {
                address,
                motor: None,
                details: e.to_string(),
            })
        })
        .collect();
    BatchOutcome {
        attempted: addresses.len(),
        failures,
    }
}
