//! [`Arm`] – one physical arm: an exclusively owned bus plus its calibration.
//!
//! The arm speaks normalized positions to the rest of the stack and raw
//! servo units to the bus. Addresses the hardware reports that have no
//! calibrated motor, and motor names missing from the calibration, are
//! skipped rather than treated as errors.
//!
//! No operation retries; the caller's loop cadence is the retry policy.

use std::collections::BTreeMap;

use armlink_types::{ArmError, BatchOutcome, MotorFault, MotorName, Positions};
use tracing::{debug, warn};

use crate::bus::{BusConnector, ServoBus};
use crate::calibration::Calibration;

/// A calibrated arm bound to a single servo bus connection.
pub struct Arm {
    port: String,
    bus: Option<Box<dyn ServoBus>>,
    calibration: Calibration,
    addresses: Vec<u8>,
}

impl Arm {
    /// Open the bus on `port` and bind the six calibrated motors.
    ///
    /// # Errors
    ///
    /// [`ArmError::Connection`] when the bus cannot be opened, and
    /// [`ArmError::Calibration`] when the calibration does not cover all six
    /// motors. In the latter case the freshly opened bus is closed again.
    pub fn connect(
        connector: &dyn BusConnector,
        port: &str,
        calibration: Calibration,
    ) -> Result<Self, ArmError> {
        let bus = connector.connect(port).map_err(|e| ArmError::Connection {
            port: port.to_string(),
            details: e.to_string(),
        })?;
        Self::new(bus, calibration)
    }

    /// Bind an already-open bus. Closes `bus` if the calibration is invalid.
    pub fn new(mut bus: Box<dyn ServoBus>, calibration: Calibration) -> Result<Self, ArmError> {
        if let Err(e) = calibration.validate() {
            if let Err(close_err) = bus.close() {
                warn!(port = %bus.port(), error = %close_err, "failed to close bus after invalid calibration");
            }
            return Err(e);
        }
        let addresses = calibration.motor_ids();
        debug!(port = %bus.port(), ?addresses, "arm bound");
        Ok(Self {
            port: bus.port().to_string(),
            bus: Some(bus),
            calibration,
            addresses,
        })
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Bound servo addresses in canonical motor order.
    pub fn addresses(&self) -> &[u8] {
        &self.addresses
    }

    pub fn is_closed(&self) -> bool {
        self.bus.is_none()
    }

    /// Release the bus. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<(), ArmError> {
        match self.bus.take() {
            Some(mut bus) => bus.close().map_err(|e| ArmError::Close(format!("{}: {e}", self.port))),
            None => Ok(()),
        }
    }

    /// Enable torque on every bound motor.
    pub fn enable(&mut self) -> BatchOutcome {
        self.torque(true)
    }

    /// Disable torque on every bound motor so the arm can be moved by hand.
    pub fn disable(&mut self) -> BatchOutcome {
        self.torque(false)
    }

    /// Read every motor and convert to normalized positions.
    pub fn read_positions(&mut self) -> Result<Positions, ArmError> {
        let bus = self.bus.as_mut().ok_or(ArmError::Closed)?;
        let raw = bus
            .positions(&self.addresses)
            .map_err(|e| ArmError::Read(e.to_string()))?;

        let mut positions = Positions::new();
        for (address, value) in raw {
            match self.calibration.by_id(address) {
                Some((name, cal)) => {
                    positions.insert(name, cal.normalize(value));
                }
                None => debug!(port = %self.port, address, "skipping uncalibrated servo"),
            }
        }
        Ok(positions)
    }

    /// Convert normalized targets to raw units and write them in one batch.
    pub fn write_positions(&mut self, positions: &Positions) -> Result<(), ArmError> {
        let bus = self.bus.as_mut().ok_or(ArmError::Closed)?;
        let targets: BTreeMap<u8, i32> = positions
            .iter()
            .filter_map(|(name, &norm)| {
                self.calibration
                    .get(*name)
                    .map(|cal| (cal.id, cal.denormalize(norm)))
            })
            .collect();
        bus.set_positions(&targets)
            .map_err(|e| ArmError::Write(e.to_string()))
    }

    fn torque(&mut self, enable: bool) -> BatchOutcome {
        let Some(bus) = self.bus.as_mut() else {
            return BatchOutcome {
                attempted: 0,
                failures: vec![MotorFault {
                    address: 0,
                    motor: None,
                    details: ArmError::Closed.to_string(),
                }],
            };
        };
        let mut outcome = if enable {
            bus.enable_all(&self.addresses)
        } else {
            bus.disable_all(&self.addresses)
        };
        for fault in &mut outcome.failures {
            fault.motor = self.motor_at(fault.address);
        }
        outcome
    }

    /// Motor bound to `address`, if any.
    pub fn motor_at(&self, address: u8) -> Option<MotorName> {
        self.calibration.by_id(address).map(|(name, _)| name)
    }
}

impl Drop for Arm {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close arm on drop");
        }
    }
}

impl std::fmt::Debug for Arm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arm")
            .field("port", &self.port)
            .field("addresses", &self.addresses)
            .field("closed", &self.is_closed())
            .finish()
    }
}
