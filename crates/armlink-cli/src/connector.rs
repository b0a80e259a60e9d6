//! Port-name based bus selection.
//!
//! Ports starting with `sim:` open an in-process simulated SO-101 arm, every
//! other port name is opened as a Feetech serial bus.

use armlink_hal::bus::{BusConnector, BusError, ServoBus};
use armlink_hal::feetech::FeetechConnector;
use armlink_hal::sim::{SimArm, SimConnector};

pub const SIM_PREFIX: &str = "sim:";

pub fn is_simulated(port: &str) -> bool {
    port.starts_with(SIM_PREFIX)
}

#[derive(Debug, Default)]
pub struct PortConnector {
    sim: SimConnector,
    serial: FeetechConnector,
}

impl PortConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BusConnector for PortConnector {
    fn connect(&self, port: &str) -> Result<Box<dyn ServoBus>, BusError> {
        if !is_simulated(port) {
            return self.serial.connect(port);
        }
        if self.sim.arm(port).is_none() {
            self.sim.register(SimArm::so101(port));
        }
        self.sim.connect(port)
    }
}
