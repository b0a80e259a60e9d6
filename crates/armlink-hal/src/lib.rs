//! `armlink-hal` – Hardware Abstraction Layer
//!
//! Everything between a normalized joint position and a byte on the serial
//! line.
//!
//! # Modules
//!
//! - [`bus`] – the [`ServoBus`][bus::ServoBus] capability every driver
//!   implements, plus [`BusConnector`][bus::BusConnector] for opening buses
//!   by port name.
//! - [`calibration`] – [`MotorCalibration`][calibration::MotorCalibration]
//!   and [`Calibration`][calibration::Calibration]: the raw ↔ normalized
//!   mapping and its JSON record.
//! - [`arm`] – [`Arm`][arm::Arm]: a bus plus a calibration, reading and
//!   writing normalized positions.
//! - [`sim`] – [`SimArm`][sim::SimArm]: in-process simulated servos for CI
//!   and dry runs.
//! - [`feetech`] – [`FeetechBus`][feetech::FeetechBus]: STS3215 driver over
//!   a serial port.

pub mod arm;
pub mod bus;
pub mod calibration;
pub mod feetech;
pub mod sim;

pub use arm::Arm;
pub use bus::{BusConnector, BusError, FoundServo, ServoBus};
pub use calibration::{Calibration, MotorCalibration};
pub use feetech::{FeetechBus, FeetechConnector};
pub use sim::{SimArm, SimBus, SimConnector};
