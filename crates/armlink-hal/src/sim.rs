//! In-process simulated servo bus for tests and hardware-free dry runs.
//!
//! A [`SimArm`] is a shared handle to a chain of simulated servos. Tests keep
//! one handle to script positions, inject faults and inspect what was
//! written, while the [`SimBus`] obtained from [`SimArm::bus`] is handed to
//! the code under test. [`SimConnector`] resolves port names to registered
//! simulated arms.
//!
//! # Example
//!
//! ```rust
//! use armlink_hal::bus::ServoBus;
//! use armlink_hal::sim::SimArm;
//!
//! let arm = SimArm::so101("sim:leader");
//! arm.set_raw(1, 1500);
//!
//! let mut bus = arm.bus();
//! assert_eq!(bus.position(1).unwrap(), 1500);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bus::{BusConnector, BusError, FoundServo, ServoBus};

/// Model number reported by simulated servos (Feetech STS3215).
pub const SIM_MODEL: u16 = 777;

/// Raw mid-scale position of a 12-bit servo.
const MID_SCALE: i32 = 2048;

// ────────────────────────────────────────────────────────────────────────────
// Shared state
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimServo {
    raw: i32,
    torque: bool,
    /// Readings returned before falling back to `raw`.
    script: VecDeque<i32>,
}

#[derive(Debug, Default)]
struct SimState {
    port: String,
    servos: BTreeMap<u8, SimServo>,
    closed: bool,
    fail_reads: bool,
    fail_writes: bool,
    torque_faults: BTreeSet<u8>,
    report_extra: bool,
    reads: usize,
    writes: usize,
}

/// Shared handle to a chain of simulated servos.
#[derive(Debug, Clone)]
pub struct SimArm {
    state: Arc<Mutex<SimState>>,
}

impl SimArm {
    /// An empty chain bound to `port`.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                port: port.into(),
                ..SimState::default()
            })),
        }
    }

    /// A six-servo SO-101 chain (addresses 1–6) parked at mid-scale.
    pub fn so101(port: impl Into<String>) -> Self {
        let arm = Self::new(port);
        for address in 1..=6 {
            arm.add_servo(address, MID_SCALE);
        }
        arm
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new bus handle onto this chain.
    pub fn bus(&self) -> SimBus {
        let port = {
            let mut state = self.lock();
            state.closed = false;
            state.port.clone()
        };
        SimBus {
            port,
            arm: self.clone(),
            open: true,
        }
    }

    pub fn port(&self) -> String {
        self.lock().port.clone()
    }

    pub fn add_servo(&self, address: u8, raw: i32) {
        self.lock().servos.insert(
            address,
            SimServo {
                raw,
                ..SimServo::default()
            },
        );
    }

    /// Move a servo by hand.
    pub fn set_raw(&self, address: u8, raw: i32) {
        if let Some(servo) = self.lock().servos.get_mut(&address) {
            servo.raw = raw;
            servo.script.clear();
        }
    }

    /// Queue readings for `address`; each read pops one, and the last one
    /// becomes the resting position.
    pub fn script(&self, address: u8, readings: impl IntoIterator<Item = i32>) {
        if let Some(servo) = self.lock().servos.get_mut(&address) {
            servo.script.extend(readings);
        }
    }

    /// Current raw position (the last commanded or hand-set value).
    pub fn raw(&self, address: u8) -> Option<i32> {
        self.lock().servos.get(&address).map(|s| s.raw)
    }

    pub fn torque(&self, address: u8) -> bool {
        self.lock().servos.get(&address).is_some_and(|s| s.torque)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn fail_torque(&self, address: u8, fail: bool) {
        let mut state = self.lock();
        if fail {
            state.torque_faults.insert(address);
        } else {
            state.torque_faults.remove(&address);
        }
    }

    /// Make batched reads return every servo on the chain, not only the
    /// requested addresses.
    pub fn report_extra_addresses(&self, report: bool) {
        self.lock().report_extra = report;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of successful batched or single reads.
    pub fn read_count(&self) -> usize {
        self.lock().reads
    }

    /// Number of successful batched or single writes.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bus handle
// ────────────────────────────────────────────────────────────────────────────

/// [`ServoBus`] view onto a [`SimArm`].
#[derive(Debug)]
pub struct SimBus {
    port: String,
    arm: SimArm,
    open: bool,
}

impl SimBus {
    fn state(&self) -> Result<MutexGuard<'_, SimState>, BusError> {
        if !self.open {
            return Err(BusError::Closed);
        }
        Ok(self.arm.lock())
    }
}

fn read_servo(state: &mut SimState, address: u8) -> Result<i32, BusError> {
    let servo = state
        .servos
        .get_mut(&address)
        .ok_or(BusError::NoResponse { address })?;
    if let Some(next) = servo.script.pop_front() {
        servo.raw = next;
    }
    Ok(servo.raw)
}

impl ServoBus for SimBus {
    fn port(&self) -> &str {
        &self.port
    }

    fn scan(&mut self, low: u8, high: u8) -> Result<Vec<FoundServo>, BusError> {
        let state = self.state()?;
        Ok(state
            .servos
            .range(low..=high)
            .map(|(&address, _)| FoundServo {
                address,
                model: SIM_MODEL,
            })
            .collect())
    }

    fn position(&mut self, address: u8) -> Result<i32, BusError> {
        let mut state = self.state()?;
        if state.fail_reads {
            return Err(BusError::Timeout { address });
        }
        let raw = read_servo(&mut state, address)?;
        state.reads += 1;
        Ok(raw)
    }

    fn set_position(&mut self, address: u8, raw: i32, _: Option<u16>) -> Result<(), BusError> {
        let mut targets = BTreeMap::new();
        targets.insert(address, raw);
        self.set_positions(&targets)
    }

    fn enable(&mut self, address: u8) -> Result<(), BusError> {
        set_torque(&mut *self.state()?, address, true)
    }

    fn disable(&mut self, address: u8) -> Result<(), BusError> {
        set_torque(&mut *self.state()?, address, false)
    }

    fn close(&mut self) -> Result<(), BusError> {
        if self.open {
            self.open = false;
            self.arm.lock().closed = true;
        }
        Ok(())
    }

    fn positions(&mut self, addresses: &[u8]) -> Result<BTreeMap<u8, i32>, BusError> {
        let mut state = self.state()?;
        if state.fail_reads {
            let address = addresses.first().copied().unwrap_or_default();
            return Err(BusError::Timeout { address });
        }
        let wanted: Vec<u8> = if state.report_extra {
            state.servos.keys().copied().collect()
        } else {
            addresses.to_vec()
        };
        let mut out = BTreeMap::new();
        for address in wanted {
            out.insert(address, read_servo(&mut state, address)?);
        }
        state.reads += 1;
        Ok(out)
    }

    fn set_positions(&mut self, targets: &BTreeMap<u8, i32>) -> Result<(), BusError> {
        let mut state = self.state()?;
        if state.fail_writes {
            return Err(BusError::Io("simulated write failure".to_string()));
        }
        for (&address, &raw) in targets {
            let servo = state
                .servos
                .get_mut(&address)
                .ok_or(BusError::NoResponse { address })?;
            servo.raw = raw;
            servo.script.clear();
        }
        state.writes += 1;
        Ok(())
    }
}

fn set_torque(state: &mut SimState, address: u8, on: bool) -> Result<(), BusError> {
    if state.torque_faults.contains(&address) {
        return Err(BusError::NoResponse { address });
    }
    let servo = state
        .servos
        .get_mut(&address)
        .ok_or(BusError::NoResponse { address })?;
    servo.torque = on;
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// Connector
// ────────────────────────────────────────────────────────────────────────────

/// Resolves port names to registered [`SimArm`]s.
#[derive(Debug, Default)]
pub struct SimConnector {
    arms: Mutex<HashMap<String, SimArm>>,
}

impl SimConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `arm` under its own port name.
    pub fn with_arm(self, arm: SimArm) -> Self {
        self.register(arm);
        self
    }

    pub fn register(&self, arm: SimArm) {
        self.arms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(arm.port(), arm);
    }

    /// Handle of the arm registered under `port`.
    pub fn arm(&self, port: &str) -> Option<SimArm> {
        self.arms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(port)
            .cloned()
    }
}

impl BusConnector for SimConnector {
    fn connect(&self, port: &str) -> Result<Box<dyn ServoBus>, BusError> {
        match self.arm(port) {
            Some(arm) => Ok(Box::new(arm.bus())),
            None => Err(BusError::Open {
                port: port.to_string(),
                details: "no simulated arm registered".to_string(),
            }),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
