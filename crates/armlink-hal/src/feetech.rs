//! Minimal Feetech STS serial-bus driver (STS3215, as fitted to SO-101 arms).
//!
//! Only what the arm needs: ping, register read/write, torque enable, goal
//! and present position, and a sync-write for batched position commands.
//!
//! Frame layout: `FF FF <id> <len> <instr> <params…> <checksum>` where
//! `len = params + 2` and the checksum is the inverted low byte of the sum of
//! every byte after the header.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, trace};

use crate::bus::{BusConnector, BusError, FoundServo, ServoBus};

pub const DEFAULT_BAUD_RATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

const HEADER: [u8; 2] = [0xFF, 0xFF];
const BROADCAST_ID: u8 = 0xFE;

const INSTR_PING: u8 = 0x01;
const INSTR_READ: u8 = 0x02;
const INSTR_WRITE: u8 = 0x03;
const INSTR_SYNC_WRITE: u8 = 0x83;

const REG_MODEL: u8 = 3;
const REG_TORQUE_ENABLE: u8 = 40;
const REG_GOAL_POSITION: u8 = 42;
const REG_PRESENT_POSITION: u8 = 56;

/// Raw positions are 12-bit.
const MAX_RAW: i32 = 4095;

fn checksum(body: &[u8]) -> u8 {
    !body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Encode one instruction frame.
pub(crate) fn encode(id: u8, instr: u8, params: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(6 + params.len());
    frame.extend_from_slice(&HEADER);
    frame.push(id);
    frame.push((params.len() + 2) as u8);
    frame.push(instr);
    frame.extend_from_slice(params);
    frame.push(checksum(&frame[2..]));
    frame
}

/// Encode a sync-write of `data_len` bytes at `register` for every servo.
pub(crate) fn encode_sync_write(register: u8, data_len: u8, entries: &[(u8, Vec<u8>)]) -> Vec<u8> {
    let mut params = Vec::with_capacity(2 + entries.len() * (1 + data_len as usize));
    params.push(register);
    params.push(data_len);
    for (id, data) in entries {
        params.push(*id);
        params.extend_from_slice(data);
    }
    encode(BROADCAST_ID, INSTR_SYNC_WRITE, &params)
}

/// Parse a status frame, returning its parameter bytes.
pub(crate) fn decode_status(expected_id: u8, frame: &[u8]) -> Result<Vec<u8>, BusError> {
    if frame.len() < 6 || frame[..2] != HEADER {
        return Err(BusError::Protocol("bad status header".to_string()));
    }
    let id = frame[2];
    let len = frame[3] as usize;
    if id != expected_id {
        return Err(BusError::Protocol(format!(
            "status from id {id}, expected {expected_id}"
        )));
    }
    if frame.len() != len + 4 {
        return Err(BusError::Protocol("truncated status frame".to_string()));
    }
    let body_end = frame.len() - 1;
    if checksum(&frame[2..body_end]) != frame[body_end] {
        return Err(BusError::Protocol("checksum mismatch".to_string()));
    }
    let error = frame[4];
    if error != 0 {
        return Err(BusError::Protocol(format!(
            "servo {id} reported error 0x{error:02x}"
        )));
    }
    Ok(frame[5..body_end].to_vec())
}

fn to_le(raw: i32) -> [u8; 2] {
    (raw.clamp(0, MAX_RAW) as u16).to_le_bytes()
}

// ────────────────────────────────────────────────────────────────────────────
// Bus
// ────────────────────────────────────────────────────────────────────────────

/// STS servo chain on one serial port.
pub struct FeetechBus {
    port_name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl FeetechBus {
    /// Open `port_name` at `baud_rate` with a per-read `timeout`.
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> Result<Self, BusError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(|e| BusError::Open {
                port: port_name.to_string(),
                details: e.to_string(),
            })?;
        debug!(port = port_name, baud_rate, "feetech bus opened");
        Ok(Self {
            port_name: port_name.to_string(),
            port: Some(port),
        })
    }

    fn io(&mut self) -> Result<&mut Box<dyn SerialPort>, BusError> {
        self.port.as_mut().ok_or(BusError::Closed)
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), BusError> {
        trace!(port = %self.port_name, ?frame, "tx");
        let io = self.io()?;
        io.clear(ClearBuffer::Input)
            .map_err(|e| BusError::Io(e.to_string()))?;
        io.write_all(frame)?;
        io.flush()?;
        Ok(())
    }

    fn receive(&mut self, address: u8) -> Result<Vec<u8>, BusError> {
        let io = self.io()?;
        let mut head = [0u8; 4];
        read_exact(io, &mut head, address)?;
        let mut rest = vec![0u8; head[3] as usize];
        read_exact(io, &mut rest, address)?;
        let mut frame = head.to_vec();
        frame.extend_from_slice(&rest);
        decode_status(address, &frame)
    }

    fn transact(&mut self, address: u8, instr: u8, params: &[u8]) -> Result<Vec<u8>, BusError> {
        self.send(&encode(address, instr, params))?;
        self.receive(address)
    }

    fn read_register(&mut self, address: u8, register: u8, len: u8) -> Result<Vec<u8>, BusError> {
        let data = self.transact(address, INSTR_READ, &[register, len])?;
        if data.len() < len as usize {
            return Err(BusError::Protocol(format!(
                "short read from servo {address}"
            )));
        }
        Ok(data)
    }

    fn write_register(&mut self, address: u8, register: u8, data: &[u8]) -> Result<(), BusError> {
        let mut params = Vec::with_capacity(1 + data.len());
        params.push(register);
        params.extend_from_slice(data);
        self.transact(address, INSTR_WRITE, &params).map(|_| ())
    }

    fn ping(&mut self, address: u8) -> Result<(), BusError> {
        self.transact(address, INSTR_PING, &[]).map(|_| ())
    }
}

fn read_exact(io: &mut Box<dyn SerialPort>, buf: &mut [u8], address: u8) -> Result<(), BusError> {
    io.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::TimedOut => BusError::Timeout { address },
        ErrorKind::UnexpectedEof => BusError::NoResponse { address },
        _ => BusError::Io(e.to_string()),
    })
}

impl ServoBus for FeetechBus {
    fn port(&self) -> &str {
        &self.port_name
    }

    fn scan(&mut self, low: u8, high: u8) -> Result<Vec<FoundServo>, BusError> {
        let mut found = Vec::new();
        for address in low..=high {
            match self.ping(address) {
                Ok(()) => {
                    let model = self
                        .read_register(address, REG_MODEL, 2)
                        .map(|d| u16::from_le_bytes([d[0], d[1]]))
                        .unwrap_or_default();
                    found.push(FoundServo { address, model });
                }
                Err(BusError::Closed) => return Err(BusError::Closed),
                Err(e) => trace!(address, error = %e, "no servo"),
            }
        }
        Ok(found)
    }

    fn position(&mut self, address: u8) -> Result<i32, BusError> {
        let data = self.read_register(address, REG_PRESENT_POSITION, 2)?;
        // Bit 15 is the direction flag; positions on this arm are unsigned 12-bit.
        Ok(i32::from(u16::from_le_bytes([data[0], data[1]]) & 0x7FFF))
    }

    fn set_position(
        &mut self,
        address: u8,
        raw: i32,
        duration_ms: Option<u16>,
    ) -> Result<(), BusError> {
        let mut data = to_le(raw).to_vec();
        if let Some(ms) = duration_ms {
            data.extend_from_slice(&ms.to_le_bytes());
        }
        self.write_register(address, REG_GOAL_POSITION, &data)
    }

    fn enable(&mut self, address: u8) -> Result<(), BusError> {
        self.write_register(address, REG_TORQUE_ENABLE, &[1])
    }

    fn disable(&mut self, address: u8) -> Result<(), BusError> {
        self.write_register(address, REG_TORQUE_ENABLE, &[0])
    }

    fn close(&mut self) -> Result<(), BusError> {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "feetech bus closed");
        }
        Ok(())
    }

    /// Broadcast sync-write; servos do not answer, so no status is read.
    fn set_positions(&mut self, targets: &BTreeMap<u8, i32>) -> Result<(), BusError> {
        if targets.is_empty() {
            return Ok(());
        }
        let entries: Vec<(u8, Vec<u8>)> = targets
            .iter()
            .map(|(&id, &raw)| (id, to_le(raw).to_vec()))
            .collect();
        self.send(&encode_sync_write(REG_GOAL_POSITION, 2, &entries))
    }
}

/// Opens [`FeetechBus`] connections.
#[derive(Debug, Clone)]
pub struct FeetechConnector {
    pub baud_rate: u32,
    pub timeout: Duration,
}

impl Default for FeetechConnector {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl BusConnector for FeetechConnector {
    fn connect(&self, port: &str) -> Result<Box<dyn ServoBus>, BusError> {
        Ok(Box::new(FeetechBus::open(port, self.baud_rate, self.timeout)?))
    }
}

/// Serial ports that might host an arm. Bluetooth pseudo-ports are skipped.
pub fn available_ports() -> Result<Vec<String>, BusError> {
    let ports = serialport::available_ports().map_err(|e| BusError::Io(e.to_string()))?;
    Ok(ports
        .into_iter()
        .map(|p| p.port_name)
        .filter(|name| !name.contains("Bluetooth"))
        .collect())
}
