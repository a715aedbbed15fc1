//! Byte transports for the watering microcontroller.
//!
//! With the `i2c` feature the driver talks to the real device through
//! `rppal`. Without it an in-process simulator answers every command, so the
//! station runs unchanged on a development host.

use std::collections::VecDeque;

use anyhow::Result;
use tracing::info;

use crate::bus::{decode, Command, Transport, BusError, FAULT_SENTINEL};
use crate::config::BusConfig;
use crate::station::PLANT_COUNT;

/// Open the transport selected at build time.
#[cfg(feature = "i2c")]
pub fn open(config: &BusConfig) -> Result<Box<dyn Transport>> {
    Ok(Box::new(I2cTransport::open(config.i2c_bus, config.mcu_address)?))
}

/// Open the transport selected at build time.
#[cfg(not(feature = "i2c"))]
pub fn open(config: &BusConfig) -> Result<Box<dyn Transport>> {
    info!(
        bus = config.i2c_bus,
        addr = format_args!("0x{:02x}", config.mcu_address),
        "i2c support not compiled in, using simulated microcontroller"
    );
    Ok(Box::new(SimTransport::new()))
}

// ---------------------------------------------------------------------------
// Linux I²C
// ---------------------------------------------------------------------------

#[cfg(feature = "i2c")]
pub struct I2cTransport {
    i2c: rppal::i2c::I2c,
}

#[cfg(feature = "i2c")]
impl I2cTransport {
    pub fn open(bus: u8, addr: u16) -> Result<Self> {
        use anyhow::Context;

        let mut i2c = rppal::i2c::I2c::with_bus(bus)
            .with_context(|| format!("failed to open i2c bus {bus}"))?;
        i2c.set_slave_address(addr)
            .with_context(|| format!("failed to select i2c address 0x{addr:02x}"))?;

        info!(bus, addr = format_args!("0x{addr:02x}"), "microcontroller bus opened");
        Ok(Self { i2c })
    }
}

#[cfg(feature = "i2c")]
impl Transport for I2cTransport {
    fn write(&mut self, buf: &[u8]) -> Result<usize, BusError> {
        self.i2c
            .write(buf)
            .map_err(|e| BusError::Transport(e.to_string()))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BusError> {
        self.i2c
            .read(buf)
            .map_err(|e| BusError::Transport(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Simulated microcontroller
// ---------------------------------------------------------------------------

/// Weight lost per weight measurement, roughly 10 g/h at one read a minute
/// plus one extra read per hour.
const DRY_PER_READ: f64 = 10.0 / 61.0;

/// Weight gained per watering unit (250 ms of pump time).
const GAIN_PER_UNIT: f64 = 5.0;

/// Peak-to-peak scale noise.
const WEIGHT_NOISE: f64 = 3.0;

/// Stateful stand-in for the watering microcontroller.
///
/// Implements the full command set: weights slowly dry out, watering adds
/// weight proportional to the requested units, and echo returns what was
/// written. Responses are queued by `write` and drained by `read`.
#[cfg_attr(feature = "i2c", allow(dead_code))]
pub struct SimTransport {
    weight: [f64; PLANT_COUNT],
    last_units: [u8; PLANT_COUNT],
    limit: [u8; PLANT_COUNT],
    pending: VecDeque<u8>,
}

#[cfg_attr(feature = "i2c", allow(dead_code))]
impl SimTransport {
    pub fn new() -> Self {
        Self {
            weight: [1500.0, 1480.0],
            last_units: [0; PLANT_COUNT],
            limit: [40, 40],
            pending: VecDeque::new(),
        }
    }

    fn respond(&mut self, bytes: &[u8]) {
        self.pending.clear();
        self.pending.extend(bytes);
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimTransport {
    fn write(&mut self, buf: &[u8]) -> Result<usize, BusError> {
        let Some(&byte) = buf.first() else {
            return Ok(0);
        };
        let (cmd, plant) = decode(byte)
            .ok_or_else(|| BusError::Transport(format!("unknown command byte 0x{byte:02x}")))?;
        let i = plant.index();

        match cmd {
            Command::GetWeight => {
                self.weight[i] = (self.weight[i] - DRY_PER_READ).max(0.0);
                let noise = (fastrand::f64() - 0.5) * WEIGHT_NOISE;
                let grams = (self.weight[i] + noise).round().clamp(0.0, 0xFEFF as f64) as u16;
                self.respond(&grams.to_le_bytes());
            }
            Command::Watering => {
                let units = buf.get(1).copied().unwrap_or(0);
                self.last_units[i] = units;
                self.weight[i] += f64::from(units) * GAIN_PER_UNIT;
                self.respond(&[units]);
            }
            Command::GetLastWatering => {
                let units = self.last_units[i].min(FAULT_SENTINEL - 1);
                self.respond(&[units]);
            }
            Command::GetWaterLimit => {
                let limit = self.limit[i];
                self.respond(&[limit]);
            }
            Command::Echo => {
                let copy = buf.to_vec();
                self.respond(&copy);
            }
        }

        Ok(buf.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BusError> {
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Scripted transport for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) use scripted::ScriptedTransport;


// ===========================================================================
// Tests
// ===========================================================================
