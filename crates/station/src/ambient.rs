//! Ambient temperature and humidity.
//!
//! The real sensor is a Sensirion SHT3x on the same I²C bus as the watering
//! microcontroller, read in single-shot high-repeatability mode.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::config::BusConfig;

/// One ambient measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Climate {
    /// Degrees Celsius.
    pub temperature: f32,
    /// Percent relative humidity.
    pub humidity: f32,
}

impl Climate {
    /// `(temperature, humidity)` in hundredths, as stored in history.
    pub fn centi(&self) -> (i32, i32) {
        (
            (self.temperature * 100.0).round() as i32,
            (self.humidity * 100.0).round() as i32,
        )
    }
}

#[async_trait]
pub trait AmbientSensor: Send + Sync {
    async fn sample(&self) -> Result<Climate>;
}

/// Start the ambient sensor selected at build time. Failure is fatal to the
/// caller.
pub async fn start(config: &BusConfig) -> Result<Arc<dyn AmbientSensor>> {
    #[cfg(feature = "i2c")]
    {
        let sensor = sht3x::Sht3x::start(config.i2c_bus, config.ambient_address).await?;
        Ok(Arc::new(sensor))
    }
    #[cfg(not(feature = "i2c"))]
    {
        tracing::info!(
            addr = format_args!("0x{:02x}", config.ambient_address),
            "i2c support not compiled in, using simulated ambient sensor"
        );
        Ok(Arc::new(SimulatedAmbient::default()))
    }
}

// ---------------------------------------------------------------------------
// SHT3x frame decoding
// ---------------------------------------------------------------------------

#[cfg(any(test, feature = "i2c"))]
const CRC_POLY: u8 = 0x31;
#[cfg(any(test, feature = "i2c"))]
const CRC_INIT: u8 = 0xFF;

/// Sensirion CRC-8 over one data word.
#[cfg(any(test, feature = "i2c"))]
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = CRC_INIT;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Decode a 6-byte measurement: temperature word, CRC, humidity word, CRC.
#[cfg(any(test, feature = "i2c"))]
pub fn decode_measurement(frame: &[u8; 6]) -> Result<Climate> {
    anyhow::ensure!(crc8(&frame[0..2]) == frame[2], "sht3x temperature crc mismatch");
    anyhow::ensure!(crc8(&frame[3..5]) == frame[5], "sht3x humidity crc mismatch");

    let raw_t = f32::from(u16::from_be_bytes([frame[0], frame[1]]));
    let raw_h = f32::from(u16::from_be_bytes([frame[3], frame[4]]));

    Ok(Climate {
        temperature: -45.0 + 175.0 * raw_t / 65535.0,
        humidity: 100.0 * raw_h / 65535.0,
    })
}

#[cfg(feature = "i2c")]
mod sht3x {
    use std::time::Duration;

    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use rppal::i2c::I2c;
    use tokio::sync::Mutex;
    use tokio::time::sleep;
    use tracing::info;

    use super::{decode_measurement, AmbientSensor, Climate};

    const CMD_SOFT_RESET: [u8; 2] = [0x30, 0xA2];
    /// Single shot, high repeatability, no clock stretching.
    const CMD_MEASURE: [u8; 2] = [0x24, 0x00];
    const MEASURE_WAIT: Duration = Duration::from_millis(15);
    const RESET_WAIT: Duration = Duration::from_millis(2);

    pub struct Sht3x {
        i2c: Mutex<I2c>,
    }

    impl Sht3x {
        pub async fn start(bus: u8, addr: u16) -> Result<Self> {
            let mut i2c =
                I2c::with_bus(bus).with_context(|| format!("failed to open i2c bus {bus}"))?;
            i2c.set_slave_address(addr)
                .with_context(|| format!("failed to select sht3x at 0x{addr:02x}"))?;
            i2c.write(&CMD_SOFT_RESET).context("sht3x soft reset failed")?;
            sleep(RESET_WAIT).await;

            info!(bus, addr = format_args!("0x{addr:02x}"), "sht3x initialised");
            Ok(Self {
                i2c: Mutex::new(i2c),
            })
        }
    }

    #[async_trait]
    impl AmbientSensor for Sht3x {
        async fn sample(&self) -> Result<Climate> {
            let mut i2c = self.i2c.lock().await;

            i2c.write(&CMD_MEASURE).context("sht3x measure command failed")?;
            sleep(MEASURE_WAIT).await;

            let mut frame = [0u8; 6];
            let n = i2c.read(&mut frame).context("sht3x read failed")?;
            anyhow::ensure!(n == frame.len(), "short sht3x read: {n} of 6 bytes");

            decode_measurement(&frame)
        }
    }
}

// ---------------------------------------------------------------------------
// Simulated sensor
// ---------------------------------------------------------------------------

/// Room-like readings with a little noise.
#[cfg_attr(feature = "i2c", allow(dead_code))]
#[derive(Debug, Clone, Copy)]
pub struct SimulatedAmbient {
    pub temperature: f32,
    pub humidity: f32,
}

impl Default for SimulatedAmbient {
    fn default() -> Self {
        Self {
            temperature: 21.5,
            humidity: 45.0,
        }
    }
}

#[async_trait]
impl AmbientSensor for SimulatedAmbient {
    async fn sample(&self) -> Result<Climate> {
        Ok(Climate {
            temperature: self.temperature + (fastrand::f32() - 0.5) * 0.2,
            humidity: self.humidity + (fastrand::f32() - 0.5),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
