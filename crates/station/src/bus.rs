//! Driver for the watering microcontroller on the shared I²C bus.
//!
//! Every transaction holds the bus lock for its full request/response round
//! trip, including the fixed settle and pump delays, so no two exchanges can
//! interleave. The peer has no ready line; fixed delays stand in for it.
//!
//! A response byte of `0xFF` is reserved as the "measurement failed"
//! sentinel and is surfaced as [`BusError::SensorFault`], never as a value.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::station::PlantId;

/// 7-bit I²C address of the watering microcontroller.
pub const MCU_ADDRESS: u16 = 0x10;

/// Reserved response byte signalling a failed measurement.
pub const FAULT_SENTINEL: u8 = 0xFF;

/// Device watering resolution.
pub const UNIT_MS: i32 = 250;

/// Largest duration the device can be asked for.
pub const MAX_WATERING_MS: i32 = 255 * UNIT_MS;

/// The plant index occupies the low bit; the command code the rest.
const CMD_SHIFT: u8 = 1;
const INDEX_MASK: u8 = 0x01;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    GetLastWatering = 0x10,
    GetWaterLimit = 0x11,
    GetWeight = 0x12,
    Watering = 0x1A,
    Echo = 0x29,
}

impl Command {
    pub const ALL: [Command; 5] = [
        Command::GetLastWatering,
        Command::GetWaterLimit,
        Command::GetWeight,
        Command::Watering,
        Command::Echo,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }
}

/// Pack a command and plant index into one protocol byte.
pub fn encode(cmd: Command, plant: PlantId) -> u8 {
    (cmd.code() << CMD_SHIFT) | (plant.index() as u8 & INDEX_MASK)
}

/// Inverse of [`encode`]. `None` for an unknown command code.
pub fn decode(byte: u8) -> Option<(Command, PlantId)> {
    let cmd = Command::from_code(byte >> CMD_SHIFT)?;
    let plant = PlantId::new((byte & INDEX_MASK) as usize)?;
    Some((cmd, plant))
}

/// Convert milliseconds into device units, rounding to the nearest unit.
pub fn ms_to_units(ms: i32) -> Result<u8, BusError> {
    let units = (i64::from(ms) + i64::from(UNIT_MS / 2)) / i64::from(UNIT_MS);
    if ms < 0 || units > i64::from(u8::MAX) {
        return Err(BusError::OutOfRange { ms, units });
    }
    Ok(units as u8)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("short {op}: {got} of {expected} bytes")]
    ShortTransfer {
        op: &'static str,
        got: usize,
        expected: usize,
    },
    #[error("failed to measure {what} for {plant}")]
    SensorFault { what: &'static str, plant: PlantId },
    #[error("watering time out of range: {units} units ({ms} ms)")]
    OutOfRange { ms: i32, units: i64 },
}

impl BusError {
    /// True when the peer answered but flagged the measurement as failed.
    pub fn is_fault(&self) -> bool {
        matches!(self, BusError::SensorFault { .. })
    }
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Raw byte transport to the microcontroller.
pub trait Transport: Send {
    fn write(&mut self, buf: &[u8]) -> Result<usize, BusError>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BusError>;
}

fn write_all(bus: &mut dyn Transport, buf: &[u8], op: &'static str) -> Result<(), BusError> {
    let n = bus.write(buf)?;
    if n < buf.len() {
        return Err(BusError::ShortTransfer {
            op,
            got: n,
            expected: buf.len(),
        });
    }
    Ok(())
}

fn read_exact(bus: &mut dyn Transport, buf: &mut [u8], op: &'static str) -> Result<(), BusError> {
    let n = bus.read(buf)?;
    if n != buf.len() {
        return Err(BusError::ShortTransfer {
            op,
            got: n,
            expected: buf.len(),
        });
    }
    Ok(())
}

fn read_byte(bus: &mut dyn Transport, op: &'static str) -> Result<u8, BusError> {
    let mut buf = [0u8; 1];
    read_exact(bus, &mut buf, op)?;
    Ok(buf[0])
}

/// Reject the fault sentinel, passing real samples through.
fn checked(byte: u8, what: &'static str, plant: PlantId) -> Result<u8, BusError> {
    if byte == FAULT_SENTINEL {
        Err(BusError::SensorFault { what, plant })
    } else {
        Ok(byte)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Fixed delays standing in for a ready signal.
#[derive(Debug, Clone, Copy)]
pub struct BusTiming {
    /// Wait between a weight command and reading its result.
    pub settle: Duration,
    /// Extra wait after the requested watering time before reading back.
    pub watering_margin: Duration,
}

impl Default for BusTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(700),
            watering_margin: Duration::from_millis(500),
        }
    }
}

pub type WeightReadings = [Result<i32, BusError>; 2];

/// Watering microcontroller handle. Cheap to share behind an `Arc`.
pub struct Wuc {
    bus: Mutex<Box<dyn Transport>>,
    timing: BusTiming,
}

impl Wuc {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_timing(transport, BusTiming::default())
    }

    pub fn with_timing(transport: Box<dyn Transport>, timing: BusTiming) -> Self {
        Self {
            bus: Mutex::new(transport),
            timing,
        }
    }

    /// Measure both weight sensors.
    ///
    /// The outer error is a transport failure, which aborts the whole read.
    /// A sensor fault only affects its own plant.
    pub async fn read_weights(&self) -> Result<WeightReadings, BusError> {
        let mut bus = self.bus.lock().await;

        let first = self.measure_weight(&mut **bus, PlantId::FIRST).await;
        let first = keep_faults(first)?;
        let second = self.measure_weight(&mut **bus, PlantId::SECOND).await;
        let second = keep_faults(second)?;

        Ok([first, second])
    }

    async fn measure_weight(&self, bus: &mut dyn Transport, plant: PlantId) -> Result<i32, BusError> {
        write_all(bus, &[encode(Command::GetWeight, plant)], "weight command")?;

        sleep(self.timing.settle).await;

        let mut buf = [0u8; 2];
        read_exact(bus, &mut buf, "weight result")?;
        checked(buf[1], "weight", plant)?;

        Ok(i32::from(u16::from_le_bytes(buf)))
    }

    /// Run the pump for roughly `requested_ms` and return the duration the
    /// device reports as applied. Failures are logged and count as 0 ms.
    pub async fn do_watering(&self, plant: PlantId, requested_ms: i32) -> i32 {
        match self.water(plant, requested_ms).await {
            Ok(ms) => ms,
            Err(e) => {
                warn!(%plant, requested_ms, "watering failed: {e}");
                0
            }
        }
    }

    async fn water(&self, plant: PlantId, requested_ms: i32) -> Result<i32, BusError> {
        let units = ms_to_units(requested_ms)?;

        let mut bus = self.bus.lock().await;

        info!(%plant, ms = i32::from(units) * UNIT_MS, "watering");
        write_all(
            &mut **bus,
            &[encode(Command::Watering, plant), units],
            "watering command",
        )?;

        // Let the pump finish, with some margin.
        let wait = Duration::from_millis(requested_ms as u64) + self.timing.watering_margin;
        sleep(wait).await;

        let applied = read_byte(&mut **bus, "watering result")?;
        if applied != units {
            info!(%plant, requested = units, applied, "device applied a different duration");
        }

        Ok(i32::from(applied) * UNIT_MS)
    }

    /// Duration of the last watering the device performed.
    pub async fn read_last_watering(&self, plant: PlantId) -> Result<i32, BusError> {
        let mut bus = self.bus.lock().await;

        write_all(
            &mut **bus,
            &[encode(Command::GetLastWatering, plant)],
            "last watering command",
        )?;
        let units = checked(
            read_byte(&mut **bus, "last watering result")?,
            "last watering time",
            plant,
        )?;

        Ok(i32::from(units) * UNIT_MS)
    }

    /// Raw water limit sensor reading.
    pub async fn read_watering_limit(&self, plant: PlantId) -> Result<u8, BusError> {
        let mut bus = self.bus.lock().await;

        write_all(
            &mut **bus,
            &[encode(Command::GetWaterLimit, plant)],
            "water limit command",
        )?;
        checked(
            read_byte(&mut **bus, "water limit result")?,
            "water limit",
            plant,
        )
    }

    /// Send `payload` behind an echo command and return what comes back.
    pub async fn echo(&self, payload: &[u8]) -> Result<Vec<u8>, BusError> {
        let mut bus = self.bus.lock().await;

        let mut buf = Vec::with_capacity(payload.len() + 1);
        buf.push(encode(Command::Echo, PlantId::FIRST));
        buf.extend_from_slice(payload);

        bus.write(&buf)?;
        let n = bus.read(&mut buf)?;
        buf.truncate(n);

        debug!(sent = payload.len(), received = n, "echo");
        Ok(buf)
    }
}

fn keep_faults(reading: Result<i32, BusError>) -> Result<Result<i32, BusError>, BusError> {
    match reading {
        Err(e) if !e.is_fault() => Err(e),
        other => Ok(other),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedTransport;

    fn wuc(script: &ScriptedTransport) -> Wuc {
        Wuc::new(Box::new(script.clone()))
    }

    // -- Command encoding ---------------------------------------------------

    #[test]
    fn encode_decode_round_trips() {
        for cmd in Command::ALL {
            for plant in PlantId::ALL {
                let byte = encode(cmd, plant);
                assert_eq!(decode(byte), Some((cmd, plant)), "byte {byte:#04x}");
            }
        }
    }

    #[test]
    fn encode_packs_index_in_low_bit() {
        assert_eq!(encode(Command::GetWeight, PlantId::FIRST), 0x24);
        assert_eq!(encode(Command::GetWeight, PlantId::SECOND), 0x25);
        assert_eq!(encode(Command::Watering, PlantId::SECOND), 0x35);
        assert_eq!(encode(Command::Echo, PlantId::FIRST), 0x52);
    }

    #[test]
    fn decode_unknown_code_is_none() {
        assert_eq!(decode(0x00), None);
        assert_eq!(decode(0xFF), None);
    }

    // -- Unit conversion ----------------------------------------------------

    #[test]
    fn ms_to_units_rounds_to_nearest() {
        assert_eq!(ms_to_units(0), Ok(0));
        assert_eq!(ms_to_units(124), Ok(0));
        assert_eq!(ms_to_units(125), Ok(1));
        assert_eq!(ms_to_units(2000), Ok(8));
        assert_eq!(ms_to_units(MAX_WATERING_MS), Ok(255));
    }

    #[test]
    fn ms_to_units_rejects_out_of_range() {
        assert!(ms_to_units(-1).is_err());
        assert!(ms_to_units(-500).is_err());
        assert!(ms_to_units(MAX_WATERING_MS + 125).is_err());
    }

    // -- ReadWeights --------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn read_weights_decodes_little_endian() {
        let script = ScriptedTransport::default();
        script.respond(&[0x14, 0x05]); // 1300
        script.respond(&[0xDC, 0x05]); // 1500

        let [a, b] = wuc(&script).read_weights().await.unwrap();
        assert_eq!(a, Ok(1300));
        assert_eq!(b, Ok(1500));
        assert_eq!(script.writes(), vec![vec![0x24], vec![0x25]]);
    }

    #[tokio::test(start_paused = true)]
    async fn read_weights_waits_settle_delay() {
        let script = ScriptedTransport::default();
        script.respond(&[1, 0]);
        script.respond(&[2, 0]);

        let start = tokio::time::Instant::now();
        let [a, b] = wuc(&script).read_weights().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1400));
        assert_eq!(a, Ok(1));
        assert_eq!(b, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn read_weights_fault_is_per_plant() {
        let script = ScriptedTransport::default();
        script.respond(&[0x00, FAULT_SENTINEL]);
        script.respond(&[0xDC, 0x05]);

        let [a, b] = wuc(&script).read_weights().await.unwrap();
        assert!(a.unwrap_err().is_fault());
        assert_eq!(b, Ok(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn read_weights_transport_error_aborts() {
        let script = ScriptedTransport::default();
        script.fail_read("nack");

        let err = wuc(&script).read_weights().await.unwrap_err();
        assert_eq!(err, BusError::Transport("nack".into()));
        // Second plant never addressed.
        assert_eq!(script.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_weights_short_read_aborts() {
        let script = ScriptedTransport::default();
        script.respond(&[0x14]);

        let err = wuc(&script).read_weights().await.unwrap_err();
        assert!(matches!(err, BusError::ShortTransfer { got: 1, expected: 2, .. }));
    }

    // -- DoWatering ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn watering_sends_rounded_units_and_returns_applied() {
        let script = ScriptedTransport::default();
        script.respond(&[8]);

        let applied = wuc(&script).do_watering(PlantId::SECOND, 2100).await;
        assert_eq!(applied, 2000);
        assert_eq!(script.writes(), vec![vec![0x35, 8]]);
    }

    #[tokio::test(start_paused = true)]
    async fn watering_returns_what_the_device_applied() {
        let script = ScriptedTransport::default();
        script.respond(&[3]); // safety cutoff

        let applied = wuc(&script).do_watering(PlantId::FIRST, 5000).await;
        assert_eq!(applied, 750);
        assert_eq!(script.writes(), vec![vec![0x34, 20]]);
    }

    #[tokio::test(start_paused = true)]
    async fn watering_blocks_for_requested_time_plus_margin() {
        let script = ScriptedTransport::default();
        script.respond(&[20]);

        let start = tokio::time::Instant::now();
        wuc(&script).do_watering(PlantId::FIRST, 5000).await;
        assert!(start.elapsed() >= Duration::from_millis(5500));
    }

    #[tokio::test(start_paused = true)]
    async fn watering_out_of_range_touches_no_bus() {
        let script = ScriptedTransport::default();
        let wuc = wuc(&script);

        assert_eq!(wuc.do_watering(PlantId::FIRST, -1).await, 0);
        assert_eq!(wuc.do_watering(PlantId::FIRST, -1000).await, 0);
        assert_eq!(wuc.do_watering(PlantId::FIRST, 64_000).await, 0);
        assert!(script.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn watering_write_failure_counts_as_zero() {
        let script = ScriptedTransport::default();
        script.fail_writes();

        assert_eq!(wuc(&script).do_watering(PlantId::FIRST, 2000).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn watering_read_failure_counts_as_zero() {
        let script = ScriptedTransport::default();
        script.fail_read("timeout");

        assert_eq!(wuc(&script).do_watering(PlantId::FIRST, 2000).await, 0);
        assert_eq!(script.writes().len(), 1);
    }

    // -- Single byte queries ------------------------------------------------

    #[tokio::test]
    async fn last_watering_in_ms() {
        let script = ScriptedTransport::default();
        script.respond(&[12]);

        let ms = wuc(&script).read_last_watering(PlantId::SECOND).await.unwrap();
        assert_eq!(ms, 3000);
        assert_eq!(script.writes(), vec![vec![0x21]]);
    }

    #[tokio::test]
    async fn last_watering_sentinel_is_fault() {
        let script = ScriptedTransport::default();
        script.respond(&[FAULT_SENTINEL]);

        let err = wuc(&script).read_last_watering(PlantId::FIRST).await.unwrap_err();
        assert!(err.is_fault());
    }

    #[tokio::test]
    async fn water_limit_raw_value() {
        let script = ScriptedTransport::default();
        script.respond(&[0x42]);

        let limit = wuc(&script).read_watering_limit(PlantId::FIRST).await.unwrap();
        assert_eq!(limit, 0x42);
        assert_eq!(script.writes(), vec![vec![0x22]]);
    }

    #[tokio::test]
    async fn water_limit_sentinel_is_fault() {
        let script = ScriptedTransport::default();
        script.respond(&[FAULT_SENTINEL]);

        let err = wuc(&script).read_watering_limit(PlantId::SECOND).await.unwrap_err();
        assert_eq!(
            err,
            BusError::SensorFault {
                what: "water limit",
                plant: PlantId::SECOND
            }
        );
    }

    // -- Bus lock -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn overlapping_callers_never_interleave() {
        let script = ScriptedTransport::default();
        script.respond(&[8]);
        script.respond(&[0x14, 0x05]);
        script.respond(&[0xDC, 0x05]);
        script.respond(&[0x52, 7]);
        let wuc = std::sync::Arc::new(wuc(&script));
        let start = tokio::time::Instant::now();

        let watering = tokio::spawn({
            let wuc = wuc.clone();
            async move { wuc.do_watering(PlantId::FIRST, 2000).await }
        });
        sleep(Duration::from_millis(10)).await;

        let weights = tokio::spawn({
            let wuc = wuc.clone();
            async move {
                let readings = wuc.read_weights().await;
                (readings, start.elapsed())
            }
        });
        sleep(Duration::from_millis(10)).await;

        let echo = tokio::spawn({
            let wuc = wuc.clone();
            async move { wuc.echo(&[7]).await }
        });

        assert_eq!(watering.await.unwrap(), 2000);
        let (readings, elapsed) = weights.await.unwrap();
        assert_eq!(readings.unwrap(), [Ok(1300), Ok(1500)]);
        // Waited for the pump (2000 + 500 ms) before its own two settles.
        assert!(elapsed >= Duration::from_millis(3900), "{elapsed:?}");
        assert_eq!(echo.await.unwrap().unwrap(), vec![0x52, 7]);

        assert_eq!(
            script.writes(),
            vec![vec![0x34, 8], vec![0x24], vec![0x25], vec![0x52, 7]]
        );
    }

    // -- Echo ---------------------------------------------------------------

    #[tokio::test]
    async fn echo_prefixes_command_and_returns_response() {
        let script = ScriptedTransport::default();
        script.respond(&[0x52, 1, 2, 3]);

        let echoed = wuc(&script).echo(&[1, 2, 3]).await.unwrap();
        assert_eq!(echoed, vec![0x52, 1, 2, 3]);
        assert_eq!(script.writes(), vec![vec![0x52, 1, 2, 3]]);
    }

    #[tokio::test]
    async fn echo_truncates_to_bytes_read() {
        let script = ScriptedTransport::default();
        script.respond(&[0x52]);

        let echoed = wuc(&script).echo(&[9, 9]).await.unwrap();
        assert_eq!(echoed, vec![0x52]);
    }
}
