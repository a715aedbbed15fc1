//! In-memory station model and the watering decision.
//!
//! Everything mutable lives in one [`Station`] behind a single
//! [`SharedState`] read/write lock. Read-only work (HTTP queries, median
//! computation, snapshot saves) takes the shared lock; appends and
//! calibration updates take the exclusive lock. Bus I/O is never done while
//! holding either.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::calibration::{self, Calibration, Fit};
use crate::config::PlantConfig;
use crate::history::{History, HOURLY_CAPACITY, MINUTE_CAPACITY};

pub const PLANT_COUNT: usize = 2;

pub type SharedState = Arc<RwLock<Station>>;

// ---------------------------------------------------------------------------
// Plant identity
// ---------------------------------------------------------------------------

/// Index of one of the two plant channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PlantId(u8);

impl PlantId {
    pub const FIRST: PlantId = PlantId(0);
    pub const SECOND: PlantId = PlantId(1);
    pub const ALL: [PlantId; PLANT_COUNT] = [PlantId::FIRST, PlantId::SECOND];

    pub fn new(index: usize) -> Option<Self> {
        (index < PLANT_COUNT).then_some(PlantId(index as u8))
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Lenient query parameter parsing: `"1"` selects the second plant,
    /// anything else (including nothing) the first.
    pub fn from_query(value: Option<&str>) -> Self {
        match value {
            Some("1") => PlantId::SECOND,
            _ => PlantId::FIRST,
        }
    }
}

impl fmt::Display for PlantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plant {}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Station
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Plant {
    pub config: PlantConfig,
    pub calibration: Calibration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Station {
    pub plants: [Plant; PLANT_COUNT],
    /// One sample per hour, eight days deep.
    pub hourly: History,
    /// One sample per minute, eight hours deep.
    pub minute: History,
}

/// Outcome of a watering decision, with the figures that went into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WateringPlan {
    /// Duration to send to the device, offset already removed.
    pub command_ms: i32,
    /// Unclamped model prediction.
    pub predicted_ms: i64,
    pub hours_since_watering: usize,
    pub average_weight: i32,
    pub average_dryout: i32,
    pub fit: Fit,
}

impl Station {
    pub fn new(configs: [PlantConfig; PLANT_COUNT]) -> Self {
        let [first, second] = configs;
        Self {
            plants: [
                Plant {
                    config: first,
                    calibration: Calibration::default(),
                },
                Plant {
                    config: second,
                    calibration: Calibration::default(),
                },
            ],
            hourly: History::default(),
            minute: History::default(),
        }
    }

    pub fn plant(&self, id: PlantId) -> &Plant {
        &self.plants[id.index()]
    }

    /// Wrap the station in its lock.
    pub fn into_shared(self) -> SharedState {
        Arc::new(RwLock::new(self))
    }

    /// Drop any samples beyond the history bounds, e.g. after a restore.
    pub fn enforce_bounds(&mut self) {
        self.hourly.truncate(HOURLY_CAPACITY);
        self.minute.truncate(MINUTE_CAPACITY);
    }

    /// Run the calibration engine on the plant's hourly history without
    /// touching the stored model.
    pub fn calculate_dryout_and_watering_time(&self, id: PlantId) -> Fit {
        let series = &self.hourly.plants[id.index()];
        calibration::fit(&series.weight, &series.water, self.plant(id).calibration)
    }

    /// Decide how long to water `id` given its current `weight`.
    ///
    /// With `save` set the freshly fitted model replaces the stored one;
    /// diagnostic callers pass `false` and leave the station untouched.
    pub fn calculate_watering(&mut self, id: PlantId, weight: i32, save: bool) -> WateringPlan {
        let series = &self.hourly.plants[id.index()];

        let hours_since_watering = series.water.iter().rev().take_while(|&&w| w <= 0).count();
        let recent = series
            .weight
            .iter()
            .rev()
            .take(hours_since_watering)
            .map(|&w| i64::from(w));
        let samples = recent.len() as i64 + 1;
        let average_weight = ((recent.sum::<i64>() + i64::from(weight)) / samples) as i32;

        info!(
            plant = %id,
            hours = hours_since_watering + 1,
            average_weight,
            "last watering"
        );

        let fit = self.calculate_dryout_and_watering_time(id);

        let plant = &mut self.plants[id.index()];
        if save {
            plant.calibration = fit.calibration;
        }
        let config = &plant.config;

        let level_span = (i64::from(config.dst) - i64::from(config.low)).max(1);
        let average_dryout = if fit.dryout > 0 {
            let dryout = i64::from(fit.dryout);
            let cycle = ((2 * level_span) / dryout + 1) * dryout / 2;
            i32::try_from(cycle).unwrap_or(i32::MAX)
        } else {
            0
        };

        let delta = config.dst - weight;
        let predicted_ms = fit.calibration.predict(delta);
        let clamped = predicted_ms
            .max(i64::from(config.start))
            .min(i64::from(config.max)) as i32;
        let command_ms = clamped - plant.calibration.offset;

        info!(
            plant = %id,
            dryout = fit.dryout,
            average_dryout,
            scale = fit.calibration.scale,
            offset = fit.calibration.offset,
            delta,
            predicted_ms,
            command_ms,
            "watering time"
        );

        WateringPlan {
            command_ms,
            predicted_ms,
            hours_since_watering,
            average_weight,
            average_dryout,
            fit,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
