//! Wall-clock scheduler driving the hourly and per-minute update cycles.
//!
//! Both cadences are one-shot deadlines re-armed after every firing from the
//! current local time, so drift never accumulates and clock adjustments are
//! picked up on the next cycle.
//!
//! ## Hourly cycle
//!
//! ```text
//! minute medians ──(missing)──▶ live bus read ──(failed)──▶ last hourly sample ──▶ 0
//!        │
//!        ▼
//! hour == config.hour && weight <= config.low ──▶ calculate_watering ──▶ do_watering
//!        │                                                                  │
//!        ▼                                                                  ▼
//! append weight, water, temperature, humidity to hourly history     publish <plant>/water
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime, TimeDelta, TimeZone, Timelike};
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::ambient::AmbientSensor;
use crate::bus::Wuc;
use crate::history::{median_if_any, History, Sample, Series, HOURLY_CAPACITY, MINUTE_CAPACITY};
use crate::mqtt::{publish_logged, Publisher, Topics};
use crate::station::{PlantId, SharedState, Station, PLANT_COUNT};

// ---------------------------------------------------------------------------
// Cadence arithmetic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Hour,
    Minute,
}

impl Cadence {
    fn period(self) -> TimeDelta {
        match self {
            Cadence::Hour => TimeDelta::hours(1),
            Cadence::Minute => TimeDelta::minutes(1),
        }
    }

    /// Hour-of-day or minute-of-hour this firing belongs to. Rounds to the
    /// nearest boundary so a timer firing slightly early still reports the
    /// boundary it was armed for.
    pub fn label<Tz: TimeZone>(self, now: &DateTime<Tz>) -> u32 {
        let shifted = now.clone() + self.period() / 2;
        match self {
            Cadence::Hour => shifted.hour(),
            Cadence::Minute => shifted.minute(),
        }
    }

    /// First deadline after startup: the next boundary.
    pub fn first_boundary<Tz: TimeZone>(self, now: &DateTime<Tz>) -> DateTime<Tz> {
        self.truncate(&(now.clone() + self.period()))
    }

    /// Deadline after a firing: the boundary following the one just served,
    /// even if the timer fired a little early.
    pub fn next_boundary<Tz: TimeZone>(self, now: &DateTime<Tz>) -> DateTime<Tz> {
        self.truncate(&(now.clone() + self.period() * 3 / 2))
    }

    /// Cut `t` down to the start of its hour or minute in local time.
    fn truncate<Tz: TimeZone>(self, t: &DateTime<Tz>) -> DateTime<Tz> {
        let local = t.naive_local();
        let start = match self {
            Cadence::Hour => NaiveTime::from_hms_opt(local.hour(), 0, 0),
            Cadence::Minute => NaiveTime::from_hms_opt(local.hour(), local.minute(), 0),
        };
        start
            .map(|time| local.date().and_time(time))
            .and_then(|naive| t.timezone().from_local_datetime(&naive).earliest())
            // Boundary falls into a DST gap.
            .unwrap_or_else(|| t.clone())
    }

    fn history(self, station: &Station) -> &History {
        match self {
            Cadence::Hour => &station.hourly,
            Cadence::Minute => &station.minute,
        }
    }
}

fn delay_until<Tz: TimeZone>(now: &DateTime<Tz>, target: &DateTime<Tz>) -> Duration {
    target
        .clone()
        .signed_duration_since(now.clone())
        .to_std()
        .unwrap_or_default()
}

fn last_sample(series: &Series) -> i32 {
    series.back().copied().unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    shared: SharedState,
    wuc: Arc<Wuc>,
    ambient: Arc<dyn AmbientSensor>,
    publisher: Arc<dyn Publisher>,
    topics: Topics,
}

impl Scheduler {
    pub fn new(
        shared: SharedState,
        wuc: Arc<Wuc>,
        ambient: Arc<dyn AmbientSensor>,
        publisher: Arc<dyn Publisher>,
        topics: Topics,
    ) -> Self {
        Self {
            shared,
            wuc,
            ambient,
            publisher,
            topics,
        }
    }

    /// Run until `shutdown` flips or its sender is dropped. A cycle in
    /// progress always completes; shutdown is only observed between cycles.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let now = Local::now();
        let mut hour_at = Instant::now() + delay_until(&now, &Cadence::Hour.first_boundary(&now));
        let mut minute_at =
            Instant::now() + delay_until(&now, &Cadence::Minute.first_boundary(&now));

        info!("scheduler started");

        loop {
            tokio::select! {
                _ = sleep_until(hour_at) => {
                    let now = Local::now();
                    let hour = Cadence::Hour.label(&now);
                    hour_at = Instant::now()
                        + delay_until(&now, &Cadence::Hour.next_boundary(&now));
                    self.update_hour(hour).await;
                }
                _ = sleep_until(minute_at) => {
                    let now = Local::now();
                    let minute = Cadence::Minute.label(&now);
                    minute_at = Instant::now()
                        + delay_until(&now, &Cadence::Minute.next_boundary(&now));
                    self.update_minute(minute).await;
                }
                _ = shutdown.changed() => {
                    info!("scheduler stopping");
                    break;
                }
            }
        }
    }

    /// Hourly cycle: fold the minute window into one sample per series,
    /// water plants that are due, append everything to hourly history.
    pub async fn update_hour(&self, hour: u32) {
        let (medians, climate) = {
            let st = self.shared.read().await;
            let weights =
                PlantId::ALL.map(|id| median_if_any(&st.minute.plants[id.index()].weight));
            let climate = median_if_any(&st.minute.temperature)
                .zip(median_if_any(&st.minute.humidity));
            (weights, climate)
        };

        let weight = match medians {
            [Some(first), Some(second)] => [first, second],
            _ => {
                let live = self.live_weights(Cadence::Hour).await;
                [medians[0].unwrap_or(live[0]), medians[1].unwrap_or(live[1])]
            }
        };
        let (temperature, humidity) = match climate {
            Some(c) => c,
            None => self.live_climate(Cadence::Hour).await,
        };

        let mut command = [0; PLANT_COUNT];
        {
            let mut st = self.shared.write().await;
            for id in PlantId::ALL {
                let config = st.plant(id).config;
                let w = weight[id.index()];
                if hour == config.hour && w <= config.low {
                    info!(plant = %id, weight = w, low = config.low, "watering due");
                    command[id.index()] = st.calculate_watering(id, w, true).command_ms;
                }
            }
        }

        let mut applied = [0; PLANT_COUNT];
        for id in PlantId::ALL {
            if command[id.index()] > 0 {
                applied[id.index()] = self.wuc.do_watering(id, command[id.index()]).await;
            }
        }
        for id in PlantId::ALL {
            if applied[id.index()] > 0 {
                publish_logged(&*self.publisher, self.topics.water(id, applied[id.index()])).await;
            }
        }

        let sample = Sample {
            weight,
            water: Some(applied),
            temperature,
            humidity,
        };
        self.shared
            .write()
            .await
            .hourly
            .record(hour, &sample, HOURLY_CAPACITY);

        info!(hour, ?weight, ?applied, temperature, humidity, "hourly update");
    }

    /// Minute cycle: live reads into minute history, then publish them.
    pub async fn update_minute(&self, minute: u32) {
        let weight = self.live_weights(Cadence::Minute).await;
        let (temperature, humidity) = self.live_climate(Cadence::Minute).await;

        let sample = Sample {
            weight,
            water: None,
            temperature,
            humidity,
        };
        self.shared
            .write()
            .await
            .minute
            .record(minute, &sample, MINUTE_CAPACITY);

        debug!(minute, ?weight, temperature, humidity, "minute update");

        for id in PlantId::ALL {
            publish_logged(&*self.publisher, self.topics.weight(id, weight[id.index()])).await;
        }
        for msg in self.topics.ambient(temperature, humidity) {
            publish_logged(&*self.publisher, msg).await;
        }
    }

    /// Read both scales, substituting the newest sample of the cadence's
    /// history (or 0) for any plant that could not be read.
    async fn live_weights(&self, cadence: Cadence) -> [i32; PLANT_COUNT] {
        let readings = self.wuc.read_weights().await;

        let st = self.shared.read().await;
        let history = cadence.history(&st);

        PlantId::ALL.map(|id| {
            let reading = match &readings {
                Ok(per_plant) => per_plant[id.index()].clone(),
                Err(e) => Err(e.clone()),
            };
            reading.unwrap_or_else(|e| {
                let fallback = last_sample(&history.plants[id.index()].weight);
                warn!(plant = %id, fallback, "failed to read weight: {e}");
                fallback
            })
        })
    }

    /// `(temperature, humidity)` in hundredths, falling back like
    /// [`Self::live_weights`].
    async fn live_climate(&self, cadence: Cadence) -> (i32, i32) {
        match self.ambient.sample().await {
            Ok(climate) => climate.centi(),
            Err(e) => {
                let st = self.shared.read().await;
                let history = cadence.history(&st);
                let fallback = (
                    last_sample(&history.temperature),
                    last_sample(&history.humidity),
                );
                warn!(?fallback, "failed to read humidity and temperature: {e:#}");
                fallback
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
