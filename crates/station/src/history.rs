//! Bounded two-resolution sample history.
//!
//! Every series is a flat, chronologically ordered sequence (newest last)
//! with a fixed maximum length. Pushing past the bound evicts the oldest
//! samples; nothing is ever reordered.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::station::PLANT_COUNT;

/// Hourly resolution keeps eight days.
pub const HOURLY_CAPACITY: usize = 8 * 24;

/// Minute resolution keeps eight hours.
pub const MINUTE_CAPACITY: usize = 8 * 60;

/// Number of minute samples folded into one hourly sample.
const MEDIAN_WINDOW: usize = 60;

pub type Series = VecDeque<i32>;

/// Append `value`, dropping the oldest samples so the series never holds
/// more than `max_len` entries.
pub fn push(series: &mut Series, value: i32, max_len: usize) {
    if max_len == 0 {
        series.clear();
        return;
    }
    while series.len() >= max_len {
        series.pop_front();
    }
    series.push_back(value);
}

/// Lower median of the most recent (at most 60) samples.
///
/// # Panics
///
/// Panics on an empty series. Callers check for samples first.
pub fn hour_median(series: &Series) -> i32 {
    assert!(!series.is_empty(), "hour_median called on an empty series");

    let start = series.len().saturating_sub(MEDIAN_WINDOW);
    let mut window: Vec<i32> = series.iter().skip(start).copied().collect();
    window.sort_unstable();
    window[window.len() / 2]
}

/// Median of the minute window if there is one, otherwise `None`.
pub fn median_if_any(series: &Series) -> Option<i32> {
    (!series.is_empty()).then(|| hour_median(series))
}

// ---------------------------------------------------------------------------
// Per-resolution history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlantSeries {
    #[serde(default)]
    pub weight: Series,
    /// Watering duration applied after the weight sample of the same slot.
    #[serde(default)]
    pub water: Series,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(default)]
    pub plants: [PlantSeries; PLANT_COUNT],
    /// Hundredths of a degree Celsius.
    #[serde(default)]
    pub temperature: Series,
    /// Hundredths of a percent relative humidity.
    #[serde(default)]
    pub humidity: Series,
    /// Hour or minute at which the last sample was recorded.
    #[serde(default)]
    pub time: u32,
}

/// One update cycle's worth of samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sample {
    pub weight: [i32; PLANT_COUNT],
    pub water: Option<[i32; PLANT_COUNT]>,
    pub temperature: i32,
    pub humidity: i32,
}

impl History {
    pub fn record(&mut self, time: u32, sample: &Sample, max_len: usize) {
        self.time = time;
        for (i, plant) in self.plants.iter_mut().enumerate() {
            push(&mut plant.weight, sample.weight[i], max_len);
            if let Some(water) = sample.water {
                push(&mut plant.water, water[i], max_len);
            }
        }
        push(&mut self.temperature, sample.temperature, max_len);
        push(&mut self.humidity, sample.humidity, max_len);
    }

    /// Drop the oldest samples of any series longer than `max_len`.
    pub fn truncate(&mut self, max_len: usize) {
        fn keep_newest(series: &mut Series, max_len: usize) {
            let excess = series.len().saturating_sub(max_len);
            series.drain(..excess);
        }
        for plant in &mut self.plants {
            keep_newest(&mut plant.weight, max_len);
            keep_newest(&mut plant.water, max_len);
        }
        keep_newest(&mut self.temperature, max_len);
        keep_newest(&mut self.humidity, max_len);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn series(values: &[i32]) -> Series {
        values.iter().copied().collect()
    }

    // -- push ---------------------------------------------------------------

    #[test]
    fn push_keeps_suffix_of_all_appends() {
        for max_len in 1..12 {
            for total in 0..30 {
                let mut s = Series::new();
                for v in 0..total {
                    push(&mut s, v, max_len);
                    assert!(s.len() <= max_len);
                }
                let expected: Vec<i32> = (0..total)
                    .skip((total as usize).saturating_sub(max_len))
                    .collect();
                assert_eq!(s.iter().copied().collect::<Vec<_>>(), expected);
            }
        }
    }

    #[test]
    fn push_over_long_series_trims_to_bound() {
        let mut s = series(&[1, 2, 3, 4, 5]);
        push(&mut s, 6, 3);
        assert_eq!(s, series(&[4, 5, 6]));
    }

    #[test]
    fn push_zero_bound_keeps_nothing() {
        let mut s = series(&[1, 2]);
        push(&mut s, 3, 0);
        assert!(s.is_empty());
    }

    // -- hour_median ---------------------------------------------------------

    #[test]
    fn median_single_sample() {
        assert_eq!(hour_median(&series(&[42])), 42);
    }

    #[test]
    fn median_is_lower_median_for_even_count() {
        // sorted [1, 2, 3, 4] -> index 2
        assert_eq!(hour_median(&series(&[4, 1, 3, 2])), 3);
    }

    #[test]
    fn median_only_considers_last_sixty() {
        let mut s = Series::new();
        for _ in 0..100 {
            s.push_back(10_000);
        }
        for v in 0..60 {
            s.push_back(v);
        }
        assert_eq!(hour_median(&s), 30);
    }

    #[test]
    fn median_is_permutation_invariant() {
        let base = [7, 3, 9, 1, 5, 5, 12, -4, 8];
        let expected = hour_median(&series(&base));
        let mut rotated = base;
        for _ in 0..base.len() {
            rotated.rotate_left(1);
            assert_eq!(hour_median(&series(&rotated)), expected);
        }
        let mut reversed = base;
        reversed.reverse();
        assert_eq!(hour_median(&series(&reversed)), expected);
        assert!(base.contains(&expected));
    }

    #[test]
    fn median_does_not_reorder_input() {
        let s = series(&[3, 1, 2]);
        hour_median(&s);
        assert_eq!(s, series(&[3, 1, 2]));
    }

    #[test]
    #[should_panic(expected = "empty series")]
    fn median_of_empty_series_panics() {
        hour_median(&Series::new());
    }

    #[test]
    fn median_if_any_empty_is_none() {
        assert_eq!(median_if_any(&Series::new()), None);
        assert_eq!(median_if_any(&series(&[5, 1, 9])), Some(5));
    }

    // -- History ------------------------------------------------------------

    #[test]
    fn record_pushes_every_series() {
        let mut h = History::default();
        let sample = Sample {
            weight: [1300, 1500],
            water: Some([5000, 0]),
            temperature: 2150,
            humidity: 4500,
        };
        h.record(7, &sample, HOURLY_CAPACITY);

        assert_eq!(h.time, 7);
        assert_eq!(h.plants[0].weight, series(&[1300]));
        assert_eq!(h.plants[0].water, series(&[5000]));
        assert_eq!(h.plants[1].weight, series(&[1500]));
        assert_eq!(h.plants[1].water, series(&[0]));
        assert_eq!(h.temperature, series(&[2150]));
        assert_eq!(h.humidity, series(&[4500]));
    }

    #[test]
    fn record_without_water_leaves_water_series_alone() {
        let mut h = History::default();
        h.record(1, &Sample::default(), MINUTE_CAPACITY);
        assert_eq!(h.plants[0].weight.len(), 1);
        assert!(h.plants[0].water.is_empty());
    }

    #[test]
    fn truncate_keeps_newest() {
        let mut h = History::default();
        h.temperature = series(&[1, 2, 3, 4]);
        h.plants[1].weight = series(&[5, 6, 7]);
        h.truncate(2);
        assert_eq!(h.temperature, series(&[3, 4]));
        assert_eq!(h.plants[1].weight, series(&[6, 7]));
    }
}
