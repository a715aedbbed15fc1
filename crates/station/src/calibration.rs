//! Adaptive watering model.
//!
//! Fits `duration = scale * weight_gain + offset` by least squares over past
//! waterings and estimates how much weight a plant loses per day while dry.
//! Degenerate input never produces garbage: the previous model is kept.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::history::Series;

/// Linear model mapping a desired weight gain to a watering duration (ms).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calibration {
    pub scale: i32,
    pub offset: i32,
}

impl Calibration {
    pub fn predict(&self, delta: i32) -> i64 {
        i64::from(self.scale) * i64::from(delta) + i64::from(self.offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Fit {
    /// Weight lost per 24 h without watering, outliers trimmed.
    pub dryout: i32,
    #[serde(flatten)]
    pub calibration: Calibration,
    /// Number of real waterings the fit saw.
    pub observations: usize,
    /// True when the regression could not be solved and the previous model
    /// was carried over.
    pub degenerate: bool,
}

/// Running least-squares sums.
#[derive(Debug, Default)]
struct Sums {
    n: f64,
    gain: f64,
    gain_sq: f64,
    time: f64,
    gain_time: f64,
}

impl Sums {
    fn add(&mut self, gain: f64, time: f64) {
        self.n += 1.0;
        self.gain += gain;
        self.gain_sq += gain * gain;
        self.time += time;
        self.gain_time += gain * time;
    }

    /// `(scale, offset)` of the least-squares line, if it is well defined.
    fn solve(&self) -> Option<(f64, f64)> {
        if self.n == 0.0 || self.gain_sq * self.n - self.gain * self.gain <= 0.0 {
            return None;
        }
        let scale = (self.gain_time - self.time * self.gain / self.n)
            / (self.gain_sq - self.gain * self.gain / self.n);
        let offset = self.time / self.n - scale * self.gain / self.n;
        (scale.is_finite() && offset.is_finite()).then_some((scale, offset))
    }
}

/// Derive the dryout rate and a fresh watering model from hourly history.
///
/// `weight` and `water` are the plant's hourly series; a watering recorded in
/// slot `k` happened right after the weight sample of slot `k`, so its effect
/// shows up in slot `k + 1`. Only the aligned, most recent tail where both
/// series have samples is used.
pub fn fit(weight: &Series, water: &Series, previous: Calibration) -> Fit {
    let n = weight.len().min(water.len());
    let slots: Vec<(i32, i32)> = weight
        .iter()
        .skip(weight.len() - n)
        .zip(water.iter().skip(water.len() - n))
        .map(|(&m, &w)| (m, w))
        .collect();

    let mut sums = Sums::default();
    let mut dryout_samples = Vec::new();

    for pair in slots.windows(2) {
        let (prev_weight, prev_water) = pair[0];
        let (weight, _) = pair[1];
        // A zero weight is a placeholder for a failed read.
        if prev_weight <= 0 {
            continue;
        }
        if prev_water > 0 {
            sums.add(f64::from(weight - prev_weight), f64::from(prev_water));
        } else {
            dryout_samples.push(prev_weight - weight);
        }
    }

    let observations = sums.n as usize;

    // Two points 12.5% around the mean gain, predicted by the previous model,
    // keep sparse data from swinging the fit away from the last good model.
    if previous.scale > 0 && observations > 0 {
        let mean_gain = sums.gain / sums.n;
        for gain in [mean_gain - mean_gain / 8.0, mean_gain + mean_gain / 8.0] {
            let time = gain * f64::from(previous.scale) + f64::from(previous.offset);
            sums.add(gain, time);
        }
    }

    let dryout = dryout_rate(dryout_samples);

    let (mut scale, mut offset, degenerate) = match sums.solve() {
        Some((scale, offset)) => (round(scale), round(offset), false),
        None => {
            warn!(
                n = sums.n,
                gain = sums.gain,
                gain_sq = sums.gain_sq,
                time = sums.time,
                gain_time = sums.gain_time,
                "cannot calculate watering times, keeping previous model"
            );
            (previous.scale, previous.offset, true)
        }
    };

    if offset < 0 {
        // Line through the origin and the centre of mass.
        debug!(scale, offset, "clamping offset");
        offset = 0;
        if sums.gain > 0.0 {
            scale = round(sums.time / sums.gain);
        }
    } else if scale < 0 {
        // More water should never mean less weight gain; recentre.
        debug!(scale, offset, "clamping scale");
        if sums.n > 0.0 {
            offset = round(0.5 * sums.time / sums.n);
        }
        if sums.gain != 0.0 {
            scale = round(0.5 * sums.time / sums.gain);
        }
    }

    Fit {
        dryout,
        calibration: Calibration { scale, offset },
        observations,
        degenerate,
    }
}

/// Mean weight loss per hour scaled to 24 h, dropping one low and one high
/// outlier per six samples.
fn dryout_rate(mut samples: Vec<i32>) -> i32 {
    if samples.is_empty() {
        debug!("no dryout measured");
        return 0;
    }
    samples.sort_unstable();

    let trim = samples.len() / 6;
    let kept = &samples[trim..samples.len() - trim];
    let count = kept.len() as i64;
    let sum: i64 = kept.iter().map(|&d| i64::from(d)).sum();

    ((sum * 24 + count / 2) / count) as i32
}

fn round(v: f64) -> i32 {
    v.round().clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Build aligned hourly series from `(weight, water)` slots.
    fn slots(values: &[(i32, i32)]) -> (Series, Series) {
        (
            values.iter().map(|&(m, _)| m).collect(),
            values.iter().map(|&(_, w)| w).collect(),
        )
    }

    /// Alternate dry hours and waterings so that each watering of `time`
    /// produces a gain of `gain`.
    fn history_from(observations: &[(i32, i32)]) -> (Series, Series) {
        let mut values = Vec::new();
        let mut weight = 1000;
        for &(gain, time) in observations {
            values.push((weight, time));
            weight += gain;
        }
        values.push((weight, 0));
        slots(&values)
    }

    // -- Regression ---------------------------------------------------------

    #[test]
    fn recovers_exact_linear_model() {
        // time = 20 * gain + 1000
        let obs: Vec<(i32, i32)> = [50, 80, 120, 200, 260]
            .iter()
            .map(|&g| (g, 20 * g + 1000))
            .collect();
        let (weight, water) = history_from(&obs);

        let fit = fit(&weight, &water, Calibration::default());
        assert_eq!(fit.calibration, Calibration { scale: 20, offset: 1000 });
        assert_eq!(fit.observations, 5);
        assert!(!fit.degenerate);
    }

    #[test]
    fn previous_model_consistent_with_data_is_kept() {
        let obs: Vec<(i32, i32)> = [40, 90, 150].iter().map(|&g| (g, 15 * g + 500)).collect();
        let (weight, water) = history_from(&obs);
        let previous = Calibration { scale: 15, offset: 500 };

        let fit = fit(&weight, &water, previous);
        assert_eq!(fit.calibration, previous);
        assert_eq!(fit.observations, 3);
    }

    #[test]
    fn synthetic_points_stabilise_single_observation() {
        // One watering alone cannot define a line; the previous model adds
        // the two anchor points that make it solvable.
        let (weight, water) = history_from(&[(100, 3000)]);
        let previous = Calibration { scale: 25, offset: 500 };

        let fit = fit(&weight, &water, previous);
        assert!(!fit.degenerate);
        assert_eq!(fit.observations, 1);
        assert!(fit.calibration.scale > 0);
    }

    #[test]
    fn no_observations_keeps_previous_model() {
        let (weight, water) = slots(&[(1500, 0), (1490, 0), (1480, 0)]);
        let previous = Calibration { scale: 30, offset: 700 };

        let fit = fit(&weight, &water, previous);
        assert_eq!(fit.calibration, previous);
        assert!(fit.degenerate);
        assert_eq!(fit.observations, 0);
    }

    #[test]
    fn empty_history_keeps_previous_model() {
        let previous = Calibration { scale: 12, offset: 340 };
        let fit = fit(&Series::new(), &Series::new(), previous);
        assert_eq!(fit.calibration, previous);
        assert_eq!(fit.dryout, 0);
    }

    #[test]
    fn zero_variance_keeps_previous_model() {
        // Identical gains: the regression has no slope to find.
        let (weight, water) = history_from(&[(100, 2000), (100, 3000)]);
        let fit = fit(&weight, &water, Calibration::default());
        assert!(fit.degenerate);
        assert_eq!(fit.calibration, Calibration::default());
    }

    #[test]
    fn negative_offset_is_clamped_through_centre_of_mass() {
        // time = 30 * gain - 1000 would give a negative offset.
        let (weight, water) = history_from(&[(100, 2000), (200, 5000)]);

        let fit = fit(&weight, &water, Calibration::default());
        assert_eq!(fit.calibration.offset, 0);
        // total time / total gain = 7000 / 300
        assert_eq!(fit.calibration.scale, (7000.0f64 / 300.0).round() as i32);
    }

    #[test]
    fn negative_offset_clamp_uses_total_ratio() {
        // Fitted line is time = 40 * gain - 2000; clamped to 10000 / 400.
        let (weight, water) = history_from(&[(100, 2000), (100, 2000), (0, 0), (200, 6000)]);
        let fit = fit(&weight, &water, Calibration::default());
        assert_eq!(fit.calibration, Calibration { scale: 25, offset: 0 });
        assert_eq!(fit.dryout, 0);
    }

    #[test]
    fn negative_scale_is_recentred() {
        // More water, less gain.
        let (weight, water) = history_from(&[(200, 2000), (100, 4000)]);

        let fit = fit(&weight, &water, Calibration::default());
        // offset = half mean time = 0.5 * 6000 / 2, scale = 0.5 * 6000 / 300
        assert_eq!(fit.calibration, Calibration { scale: 10, offset: 1500 });
    }

    #[test]
    fn leading_zero_weight_is_skipped() {
        let (weight, water) = slots(&[(0, 3000), (1200, 0), (1190, 0)]);
        let fit = fit(&weight, &water, Calibration::default());
        assert_eq!(fit.observations, 0);
        assert_eq!(fit.dryout, 240);
    }

    #[test]
    fn only_aligned_tail_is_used() {
        // Weight has two extra old samples that predate the water series.
        let weight: Series = [5000, 4000, 1500, 1490].into_iter().collect();
        let water: Series = [0, 0].into_iter().collect();
        let fit = fit(&weight, &water, Calibration::default());
        assert_eq!(fit.dryout, 240);
    }

    // -- Dryout -------------------------------------------------------------

    #[test]
    fn dryout_scales_hourly_loss_to_a_day() {
        let (weight, water) = slots(&[(1500, 0), (1495, 0), (1490, 0), (1485, 0)]);
        let fit = fit(&weight, &water, Calibration::default());
        assert_eq!(fit.dryout, 5 * 24);
    }

    #[test]
    fn dryout_trims_outliers() {
        // 12 samples -> trim 2 from each end.
        let mut samples = vec![4; 8];
        samples.extend([-100, -90, 300, 500]);
        assert_eq!(dryout_rate(samples), 4 * 24);
    }

    #[test]
    fn dryout_keeps_all_below_six_samples() {
        assert_eq!(dryout_rate(vec![1, 2, 3, 10, 20]), (36 * 24 + 2) / 5);
    }

    #[test]
    fn dryout_empty_is_zero() {
        assert_eq!(dryout_rate(Vec::new()), 0);
    }

    #[test]
    fn watering_slot_does_not_count_as_dryout() {
        let (weight, water) = slots(&[(1400, 2000), (1500, 0), (1490, 0)]);
        let fit = fit(&weight, &water, Calibration::default());
        assert_eq!(fit.observations, 1);
        assert_eq!(fit.dryout, 240);
    }

    // -- Prediction ---------------------------------------------------------

    #[test]
    fn predict_applies_linear_model() {
        let c = Calibration { scale: 20, offset: 1000 };
        assert_eq!(c.predict(200), 5000);
        assert_eq!(c.predict(-10), 800);
    }
}
