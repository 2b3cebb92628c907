//! Series-level statistics: baseline removal, differentiation, smoothing,
//! repetition counting, active-window detection and left/right asymmetry.
//!
//! Every reduction returns 0 (or an empty series) for empty input instead of
//! dividing by zero.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Fallback baseline length, in samples, when no timestamp reaches the
/// requested baseline duration.
const BASELINE_FALLBACK_SAMPLES: usize = 60;
const ASYMMETRY_ROM_THRESHOLD_DEG: f64 = 10.0;
const ASYMMETRY_REP_THRESHOLD: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeakOptions {
    pub min_distance_s: f64,
    pub threshold_abs_deg: f64,
    pub threshold_rom_fraction: f64,
    pub smoothing_window: usize,
}

impl Default for PeakOptions {
    fn default() -> Self {
        Self {
            min_distance_s: 0.6,
            threshold_abs_deg: 15.0,
            threshold_rom_fraction: 0.35,
            smoothing_window: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActiveWindowOptions {
    /// Moving-RMS window length in seconds.
    pub window_s: f64,
    pub threshold_deg_s: f64,
}

impl Default for ActiveWindowOptions {
    fn default() -> Self {
        Self {
            window_s: 0.5,
            threshold_deg_s: 5.0,
        }
    }
}

/// Inclusive sample-index bounds of the detected exercise period.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveWindow {
    pub start: usize,
    pub end: usize,
}

impl ActiveWindow {
    pub fn len(&self) -> usize {
        (self.end + 1).saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Slice `data` to this window, clamped to the data's length.
    pub fn slice<'a, T>(&self, data: &'a [T]) -> &'a [T] {
        if data.is_empty() || self.start >= data.len() {
            return &data[..0];
        }
        let end = (self.end + 1).min(data.len());
        &data[self.start..end]
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DominantSide {
    Left,
    Right,
    Balanced,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RomReps {
    pub rom: f64,
    pub repetitions: u32,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Asymmetry {
    pub rom_difference: f64,
    pub repetition_difference: u32,
    pub dominant_side: DominantSide,
}

impl Default for Asymmetry {
    fn default() -> Self {
        Self {
            rom_difference: 0.0,
            repetition_difference: 0,
            dominant_side: DominantSide::Balanced,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct VelocityStats {
    pub average: f64,
    pub peak: f64,
    pub p95: f64,
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Nearest-rank-below percentile: index `floor(p/100 * (n-1))` of the sorted values.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Subtract the mean of the first `baseline_s` seconds from the whole series.
pub fn baseline_subtract(angles: &[f64], t: &[f64], baseline_s: f64) -> Vec<f64> {
    if angles.is_empty() || t.is_empty() {
        return Vec::new();
    }
    let end = match t.iter().position(|&ti| ti >= baseline_s) {
        Some(idx) if idx > 0 => idx,
        _ => BASELINE_FALLBACK_SAMPLES.min(angles.len()).min(t.len()),
    };
    let offset = mean(&angles[..end.min(angles.len())]);
    angles.iter().map(|a| a - offset).collect()
}

/// Central-difference derivative in units per second. Endpoints copy their
/// interior neighbour. Mismatched lengths give an empty series.
pub fn gradient(values: &[f64], t: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n == 0 || n != t.len() {
        return Vec::new();
    }
    let mut out = vec![0.0; n];
    for i in 1..n.saturating_sub(1) {
        let dt = t[i + 1] - t[i - 1];
        out[i] = if dt != 0.0 {
            (values[i + 1] - values[i - 1]) / dt
        } else {
            0.0
        };
    }
    if n > 1 {
        out[0] = out[1];
        out[n - 1] = out[n - 2];
    }
    out
}

pub fn velocity_stats(velocities: &[f64]) -> VelocityStats {
    let abs: Vec<f64> = velocities.iter().map(|v| v.abs()).collect();
    VelocityStats {
        average: mean(&abs),
        peak: abs.iter().copied().fold(0.0, f64::max),
        p95: percentile(&abs, 95.0),
    }
}

pub fn average_velocity(angles: &[f64], t: &[f64]) -> f64 {
    velocity_stats(&gradient(angles, t)).average
}

pub fn peak_velocity(angles: &[f64], t: &[f64]) -> f64 {
    velocity_stats(&gradient(angles, t)).peak
}

pub fn p95_velocity(angles: &[f64], t: &[f64]) -> f64 {
    velocity_stats(&gradient(angles, t)).p95
}

/// Centered moving average; the window shrinks at the edges instead of padding.
pub fn moving_average(data: &[f64], window: usize) -> Array1<f64> {
    if window <= 1 {
        return Array1::from_vec(data.to_vec());
    }
    let radius = window / 2;
    let mut out = Vec::with_capacity(data.len());
    for i in 0..data.len() {
        let start = i.saturating_sub(radius);
        let end = (i + radius + 1).min(data.len());
        out.push(mean(&data[start..end]));
    }
    Array1::from_vec(out)
}

/// `max - min`, 0 for an empty series.
pub fn range_of_motion(angles: &[f64]) -> f64 {
    if angles.is_empty() {
        return 0.0;
    }
    let (lo, hi) = min_max(angles);
    hi - lo
}

/// Raw extrema: the series minimum is reported as maximum flexion and the
/// maximum as maximum extension. The orchestrator uses the baseline-relative
/// convention instead (see [`baseline_relative_flex_ext`]).
pub fn max_flex_ext(angles: &[f64]) -> (f64, f64) {
    if angles.is_empty() {
        return (0.0, 0.0);
    }
    min_max(angles)
}

/// Baseline-relative extrema: extension is the zero baseline and flexion is
/// the full ROM.
pub fn baseline_relative_flex_ext(angles: &[f64]) -> (f64, f64) {
    (range_of_motion(angles), 0.0)
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

/// Count repetitions as well-separated local maxima of the smoothed series.
pub fn count_peaks(angles: &[f64], t: &[f64], opts: &PeakOptions) -> u32 {
    let n = angles.len().min(t.len());
    if n < 3 {
        return 0;
    }
    let smoothed = moving_average(&angles[..n], opts.smoothing_window);
    let s = smoothed.as_slice().unwrap_or(&[]);
    let threshold = opts
        .threshold_abs_deg
        .max(opts.threshold_rom_fraction * range_of_motion(s));

    let mut count = 0;
    let mut last_peak_t = f64::NEG_INFINITY;
    for i in 1..n - 1 {
        let is_local_max = s[i] > s[i - 1] && s[i] > s[i + 1];
        if is_local_max && s[i] > threshold && t[i] - last_peak_t > opts.min_distance_s {
            count += 1;
            last_peak_t = t[i];
        }
    }
    count
}

/// Centered moving RMS over `[i - w/2, i + w/2)`.
pub fn moving_rms(values: &[f64], window: usize) -> Vec<f64> {
    let half = window / 2;
    (0..values.len())
        .map(|i| {
            let start = i.saturating_sub(half);
            let end = (i + half).min(values.len()).max(start + 1);
            let sum_sq: f64 = values[start..end].iter().map(|v| v * v).sum();
            (sum_sq / (end - start) as f64).sqrt()
        })
        .collect()
}

/// Window length in samples for a duration, from the mean sample interval.
pub fn samples_for_duration(t: &[f64], seconds: f64) -> usize {
    if t.len() < 2 {
        return 1;
    }
    let dt = (t[t.len() - 1] - t[0]) / (t.len() - 1) as f64;
    if dt <= 0.0 || !dt.is_finite() {
        return 1;
    }
    ((seconds / dt).round() as usize).max(1)
}

/// Locate the span where the combined activity of two velocity series stays
/// above threshold. Returns `None` when there is no data at all; when nothing
/// crosses the threshold the whole series is returned.
pub fn detect_active_window(
    vel_a: &[f64],
    vel_b: &[f64],
    t: &[f64],
    opts: &ActiveWindowOptions,
) -> Option<ActiveWindow> {
    let n = vel_a.len().min(vel_b.len()).min(t.len());
    if n == 0 {
        return None;
    }
    let window = samples_for_duration(&t[..n], opts.window_s);

    let activity: Vec<f64> = vel_a[..n]
        .iter()
        .zip(&vel_b[..n])
        .map(|(a, b)| ((a * a + b * b) / 2.0).sqrt())
        .collect();
    let rms = moving_rms(&activity, window);

    let mut start = rms
        .iter()
        .position(|&v| v > opts.threshold_deg_s)
        .unwrap_or(0);
    let mut end = rms
        .iter()
        .rposition(|&v| v > opts.threshold_deg_s)
        .unwrap_or(n - 1);

    if end < start || end - start < window {
        let center = (start + end) / 2;
        start = center.saturating_sub(window / 2);
        end = (center + window / 2).min(n - 1);
    }
    Some(ActiveWindow { start, end })
}

pub fn calculate_asymmetry(left: RomReps, right: RomReps) -> Asymmetry {
    let rom_difference = (left.rom - right.rom).abs();
    let repetition_difference = left.repetitions.abs_diff(right.repetitions);

    let dominant_side = if rom_difference >= ASYMMETRY_ROM_THRESHOLD_DEG {
        if left.rom > right.rom {
            DominantSide::Left
        } else {
            DominantSide::Right
        }
    } else if repetition_difference > ASYMMETRY_REP_THRESHOLD {
        if left.repetitions > right.repetitions {
            DominantSide::Left
        } else {
            DominantSide::Right
        }
    } else {
        DominantSide::Balanced
    };

    Asymmetry {
        rom_difference,
        repetition_difference,
        dominant_side,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn time_axis(n: usize, hz: f64) -> Vec<f64> {
        (0..n).map(|i| i as f64 / hz).collect()
    }

    #[test]
    fn test_velocity_uses_elapsed_seconds() {
        let angles = [0.0, 10.0, 20.0, 30.0, 40.0];
        let slow = [0.0, 0.1, 0.2, 0.3, 0.4];
        let fast = [0.0, 0.05, 0.1, 0.15, 0.2];
        assert!((average_velocity(&angles, &slow) - 100.0).abs() < 1e-9);
        assert!((average_velocity(&angles, &fast) - 200.0).abs() < 1e-9);
        assert!((peak_velocity(&angles, &fast) - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_gradient_edges_and_mismatch() {
        let v = gradient(&[0.0, 1.0, 4.0, 9.0], &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(v, vec![2.0, 2.0, 4.0, 4.0]);
        assert!(gradient(&[1.0, 2.0], &[0.0]).is_empty());
        assert!(gradient(&[], &[]).is_empty());
        assert_eq!(gradient(&[5.0, 6.0, 7.0], &[1.0, 1.0, 1.0]), vec![0.0; 3]);
    }

    #[test]
    fn test_baseline_subtract_by_time() {
        let t = [0.0, 0.5, 1.0, 1.5];
        let out = baseline_subtract(&[10.0, 20.0, 40.0, 50.0], &t, 1.0);
        assert_eq!(out, vec![-5.0, 5.0, 25.0, 35.0]);
    }

    #[test]
    fn test_baseline_subtract_fallback() {
        // No timestamp reaches the baseline duration.
        let t = [0.0, 0.1, 0.2];
        let out = baseline_subtract(&[1.0, 2.0, 3.0], &t, 5.0);
        assert_eq!(out, vec![-1.0, 0.0, 1.0]);
        assert!(baseline_subtract(&[], &[], 1.0).is_empty());
    }

    #[test]
    fn test_moving_average_truncates_edges() {
        let s = moving_average(&[0.0, 3.0, 6.0, 9.0], 3);
        assert_eq!(s.to_vec(), vec![1.5, 3.0, 6.0, 7.5]);
        assert_eq!(moving_average(&[1.0, 2.0], 1).to_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_percentile_index_rule() {
        let values: Vec<f64> = (1..=10).map(f64::from).collect();
        assert_eq!(percentile(&values, 95.0), 9.0);
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_rom_and_raw_extrema() {
        let series = [60.0, 80.0, 100.0, 120.0, 90.0];
        assert_eq!(range_of_motion(&series), 60.0);
        let (max_flexion, max_extension) = max_flex_ext(&series);
        assert_eq!(max_flexion, 60.0);
        assert_eq!(max_extension, 120.0);
        assert_eq!(range_of_motion(&[]), 0.0);
    }

    #[test]
    fn test_baseline_relative_extrema() {
        let series = [60.0, 80.0, 100.0, 120.0, 90.0];
        assert_eq!(baseline_relative_flex_ext(&series), (60.0, 0.0));
        assert_eq!(baseline_relative_flex_ext(&[]), (0.0, 0.0));
    }

    #[test]
    fn test_count_peaks_five_cycles() {
        let t = time_axis(300, 60.0);
        let angles: Vec<f64> = t.iter().map(|&s| 30.0 * (1.0 - (2.0 * PI * s).cos())).collect();
        assert_eq!(count_peaks(&angles, &t, &PeakOptions::default()), 5);
    }

    #[test]
    fn test_count_peaks_ignores_valleys() {
        let t = time_axis(300, 60.0);
        let angles: Vec<f64> = t.iter().map(|&s| -30.0 * (1.0 - (2.0 * PI * s).cos())).collect();
        assert_eq!(count_peaks(&angles, &t, &PeakOptions::default()), 0);
    }

    #[test]
    fn test_count_peaks_min_distance() {
        // 3 Hz oscillation: peaks every 0.33 s, only every other one is far enough apart.
        let t = time_axis(120, 60.0);
        let angles: Vec<f64> = t.iter().map(|&s| 25.0 * (1.0 - (6.0 * PI * s).cos())).collect();
        let opts = PeakOptions::default();
        let all = count_peaks(&angles, &t, &PeakOptions { min_distance_s: 0.0, ..opts });
        let spaced = count_peaks(&angles, &t, &opts);
        assert_eq!(all, 6);
        assert_eq!(spaced, 3);
    }

    #[test]
    fn test_active_window_bounds() {
        let t = time_axis(240, 60.0);
        let vel: Vec<f64> = (0..240)
            .map(|i| if (60..120).contains(&i) { 100.0 } else { 0.0 })
            .collect();
        let window = detect_active_window(&vel, &vel, &t, &ActiveWindowOptions::default()).unwrap();
        assert_eq!(window, ActiveWindow { start: 46, end: 134 });
        assert!(detect_active_window(&[], &vel, &t, &ActiveWindowOptions::default()).is_none());
    }

    #[test]
    fn test_active_window_expands_short_bursts() {
        let t = time_axis(200, 60.0);
        let vel: Vec<f64> = (0..200).map(|i| if i == 100 { 500.0 } else { 0.0 }).collect();
        let window = detect_active_window(&vel, &vel, &t, &ActiveWindowOptions::default()).unwrap();
        assert!(window.len() >= 30);
        assert!(window.start <= 100 && window.end >= 100);
    }

    #[test]
    fn test_asymmetry_rules() {
        let left = RomReps { rom: 100.0, repetitions: 5 };
        let a = calculate_asymmetry(left, RomReps { rom: 90.0, repetitions: 6 });
        assert_eq!(a.rom_difference, 10.0);
        assert_eq!(a.repetition_difference, 1);
        assert_eq!(a.dominant_side, DominantSide::Left);

        let b = calculate_asymmetry(left, RomReps { rom: 95.0, repetitions: 5 });
        assert_eq!(b.dominant_side, DominantSide::Balanced);

        let c = calculate_asymmetry(left, RomReps { rom: 98.0, repetitions: 8 });
        assert_eq!(c.dominant_side, DominantSide::Right);
    }
}
