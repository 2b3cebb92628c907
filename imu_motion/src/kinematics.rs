//! Joint-angle series from segment orientations.
//!
//! Every series is computed over `min(len(a), len(b))` aligned frames and is
//! empty when either input is empty.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rotation::{
    angle_between_deg, relative_rotation, rotate_vec, wrap180, Mat3, Quat, BONE_AXIS, WORLD_UP,
};

/// Samples averaged for the hip baselines (neutral stance at the start).
pub const HIP_BASELINE_SAMPLES: usize = 200;
/// Plausible hip-flexion ROM, degrees.
pub const PHYSIOLOGICAL_HIP_ROM: (f64, f64) = (40.0, 140.0);
/// A step larger than this is treated as a wrap artifact, not motion.
const UNWRAP_RESET_DEG: f64 = 90.0;

/// Knee flexion as the angle between the thigh and shank long axes.
pub fn knee_angle_series(thigh: &[Quat], shank: &[Quat]) -> Vec<f64> {
    thigh
        .iter()
        .zip(shank)
        .map(|(qt, qs)| angle_between_deg(rotate_vec(qt, BONE_AXIS), rotate_vec(qs, BONE_AXIS)))
        .collect()
}

/// Cumulative unwrap: each step is wrapped to (-180, 180] before accumulating.
pub fn unwrap_degrees(angles: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(angles.len());
    let mut prev_raw = match angles.first() {
        Some(&first) => {
            out.push(first);
            first
        }
        None => return out,
    };
    let mut acc = prev_raw;
    for &raw in &angles[1..] {
        acc += wrap180(raw - prev_raw);
        out.push(acc);
        prev_raw = raw;
    }
    out
}

/// ROM measured on the wrapped series, so a series straddling ±180 is not
/// reported as a near-full turn.
pub fn circular_rom(angles: &[f64]) -> f64 {
    if angles.is_empty() {
        return 0.0;
    }
    let (lo, hi) = angles
        .iter()
        .map(|&a| wrap180(a))
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), w| {
            (lo.min(w), hi.max(w))
        });
    let span = hi - lo;
    if span > 180.0 {
        360.0 - span
    } else {
        span
    }
}

fn relative_matrices(pelvis: &[Quat], thigh: &[Quat]) -> Vec<Mat3> {
    pelvis
        .iter()
        .zip(thigh)
        .map(|(qp, qt)| relative_rotation(qp, qt))
        .collect()
}

fn subtract_leading_mean(series: &mut [f64], samples: usize) {
    let b = samples.min(series.len());
    if b == 0 {
        return;
    }
    let base = series[..b].iter().sum::<f64>() / b as f64;
    for v in series.iter_mut() {
        *v -= base;
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    /// Largest ROM among candidates inside the physiological window.
    PhysiologicalRom,
    /// No candidate was plausible; picked the most sagittal one.
    SagittalityFallback,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ColumnCandidate {
    pub column: usize,
    pub rom: f64,
    pub sagittality: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HipFlexionSelection {
    pub column: usize,
    pub reason: SelectionReason,
    pub candidates: Vec<ColumnCandidate>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HipFlexion {
    /// Unwrapped, baseline-subtracted flexion of the chosen column.
    pub series: Vec<f64>,
    pub selection: HipFlexionSelection,
}

impl HipFlexion {
    pub fn rom(&self) -> f64 {
        self.selection
            .candidates
            .iter()
            .find(|c| c.column == self.selection.column)
            .map_or(0.0, |c| c.rom)
    }
}

/// Sagittal angle of one reference column, unwrapped with a reset on large
/// jumps and centred on the leading baseline.
fn flexion_for_column(rel: &[Mat3], column: usize) -> Vec<f64> {
    let mut theta: Vec<f64> = rel
        .iter()
        .map(|r| r[2][column].atan2(-r[1][column]).to_degrees())
        .collect();
    for i in 1..theta.len() {
        let d = wrap180(theta[i] - theta[i - 1]);
        theta[i] = if d.abs() > UNWRAP_RESET_DEG {
            wrap180(theta[i])
        } else {
            theta[i - 1] + d
        };
    }
    subtract_leading_mean(&mut theta, HIP_BASELINE_SAMPLES);
    theta
}

/// Variance of `R[2][column]` over the frames after the baseline, or over
/// the whole series when it is no longer than the baseline.
fn sagittality(rel: &[Mat3], column: usize) -> f64 {
    let frames = if rel.len() > HIP_BASELINE_SAMPLES {
        &rel[HIP_BASELINE_SAMPLES..]
    } else {
        rel
    };
    if frames.is_empty() {
        return 0.0;
    }
    let n = frames.len() as f64;
    let mean = frames.iter().map(|r| r[2][column]).sum::<f64>() / n;
    frames
        .iter()
        .map(|r| (r[2][column] - mean).powi(2))
        .sum::<f64>()
        / n
}

/// Hip flexion of `thigh` in the pelvis frame. The sagittal reference column of
/// the relative rotation is not known a priori (sensor mounting varies), so all
/// three are scored and one is picked: the largest ROM inside
/// [`PHYSIOLOGICAL_HIP_ROM`], otherwise the largest sagittality, with equal
/// sagittality broken by the larger ROM. Remaining ties go to the lowest
/// column index.
pub fn hip_flexion_series(pelvis: &[Quat], thigh: &[Quat]) -> Option<HipFlexion> {
    let rel = relative_matrices(pelvis, thigh);
    if rel.is_empty() {
        return None;
    }

    let mut series: Vec<Vec<f64>> = (0..3).map(|k| flexion_for_column(&rel, k)).collect();
    let candidates: Vec<ColumnCandidate> = series
        .iter()
        .enumerate()
        .map(|(column, s)| ColumnCandidate {
            column,
            rom: circular_rom(s),
            sagittality: sagittality(&rel, column),
        })
        .collect();

    let (lo, hi) = PHYSIOLOGICAL_HIP_ROM;
    // `max_by_key` keeps the last maximum, so scan from the highest column down.
    let plausible = candidates
        .iter()
        .rev()
        .filter(|c| c.rom >= lo && c.rom <= hi)
        .max_by_key(|c| OrderedFloat(c.rom));
    let (chosen, reason) = match plausible {
        Some(c) => (c.column, SelectionReason::PhysiologicalRom),
        None => {
            let c = candidates
                .iter()
                .rev()
                .max_by_key(|c| (OrderedFloat(c.sagittality), OrderedFloat(c.rom)))
                .map_or(0, |c| c.column);
            (c, SelectionReason::SagittalityFallback)
        }
    };

    for c in &candidates {
        debug!(
            "Hip flexion column {}: rom={:.1} deg sagittality={:.5}",
            c.column, c.rom, c.sagittality
        );
    }
    debug!("Hip flexion uses column {} ({:?})", chosen, reason);

    Some(HipFlexion {
        series: series.swap_remove(chosen),
        selection: HipFlexionSelection {
            column: chosen,
            reason,
            candidates,
        },
    })
}

/// Frontal-plane hip angle in the pelvis frame, centred on the leading baseline.
pub fn hip_abduction_series(pelvis: &[Quat], thigh: &[Quat]) -> Vec<f64> {
    let mut out: Vec<f64> = relative_matrices(pelvis, thigh)
        .iter()
        .map(|r| {
            r[0][1]
                .atan2((r[1][1] * r[1][1] + r[2][1] * r[2][1]).sqrt())
                .to_degrees()
        })
        .collect();
    subtract_leading_mean(&mut out, HIP_BASELINE_SAMPLES);
    out
}

/// Transverse-plane hip angle in the pelvis frame, centred on the leading baseline.
pub fn hip_rotation_series(pelvis: &[Quat], thigh: &[Quat]) -> Vec<f64> {
    let mut out: Vec<f64> = relative_matrices(pelvis, thigh)
        .iter()
        .map(|r| r[2][0].atan2(r[0][0]).to_degrees())
        .collect();
    subtract_leading_mean(&mut out, HIP_BASELINE_SAMPLES);
    out
}

/// Hip flexion without a pelvis sensor: `180 - angle(thigh axis, world up)`.
/// Zero when the thigh hangs straight down.
pub fn hip_flexion_world_frame(thigh: &[Quat]) -> Vec<f64> {
    thigh
        .iter()
        .map(|q| 180.0 - angle_between_deg(rotate_vec(q, BONE_AXIS), WORLD_UP))
        .collect()
}
