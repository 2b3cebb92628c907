//! Session-level orchestration: joint metrics per limb, center of mass,
//! asymmetry, and the diagnostics that explain how each number was derived.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::com::{
    analyze_com, build_segment_model, com_trajectory, BodyDimensions, CenterOfMassResult, Leg,
    SegmentStreams,
};
use crate::ingest::{
    load_session_from_base64, load_session_from_zip, validate_required_sensors, BodySegment,
    DeviceTag, IngestNote, SensorStream, Session,
};
use crate::kinematics::{
    hip_abduction_series, hip_flexion_series, hip_rotation_series, knee_angle_series,
    HipFlexionSelection,
};
use crate::metrics::{
    baseline_relative_flex_ext, baseline_subtract, calculate_asymmetry, count_peaks,
    detect_active_window, gradient, range_of_motion, velocity_stats, ActiveWindow, Asymmetry,
    RomReps, VelocityStats,
};
use crate::{MotionError, Options};

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct JointPair<T> {
    pub left: T,
    pub right: T,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn thigh(self) -> DeviceTag {
        match self {
            Side::Left => DeviceTag::LeftThigh,
            Side::Right => DeviceTag::RightThigh,
        }
    }

    fn shank(self) -> DeviceTag {
        match self {
            Side::Left => DeviceTag::LeftShank,
            Side::Right => DeviceTag::RightShank,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

/// Whether a limb's numbers were measured or are zero-filled placeholders.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetricSource {
    Measured,
    Missing { segments: Vec<BodySegment> },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LimbMetrics {
    pub source: MetricSource,
    pub rom: f64,
    pub max_flexion: f64,
    pub max_extension: f64,
    pub max_abduction: Option<f64>,
    pub max_rotation: Option<f64>,
    pub avg_velocity: f64,
    pub peak_velocity: f64,
    pub p95_velocity: f64,
    pub repetitions: Option<u32>,
}

impl LimbMetrics {
    pub fn missing(segments: Vec<BodySegment>) -> Self {
        Self {
            source: MetricSource::Missing { segments },
            rom: 0.0,
            max_flexion: 0.0,
            max_extension: 0.0,
            max_abduction: None,
            max_rotation: None,
            avg_velocity: 0.0,
            peak_velocity: 0.0,
            p95_velocity: 0.0,
            repetitions: None,
        }
    }

    fn measured(rom: f64, flex_ext: (f64, f64), velocity: VelocityStats, reps: u32) -> Self {
        Self {
            source: MetricSource::Measured,
            rom,
            max_flexion: flex_ext.0,
            max_extension: flex_ext.1,
            max_abduction: None,
            max_rotation: None,
            avg_velocity: velocity.average,
            peak_velocity: velocity.peak,
            p95_velocity: velocity.p95,
            repetitions: Some(reps),
        }
    }

    pub fn is_measured(&self) -> bool {
        self.source == MetricSource::Measured
    }

    fn rom_reps(&self) -> RomReps {
        RomReps {
            rom: self.rom,
            repetitions: self.repetitions.unwrap_or(0),
        }
    }
}

impl Default for LimbMetrics {
    fn default() -> Self {
        Self::missing(Vec::new())
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AsymmetrySummary {
    pub knee: Asymmetry,
    pub hip: Asymmetry,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisDiagnostics {
    pub hip_flexion: JointPair<Option<HipFlexionSelection>>,
    pub knee_windows: JointPair<Option<ActiveWindow>>,
    pub com_window: Option<ActiveWindow>,
    pub knee_frames: JointPair<usize>,
    pub hip_frames: JointPair<usize>,
    pub com_frames: usize,
    pub notes: Vec<IngestNote>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub knee: JointPair<LimbMetrics>,
    pub hip: JointPair<LimbMetrics>,
    pub center_of_mass: CenterOfMassResult,
    pub asymmetry: AsymmetrySummary,
    pub missing_sensors: Vec<BodySegment>,
    pub diagnostics: AnalysisDiagnostics,
}

struct KneeOutcome {
    metrics: LimbMetrics,
    window: Option<ActiveWindow>,
    velocity: Vec<f64>,
    frames: usize,
}

fn missing_segments(session: &Session, tags: &[DeviceTag]) -> Vec<BodySegment> {
    tags.iter()
        .filter(|&&tag| session.stream_with_data(tag).is_none())
        .map(|tag| tag.segment())
        .collect()
}

fn knee_metrics(thigh: &SensorStream, shank: &SensorStream, options: &Options) -> KneeOutcome {
    let angles = knee_angle_series(&thigh.quat, &shank.quat);
    let n = angles.len();
    let t = &thigh.t[..n];

    let relative = baseline_subtract(&angles, t, options.baseline_s);
    let velocity = gradient(&relative, t);
    let window = detect_active_window(&velocity, &velocity, t, &options.active_window_options());
    debug!(
        "Knee {:?}/{:?}: {} frames, active window {:?}",
        thigh.tag, shank.tag, n, window
    );

    let (angles_w, t_w, vel_w) = match window {
        Some(w) => (w.slice(&relative), w.slice(t), w.slice(&velocity)),
        None => (&relative[..], t, &velocity[..]),
    };
    let metrics = LimbMetrics::measured(
        range_of_motion(angles_w),
        baseline_relative_flex_ext(angles_w),
        velocity_stats(vel_w),
        count_peaks(angles_w, t_w, &options.peak_options()),
    );

    KneeOutcome {
        metrics,
        window,
        velocity,
        frames: n,
    }
}

fn max_abs(values: &[f64]) -> f64 {
    values.iter().fold(0.0, |m, v| m.max(v.abs()))
}

fn hip_metrics(
    pelvis: &SensorStream,
    thigh: &SensorStream,
    options: &Options,
) -> Option<(LimbMetrics, HipFlexionSelection, usize)> {
    let flexion = hip_flexion_series(&pelvis.quat, &thigh.quat)?;
    let n = flexion.series.len();
    let t = &thigh.t[..n];

    let rom = flexion.rom();
    let velocity = gradient(&flexion.series, t);
    let mut metrics = LimbMetrics::measured(
        rom,
        (rom, 0.0),
        velocity_stats(&velocity),
        count_peaks(&flexion.series, t, &options.peak_options()),
    );
    metrics.max_abduction = Some(max_abs(&hip_abduction_series(&pelvis.quat, &thigh.quat)));
    metrics.max_rotation = Some(max_abs(&hip_rotation_series(&pelvis.quat, &thigh.quat)));

    Some((metrics, flexion.selection, n))
}

/// Run the full pipeline over an ingested session. Missing sensors never fail
/// the analysis; the affected limbs are zero-filled and listed in
/// `missing_sensors`.
pub fn analyze_session(session: &Session, options: &Options) -> Result<AnalysisResult, MotionError> {
    options.validate()?;
    if options.artificial_delay_ms > 0 {
        thread::sleep(Duration::from_millis(options.artificial_delay_ms));
    }

    let validation = validate_required_sensors(session);
    let mut result = AnalysisResult {
        missing_sensors: validation.missing.clone(),
        ..AnalysisResult::default()
    };
    result.diagnostics.notes = session.notes.clone();

    let pelvis = session.stream_with_data(DeviceTag::Pelvis);
    let mut knee_velocity: JointPair<Option<Vec<f64>>> = JointPair::default();

    for side in [Side::Right, Side::Left] {
        let thigh = session.stream_with_data(side.thigh());
        let shank = session.stream_with_data(side.shank());

        let knee = match (thigh, shank) {
            (Some(thigh), Some(shank)) => Some(knee_metrics(thigh, shank, options)),
            _ => None,
        };
        let hip = match (pelvis, thigh) {
            (Some(pelvis), Some(thigh)) => hip_metrics(pelvis, thigh, options),
            _ => None,
        };

        let (knee_slot, hip_slot) = match side {
            Side::Left => (&mut result.knee.left, &mut result.hip.left),
            Side::Right => (&mut result.knee.right, &mut result.hip.right),
        };
        *knee_slot = match &knee {
            Some(outcome) => outcome.metrics.clone(),
            None => LimbMetrics::missing(missing_segments(session, &[side.thigh(), side.shank()])),
        };
        let hip_selection = match hip {
            Some((metrics, selection, frames)) => {
                *hip_slot = metrics;
                Some((selection, frames))
            }
            None => {
                *hip_slot =
                    LimbMetrics::missing(missing_segments(session, &[DeviceTag::Pelvis, side.thigh()]));
                None
            }
        };

        let diag = &mut result.diagnostics;
        let (window_slot, knee_frames, selection_slot, hip_frames, velocity_slot) = match side {
            Side::Left => (
                &mut diag.knee_windows.left,
                &mut diag.knee_frames.left,
                &mut diag.hip_flexion.left,
                &mut diag.hip_frames.left,
                &mut knee_velocity.left,
            ),
            Side::Right => (
                &mut diag.knee_windows.right,
                &mut diag.knee_frames.right,
                &mut diag.hip_flexion.right,
                &mut diag.hip_frames.right,
                &mut knee_velocity.right,
            ),
        };
        if let Some(outcome) = knee {
            *window_slot = outcome.window;
            *knee_frames = outcome.frames;
            *velocity_slot = Some(outcome.velocity);
        }
        if let Some((selection, frames)) = hip_selection {
            debug!(
                "Hip {}: column {} via {:?}",
                side.label(),
                selection.column,
                selection.reason
            );
            *selection_slot = Some(selection);
            *hip_frames = frames;
        }
    }

    if let Some(pelvis) = pelvis {
        let leg = |side: Side| {
            session.stream_with_data(side.thigh()).map(|thigh| Leg {
                thigh: &thigh.quat,
                shank: session.stream_with_data(side.shank()).map(|s| s.quat.as_slice()),
            })
        };
        let streams = SegmentStreams {
            pelvis: &pelvis.quat,
            right: leg(Side::Right),
            left: leg(Side::Left),
        };
        let body = BodyDimensions {
            height_m: options.body_height_m,
            mass_kg: options.body_mass_kg,
        };
        let segment_frames = build_segment_model(&streams, &body);
        let trajectory = com_trajectory(&segment_frames);
        let frames = trajectory.nrows();

        let window = match (&knee_velocity.right, &knee_velocity.left) {
            (Some(right), Some(left)) => {
                let t = &pelvis.t[..frames.min(pelvis.t.len())];
                detect_active_window(right, left, t, &options.active_window_options())
                    .filter(|w| w.end < frames)
            }
            _ => None,
        };
        debug!("Center of mass over {} frames, window {:?}", frames, window);
        result.center_of_mass = analyze_com(&trajectory, window);
        result.diagnostics.com_window = window;
        result.diagnostics.com_frames = frames;
    }

    result.asymmetry = AsymmetrySummary {
        knee: calculate_asymmetry(result.knee.left.rom_reps(), result.knee.right.rom_reps()),
        hip: calculate_asymmetry(result.hip.left.rom_reps(), result.hip.right.rom_reps()),
    };

    info!(
        "Analysis: knee ROM R={:.1} L={:.1}, hip ROM R={:.1} L={:.1}, knee dominant side {:?}, missing {:?}",
        result.knee.right.rom,
        result.knee.left.rom,
        result.hip.right.rom,
        result.hip.left.rom,
        result.asymmetry.knee.dominant_side,
        result.missing_sensors
    );
    Ok(result)
}

/// Decode a ZIP archive and analyse it. Fails only when the archive itself
/// cannot be opened or the options are invalid.
pub fn analyze_archive(bytes: &[u8], options: &Options) -> Result<AnalysisResult, MotionError> {
    options.validate()?;
    let session = load_session_from_zip(bytes)?;
    analyze_session(&session, options)
}

pub fn analyze_base64(encoded: &str, options: &Options) -> Result<AnalysisResult, MotionError> {
    options.validate()?;
    let session = load_session_from_base64(encoded)?;
    analyze_session(&session, options)
}

/// Per-frame baseline-relative joint angles on a shared time axis. Columns
/// for joints whose sensors are missing are `None`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct JointAngleTable {
    pub t: Vec<f64>,
    pub knee: JointPair<Option<Vec<f64>>>,
    pub hip: JointPair<Option<Vec<f64>>>,
}

impl JointAngleTable {
    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    /// Present columns in a fixed order, named for export.
    pub fn columns(&self) -> Vec<(&'static str, &[f64])> {
        [
            ("knee_right_deg", &self.knee.right),
            ("knee_left_deg", &self.knee.left),
            ("hip_right_deg", &self.hip.right),
            ("hip_left_deg", &self.hip.left),
        ]
        .into_iter()
        .filter_map(|(name, col)| col.as_deref().map(|c| (name, c)))
        .collect()
    }
}

pub fn joint_angle_table(session: &Session, options: &Options) -> Result<JointAngleTable, MotionError> {
    options.validate()?;
    let pelvis = session.stream_with_data(DeviceTag::Pelvis);

    let mut table = JointAngleTable::default();
    let mut reference: Option<&SensorStream> = None;
    for side in [Side::Right, Side::Left] {
        let Some(thigh) = session.stream_with_data(side.thigh()) else {
            continue;
        };
        reference.get_or_insert(thigh);

        let knee = session.stream_with_data(side.shank()).map(|shank| {
            let angles = knee_angle_series(&thigh.quat, &shank.quat);
            baseline_subtract(&angles, &thigh.t[..angles.len()], options.baseline_s)
        });
        let hip = pelvis
            .and_then(|p| hip_flexion_series(&p.quat, &thigh.quat))
            .map(|h| h.series);

        match side {
            Side::Left => {
                table.knee.left = knee;
                table.hip.left = hip;
            }
            Side::Right => {
                table.knee.right = knee;
                table.hip.right = hip;
            }
        }
    }

    let Some(reference) = reference else {
        return Ok(table);
    };
    let n = table
        .columns()
        .iter()
        .map(|(_, c)| c.len())
        .min()
        .unwrap_or(0)
        .min(reference.t.len());
    table.t = reference.t[..n].to_vec();
    for col in [
        &mut table.knee.left,
        &mut table.knee.right,
        &mut table.hip.left,
        &mut table.hip.right,
    ]
    .into_iter()
    .flatten()
    {
        col.truncate(n);
    }
    Ok(table)
}
