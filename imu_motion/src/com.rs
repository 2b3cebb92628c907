//! Whole-body center of mass from a five-segment lower-body chain, using
//! De Leva (1996) anthropometric fractions.
//!
//! World axes: X medial-lateral, Y vertical, Z anterior-posterior.

use ndarray::{s, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::metrics::ActiveWindow;
use crate::rotation::{add3, mat3_from_quat, rotate_vec, scale3, Quat, Vec3, BONE_AXIS};

// Fractions of body height.
pub const THIGH_LENGTH: f64 = 0.245;
pub const SHANK_LENGTH: f64 = 0.246;
pub const PELVIS_WIDTH: f64 = 0.146;

// Segment CoM location from the proximal joint, fraction of segment length.
pub const THIGH_COM: f64 = 0.409;
pub const SHANK_COM: f64 = 0.445;

// Fractions of body mass.
pub const THIGH_MASS: f64 = 0.1;
pub const SHANK_MASS: f64 = 0.0465;
pub const PELVIS_MASS: f64 = 0.142;

const AXIS_ML: usize = 0;
const AXIS_VERTICAL: usize = 1;
const AXIS_AP: usize = 2;
const M_TO_CM: f64 = 100.0;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CenterOfMassResult {
    pub vertical_amplitude_cm: f64,
    pub medial_lateral_amplitude_cm: f64,
    pub anterior_posterior_amplitude_cm: f64,
    /// RMS of the 3D CoM distance from the pelvis origin.
    pub rms_displacement_cm: f64,
}

/// Orientation streams of one leg. A shank without its thigh cannot be placed.
#[derive(Clone, Copy, Debug)]
pub struct Leg<'a> {
    pub thigh: &'a [Quat],
    pub shank: Option<&'a [Quat]>,
}

/// The orientation streams feeding [`build_segment_model`].
#[derive(Clone, Copy, Debug)]
pub struct SegmentStreams<'a> {
    pub pelvis: &'a [Quat],
    pub right: Option<Leg<'a>>,
    pub left: Option<Leg<'a>>,
}

impl SegmentStreams<'_> {
    /// Frames available in every present segment.
    pub fn frame_count(&self) -> usize {
        let mut n = self.pelvis.len();
        for leg in [self.right, self.left].into_iter().flatten() {
            n = n.min(leg.thigh.len());
            if let Some(shank) = leg.shank {
                n = n.min(shank.len());
            }
        }
        n
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BodyDimensions {
    pub height_m: f64,
    pub mass_kg: f64,
}

/// One rigid segment in one frame. `position` is the proximal joint in
/// meters, relative to the pelvis origin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Segment {
    pub position: Vec3,
    pub orientation: Quat,
    pub mass: f64,
    /// `None` for the pelvis, which is a point mass.
    pub length: Option<f64>,
    /// Segment CoM as a fraction of `length` from the proximal joint.
    pub com_fraction: f64,
}

impl Segment {
    fn limb(position: Vec3, orientation: Quat, mass: f64, length: f64, com_fraction: f64) -> Self {
        Self {
            position,
            orientation,
            mass,
            length: Some(length),
            com_fraction,
        }
    }

    /// Distal joint: the proximal joint moved along the rotated bone axis.
    pub fn distal(&self) -> Vec3 {
        match self.length {
            Some(len) => add3(self.position, scale3(rotate_vec(&self.orientation, BONE_AXIS), len)),
            None => self.position,
        }
    }

    pub fn center_of_mass(&self) -> Vec3 {
        let distal = self.distal();
        add3(
            self.position,
            scale3(add3(distal, scale3(self.position, -1.0)), self.com_fraction),
        )
    }
}

/// The lower-body skeleton at one aligned frame. Limb segments whose sensor is
/// missing are `None`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentFrame {
    pub pelvis: Segment,
    pub right_thigh: Option<Segment>,
    pub right_shank: Option<Segment>,
    pub left_thigh: Option<Segment>,
    pub left_shank: Option<Segment>,
}

impl SegmentFrame {
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        std::iter::once(&self.pelvis)
            .chain(self.right_thigh.iter())
            .chain(self.right_shank.iter())
            .chain(self.left_thigh.iter())
            .chain(self.left_shank.iter())
    }

    pub fn total_mass(&self) -> f64 {
        self.segments().map(|s| s.mass).sum()
    }

    /// Mass-weighted mean of the segment centers.
    pub fn center_of_mass(&self) -> Vec3 {
        let mass = self.total_mass();
        if mass <= 0.0 {
            return [0.0; 3];
        }
        let weighted = self
            .segments()
            .fold([0.0; 3], |acc, s| add3(acc, scale3(s.center_of_mass(), s.mass)));
        scale3(weighted, 1.0 / mass)
    }
}

fn place_leg(
    leg: Option<&Leg<'_>>,
    hip: Vec3,
    i: usize,
    body: &BodyDimensions,
) -> (Option<Segment>, Option<Segment>) {
    let Some(leg) = leg else {
        return (None, None);
    };
    let thigh = Segment::limb(
        hip,
        leg.thigh[i],
        body.mass_kg * THIGH_MASS,
        body.height_m * THIGH_LENGTH,
        THIGH_COM,
    );
    let shank = leg.shank.map(|shank| {
        Segment::limb(
            thigh.distal(),
            shank[i],
            body.mass_kg * SHANK_MASS,
            body.height_m * SHANK_LENGTH,
            SHANK_COM,
        )
    });
    (Some(thigh), shank)
}

/// Place every present segment for each of the `frame_count` aligned frames.
/// The pelvis sits at the origin; the hips are half a pelvis width either side
/// along the pelvis lateral axis.
pub fn build_segment_model(streams: &SegmentStreams<'_>, body: &BodyDimensions) -> Vec<SegmentFrame> {
    let half_width = body.height_m * PELVIS_WIDTH / 2.0;
    (0..streams.frame_count())
        .map(|i| {
            let pelvis_q = streams.pelvis[i];
            let m = mat3_from_quat(&pelvis_q);
            let lateral = [m[0][0], m[1][0], m[2][0]];

            let (right_thigh, right_shank) =
                place_leg(streams.right.as_ref(), scale3(lateral, half_width), i, body);
            let (left_thigh, left_shank) =
                place_leg(streams.left.as_ref(), scale3(lateral, -half_width), i, body);

            SegmentFrame {
                pelvis: Segment {
                    position: [0.0; 3],
                    orientation: pelvis_q,
                    mass: body.mass_kg * PELVIS_MASS,
                    length: None,
                    com_fraction: 0.0,
                },
                right_thigh,
                right_shank,
                left_thigh,
                left_shank,
            }
        })
        .collect()
}

/// Whole-body CoM per frame, meters, as an `n x 3` array.
pub fn com_trajectory(frames: &[SegmentFrame]) -> Array2<f64> {
    let mut out = Array2::zeros((frames.len(), 3));
    for (mut row, frame) in out.rows_mut().into_iter().zip(frames) {
        for (cell, value) in row.iter_mut().zip(frame.center_of_mass()) {
            *cell = value;
        }
    }
    out
}

fn amplitude(axis: ArrayView1<'_, f64>) -> f64 {
    let (lo, hi) = axis
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if lo.is_finite() {
        hi - lo
    } else {
        0.0
    }
}

/// Summarise a trajectory over `window` (inclusive bounds), or over every
/// frame when no window is given. Values are converted to centimeters.
pub fn analyze_com(trajectory: &Array2<f64>, window: Option<ActiveWindow>) -> CenterOfMassResult {
    let n = trajectory.nrows();
    let (start, end) = match window {
        Some(w) => (w.start, (w.end + 1).min(n)),
        None => (0, n),
    };
    if start >= end {
        return CenterOfMassResult::default();
    }
    let frames = trajectory.slice(s![start..end, ..]);

    let mean_sq = frames
        .rows()
        .into_iter()
        .map(|r| r.dot(&r))
        .sum::<f64>()
        / frames.nrows() as f64;

    CenterOfMassResult {
        vertical_amplitude_cm: amplitude(frames.column(AXIS_VERTICAL)) * M_TO_CM,
        medial_lateral_amplitude_cm: amplitude(frames.column(AXIS_ML)) * M_TO_CM,
        anterior_posterior_amplitude_cm: amplitude(frames.column(AXIS_AP)) * M_TO_CM,
        rms_displacement_cm: mean_sq.sqrt() * M_TO_CM,
    }
}
