//! Offline movement-analysis pipeline for multi-sensor IMU rehabilitation sessions.
//!
//! An archive of per-sensor Movella DOT text logs goes in; joint-angle series,
//! range-of-motion, angular velocity, repetition, asymmetry and center-of-mass
//! metrics come out. Every stage is a pure function of its inputs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod analysis;
pub mod com;
pub mod ingest;
pub mod kinematics;
pub mod metrics;
pub mod rotation;

pub use analysis::{
    analyze_archive, analyze_base64, analyze_session, joint_angle_table, AnalysisDiagnostics,
    AnalysisResult, AsymmetrySummary, JointAngleTable, JointPair, LimbMetrics, MetricSource,
};
pub use com::{build_segment_model, CenterOfMassResult, Segment, SegmentFrame};
pub use ingest::{
    load_session_from_base64, load_session_from_texts, load_session_from_zip,
    validate_required_sensors, BodySegment, DeviceTag, IngestIssue, IngestNote, SensorStream,
    SensorValidation, Session,
};
pub use metrics::{ActiveWindow, DominantSide};

#[derive(Error, Debug)]
pub enum MotionError {
    #[error("failed to open session archive: {0}")]
    Archive(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("invalid options: {0}")]
    Config(String),
}

/// Tunables for one analysis run. Any subset may be given as JSON; missing
/// fields fall back to the defaults below.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Options {
    /// Absolute amplitude a peak must exceed to count as a repetition (degrees).
    pub peak_threshold_deg: f64,
    /// Fraction of the series ROM used as an alternative, dynamic threshold.
    pub peak_rom_fraction: f64,
    pub min_peak_distance_s: f64,
    /// Length of the neutral-stance window used for baseline removal.
    pub baseline_s: f64,
    pub smoothing_window: usize,
    pub active_window_s: f64,
    pub activity_threshold_deg_s: f64,
    pub body_height_m: f64,
    pub body_mass_kg: f64,
    /// Test-only: sleep before analysing to mimic a slow remote service.
    pub artificial_delay_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            peak_threshold_deg: 15.0,
            peak_rom_fraction: 0.35,
            min_peak_distance_s: 0.6,
            baseline_s: 1.0,
            smoothing_window: 5,
            active_window_s: 0.5,
            activity_threshold_deg_s: 5.0,
            body_height_m: 1.75,
            body_mass_kg: 70.0,
            artificial_delay_ms: 0,
        }
    }
}

impl Options {
    pub fn from_json_str(text: &str) -> Result<Self, MotionError> {
        let options: Options =
            serde_json::from_str(text).map_err(|e| MotionError::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), MotionError> {
        let positive = [
            ("body_height_m", self.body_height_m),
            ("body_mass_kg", self.body_mass_kg),
            ("baseline_s", self.baseline_s),
            ("active_window_s", self.active_window_s),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(MotionError::InvalidParameter(format!(
                    "{name} must be a positive number (got {value})"
                )));
            }
        }
        let non_negative = [
            ("peak_threshold_deg", self.peak_threshold_deg),
            ("peak_rom_fraction", self.peak_rom_fraction),
            ("min_peak_distance_s", self.min_peak_distance_s),
            ("activity_threshold_deg_s", self.activity_threshold_deg_s),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(MotionError::InvalidParameter(format!(
                    "{name} must be zero or positive (got {value})"
                )));
            }
        }
        if self.smoothing_window == 0 {
            return Err(MotionError::InvalidParameter(
                "smoothing_window must be at least 1 sample".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn peak_options(&self) -> metrics::PeakOptions {
        metrics::PeakOptions {
            min_distance_s: self.min_peak_distance_s,
            threshold_abs_deg: self.peak_threshold_deg,
            threshold_rom_fraction: self.peak_rom_fraction,
            smoothing_window: self.smoothing_window,
        }
    }

    pub(crate) fn active_window_options(&self) -> metrics::ActiveWindowOptions {
        metrics::ActiveWindowOptions {
            window_s: self.active_window_s,
            threshold_deg_s: self.activity_threshold_deg_s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let opts = Options::from_json_str(r#"{"body_height_m": 1.62, "peak_threshold_deg": 18}"#)
            .unwrap();
        assert_eq!(opts.body_height_m, 1.62);
        assert_eq!(opts.peak_threshold_deg, 18.0);
        assert_eq!(opts.body_mass_kg, 70.0);
        assert_eq!(opts.min_peak_distance_s, 0.6);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = Options::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, MotionError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_non_positive_mass() {
        let opts = Options {
            body_mass_kg: 0.0,
            ..Options::default()
        };
        assert!(matches!(
            opts.validate(),
            Err(MotionError::InvalidParameter(_))
        ));
        assert!(Options::default().validate().is_ok());
    }
}
