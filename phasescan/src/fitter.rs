//! Curve-fitter contract
//!
//! The sequencer only knows this trait. A fitter turns one cavity's sweep and
//! the energy entering it into a candidate phase, the energy gain that phase
//! implies, a field amplitude and a residual, plus a smooth curve for display.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collector::SweepSeries;
use crate::profile::CavityProfile;
use crate::request::ScanRequest;

/// Fewest points any fitter is asked to fit unless it says otherwise
pub const DEFAULT_MIN_POINTS: usize = 3;

/// Per-cavity fit parameters taken from the profile and the request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitParameters {
    /// Cavity-to-BPM distance in meters
    pub distance_m: f64,
    /// Design synchronous phase in degrees
    pub synch_phase_deg: f64,
    /// Field-profile identifier
    pub field_profile: String,
    /// Sweep step in radians
    pub step_radians: f64,
    /// First swept phase in degrees
    pub first_phase_deg: f64,
    /// Energy-gain slope correction
    pub slope: f64,
    /// Peak-field scale factor
    pub peak_field_factor: f64,
}

impl FitParameters {
    /// Parameters for sweeping `profile` with `request`
    pub fn for_cavity(profile: &CavityProfile, request: &ScanRequest) -> Self {
        Self {
            distance_m: profile.distance_m,
            synch_phase_deg: profile.synch_phase_deg,
            field_profile: profile.field_profile.clone(),
            step_radians: request.step_radians(),
            first_phase_deg: request.first_phase_deg,
            slope: profile.slope,
            peak_field_factor: profile.peak_field_factor(),
        }
    }
}

/// Everything a fitter sees for one cavity
#[derive(Debug, Clone, Copy)]
pub struct FitInput<'a> {
    /// Completed sweep
    pub series: &'a SweepSeries,
    /// Beam energy entering the cavity in MeV
    pub win_mev: f64,
    /// Cavity fit parameters
    pub params: &'a FitParameters,
}

/// Result of a successful fit
#[derive(Debug, Clone, PartialEq)]
pub struct FitOutcome {
    /// Phase to command for the design operating point, degrees
    pub rf_phase: f64,
    /// Energy gain at `rf_phase` in MeV
    pub energy_gain: f64,
    /// Field amplitude
    pub amplitude: f64,
    /// Non-negative residual compared against the acceptance tolerance
    pub error_metric: f64,
    /// Display curve as (phase, BPM phase)
    pub plot_curve: Vec<(f64, f64)>,
}

/// Why a fitter produced no outcome
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("need at least {need} points to fit, got {got}")]
    TooFewPoints { got: usize, need: usize },

    #[error("invalid fit input: {0}")]
    InvalidInput(String),

    #[error("normal equations are singular")]
    Singular,

    #[error("fit did not converge after {iterations} iterations")]
    NotConverged { iterations: usize },
}

/// Fits one cavity's phase-scan response
pub trait CurveFitter: Send + Sync {
    /// Fit a completed sweep
    fn fit(&self, input: &FitInput<'_>) -> Result<FitOutcome, FitError>;

    /// Sweeps with fewer points are rejected without calling [`CurveFitter::fit`]
    fn min_points(&self) -> usize {
        DEFAULT_MIN_POINTS
    }
}
