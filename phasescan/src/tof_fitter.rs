//! Time-of-flight phase-scan fitter
//!
//! The BPM phase downstream of a cavity is the RF phase the beam accumulates
//! over the cavity-to-BPM drift. Sweeping the cavity phase `φ` changes the
//! beam energy by `ΔW(φ) = a cos φ + b sin φ`, so the measured response is
//!
//! ```text
//! y(φ) = c + T(W + a cos φ + b sin φ) - T(W)
//! ```
//!
//! where `T(W)` is the drift phase at kinetic energy `W` and `c` absorbs the
//! BPM offset. The fit starts from the linearised problem (`T` replaced by its
//! tangent at `W`) and refines `(c, a, b)` with damped Gauss-Newton.
//!
//! The crest is `atan2(b, a)`; the operating phase is the crest shifted by the
//! design synchronous phase.

use std::collections::HashMap;

use hardware::linac_sim::{beta_from_kinetic, PROTON_REST_MEV};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fitter::{CurveFitter, FitError, FitInput, FitOutcome, DEFAULT_MIN_POINTS};

/// Speed of light in m/s
const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Step-halving attempts per Gauss-Newton iteration
const MAX_STEP_HALVINGS: usize = 30;

/// Fitter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TofFitterConfig {
    /// RF frequency used to convert time of flight to phase
    pub rf_frequency_mhz: f64,
    /// Rest energy of the beam particle in MeV
    pub rest_mass_mev: f64,
    /// Transit-time factor per field-profile identifier (1.0 when absent)
    #[serde(default)]
    pub transit_time_factors: HashMap<String, f64>,
    /// Gauss-Newton iteration cap
    pub max_iterations: usize,
    /// Relative parameter change below which the fit is converged
    pub convergence: f64,
    /// Display curve points per sweep step
    pub plot_oversample: usize,
}

impl Default for TofFitterConfig {
    fn default() -> Self {
        Self {
            rf_frequency_mhz: 162.5,
            rest_mass_mev: PROTON_REST_MEV,
            transit_time_factors: HashMap::new(),
            max_iterations: 100,
            convergence: 1e-10,
            plot_oversample: 8,
        }
    }
}

/// Reference [`CurveFitter`] using a time-of-flight response model
#[derive(Debug, Clone, Default)]
pub struct TimeOfFlightFitter {
    config: TofFitterConfig,
}

/// Drift-phase model for one cavity at one entrance energy
struct Drift {
    /// 360 f d / c, in degrees
    k: f64,
    rest_mass_mev: f64,
    win_mev: f64,
    reference: f64,
}

impl Drift {
    fn new(config: &TofFitterConfig, distance_m: f64, win_mev: f64) -> Self {
        let k = 360.0 * config.rf_frequency_mhz * 1.0e6 * distance_m / SPEED_OF_LIGHT;
        let mut drift = Self {
            k,
            rest_mass_mev: config.rest_mass_mev,
            win_mev,
            reference: 0.0,
        };
        drift.reference = drift.k / beta_from_kinetic(win_mev, config.rest_mass_mev);
        drift
    }

    /// Drift phase at `kinetic_mev`, `None` if the beam would be stopped
    fn phase(&self, kinetic_mev: f64) -> Option<f64> {
        (kinetic_mev > 0.0).then(|| self.k / beta_from_kinetic(kinetic_mev, self.rest_mass_mev))
    }

    /// dT/dW at `kinetic_mev`
    fn slope(&self, kinetic_mev: f64) -> f64 {
        let gamma = 1.0 + kinetic_mev / self.rest_mass_mev;
        let beta = beta_from_kinetic(kinetic_mev, self.rest_mass_mev);
        -self.k / (beta.powi(3) * gamma.powi(3) * self.rest_mass_mev)
    }

    fn energy(&self, theta: &Vector3<f64>, phi: f64) -> f64 {
        self.win_mev + theta[1] * phi.cos() + theta[2] * phi.sin()
    }

    fn model(&self, theta: &Vector3<f64>, phi: f64) -> Option<f64> {
        Some(theta[0] + self.phase(self.energy(theta, phi))? - self.reference)
    }

    fn sum_squared_residuals(&self, theta: &Vector3<f64>, points: &[(f64, f64)]) -> Option<f64> {
        points.iter().try_fold(0.0, |acc, &(phi, y)| {
            let r = y - self.model(theta, phi)?;
            Some(acc + r * r)
        })
    }
}

/// Wrap an angle in degrees to [-180, 180)
pub fn wrap_degrees(angle: f64) -> f64 {
    (angle + 180.0).rem_euclid(360.0) - 180.0
}

fn solve(jtj: Matrix3<f64>, jtr: Vector3<f64>) -> Result<Vector3<f64>, FitError> {
    jtj.cholesky()
        .map(|c| c.solve(&jtr))
        .ok_or(FitError::Singular)
}

impl TimeOfFlightFitter {
    /// Create a fitter
    pub fn new(config: TofFitterConfig) -> Self {
        Self { config }
    }

    /// Configuration
    pub fn config(&self) -> &TofFitterConfig {
        &self.config
    }

    /// Transit-time factor for a field profile
    pub fn transit_time_factor(&self, field_profile: &str) -> f64 {
        self.config
            .transit_time_factors
            .get(field_profile)
            .copied()
            .unwrap_or(1.0)
    }

    /// Linearised least squares: y = c + p cos φ + q sin φ, then a = p / T'(W)
    fn initial_guess(
        &self,
        drift: &Drift,
        points: &[(f64, f64)],
    ) -> Result<Vector3<f64>, FitError> {
        let mut jtj = Matrix3::zeros();
        let mut jty = Vector3::zeros();
        for &(phi, y) in points {
            let j = Vector3::new(1.0, phi.cos(), phi.sin());
            jtj += j * j.transpose();
            jty += j * y;
        }
        let linear = solve(jtj, jty)?;
        let tangent = drift.slope(drift.win_mev);
        Ok(Vector3::new(linear[0], linear[1] / tangent, linear[2] / tangent))
    }

    fn refine(
        &self,
        drift: &Drift,
        points: &[(f64, f64)],
        mut theta: Vector3<f64>,
    ) -> Result<(Vector3<f64>, f64), FitError> {
        let mut ssr = drift
            .sum_squared_residuals(&theta, points)
            .ok_or_else(|| FitError::InvalidInput("initial estimate stops the beam".to_string()))?;

        for iteration in 0..self.config.max_iterations {
            let mut jtj = Matrix3::zeros();
            let mut jtr = Vector3::zeros();
            for &(phi, y) in points {
                let energy = drift.energy(&theta, phi);
                let (Some(model), d) = (drift.model(&theta, phi), drift.slope(energy)) else {
                    return Err(FitError::InvalidInput("fit stops the beam".to_string()));
                };
                let j = Vector3::new(1.0, d * phi.cos(), d * phi.sin());
                jtj += j * j.transpose();
                jtr += j * (y - model);
            }
            let delta = solve(jtj, jtr)?;

            let mut scale = 1.0;
            let mut improved = None;
            for _ in 0..MAX_STEP_HALVINGS {
                let candidate = theta + delta * scale;
                if let Some(candidate_ssr) = drift.sum_squared_residuals(&candidate, points) {
                    if candidate_ssr <= ssr {
                        improved = Some((candidate, candidate_ssr));
                        break;
                    }
                }
                scale *= 0.5;
            }

            let Some((candidate, candidate_ssr)) = improved else {
                debug!("tof fit: no downhill step at iteration {iteration}, ssr {ssr:.3e}");
                return Ok((theta, ssr));
            };
            let step = (delta * scale).norm();
            theta = candidate;
            ssr = candidate_ssr;
            if step <= self.config.convergence * (1.0 + theta.norm()) {
                debug!("tof fit: converged in {} iterations, ssr {ssr:.3e}", iteration + 1);
                return Ok((theta, ssr));
            }
        }

        Err(FitError::NotConverged {
            iterations: self.config.max_iterations,
        })
    }

    fn plot_curve(
        &self,
        drift: &Drift,
        theta: &Vector3<f64>,
        first_phase_deg: f64,
        step_deg: f64,
        points: usize,
    ) -> Vec<(f64, f64)> {
        let oversample = self.config.plot_oversample.max(1);
        let fine_step = step_deg / oversample as f64;
        (0..=(points.saturating_sub(1) * oversample))
            .filter_map(|k| {
                let x = first_phase_deg + k as f64 * fine_step;
                drift.model(theta, x.to_radians()).map(|y| (x, y))
            })
            .collect()
    }
}

impl CurveFitter for TimeOfFlightFitter {
    fn fit(&self, input: &FitInput<'_>) -> Result<FitOutcome, FitError> {
        let params = input.params;
        let samples = input.series.samples();
        if samples.len() < self.min_points() {
            return Err(FitError::TooFewPoints {
                got: samples.len(),
                need: self.min_points(),
            });
        }
        if !(input.win_mev.is_finite() && input.win_mev > 0.0) {
            return Err(FitError::InvalidInput(format!("win {} MeV", input.win_mev)));
        }
        if !(params.distance_m.is_finite() && params.distance_m > 0.0) {
            return Err(FitError::InvalidInput(format!(
                "distance {} m",
                params.distance_m
            )));
        }
        let ttf = self.transit_time_factor(&params.field_profile);
        if !(ttf.is_finite() && ttf > 0.0) {
            return Err(FitError::InvalidInput(format!(
                "transit-time factor {ttf} for {}",
                params.field_profile
            )));
        }

        let points: Vec<(f64, f64)> = samples
            .iter()
            .map(|s| (s.phase.to_radians(), s.mean_bpm_phase))
            .collect();
        if points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(FitError::InvalidInput("non-finite sample".to_string()));
        }

        let drift = Drift::new(&self.config, params.distance_m, input.win_mev);
        let start = self.initial_guess(&drift, &points)?;
        let (theta, ssr) = self.refine(&drift, &points, start)?;

        let (a, b) = (theta[1], theta[2]);
        let gain_amplitude = a.hypot(b);
        let crest_deg = b.atan2(a).to_degrees();
        let rf_phase = wrap_degrees(crest_deg + params.synch_phase_deg);
        let energy_gain = params.slope * gain_amplitude * params.synch_phase_deg.to_radians().cos();
        let amplitude = gain_amplitude * params.peak_field_factor / ttf;

        debug!(
            "tof fit: crest {:.2} deg, gain amplitude {:.4} MeV, offset {:.2} deg",
            crest_deg, gain_amplitude, theta[0]
        );

        Ok(FitOutcome {
            rf_phase,
            energy_gain,
            amplitude,
            error_metric: ssr,
            plot_curve: self.plot_curve(
                &drift,
                &theta,
                params.first_phase_deg,
                params.step_radians.to_degrees(),
                samples.len(),
            ),
        })
    }

    fn min_points(&self) -> usize {
        DEFAULT_MIN_POINTS
    }
}
