//! Scan request and its validation
//!
//! A [`ScanRequest`] is immutable once a run starts. Operators fill in a
//! [`ScanForm`] of raw text fields; parsing it against the cavity table gives
//! either a validated request or a [`ConfigurationError`] before any hardware
//! is touched.

use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::profile::CavityTable;

/// Operating mode, consulted once per accepted cavity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum ScanMode {
    /// Keep the accepted cavity's sweep and fit parameters for export
    Manual,
    /// Discard per-cavity buffers after each acceptance
    Auto,
}

impl ScanMode {
    /// Whether accepted sweeps are retained in the session for export
    pub fn retains_session(self) -> bool {
        matches!(self, ScanMode::Manual)
    }
}

/// Parameters for one scan run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Injected beam kinetic energy in MeV
    pub win_mev: f64,
    /// First cavity index (inclusive)
    pub first_cavity: usize,
    /// Last cavity index (inclusive)
    pub last_cavity: usize,
    /// First swept phase in degrees
    pub first_phase_deg: f64,
    /// Sweep bound in degrees (exclusive)
    pub last_phase_deg: f64,
    /// Signed phase increment in degrees
    pub phase_step_deg: f64,
    /// Wait after the setpoint is confirmed, before sampling
    pub settle_delay: Duration,
    /// Wait between consecutive BPM reads
    pub read_delay: Duration,
    /// Number of BPM reads averaged per point
    pub num_read: usize,
    /// Operating mode
    pub mode: ScanMode,
}

impl ScanRequest {
    /// Check the request against the cavity table.
    ///
    /// A step whose sign points away from `last_phase_deg` is accepted here;
    /// it produces an empty sweep that the sequencer rejects.
    pub fn validate(&self, table: &CavityTable) -> Result<(), ConfigurationError> {
        finite("win", self.win_mev)?;
        if self.win_mev <= 0.0 {
            return Err(ConfigurationError::InvalidValue {
                field: "win",
                value: self.win_mev,
            });
        }
        finite("first phase", self.first_phase_deg)?;
        finite("last phase", self.last_phase_deg)?;
        finite("phase step", self.phase_step_deg)?;

        if self.phase_step_deg == 0.0 {
            return Err(ConfigurationError::ZeroStep);
        }
        if self.num_read == 0 {
            return Err(ConfigurationError::ZeroReadCount);
        }
        if self.first_cavity > self.last_cavity {
            return Err(ConfigurationError::ReversedRange {
                first: self.first_cavity,
                last: self.last_cavity,
            });
        }
        if self.last_cavity >= table.len() {
            return Err(ConfigurationError::CavityOutOfRange {
                index: self.last_cavity,
                len: table.len(),
            });
        }
        Ok(())
    }

    /// Cavity indices covered by the run
    pub fn cavity_range(&self) -> RangeInclusive<usize> {
        self.first_cavity..=self.last_cavity
    }

    /// Phase of the `k`-th sweep point
    pub fn phase_at(&self, k: usize) -> f64 {
        self.first_phase_deg + k as f64 * self.phase_step_deg
    }

    /// True while `phase` has not yet reached the sweep bound
    pub fn before_bound(&self, phase: f64) -> bool {
        (self.last_phase_deg - phase) * self.phase_step_deg > 0.0
    }

    /// Commanded phases in sweep order
    pub fn setpoints(&self) -> impl Iterator<Item = f64> + '_ {
        (0..)
            .map(|k| self.phase_at(k))
            .take_while(|&phase| self.before_bound(phase))
    }

    /// Number of points per cavity sweep.
    ///
    /// Equals `ceil((last - first) / step)` when the step moves toward the
    /// bound, zero otherwise (including a zero step).
    pub fn expected_points(&self) -> usize {
        self.setpoints().count()
    }

    /// Phase step in radians, as handed to the fitter
    pub fn step_radians(&self) -> f64 {
        self.phase_step_deg.to_radians()
    }
}

fn finite(field: &'static str, value: f64) -> Result<(), ConfigurationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidValue { field, value })
    }
}

/// Operator-entered scan parameters as raw text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanForm {
    /// Injected energy in MeV
    pub win_mev: String,
    /// First cavity name
    pub first_cavity: String,
    /// Last cavity name
    pub last_cavity: String,
    /// First phase in degrees
    pub first_phase: String,
    /// Last phase in degrees
    pub last_phase: String,
    /// Phase step in degrees
    pub phase_step: String,
    /// Settle delay in seconds
    pub settle_delay: String,
    /// Delay between reads in seconds
    pub read_delay: String,
    /// Reads per point
    pub num_read: String,
    /// Operating mode
    pub mode: ScanMode,
}

impl Default for ScanForm {
    fn default() -> Self {
        Self {
            win_mev: "2.1".to_string(),
            first_cavity: "buncher1".to_string(),
            last_cavity: "hwr12".to_string(),
            first_phase: "-180".to_string(),
            last_phase: "180".to_string(),
            phase_step: "10".to_string(),
            settle_delay: "0.5".to_string(),
            read_delay: "1".to_string(),
            num_read: "5".to_string(),
            mode: ScanMode::Manual,
        }
    }
}

impl ScanForm {
    /// Parse and validate against `table`
    pub fn parse(&self, table: &CavityTable) -> Result<ScanRequest, ConfigurationError> {
        let request = ScanRequest {
            win_mev: number("win", &self.win_mev)?,
            first_cavity: cavity(table, &self.first_cavity)?,
            last_cavity: cavity(table, &self.last_cavity)?,
            first_phase_deg: number("first phase", &self.first_phase)?,
            last_phase_deg: number("last phase", &self.last_phase)?,
            phase_step_deg: number("phase step", &self.phase_step)?,
            settle_delay: seconds("settle delay", &self.settle_delay)?,
            read_delay: seconds("read delay", &self.read_delay)?,
            num_read: self
                .num_read
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigurationError::NotNumeric {
                    field: "read count",
                    value: self.num_read.clone(),
                })?,
            mode: self.mode,
        };
        request.validate(table)?;
        Ok(request)
    }
}

fn number(field: &'static str, text: &str) -> Result<f64, ConfigurationError> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| ConfigurationError::NotNumeric {
            field,
            value: text.to_string(),
        })
}

fn seconds(field: &'static str, text: &str) -> Result<Duration, ConfigurationError> {
    let secs = number(field, text)?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| ConfigurationError::InvalidValue { field, value: secs })
}

fn cavity(table: &CavityTable, name: &str) -> Result<usize, ConfigurationError> {
    table
        .index_of(name.trim())
        .ok_or_else(|| ConfigurationError::UnknownCavity(name.to_string()))
}
