//! Sequencer settings that are not part of an individual scan request

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fit residual acceptance threshold
pub const DEFAULT_TOLERANCE: f64 = 100.0;

/// Readback must agree with the setpoint within this many degrees
pub const DEFAULT_CONFIRM_WINDOW_DEG: f64 = 5.0;

/// Settle confirmation timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettleSettings {
    /// Wait between a put and the readback check (closed loop)
    pub confirm_interval_secs: f64,
    /// Put/check cycles before the cavity is declared faulted (closed loop)
    pub confirm_max_attempts: usize,
    /// Accepted readback deviation in degrees (closed loop)
    pub confirm_window_deg: f64,
    /// Number of puts (fixed retry)
    pub retry_count: usize,
    /// Wait after each put (fixed retry)
    pub retry_interval_secs: f64,
}

impl SettleSettings {
    /// Closed-loop wait as a duration
    pub fn confirm_interval(&self) -> Duration {
        secs(self.confirm_interval_secs)
    }

    /// Fixed-retry wait as a duration
    pub fn retry_interval(&self) -> Duration {
        secs(self.retry_interval_secs)
    }

    /// Settings with every wait set to zero, for tests and simulations
    pub fn immediate() -> Self {
        Self {
            confirm_interval_secs: 0.0,
            retry_interval_secs: 0.0,
            ..Self::default()
        }
    }
}

impl Default for SettleSettings {
    fn default() -> Self {
        Self {
            confirm_interval_secs: 0.5,
            confirm_max_attempts: 20,
            confirm_window_deg: DEFAULT_CONFIRM_WINDOW_DEG,
            retry_count: 3,
            retry_interval_secs: 0.2,
        }
    }
}

/// Settings shared by every run of a controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencerSettings {
    /// A fit is accepted when its error metric is strictly below this
    pub tolerance: f64,
    /// Settle confirmation
    pub settle: SettleSettings,
    /// Wait after an accepted cavity before the next sweep
    pub inter_cavity_delay_secs: f64,
    /// Command the accepted phase back to the cavity
    pub apply_accepted_phase: bool,
    /// Base directory for per-run sweep logs
    pub log_dir: PathBuf,
}

impl SequencerSettings {
    /// Inter-cavity wait as a duration
    pub fn inter_cavity_delay(&self) -> Duration {
        secs(self.inter_cavity_delay_secs)
    }

    /// Settings with every wait set to zero, logging under `log_dir`
    pub fn immediate(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            settle: SettleSettings::immediate(),
            inter_cavity_delay_secs: 0.0,
            log_dir: log_dir.into(),
            ..Self::default()
        }
    }

    /// Save to JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Load from JSON file
    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            settle: SettleSettings::default(),
            inter_cavity_delay_secs: 10.0,
            apply_accepted_phase: true,
            log_dir: PathBuf::from("phasescan_logs"),
        }
    }
}

/// Negative or NaN durations in a settings file collapse to zero
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
