//! PHASESCAN - RF cavity phase-scan sequencing
//!
//! Sweeps each cavity's RF phase across a configured range, averages the
//! downstream BPM phase at every setpoint, fits the response and carries the
//! accepted energy gain into the next cavity.
//! Runs through states: Idle -> Running -> Completed | Aborted

pub mod collector;
pub mod control;
pub mod controller;
pub mod error;
pub mod events;
pub mod export;
pub mod fitter;
pub mod profile;
pub mod request;
pub mod sequencer;
pub mod settings;
pub mod stats;
pub mod tof_fitter;

// Re-export commonly used types for external use
pub use crate::collector::{SweepSample, SweepSeries};
pub use crate::control::{RunControl, RunStatus};
pub use crate::controller::ScanController;
pub use crate::error::{ConfigurationError, ExportError, ImportParseError, SweepError};
pub use crate::events::{RunId, ScanEvent};
pub use crate::export::{export_session, import_from_file, parse_export, SessionExport};
pub use crate::fitter::{CurveFitter, FitError, FitInput, FitOutcome, FitParameters};
pub use crate::profile::{CavityCategory, CavityProfile, CavityTable, ConfirmPolicy};
pub use crate::request::{ScanForm, ScanMode, ScanRequest};
pub use crate::sequencer::{SessionState, Termination};
pub use crate::settings::SequencerSettings;
pub use crate::tof_fitter::TimeOfFlightFitter;
