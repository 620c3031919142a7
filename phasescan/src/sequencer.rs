//! Cavity-chain sequencing
//!
//! Walks the requested cavity range in beam order. Each cavity is swept, fitted
//! and either accepted, which carries its energy gain into the next cavity's
//! fit, or rejected, which ends the run with enough state to resume by hand
//! from the failing cavity.
//!
//! ```text
//! Idle -> Running{cavity} -> Completed
//!                         -> Aborted   (cancel, rejection, channel fault, fault)
//! ```

use std::fmt;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use hardware::{ChannelError, ChannelSession};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::collector::{CavityChannels, PointLog, SampleCollector, SweepSeries};
use crate::control::{RunControl, RunStatus};
use crate::error::SweepError;
use crate::events::{EventSink, ScanEvent};
use crate::fitter::{CurveFitter, FitError, FitInput, FitOutcome, FitParameters};
use crate::profile::{CavityProfile, CavityTable};
use crate::request::ScanRequest;
use crate::settings::SequencerSettings;

/// File name of the accepted-fit record inside a run directory
pub const ACCEPTED_FITS_FILE: &str = "accepted_fits.txt";

/// Sequencer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    Running { cavity: usize },
    Completed,
    Aborted,
}

/// One accepted cavity, in acceptance order
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedCavity {
    pub index: usize,
    pub name: String,
    pub rf_phase: f64,
    pub energy_gain: f64,
    /// Accumulated energy after this cavity
    pub win_mev: f64,
    pub amplitude: f64,
    pub error_metric: f64,
}

/// Last accepted cavity's sweep and fit inputs, kept in Manual mode for export
#[derive(Debug, Clone, PartialEq)]
pub struct RetainedCavity {
    pub index: usize,
    pub name: String,
    /// Energy entering the cavity when it was fitted
    pub win_mev: f64,
    pub params: FitParameters,
    pub series: SweepSeries,
}

/// Worker-owned state of one run, handed to the presentation layer when the run ends
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    /// Injected energy
    pub win0_mev: f64,
    /// Accumulated energy: `win0_mev` plus every accepted gain so far
    pub win_mev: f64,
    /// Cavity being processed, or the last one processed
    pub current_cavity: Option<usize>,
    /// Accepted cavities in order
    pub accepted: Vec<AcceptedCavity>,
    /// Manual mode: the last accepted cavity
    pub retained: Option<RetainedCavity>,
    /// Current cavity's sweep for display; cleared after acceptance in Auto mode
    pub sweep: SweepSeries,
    /// Directory holding this run's sweep logs
    pub run_dir: Option<PathBuf>,
}

impl SessionState {
    /// Fresh state for a run starting at `win0_mev`
    pub fn new(win0_mev: f64, run_dir: Option<PathBuf>) -> Self {
        Self {
            win0_mev,
            win_mev: win0_mev,
            current_cavity: None,
            accepted: Vec::new(),
            retained: None,
            sweep: SweepSeries::new(),
            run_dir,
        }
    }
}

/// Why a fit was not accepted
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RejectCause {
    #[error("fit error {error_metric:.3} not below tolerance {tolerance}")]
    Tolerance { error_metric: f64, tolerance: f64 },

    #[error("sweep has {got} points, fitter needs {need}")]
    TooFewPoints { got: usize, need: usize },

    #[error("fit failed: {0}")]
    FitFailed(#[from] FitError),
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// Every cavity in the range was accepted
    Completed,
    /// The operator cancelled
    Cancelled,
    /// A cavity's fit was rejected
    FitRejected {
        index: usize,
        name: String,
        /// Energy entering the failing cavity
        win_at_failure: f64,
        cause: RejectCause,
    },
    /// A channel read or write failed, or a setpoint never settled
    ChannelFault {
        index: usize,
        name: String,
        win_at_failure: f64,
        error: ChannelError,
    },
    /// Log I/O failure, missing session or a worker panic
    Fault {
        index: Option<usize>,
        message: String,
    },
}

impl Termination {
    /// True for every ending other than `Completed`
    pub fn is_aborted(&self) -> bool {
        !matches!(self, Termination::Completed)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Completed => write!(f, "completed"),
            Termination::Cancelled => write!(f, "cancelled"),
            Termination::FitRejected {
                name,
                win_at_failure,
                cause,
                ..
            } => write!(f, "{name} rejected at Win = {win_at_failure} MeV: {cause}"),
            Termination::ChannelFault {
                name,
                win_at_failure,
                error,
                ..
            } => write!(f, "{name} channel fault at Win = {win_at_failure} MeV: {error}"),
            Termination::Fault { message, .. } => write!(f, "fault: {message}"),
        }
    }
}

/// Durable record of accepted fits, one `rfPhase\tWin\tamplitude` line each
pub struct AcceptedFitLog {
    writer: Box<dyn Write + Send>,
}

impl AcceptedFitLog {
    /// Create the record. Fails if the file already exists.
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(Self::from_writer(BufWriter::new(file)))
    }

    /// Record into any writer
    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Box::new(writer),
        }
    }

    /// Append one accepted cavity and flush
    pub fn append(&mut self, rf_phase: f64, win_mev: f64, amplitude: f64) -> std::io::Result<()> {
        writeln!(self.writer, "{}\t{}\t{}", rf_phase, win_mev, amplitude)?;
        self.writer.flush()
    }
}

enum Step {
    Next,
    Stop(Termination),
}

/// Runs the accept/reject loop over a cavity range
pub struct CavitySequencer<'a> {
    table: &'a CavityTable,
    fitter: &'a dyn CurveFitter,
    settings: &'a SequencerSettings,
    control: &'a RunControl,
    events: &'a EventSink,
    state: SequencerState,
}

impl<'a> CavitySequencer<'a> {
    pub fn new(
        table: &'a CavityTable,
        fitter: &'a dyn CurveFitter,
        settings: &'a SequencerSettings,
        control: &'a RunControl,
        events: &'a EventSink,
    ) -> Self {
        Self {
            table,
            fitter,
            settings,
            control,
            events,
            state: SequencerState::Idle,
        }
    }

    /// Current state
    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Process every cavity in the request's range.
    ///
    /// Logs go to `run_dir`, which must exist. `session_state` is updated in
    /// place so the caller still holds it if this panics.
    pub fn run(
        &mut self,
        request: &ScanRequest,
        channels: &mut dyn ChannelSession,
        run_dir: &Path,
        session_state: &mut SessionState,
    ) -> Termination {
        let termination = self.run_range(request, channels, run_dir, session_state);
        self.state = match termination {
            Termination::Completed => SequencerState::Completed,
            _ => SequencerState::Aborted,
        };
        info!("Sequencer finished: {termination}");
        termination
    }

    fn run_range(
        &mut self,
        request: &ScanRequest,
        channels: &mut dyn ChannelSession,
        run_dir: &Path,
        session_state: &mut SessionState,
    ) -> Termination {
        let mut accepted_log = match AcceptedFitLog::create(&run_dir.join(ACCEPTED_FITS_FILE)) {
            Ok(log) => log,
            Err(e) => {
                return Termination::Fault {
                    index: None,
                    message: format!("cannot create accepted-fit log: {e}"),
                }
            }
        };

        for index in request.cavity_range() {
            if self.control.is_cancelled() {
                return Termination::Cancelled;
            }
            let Some(profile) = self.table.get(index) else {
                return Termination::Fault {
                    index: Some(index),
                    message: format!("no cavity at index {index}"),
                };
            };
            self.state = SequencerState::Running { cavity: index };
            session_state.current_cavity = Some(index);

            let step = self.process_cavity(
                index,
                profile,
                request,
                channels,
                run_dir,
                &mut accepted_log,
                session_state,
            );
            if let Step::Stop(termination) = step {
                return termination;
            }
        }

        Termination::Completed
    }

    #[allow(clippy::too_many_arguments)]
    fn process_cavity(
        &self,
        index: usize,
        profile: &CavityProfile,
        request: &ScanRequest,
        session: &mut dyn ChannelSession,
        run_dir: &Path,
        accepted_log: &mut AcceptedFitLog,
        state: &mut SessionState,
    ) -> Step {
        let expected_points = request.expected_points();
        info!(
            "Cavity {} ({}): sweeping {} points, Win = {:.4} MeV",
            index, profile.name, expected_points, state.win_mev
        );
        self.events.emit(ScanEvent::CavityStarted {
            index,
            name: profile.name.clone(),
            expected_points,
        });
        state.sweep = SweepSeries::new();

        let mut channels = match CavityChannels::open(session, profile) {
            Ok(channels) => channels,
            Err(e) => return self.channel_fault(index, profile, state, e),
        };
        let mut log = match PointLog::create(&run_dir.join(format!("{}.txt", profile.name))) {
            Ok(log) => log,
            Err(e) => return self.fault(index, state, format!("cannot create sweep log: {e}")),
        };

        let collector = SampleCollector::new(self.control, self.events, &self.settings.settle);
        let sweep = collector.sweep(index, profile, &mut channels, request, &mut log);
        let closed = log.close();

        let series = match sweep {
            Ok(series) => series,
            Err(SweepError::Cancelled { partial }) => {
                info!(
                    "Cavity {} ({}): cancelled after {} points",
                    index,
                    profile.name,
                    partial.len()
                );
                state.sweep = partial;
                return Step::Stop(Termination::Cancelled);
            }
            Err(SweepError::Channel(e)) => return self.channel_fault(index, profile, state, e),
            Err(SweepError::Log(e)) => {
                return self.fault(index, state, format!("sweep log write failed: {e}"))
            }
        };
        if let Err(e) = closed {
            return self.fault(index, state, format!("sweep log close failed: {e}"));
        }
        state.sweep = series.clone();

        let params = FitParameters::for_cavity(profile, request);
        let outcome = match self.evaluate(&series, state.win_mev, &params) {
            Ok(outcome) => outcome,
            Err(cause) => return self.reject(index, profile, state, cause),
        };

        self.accept(
            index,
            profile,
            request,
            &mut channels,
            accepted_log,
            state,
            params,
            outcome,
        )
    }

    /// Fit the series and apply the acceptance test
    fn evaluate(
        &self,
        series: &SweepSeries,
        win_mev: f64,
        params: &FitParameters,
    ) -> Result<FitOutcome, RejectCause> {
        let need = self.fitter.min_points().max(1);
        if series.len() < need {
            return Err(RejectCause::TooFewPoints {
                got: series.len(),
                need,
            });
        }

        let outcome = self.fitter.fit(&FitInput {
            series,
            win_mev,
            params,
        })?;

        // NaN fails the comparison and is rejected
        if outcome.error_metric < self.settings.tolerance {
            Ok(outcome)
        } else {
            Err(RejectCause::Tolerance {
                error_metric: outcome.error_metric,
                tolerance: self.settings.tolerance,
            })
        }
    }

    /// Commit an accepted fit.
    ///
    /// `Win` and the accepted list change only after the accepted phase is
    /// commanded and the record is written.
    #[allow(clippy::too_many_arguments)]
    fn accept(
        &self,
        index: usize,
        profile: &CavityProfile,
        request: &ScanRequest,
        channels: &mut CavityChannels,
        accepted_log: &mut AcceptedFitLog,
        state: &mut SessionState,
        params: FitParameters,
        outcome: FitOutcome,
    ) -> Step {
        let win_entering = state.win_mev;
        let win_after = win_entering + outcome.energy_gain;

        let cancelled = if self.settings.apply_accepted_phase {
            match self.command_accepted_phase(index, channels, outcome.rf_phase) {
                Ok(applied) => !applied,
                Err(e) => return self.channel_fault(index, profile, state, e),
            }
        } else {
            false
        };

        if let Err(e) = accepted_log.append(outcome.rf_phase, win_after, outcome.amplitude) {
            return self.fault(index, state, format!("accepted-fit log write failed: {e}"));
        }

        state.win_mev = win_after;
        info!(
            "Cavity {} ({}) accepted: rfPhase {:.2} deg, gain {:.4} MeV, Win {:.4} MeV, \
             error {:.3}",
            index,
            profile.name,
            outcome.rf_phase,
            outcome.energy_gain,
            state.win_mev,
            outcome.error_metric
        );
        state.accepted.push(AcceptedCavity {
            index,
            name: profile.name.clone(),
            rf_phase: outcome.rf_phase,
            energy_gain: outcome.energy_gain,
            win_mev: state.win_mev,
            amplitude: outcome.amplitude,
            error_metric: outcome.error_metric,
        });
        self.events.emit(ScanEvent::FitCurve {
            index,
            points: outcome.plot_curve,
        });
        self.events.emit(ScanEvent::CavityAccepted {
            index,
            rf_phase: outcome.rf_phase,
            win_mev: state.win_mev,
            amplitude: outcome.amplitude,
        });

        if request.mode.retains_session() {
            state.retained = Some(RetainedCavity {
                index,
                name: profile.name.clone(),
                win_mev: win_entering,
                params,
                series: state.sweep.clone(),
            });
        } else {
            state.sweep = SweepSeries::new();
            state.retained = None;
        }

        if cancelled {
            return Step::Stop(Termination::Cancelled);
        }
        let last = index >= request.last_cavity;
        if !last && self.control.sleep(self.settings.inter_cavity_delay()).is_err() {
            return Step::Stop(Termination::Cancelled);
        }
        Step::Next
    }

    /// Command the accepted phase once the pause gate is open.
    ///
    /// Returns `Ok(false)` without touching the cavity if the run was cancelled.
    fn command_accepted_phase(
        &self,
        index: usize,
        channels: &mut CavityChannels,
        rf_phase: f64,
    ) -> Result<bool, ChannelError> {
        if self.control.status() == RunStatus::Paused {
            info!("Cavity {index}: paused before applying {rf_phase:.2} deg");
            self.events.emit(ScanEvent::Paused {
                index,
                next_phase: rf_phase,
            });
            if self.control.wait_while_paused().is_err() {
                return Ok(false);
            }
            self.events.emit(ScanEvent::Resumed {
                index,
                next_phase: rf_phase,
            });
        }
        if self.control.is_cancelled() {
            return Ok(false);
        }
        channels.command(rf_phase)?;
        Ok(true)
    }

    fn reject(
        &self,
        index: usize,
        profile: &CavityProfile,
        state: &SessionState,
        cause: RejectCause,
    ) -> Step {
        warn!(
            "Cavity {} ({}) rejected at Win {:.4} MeV: {}",
            index, profile.name, state.win_mev, cause
        );
        self.events.emit(ScanEvent::Error {
            index,
            win_mev: state.win_mev,
            reason: cause.to_string(),
        });
        Step::Stop(Termination::FitRejected {
            index,
            name: profile.name.clone(),
            win_at_failure: state.win_mev,
            cause,
        })
    }

    fn channel_fault(
        &self,
        index: usize,
        profile: &CavityProfile,
        state: &SessionState,
        e: ChannelError,
    ) -> Step {
        error!("Cavity {} ({}) channel fault: {}", index, profile.name, e);
        self.events.emit(ScanEvent::Error {
            index,
            win_mev: state.win_mev,
            reason: e.to_string(),
        });
        Step::Stop(Termination::ChannelFault {
            index,
            name: profile.name.clone(),
            win_at_failure: state.win_mev,
            error: e,
        })
    }

    fn fault(&self, index: usize, state: &SessionState, message: String) -> Step {
        error!("Cavity {index}: {message}");
        self.events.emit(ScanEvent::Error {
            index,
            win_mev: state.win_mev,
            reason: message.clone(),
        });
        Step::Stop(Termination::Fault {
            index: Some(index),
            message,
        })
    }
}
