//! Scan worker lifecycle
//!
//! [`ScanController`] validates requests, owns at most one worker thread and
//! the [`RunControl`] shared with it, and exposes the operator's
//! start/pause/resume/cancel surface. Each worker acquires its channel session
//! inside the thread and drops it on every exit path, then posts exactly one
//! `Finished` event.

use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::Local;
use crossbeam_channel::Receiver;
use hardware::ChannelBackend;
use tracing::{error, info, warn};

use crate::control::RunControl;
use crate::error::ConfigurationError;
use crate::events::{EventSink, RunId, ScanEvent};
use crate::fitter::CurveFitter;
use crate::profile::CavityTable;
use crate::request::{ScanForm, ScanRequest};
use crate::sequencer::{CavitySequencer, SessionState, Termination};
use crate::settings::SequencerSettings;

struct ActiveRun {
    run_id: RunId,
    control: Arc<RunControl>,
    join_handle: Option<JoinHandle<()>>,
}

/// Everything a worker thread owns
struct Worker {
    run_id: RunId,
    request: ScanRequest,
    backend: Arc<dyn ChannelBackend>,
    fitter: Arc<dyn CurveFitter>,
    table: Arc<CavityTable>,
    settings: Arc<SequencerSettings>,
    control: Arc<RunControl>,
    events: EventSink,
}

/// Owns the background scan worker
pub struct ScanController {
    backend: Arc<dyn ChannelBackend>,
    fitter: Arc<dyn CurveFitter>,
    table: Arc<CavityTable>,
    settings: Arc<SequencerSettings>,
    events: EventSink,
    next_run_id: RunId,
    active: Option<ActiveRun>,
}

impl ScanController {
    /// Create a controller and the receiver for its events
    pub fn new(
        backend: Arc<dyn ChannelBackend>,
        fitter: Arc<dyn CurveFitter>,
        table: CavityTable,
        settings: SequencerSettings,
    ) -> (Self, Receiver<ScanEvent>) {
        let (events, receiver) = EventSink::channel();
        let controller = Self {
            backend,
            fitter,
            table: Arc::new(table),
            settings: Arc::new(settings),
            events,
            next_run_id: 1,
            active: None,
        };
        (controller, receiver)
    }

    /// Cavity table used for validation and sweeps
    pub fn table(&self) -> &CavityTable {
        &self.table
    }

    /// Sequencer settings
    pub fn settings(&self) -> &SequencerSettings {
        &self.settings
    }

    /// Parse an operator form and start a run
    pub fn start_form(&mut self, form: &ScanForm) -> Result<RunId, ConfigurationError> {
        let request = form.parse(&self.table)?;
        self.start(request)
    }

    /// Validate `request` and start a worker for it.
    ///
    /// A run still active is cancelled and joined first. Nothing is touched
    /// if validation fails.
    pub fn start(&mut self, request: ScanRequest) -> Result<RunId, ConfigurationError> {
        request.validate(&self.table)?;
        self.stop_active();

        let run_id = self.next_run_id;
        self.next_run_id += 1;
        let control = Arc::new(RunControl::new());

        let worker = Worker {
            run_id,
            request,
            backend: self.backend.clone(),
            fitter: self.fitter.clone(),
            table: self.table.clone(),
            settings: self.settings.clone(),
            control: control.clone(),
            events: self.events.clone(),
        };
        let join_handle = std::thread::spawn(move || worker.run());

        info!("Scan run {run_id} started");
        self.active = Some(ActiveRun {
            run_id,
            control,
            join_handle: Some(join_handle),
        });
        Ok(run_id)
    }

    /// Pause the active run at its next checkpoint. Returns false if nothing was running.
    pub fn pause(&self) -> bool {
        let paused = self.active.as_ref().is_some_and(|run| run.control.pause());
        if paused {
            info!("Pause requested");
        }
        paused
    }

    /// Resume a paused run. Returns false if nothing was paused.
    pub fn resume(&self) -> bool {
        let resumed = self.active.as_ref().is_some_and(|run| run.control.resume());
        if resumed {
            info!("Resume requested");
        }
        resumed
    }

    /// Cancel the active run without waiting for it
    pub fn cancel(&self) {
        if let Some(run) = &self.active {
            run.control.cancel();
        }
    }

    /// Id of the most recently started run, if its worker has not been joined
    pub fn active_run(&self) -> Option<RunId> {
        self.active.as_ref().map(|run| run.run_id)
    }

    /// True while a worker thread is still executing
    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .and_then(|run| run.join_handle.as_ref())
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Block until the active worker exits
    pub fn wait(&mut self) {
        if let Some(mut run) = self.active.take() {
            join(&mut run);
        }
    }

    fn stop_active(&mut self) {
        if let Some(mut run) = self.active.take() {
            run.control.cancel();
            join(&mut run);
        }
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        self.stop_active();
    }
}

fn join(run: &mut ActiveRun) {
    if let Some(handle) = run.join_handle.take() {
        if handle.join().is_err() {
            warn!("Scan run {} worker thread panicked", run.run_id);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    }
}

impl Worker {
    fn run(self) {
        let run_dir = self.settings.log_dir.join(format!(
            "run_{}_{}",
            Local::now().format("%Y%m%d_%H%M%S"),
            self.run_id
        ));
        let mut state = SessionState::new(self.request.win_mev, Some(run_dir.clone()));

        self.events.emit(ScanEvent::RunStarted {
            run_id: self.run_id,
            first_cavity: self.request.first_cavity,
            last_cavity: self.request.last_cavity,
            log_dir: run_dir.clone(),
        });

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.execute(run_dir, &mut state)));
        let termination = match result {
            Ok(termination) => termination,
            Err(payload) => {
                let message = format!("worker panicked: {}", panic_message(payload));
                error!("Scan run {}: {}", self.run_id, message);
                if let Some(index) = state.current_cavity {
                    self.events.emit(ScanEvent::Error {
                        index,
                        win_mev: state.win_mev,
                        reason: message.clone(),
                    });
                }
                Termination::Fault {
                    index: state.current_cavity,
                    message,
                }
            }
        };

        info!("Scan run {} finished: {}", self.run_id, termination);
        self.events.emit(ScanEvent::Finished {
            run_id: self.run_id,
            termination,
            session: state,
        });
    }

    fn execute(&self, run_dir: PathBuf, state: &mut SessionState) -> Termination {
        if let Err(e) = fs::create_dir_all(&run_dir) {
            return Termination::Fault {
                index: None,
                message: format!("cannot create {}: {e}", run_dir.display()),
            };
        }

        let mut session = match self.backend.connect() {
            Ok(session) => session,
            Err(e) => {
                error!("Cannot open channel session: {e}");
                return Termination::Fault {
                    index: None,
                    message: format!("cannot open channel session: {e}"),
                };
            }
        };
        info!("Channel session opened, logging to {}", run_dir.display());

        let mut sequencer = CavitySequencer::new(
            &self.table,
            self.fitter.as_ref(),
            &self.settings,
            &self.control,
            &self.events,
        );
        let termination = sequencer.run(&self.request, session.as_mut(), &run_dir, state);

        drop(session);
        info!("Channel session released");
        termination
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitter::{FitError, FitInput, FitOutcome};
    use crate::request::ScanMode;
    use hardware::MockBackend;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Flat;

    impl CurveFitter for Flat {
        fn fit(&self, _input: &FitInput<'_>) -> Result<FitOutcome, FitError> {
            Ok(FitOutcome {
                rf_phase: 0.0,
                energy_gain: 0.1,
                amplitude: 1.0,
                error_metric: 1.0,
                plot_curve: Vec::new(),
            })
        }
    }

    struct Panics;

    impl CurveFitter for Panics {
        fn fit(&self, _input: &FitInput<'_>) -> Result<FitOutcome, FitError> {
            panic!("fit exploded");
        }
    }

    fn backend() -> MockBackend {
        MockBackend::new()
            .with_setpoint("LLRF:Buncher1:PHA_SET")
            .with_response("Bpm:2-P11", "LLRF:Buncher1:PHA_SET", |p| p)
    }

    fn request() -> ScanRequest {
        ScanRequest {
            win_mev: 2.1,
            first_cavity: 0,
            last_cavity: 0,
            first_phase_deg: 0.0,
            last_phase_deg: 50.0,
            phase_step_deg: 10.0,
            settle_delay: Duration::ZERO,
            read_delay: Duration::ZERO,
            num_read: 1,
            mode: ScanMode::Auto,
        }
    }

    fn finished(receiver: &Receiver<ScanEvent>) -> Vec<Termination> {
        receiver
            .try_iter()
            .filter_map(|event| match event {
                ScanEvent::Finished { termination, .. } => Some(termination),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_invalid_request_starts_nothing() {
        let dir = TempDir::new().unwrap();
        let backend = backend();
        let (mut controller, receiver) = ScanController::new(
            Arc::new(backend.clone()),
            Arc::new(Flat),
            CavityTable::injector(),
            SequencerSettings::immediate(dir.path()),
        );
        let mut req = request();
        req.phase_step_deg = 0.0;

        assert_eq!(controller.start(req), Err(ConfigurationError::ZeroStep));
        assert!(!controller.is_running());
        assert_eq!(controller.active_run(), None);
        assert_eq!(backend.sessions_opened(), 0);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_completed_run_releases_session() {
        let dir = TempDir::new().unwrap();
        let backend = backend();
        let (mut controller, receiver) = ScanController::new(
            Arc::new(backend.clone()),
            Arc::new(Flat),
            CavityTable::injector(),
            SequencerSettings::immediate(dir.path()),
        );

        assert_eq!(controller.start(request()), Ok(1));
        controller.wait();

        assert_eq!(finished(&receiver), vec![Termination::Completed]);
        assert_eq!(backend.sessions_opened(), 1);
        assert_eq!(backend.sessions_released(), 1);
    }

    #[test]
    fn test_panicking_fitter_becomes_fault() {
        let dir = TempDir::new().unwrap();
        let backend = backend();
        let (mut controller, receiver) = ScanController::new(
            Arc::new(backend.clone()),
            Arc::new(Panics),
            CavityTable::injector(),
            SequencerSettings::immediate(dir.path()),
        );

        controller.start(request()).unwrap();
        controller.wait();

        let terminations = finished(&receiver);
        assert_eq!(terminations.len(), 1);
        match &terminations[0] {
            Termination::Fault { index, message } => {
                assert_eq!(*index, Some(0));
                assert!(message.contains("fit exploded"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(backend.sessions_released(), 1);
    }

    #[test]
    fn test_connect_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let (mut controller, receiver) = ScanController::new(
            Arc::new(backend().failing_connect()),
            Arc::new(Flat),
            CavityTable::injector(),
            SequencerSettings::immediate(dir.path()),
        );

        controller.start(request()).unwrap();
        controller.wait();
        assert!(matches!(
            finished(&receiver).as_slice(),
            [Termination::Fault { index: None, .. }]
        ));
    }

    #[test]
    fn test_pause_without_run() {
        let dir = TempDir::new().unwrap();
        let (controller, _receiver) = ScanController::new(
            Arc::new(backend()),
            Arc::new(Flat),
            CavityTable::injector(),
            SequencerSettings::immediate(dir.path()),
        );
        assert!(!controller.pause());
        assert!(!controller.resume());
        controller.cancel();
    }
}
