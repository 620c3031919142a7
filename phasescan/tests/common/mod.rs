//! Common utilities for phasescan integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use hardware::{ChannelOp, MockBackend, ReadbackMode};
use phasescan::{
    CavityCategory, CavityProfile, CavityTable, ConfirmPolicy, CurveFitter, FitError, FitInput,
    FitOutcome, ScanEvent, ScanMode, ScanRequest, SessionState, Termination,
};

/// Upper bound on how long any test waits for the worker
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// A test cavity with channels `SETi`, `RBi` (closed loop only) and `BPMi`
pub fn profile(i: usize, policy: ConfirmPolicy) -> CavityProfile {
    let set = format!("SET{i}");
    let readback = match policy {
        ConfirmPolicy::ClosedLoop => format!("RB{i}"),
        ConfirmPolicy::FixedRetry => set.clone(),
    };
    CavityProfile {
        name: format!("cav{i}"),
        set_channel: set,
        readback_channel: readback,
        bpm_channel: format!("BPM{i}"),
        distance_m: 0.1026,
        synch_phase_deg: -20.0,
        field_profile: "Exyz.txt".to_string(),
        slope: 1.0,
        category: if i == 0 {
            CavityCategory::Buncher
        } else {
            CavityCategory::HalfWave
        },
        peak_field_override: None,
        confirm_policy: policy,
    }
}

/// `n` fixed-retry cavities
pub fn table(n: usize) -> CavityTable {
    CavityTable::new((0..n).map(|i| profile(i, ConfirmPolicy::FixedRetry)).collect())
}

/// `n` closed-loop cavities
pub fn closed_loop_table(n: usize) -> CavityTable {
    CavityTable::new((0..n).map(|i| profile(i, ConfirmPolicy::ClosedLoop)).collect())
}

/// Mock backend serving every channel in `table`; BPM phase is `sin(setpoint)`
pub fn mock_for(table: &CavityTable) -> MockBackend {
    table.iter().fold(MockBackend::new(), |backend, cavity| {
        let backend = backend.with_setpoint(&cavity.set_channel).with_response(
            &cavity.bpm_channel,
            &cavity.set_channel,
            |phase: f64| phase.to_radians().sin(),
        );
        if cavity.has_independent_readback() {
            backend.with_readback(
                &cavity.readback_channel,
                &cavity.set_channel,
                ReadbackMode::Follow,
            )
        } else {
            backend
        }
    })
}

/// Request over cavities `first..=last` with no waits
pub fn request(
    first: usize,
    last: usize,
    step: f64,
    num_read: usize,
    mode: ScanMode,
) -> ScanRequest {
    ScanRequest {
        win_mev: 2.1,
        first_cavity: first,
        last_cavity: last,
        first_phase_deg: -180.0,
        last_phase_deg: 180.0,
        phase_step_deg: step,
        settle_delay: Duration::ZERO,
        read_delay: Duration::ZERO,
        num_read,
        mode,
    }
}

/// What the fitter was called with
#[derive(Debug, Clone, PartialEq)]
pub struct FitCall {
    pub win_mev: f64,
    pub points: usize,
}

/// Fitter returning scripted (energy gain, error metric) pairs in call order
pub struct ScriptedFitter {
    script: Mutex<VecDeque<(f64, f64)>>,
    calls: Mutex<Vec<FitCall>>,
}

impl ScriptedFitter {
    pub fn new(script: &[(f64, f64)]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<FitCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl CurveFitter for ScriptedFitter {
    fn fit(&self, input: &FitInput<'_>) -> Result<FitOutcome, FitError> {
        self.calls.lock().unwrap().push(FitCall {
            win_mev: input.win_mev,
            points: input.series.len(),
        });
        let (energy_gain, error_metric) = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .expect("fitter called more often than scripted");
        Ok(FitOutcome {
            rf_phase: 12.5,
            energy_gain,
            amplitude: 3.0,
            error_metric,
            plot_curve: vec![(-180.0, 0.0), (0.0, 1.0)],
        })
    }
}

/// Everything observed for one run
pub struct Outcome {
    pub events: Vec<ScanEvent>,
    pub termination: Termination,
    pub session: SessionState,
}

/// Collect events until `Finished`, failing the test after [`TIMEOUT`]
pub fn wait_finished(receiver: &Receiver<ScanEvent>) -> Outcome {
    let mut events = Vec::new();
    loop {
        let event = receiver
            .recv_timeout(TIMEOUT)
            .expect("run did not finish in time");
        if let ScanEvent::Finished {
            termination,
            session,
            ..
        } = &event
        {
            let termination = termination.clone();
            let session = session.clone();
            events.push(event);
            return Outcome {
                events,
                termination,
                session,
            };
        }
        events.push(event);
    }
}

/// Count events matching `predicate`
pub fn count(events: &[ScanEvent], predicate: impl Fn(&ScanEvent) -> bool) -> usize {
    events.iter().filter(|e| predicate(e)).count()
}

/// Rendezvous between the worker (inside a mock hook) and the test thread.
///
/// The first `put` of `phase` to `channel` parks the worker until the test
/// calls [`Gate::release`].
pub struct Gate {
    reached: Receiver<()>,
    release: Sender<()>,
}

impl Gate {
    /// Install the gate as `backend`'s hook
    pub fn install(backend: MockBackend, channel: &str, phase: f64) -> (MockBackend, Gate) {
        let (reached_tx, reached_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        let fired = AtomicBool::new(false);
        let channel = channel.to_string();

        let backend = backend.with_hook(move |op, _ordinal| {
            let hit = matches!(
                op,
                ChannelOp::Put { name, value } if *name == channel && *value == phase
            );
            if hit && !fired.swap(true, Ordering::SeqCst) {
                let _ = reached_tx.send(());
                let _ = release_rx.recv_timeout(TIMEOUT);
            }
        });
        (
            backend,
            Gate {
                reached: reached_rx,
                release: release_tx,
            },
        )
    }

    /// Block until the worker is parked at the gate
    pub fn wait_reached(&self) {
        self.reached
            .recv_timeout(TIMEOUT)
            .expect("worker never reached the gate");
    }

    /// Let the worker continue
    pub fn release(&self) {
        self.release.send(()).unwrap();
    }
}
