//! Notifications from the scan worker to the presentation layer
//!
//! The worker never calls into the presentation layer. It posts typed
//! [`ScanEvent`] values on an unbounded channel and moves on; the receiver
//! drains them on its own thread at its own pace.

use std::path::PathBuf;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::debug;

use crate::collector::SweepSample;
use crate::sequencer::{SessionState, Termination};

/// Identifier of one scan run, unique per controller
pub type RunId = u64;

/// Events emitted for the presentation layer
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A worker has started
    RunStarted {
        run_id: RunId,
        first_cavity: usize,
        last_cavity: usize,
        log_dir: PathBuf,
    },
    /// A cavity sweep is about to begin
    CavityStarted {
        index: usize,
        name: String,
        expected_points: usize,
    },
    /// One sweep point completed; `series` is everything taken so far for this cavity
    Progress {
        index: usize,
        phase: f64,
        series: Vec<SweepSample>,
    },
    /// The worker is parked at a checkpoint
    Paused { index: usize, next_phase: f64 },
    /// The worker left a pause and continues with `next_phase`
    Resumed { index: usize, next_phase: f64 },
    /// Smooth fit curve for display
    FitCurve {
        index: usize,
        points: Vec<(f64, f64)>,
    },
    /// A cavity fit was accepted; `win_mev` already includes its energy gain
    CavityAccepted {
        index: usize,
        rf_phase: f64,
        win_mev: f64,
        amplitude: f64,
    },
    /// A cavity failed; `win_mev` is the energy entering it
    Error {
        index: usize,
        win_mev: f64,
        reason: String,
    },
    /// The run is over. Emitted exactly once per run.
    Finished {
        run_id: RunId,
        termination: Termination,
        session: SessionState,
    },
}

/// Non-blocking event sender
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: Sender<ScanEvent>,
}

impl EventSink {
    /// Create a sink and its receiving end
    pub fn channel() -> (Self, Receiver<ScanEvent>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { sender }, receiver)
    }

    /// Post an event. Never blocks; events are dropped once the receiver is gone.
    pub fn emit(&self, event: ScanEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Disconnected(event)) => {
                debug!("No event receiver, dropping {:?}", std::mem::discriminant(&event));
            }
            // Unbounded channel
            Err(TrySendError::Full(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_receiver_does_not_block() {
        let (sink, receiver) = EventSink::channel();
        drop(receiver);
        sink.emit(ScanEvent::Paused {
            index: 0,
            next_phase: 0.0,
        });
    }

    #[test]
    fn test_events_arrive_in_order() {
        let (sink, receiver) = EventSink::channel();
        for k in 0..3 {
            sink.emit(ScanEvent::Resumed {
                index: 0,
                next_phase: k as f64,
            });
        }
        let phases: Vec<f64> = receiver
            .try_iter()
            .map(|e| match e {
                ScanEvent::Resumed { next_phase, .. } => next_phase,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(phases, vec![0.0, 1.0, 2.0]);
    }
}
