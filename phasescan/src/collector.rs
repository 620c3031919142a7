//! Per-cavity phase sweep
//!
//! For each setpoint the collector commands the cavity, confirms settling per
//! the cavity's policy, averages repeated BPM reads and records the point in
//! memory, in the cavity's sweep log and as a progress event.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use hardware::{ChannelError, ChannelResult, ChannelSession, HardwareChannel};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::control::{Cancelled, RunControl, RunStatus};
use crate::error::SweepError;
use crate::events::{EventSink, ScanEvent};
use crate::profile::{CavityProfile, ConfirmPolicy};
use crate::request::ScanRequest;
use crate::settings::SettleSettings;
use crate::stats::ReadStats;

/// One swept setpoint and the averaged BPM response
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepSample {
    /// Commanded cavity phase in degrees
    pub phase: f64,
    /// Mean BPM phase over the averaged reads
    pub mean_bpm_phase: f64,
    /// Population standard deviation of the reads
    pub rms_bpm_phase: f64,
}

/// Sweep points in sweep order. Append-only while sweeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepSeries {
    samples: Vec<SweepSample>,
}

impl SweepSeries {
    /// Empty series
    pub fn new() -> Self {
        Self::default()
    }

    /// Series from already-ordered samples (e.g. an imported export)
    pub fn from_samples(samples: Vec<SweepSample>) -> Self {
        Self { samples }
    }

    pub(crate) fn push(&mut self, sample: SweepSample) {
        self.samples.push(sample);
    }

    /// Number of points
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when no point was taken
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Points in sweep order
    pub fn samples(&self) -> &[SweepSample] {
        &self.samples
    }

    /// Commanded phases
    pub fn phases(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.phase).collect()
    }

    /// Mean BPM phases
    pub fn means(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.mean_bpm_phase).collect()
    }
}

/// Append-only text log of one cavity's sweep, one `phase\tmean\trms` line per point
pub struct PointLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl PointLog {
    /// Create the log. Fails if the file already exists.
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    /// Append one point and flush it to disk
    pub fn append(&mut self, sample: &SweepSample) -> std::io::Result<()> {
        writeln!(
            self.writer,
            "{}\t{}\t{}",
            sample.phase, sample.mean_bpm_phase, sample.rms_bpm_phase
        )?;
        self.writer.flush()
    }

    /// Flush and close
    pub fn close(mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    /// Log file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The three channels a cavity sweep uses
pub struct CavityChannels {
    set: Box<dyn HardwareChannel>,
    readback: Option<Box<dyn HardwareChannel>>,
    bpm: Box<dyn HardwareChannel>,
}

impl CavityChannels {
    /// Open the cavity's set, readback and BPM channels
    pub fn open(session: &mut dyn ChannelSession, profile: &CavityProfile) -> ChannelResult<Self> {
        let set = session.open(&profile.set_channel)?;
        let readback = if profile.has_independent_readback() {
            Some(session.open(&profile.readback_channel)?)
        } else {
            None
        };
        let bpm = session.open(&profile.bpm_channel)?;
        Ok(Self { set, readback, bpm })
    }

    /// Command the cavity phase
    pub fn command(&mut self, phase: f64) -> ChannelResult<()> {
        self.set.put(phase)
    }

    /// Read the cavity phase (from the setpoint channel when there is no readback)
    pub fn read_back(&mut self) -> ChannelResult<f64> {
        match self.readback.as_mut() {
            Some(readback) => readback.get(),
            None => self.set.get(),
        }
    }

    fn readback_name(&self) -> &str {
        match &self.readback {
            Some(readback) => readback.name(),
            None => self.set.name(),
        }
    }

    /// Read the BPM phase
    pub fn read_bpm(&mut self) -> ChannelResult<f64> {
        self.bpm.get()
    }
}

enum Stop {
    Cancelled,
    Channel(ChannelError),
}

impl From<Cancelled> for Stop {
    fn from(_: Cancelled) -> Self {
        Stop::Cancelled
    }
}

impl From<ChannelError> for Stop {
    fn from(e: ChannelError) -> Self {
        Stop::Channel(e)
    }
}

/// Drives one cavity's sweep
pub struct SampleCollector<'a> {
    control: &'a RunControl,
    events: &'a EventSink,
    settle: &'a SettleSettings,
}

impl<'a> SampleCollector<'a> {
    /// Create a collector bound to a run's control block and event sink
    pub fn new(
        control: &'a RunControl,
        events: &'a EventSink,
        settle: &'a SettleSettings,
    ) -> Self {
        Self {
            control,
            events,
            settle,
        }
    }

    /// Sweep `profile` through the request's setpoints.
    ///
    /// Returns the complete series, or `SweepError::Cancelled` carrying the
    /// points taken before cancellation was observed.
    pub fn sweep(
        &self,
        index: usize,
        profile: &CavityProfile,
        channels: &mut CavityChannels,
        request: &ScanRequest,
        log: &mut PointLog,
    ) -> Result<SweepSeries, SweepError> {
        let mut series = SweepSeries::new();

        for phase in request.setpoints() {
            if self.control.is_cancelled() {
                return Err(SweepError::Cancelled { partial: series });
            }
            if self.control.status() == RunStatus::Paused {
                info!("{}: paused before {:.1} deg", profile.name, phase);
                self.events.emit(ScanEvent::Paused {
                    index,
                    next_phase: phase,
                });
                if self.control.wait_while_paused().is_err() {
                    return Err(SweepError::Cancelled { partial: series });
                }
                info!("{}: resumed at {:.1} deg", profile.name, phase);
                self.events.emit(ScanEvent::Resumed {
                    index,
                    next_phase: phase,
                });
            }

            let stats = match self.measure_point(profile, channels, request, phase) {
                Ok(stats) => stats,
                Err(Stop::Cancelled) => return Err(SweepError::Cancelled { partial: series }),
                Err(Stop::Channel(e)) => return Err(SweepError::Channel(e)),
            };

            let sample = SweepSample {
                phase,
                mean_bpm_phase: stats.mean,
                rms_bpm_phase: stats.rms,
            };
            debug!(
                "{}: {:.1} deg -> {:.3} +/- {:.3}",
                profile.name, phase, stats.mean, stats.rms
            );
            series.push(sample);
            log.append(&sample)?;
            self.events.emit(ScanEvent::Progress {
                index,
                phase,
                series: series.samples().to_vec(),
            });
        }

        Ok(series)
    }

    fn measure_point(
        &self,
        profile: &CavityProfile,
        channels: &mut CavityChannels,
        request: &ScanRequest,
        phase: f64,
    ) -> Result<ReadStats, Stop> {
        match profile.confirm_policy {
            ConfirmPolicy::ClosedLoop => self.confirm_closed_loop(channels, phase)?,
            ConfirmPolicy::FixedRetry => self.put_fixed_retry(channels, phase)?,
        }
        self.control.sleep(request.settle_delay)?;

        let mut reads = Vec::with_capacity(request.num_read);
        for i in 0..request.num_read {
            self.control.checkpoint()?;
            reads.push(channels.read_bpm()?);
            if i + 1 < request.num_read {
                self.control.sleep(request.read_delay)?;
            }
        }

        // num_read >= 1 is enforced by request validation; an empty read set
        // only happens if that was bypassed.
        ReadStats::from_reads(&reads).ok_or(Stop::Channel(ChannelError::ReadTimeout {
            name: profile.bpm_channel.clone(),
        }))
    }

    fn confirm_closed_loop(&self, channels: &mut CavityChannels, phase: f64) -> Result<(), Stop> {
        let attempts = self.settle.confirm_max_attempts.max(1);
        let mut last = f64::NAN;

        for attempt in 1..=attempts {
            self.control.checkpoint()?;
            channels.command(phase)?;
            self.control.sleep(self.settle.confirm_interval())?;
            self.control.checkpoint()?;
            last = channels.read_back()?;
            if (last - phase).abs() < self.settle.confirm_window_deg {
                return Ok(());
            }
            debug!(
                "{}: readback {:.2} != {:.2} (attempt {}/{})",
                channels.readback_name(),
                last,
                phase,
                attempt,
                attempts
            );
        }

        warn!(
            "{}: did not settle at {:.2} after {} attempts",
            channels.readback_name(),
            phase,
            attempts
        );
        Err(Stop::Channel(ChannelError::SettleTimeout {
            name: channels.readback_name().to_string(),
            target: phase,
            last,
            attempts,
        }))
    }

    fn put_fixed_retry(&self, channels: &mut CavityChannels, phase: f64) -> Result<(), Stop> {
        for _ in 0..self.settle.retry_count.max(1) {
            self.control.checkpoint()?;
            channels.command(phase)?;
            self.control.sleep(self.settle.retry_interval())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::CavityCategory;
    use crate::request::ScanMode;
    use approx::assert_relative_eq;
    use hardware::{ChannelBackend, ChannelOp, MockBackend, ReadbackMode};
    use std::time::Duration;
    use tempfile::TempDir;

    fn profile(policy: ConfirmPolicy) -> CavityProfile {
        let readback = match policy {
            ConfirmPolicy::ClosedLoop => "RB",
            ConfirmPolicy::FixedRetry => "SET",
        };
        CavityProfile {
            name: "cav".to_string(),
            set_channel: "SET".to_string(),
            readback_channel: readback.to_string(),
            bpm_channel: "BPM".to_string(),
            distance_m: 0.1,
            synch_phase_deg: -20.0,
            field_profile: "Exyz.txt".to_string(),
            slope: 1.0,
            category: CavityCategory::HalfWave,
            peak_field_override: None,
            confirm_policy: policy,
        }
    }

    fn request(first: f64, last: f64, step: f64, num_read: usize) -> ScanRequest {
        ScanRequest {
            win_mev: 2.1,
            first_cavity: 0,
            last_cavity: 0,
            first_phase_deg: first,
            last_phase_deg: last,
            phase_step_deg: step,
            settle_delay: Duration::ZERO,
            read_delay: Duration::ZERO,
            num_read,
            mode: ScanMode::Auto,
        }
    }

    struct Fixture {
        _dir: TempDir,
        log_path: PathBuf,
        log: PointLog,
        control: RunControl,
        sink: EventSink,
        settle: SettleSettings,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("cav.txt");
        let log = PointLog::create(&log_path).unwrap();
        let (sink, _receiver) = EventSink::channel();
        Fixture {
            _dir: dir,
            log_path,
            log,
            control: RunControl::new(),
            sink,
            settle: SettleSettings::immediate(),
        }
    }

    #[test]
    fn test_fixed_retry_sweep() {
        let backend = MockBackend::new()
            .with_setpoint("SET")
            .with_response("BPM", "SET", |phase| phase / 10.0);
        let mut session = backend.connect().unwrap();
        let profile = profile(ConfirmPolicy::FixedRetry);
        let mut channels = CavityChannels::open(session.as_mut(), &profile).unwrap();
        let mut fx = fixture();

        let collector = SampleCollector::new(&fx.control, &fx.sink, &fx.settle);
        let series = collector
            .sweep(0, &profile, &mut channels, &request(0.0, 30.0, 10.0, 4), &mut fx.log)
            .unwrap();
        fx.log.close().unwrap();

        assert_eq!(series.phases(), vec![0.0, 10.0, 20.0]);
        assert_relative_eq!(series.means()[2], 2.0);
        assert_relative_eq!(series.samples()[2].rms_bpm_phase, 0.0);
        // Three puts per point, four reads per point
        assert_eq!(
            backend.puts_to("SET"),
            vec![0.0, 0.0, 0.0, 10.0, 10.0, 10.0, 20.0, 20.0, 20.0]
        );
        assert_eq!(backend.reads_from("BPM"), 12);

        let log = std::fs::read_to_string(&fx.log_path).unwrap();
        assert_eq!(log, "0\t0\t0\n10\t1\t0\n20\t2\t0\n");
    }

    #[test]
    fn test_closed_loop_confirms_before_reading() {
        let backend = MockBackend::new()
            .with_setpoint("SET")
            .with_readback("RB", "SET", ReadbackMode::Offset(1.0))
            .with_response("BPM", "SET", |_| 5.0);
        let mut session = backend.connect().unwrap();
        let profile = profile(ConfirmPolicy::ClosedLoop);
        let mut channels = CavityChannels::open(session.as_mut(), &profile).unwrap();
        let mut fx = fixture();

        let collector = SampleCollector::new(&fx.control, &fx.sink, &fx.settle);
        collector
            .sweep(0, &profile, &mut channels, &request(0.0, 10.0, 10.0, 1), &mut fx.log)
            .unwrap();

        let ops = backend.ops();
        assert_eq!(ops.len(), 3);
        assert!(matches!(&ops[0], ChannelOp::Put { name, .. } if name == "SET"));
        assert!(matches!(&ops[1], ChannelOp::Get { name, .. } if name == "RB"));
        assert!(matches!(&ops[2], ChannelOp::Get { name, .. } if name == "BPM"));
    }

    #[test]
    fn test_closed_loop_gives_up() {
        let backend = MockBackend::new()
            .with_setpoint("SET")
            .with_readback("RB", "SET", ReadbackMode::Stuck(90.0))
            .with_response("BPM", "SET", |_| 0.0);
        let mut session = backend.connect().unwrap();
        let profile = profile(ConfirmPolicy::ClosedLoop);
        let mut channels = CavityChannels::open(session.as_mut(), &profile).unwrap();
        let mut fx = fixture();
        fx.settle.confirm_max_attempts = 4;

        let collector = SampleCollector::new(&fx.control, &fx.sink, &fx.settle);
        let result =
            collector.sweep(0, &profile, &mut channels, &request(0.0, 10.0, 10.0, 1), &mut fx.log);

        match result {
            Err(SweepError::Channel(ChannelError::SettleTimeout { attempts, last, .. })) => {
                assert_eq!(attempts, 4);
                assert_relative_eq!(last, 90.0);
            }
            other => panic!("expected settle timeout, got {other:?}"),
        }
        assert_eq!(backend.puts_to("SET").len(), 4);
        assert_eq!(backend.reads_from("BPM"), 0);
    }

    #[test]
    fn test_cancelled_before_start_returns_empty_partial() {
        let backend = MockBackend::new()
            .with_setpoint("SET")
            .with_response("BPM", "SET", |_| 0.0);
        let mut session = backend.connect().unwrap();
        let profile = profile(ConfirmPolicy::FixedRetry);
        let mut channels = CavityChannels::open(session.as_mut(), &profile).unwrap();
        let mut fx = fixture();
        fx.control.cancel();

        let collector = SampleCollector::new(&fx.control, &fx.sink, &fx.settle);
        let result =
            collector.sweep(0, &profile, &mut channels, &request(0.0, 30.0, 10.0, 2), &mut fx.log);

        assert!(matches!(result, Err(SweepError::Cancelled { partial }) if partial.is_empty()));
        assert_eq!(backend.op_count(), 0);
    }

    #[test]
    fn test_bpm_fault_is_channel_error() {
        let backend = MockBackend::new()
            .with_setpoint("SET")
            .with_response("BPM", "SET", |_| 0.0)
            .with_get_fault("BPM", 3);
        let mut session = backend.connect().unwrap();
        let profile = profile(ConfirmPolicy::FixedRetry);
        let mut channels = CavityChannels::open(session.as_mut(), &profile).unwrap();
        let mut fx = fixture();

        let collector = SampleCollector::new(&fx.control, &fx.sink, &fx.settle);
        let result =
            collector.sweep(0, &profile, &mut channels, &request(0.0, 30.0, 10.0, 2), &mut fx.log);

        assert!(matches!(
            result,
            Err(SweepError::Channel(ChannelError::ReadTimeout { .. }))
        ));
        fx.log.close().unwrap();
        // Only the first point completed
        let log = std::fs::read_to_string(&fx.log_path).unwrap();
        assert_eq!(log.lines().count(), 1);
    }

    #[test]
    fn test_log_refuses_existing_file() {
        let fx = fixture();
        assert!(PointLog::create(&fx.log_path).is_err());
    }
}
