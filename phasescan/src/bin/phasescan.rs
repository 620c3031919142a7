//! Phase-scan command-line tool
//!
//! Subcommands:
//! - `run`: scan a cavity range against the simulated linac
//! - `refit`: re-run the fit on an exported session
//! - `table`: write the built-in cavity table as JSON
//! - `settings`: write the default sequencer settings as JSON

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use hardware::{SimCavity, SimulatedLinac};
use phasescan::profile::CavityCategory;
use phasescan::settings::SettleSettings;
use phasescan::{
    export_session, import_from_file, CavityTable, ScanController, ScanEvent,
    ScanForm, ScanMode, SequencerSettings, SessionState, Termination, TimeOfFlightFitter,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// RF frequency of the simulated linac
const SIM_RF_FREQUENCY_MHZ: f64 = 162.5;

/// How often operator input is checked while waiting for events
const OPERATOR_POLL: Duration = Duration::from_millis(100);

/// Linac cavity phase-scan controller
#[derive(Parser, Debug)]
#[command(name = "phasescan")]
#[command(about = "Sweep, fit and set RF cavity phases one cavity at a time")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan a cavity range against the simulated linac
    Run(RunArgs),

    /// Re-run the fit on an exported session without hardware
    Refit {
        /// Export file written by `run --export`
        input: PathBuf,

        /// Injected energy in MeV, used when the export has none
        #[arg(long, default_value = "2.1")]
        win: f64,
    },

    /// Write the built-in cavity table as JSON
    Table {
        #[arg(short, long, default_value = "cavities.json")]
        output: PathBuf,
    },

    /// Write the default sequencer settings as JSON
    Settings {
        #[arg(short, long, default_value = "phasescan_settings.json")]
        output: PathBuf,
    },
}

/// Scan request fields, as the operator would type them
#[derive(Args, Debug)]
struct ScanArgs {
    /// Injected beam energy in MeV
    #[arg(long, default_value = "2.1")]
    win: String,

    /// First cavity name
    #[arg(long, default_value = "buncher1")]
    first_cavity: String,

    /// Last cavity name
    #[arg(long, default_value = "hwr12")]
    last_cavity: String,

    /// First phase in degrees
    #[arg(long, default_value = "-180", allow_hyphen_values = true)]
    first_phase: String,

    /// Sweep bound in degrees (not swept)
    #[arg(long, default_value = "180", allow_hyphen_values = true)]
    last_phase: String,

    /// Signed phase step in degrees
    #[arg(long, default_value = "10", allow_hyphen_values = true)]
    phase_step: String,

    /// Wait after each setpoint before sampling, seconds
    #[arg(long, default_value = "0.5")]
    settle_delay: String,

    /// Wait between BPM reads, seconds
    #[arg(long, default_value = "1")]
    read_delay: String,

    /// BPM reads averaged per point
    #[arg(long, default_value = "5")]
    num_read: String,

    /// Manual keeps the last accepted sweep for export; Auto discards it
    #[arg(long, value_enum, default_value = "manual")]
    mode: ScanMode,
}

impl ScanArgs {
    fn to_form(&self) -> ScanForm {
        ScanForm {
            win_mev: self.win.clone(),
            first_cavity: self.first_cavity.clone(),
            last_cavity: self.last_cavity.clone(),
            first_phase: self.first_phase.clone(),
            last_phase: self.last_phase.clone(),
            phase_step: self.phase_step.clone(),
            settle_delay: self.settle_delay.clone(),
            read_delay: self.read_delay.clone(),
            num_read: self.num_read.clone(),
            mode: self.mode,
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    scan: ScanArgs,

    /// Sequencer settings JSON (defaults when omitted)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Cavity table JSON (built-in injector table when omitted)
    #[arg(long)]
    cavity_table: Option<PathBuf>,

    /// Write the retained Manual-mode session here when the run ends
    #[arg(long)]
    export: Option<PathBuf>,

    /// Seed for the simulated cavity crests and BPM noise
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Standard deviation of simulated BPM noise in degrees
    #[arg(long, default_value = "0.5")]
    noise_deg: f64,

    /// Zero the settle and inter-cavity waits from the settings file
    #[arg(long)]
    immediate: bool,
}

/// Operator commands typed on stdin
#[derive(Debug, Clone, Copy)]
enum Operator {
    Pause,
    Resume,
    Cancel,
}

fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args),
        Command::Refit { input, win } => refit(&input, win),
        Command::Table { output } => {
            CavityTable::injector()
                .save_to_file(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!("Wrote cavity table to {}", output.display());
            Ok(())
        }
        Command::Settings { output } => {
            SequencerSettings::default()
                .save_to_file(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!("Wrote default settings to {}", output.display());
            Ok(())
        }
    }
}

/// Simulated linac matching `table`, with seeded crest phases
fn simulated_linac(
    table: &CavityTable,
    injection_mev: f64,
    noise_deg: f64,
    seed: u64,
) -> Result<SimulatedLinac> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let cavities = table
        .iter()
        .map(|profile| SimCavity {
            set_channel: profile.set_channel.clone(),
            readback_channel: profile
                .has_independent_readback()
                .then(|| profile.readback_channel.clone()),
            bpm_channel: profile.bpm_channel.clone(),
            distance_m: profile.distance_m,
            crest_deg: rng.gen_range(-180.0..180.0),
            voltage_mv: match profile.category {
                CavityCategory::Buncher => 0.08,
                CavityCategory::HalfWave => 0.6,
            },
        })
        .collect();

    SimulatedLinac::new(
        cavities,
        injection_mev,
        SIM_RF_FREQUENCY_MHZ,
        noise_deg,
        seed.wrapping_add(1),
    )
    .map_err(|e| anyhow::anyhow!("Failed to build simulated linac: {e}"))
}

/// Forward `p`, `r`, `c` lines from stdin
fn spawn_operator_input() -> Receiver<Operator> {
    let (sender, receiver) = crossbeam_channel::unbounded();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            let command = match line.trim() {
                "p" | "pause" => Operator::Pause,
                "r" | "resume" => Operator::Resume,
                "c" | "cancel" => Operator::Cancel,
                "" => continue,
                other => {
                    warn!("Unknown command '{other}' (p = pause, r = resume, c = cancel)");
                    continue;
                }
            };
            if sender.send(command).is_err() {
                break;
            }
        }
    });
    receiver
}

fn run(args: RunArgs) -> Result<()> {
    let table = match &args.cavity_table {
        Some(path) => CavityTable::load_from_file(path)
            .with_context(|| format!("Failed to load cavity table {}", path.display()))?,
        None => CavityTable::injector(),
    };
    let mut settings = match &args.settings {
        Some(path) => SequencerSettings::load_from_file(path)
            .with_context(|| format!("Failed to load settings {}", path.display()))?,
        None => SequencerSettings::default(),
    };
    if args.immediate {
        settings.settle = SettleSettings::immediate();
        settings.inter_cavity_delay_secs = 0.0;
    }

    let form = args.scan.to_form();
    let request = form.parse(&table).context("Invalid scan request")?;
    let linac = simulated_linac(&table, request.win_mev, args.noise_deg, args.seed)?;

    let (mut controller, events) = ScanController::new(
        Arc::new(linac),
        Arc::new(TimeOfFlightFitter::default()),
        table,
        settings,
    );
    let run_id = controller.start(request).context("Invalid scan request")?;
    info!("Type p + Enter to pause, r to resume, c to cancel");

    let operator = spawn_operator_input();
    let (termination, session) = loop {
        while let Ok(command) = operator.try_recv() {
            match command {
                Operator::Pause => {
                    if !controller.pause() {
                        warn!("Nothing to pause");
                    }
                }
                Operator::Resume => {
                    if !controller.resume() {
                        warn!("Nothing to resume");
                    }
                }
                Operator::Cancel => controller.cancel(),
            }
        }
        match events.recv_timeout(OPERATOR_POLL) {
            Ok(event) => {
                if let Some(finished) = report(run_id, event) {
                    break finished;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => bail!("Scan worker exited without reporting"),
        }
    };
    controller.wait();

    summarize(controller.table(), &termination, &session);

    if let Some(path) = &args.export {
        if let Err(e) = export_session(&session, path) {
            warn!("No export written: {e}");
        }
    }

    if termination.is_aborted() {
        bail!("Scan aborted: {termination}");
    }
    Ok(())
}

/// Log one event; returns the final state once the run is finished
fn report(run_id: u64, event: ScanEvent) -> Option<(Termination, SessionState)> {
    match event {
        ScanEvent::RunStarted {
            run_id,
            first_cavity,
            last_cavity,
            log_dir,
        } => info!(
            "Run {run_id}: cavities {first_cavity}..={last_cavity}, logs in {}",
            log_dir.display()
        ),
        ScanEvent::CavityStarted {
            index,
            name,
            expected_points,
        } => info!("[{index}] {name}: {expected_points} points"),
        ScanEvent::Progress { index, phase, series } => {
            if let Some(last) = series.last() {
                info!(
                    "[{index}] {phase:7.1} deg -> {:8.3} +/- {:.3}",
                    last.mean_bpm_phase, last.rms_bpm_phase
                );
            }
        }
        ScanEvent::Paused { index, next_phase } => {
            info!("[{index}] paused, next phase {next_phase:.1} deg (r to resume)")
        }
        ScanEvent::Resumed { index, next_phase } => {
            info!("[{index}] resumed at {next_phase:.1} deg")
        }
        ScanEvent::FitCurve { index, points } => {
            info!("[{index}] fit curve with {} points", points.len())
        }
        ScanEvent::CavityAccepted {
            index,
            rf_phase,
            win_mev,
            amplitude,
        } => info!(
            "[{index}] accepted: rfPhase {rf_phase:.2} deg, Win {win_mev:.4} MeV, \
             amplitude {amplitude:.3}"
        ),
        ScanEvent::Error {
            index,
            win_mev,
            reason,
        } => error!("[{index}] failed at Win {win_mev:.4} MeV: {reason}"),
        ScanEvent::Finished {
            run_id: finished_id,
            termination,
            session,
        } => {
            if finished_id == run_id {
                return Some((termination, session));
            }
        }
    }
    None
}

fn summarize(table: &CavityTable, termination: &Termination, session: &SessionState) {
    for cavity in &session.accepted {
        info!(
            "{:>10}  rfPhase {:8.2} deg  gain {:8.4} MeV  Win {:8.4} MeV",
            cavity.name, cavity.rf_phase, cavity.energy_gain, cavity.win_mev
        );
    }
    match termination {
        Termination::FitRejected {
            name,
            win_at_failure,
            ..
        }
        | Termination::ChannelFault {
            name,
            win_at_failure,
            ..
        } => {
            let last = table
                .cavities
                .last()
                .map(|c| c.name.as_str())
                .unwrap_or(name.as_str());
            warn!(
                "Resume with: phasescan run --first-cavity {name} --last-cavity {last} \
                 --win {win_at_failure}"
            );
        }
        Termination::Completed => info!("Final Win {:.4} MeV", session.win_mev),
        Termination::Cancelled | Termination::Fault { .. } => {}
    }
}

fn refit(input: &Path, win: f64) -> Result<()> {
    let export = import_from_file(input)
        .with_context(|| format!("Failed to import {}", input.display()))?;
    let fitter = TimeOfFlightFitter::default();
    let outcome = export.refit(&fitter, win).context("Fit failed")?;

    info!(
        "{} samples, Win {:.4} MeV",
        export.series.len(),
        export.win_mev.unwrap_or(win)
    );
    info!(
        "rfPhase {:.2} deg, energy gain {:.4} MeV, amplitude {:.3}, error {:.3}",
        outcome.rf_phase, outcome.energy_gain, outcome.amplitude, outcome.error_metric
    );
    Ok(())
}
