//! Manual-mode session export and import
//!
//! An export holds the last accepted cavity's fit parameters and sweep so the
//! fit can be redone offline without touching hardware. Tab-separated text:
//!
//! ```text
//! distance  synchPhase  fieldProfile  stepRadians  slope  peakFieldFactor  [win]
//! phase     bpmPhase    rms
//! ...
//! ```
//!
//! `win` is optional on import; without it the caller supplies the energy.
//! The first phase is taken from the first sample.

use std::path::Path;

use tracing::info;

use crate::collector::{SweepSample, SweepSeries};
use crate::error::{ExportError, ImportParseError};
use crate::fitter::{CurveFitter, FitError, FitInput, FitOutcome, FitParameters};
use crate::sequencer::SessionState;

/// A cavity's fit inputs as exported
#[derive(Debug, Clone, PartialEq)]
pub struct SessionExport {
    /// Fit parameters; `first_phase_deg` equals the first sample's phase
    pub params: FitParameters,
    /// Energy entering the cavity, when recorded
    pub win_mev: Option<f64>,
    /// Sweep samples in sweep order
    pub series: SweepSeries,
}

impl SessionExport {
    /// Export of the session's retained cavity, if any
    pub fn from_session(state: &SessionState) -> Option<Self> {
        state.retained.as_ref().map(|retained| Self {
            params: retained.params.clone(),
            win_mev: Some(retained.win_mev),
            series: retained.series.clone(),
        })
    }

    /// Render as export text
    pub fn to_text(&self) -> Result<String, ExportError> {
        let p = &self.params;
        if p.field_profile.contains(['\t', '\n', '\r']) || p.field_profile.is_empty() {
            return Err(ExportError::UnwritableFieldProfile(p.field_profile.clone()));
        }

        let mut header = vec![
            p.distance_m.to_string(),
            p.synch_phase_deg.to_string(),
            p.field_profile.clone(),
            p.step_radians.to_string(),
            p.slope.to_string(),
            p.peak_field_factor.to_string(),
        ];
        if let Some(win) = self.win_mev {
            header.push(win.to_string());
        }

        let mut text = header.join("\t");
        text.push('\n');
        for s in self.series.samples() {
            text.push_str(&format!(
                "{}\t{}\t{}\n",
                s.phase, s.mean_bpm_phase, s.rms_bpm_phase
            ));
        }
        Ok(text)
    }

    /// Write the export to `path`
    pub fn save_to_file(&self, path: &Path) -> Result<(), ExportError> {
        std::fs::write(path, self.to_text()?)?;
        Ok(())
    }

    /// Re-run the fit on the exported sweep.
    ///
    /// Uses the recorded energy, or `fallback_win_mev` when none was recorded.
    pub fn refit(
        &self,
        fitter: &dyn CurveFitter,
        fallback_win_mev: f64,
    ) -> Result<FitOutcome, FitError> {
        fitter.fit(&FitInput {
            series: &self.series,
            win_mev: self.win_mev.unwrap_or(fallback_win_mev),
            params: &self.params,
        })
    }
}

/// Write the session's retained cavity to `path`
pub fn export_session(state: &SessionState, path: &Path) -> Result<SessionExport, ExportError> {
    let export = SessionExport::from_session(state).ok_or(ExportError::NothingRetained)?;
    export.save_to_file(path)?;
    info!(
        "Exported {} samples to {}",
        export.series.len(),
        path.display()
    );
    Ok(export)
}

fn number(line: usize, field: &'static str, text: &str) -> Result<f64, ImportParseError> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| ImportParseError::InvalidNumber {
            line,
            field,
            value: text.to_string(),
        })
}

/// Parse export text
pub fn parse_export(text: &str) -> Result<SessionExport, ImportParseError> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim_end_matches('\r')))
        .filter(|(_, line)| !line.trim().is_empty());

    let (header_line, header) = lines.next().ok_or(ImportParseError::Empty)?;
    let fields: Vec<&str> = header.split('\t').collect();
    if fields.len() != 6 && fields.len() != 7 {
        return Err(ImportParseError::HeaderFieldCount { got: fields.len() });
    }
    let distance_m = number(header_line, "distance", fields[0])?;
    let synch_phase_deg = number(header_line, "synch phase", fields[1])?;
    let field_profile = fields[2].trim().to_string();
    let step_radians = number(header_line, "step", fields[3])?;
    let slope = number(header_line, "slope", fields[4])?;
    let peak_field_factor = number(header_line, "peak field factor", fields[5])?;
    let win_mev = match fields.get(6) {
        Some(win) => Some(number(header_line, "win", win)?),
        None => None,
    };

    let mut samples = Vec::new();
    for (line, text) in lines {
        let fields: Vec<&str> = text.split('\t').collect();
        if fields.len() != 3 {
            return Err(ImportParseError::SampleFieldCount {
                line,
                got: fields.len(),
            });
        }
        samples.push(SweepSample {
            phase: number(line, "phase", fields[0])?,
            mean_bpm_phase: number(line, "bpm phase", fields[1])?,
            rms_bpm_phase: number(line, "rms", fields[2])?,
        });
    }
    let first_phase_deg = samples.first().ok_or(ImportParseError::NoSamples)?.phase;

    Ok(SessionExport {
        params: FitParameters {
            distance_m,
            synch_phase_deg,
            field_profile,
            step_radians,
            first_phase_deg,
            slope,
            peak_field_factor,
        },
        win_mev,
        series: SweepSeries::from_samples(samples),
    })
}

/// Read and parse an export file
pub fn import_from_file(path: &Path) -> Result<SessionExport, ImportParseError> {
    let text = std::fs::read_to_string(path)?;
    parse_export(&text)
}
