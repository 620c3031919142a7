use hardware::ChannelError;
use thiserror::Error;

use crate::collector::SweepSeries;

/// Malformed scan request, reported before any worker starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    /// A form field did not parse as a number.
    #[error("{field}: '{value}' is not a number")]
    NotNumeric {
        /// Field name.
        field: &'static str,
        /// Text as entered.
        value: String,
    },

    /// A cavity name is not in the table.
    #[error("unknown cavity '{0}'")]
    UnknownCavity(String),

    /// A cavity index is past the end of the table.
    #[error("cavity index {index} out of range (table has {len} cavities)")]
    CavityOutOfRange {
        /// Requested index.
        index: usize,
        /// Table length.
        len: usize,
    },

    /// First cavity comes after the last cavity.
    #[error("first cavity {first} is after last cavity {last}")]
    ReversedRange {
        /// First cavity index.
        first: usize,
        /// Last cavity index.
        last: usize,
    },

    /// Phase step is zero.
    #[error("phase step must be non-zero")]
    ZeroStep,

    /// Read count is zero.
    #[error("read count must be at least 1")]
    ZeroReadCount,

    /// A numeric field is NaN, infinite or out of its allowed range.
    #[error("{field} = {value} is invalid")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: f64,
    },
}

/// Why a single cavity sweep stopped before the last setpoint.
#[derive(Error, Debug)]
pub enum SweepError {
    /// Cancellation was observed; carries the points taken so far.
    #[error("sweep cancelled after {} points", partial.len())]
    Cancelled {
        /// Points completed before cancellation.
        partial: SweepSeries,
    },

    /// A hardware read or write failed, or a setpoint never settled.
    #[error("channel fault: {0}")]
    Channel(#[from] ChannelError),

    /// The per-cavity sweep log could not be written.
    #[error("sweep log error: {0}")]
    Log(#[from] std::io::Error),
}

/// Session export could not be written.
#[derive(Error, Debug)]
pub enum ExportError {
    /// The session holds no retained cavity (Auto mode, or nothing accepted).
    #[error("no accepted cavity retained for export")]
    NothingRetained,

    /// The field-profile identifier cannot be written as a single field.
    #[error("field profile '{0}' contains a tab or newline")]
    UnwritableFieldProfile(String),

    /// The file could not be written.
    #[error("cannot write export: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed session export file.
#[derive(Error, Debug)]
pub enum ImportParseError {
    /// The file could not be read.
    #[error("cannot read export: {0}")]
    Io(#[from] std::io::Error),

    /// The file has no header line.
    #[error("export is empty")]
    Empty,

    /// The header does not have the expected number of fields.
    #[error("header has {got} fields, expected 6 or 7")]
    HeaderFieldCount {
        /// Fields found.
        got: usize,
    },

    /// A sample line does not have three fields.
    #[error("line {line}: expected 3 fields, found {got}")]
    SampleFieldCount {
        /// 1-based line number.
        line: usize,
        /// Fields found.
        got: usize,
    },

    /// A field is not a number.
    #[error("line {line}: {field} '{value}' is not a number")]
    InvalidNumber {
        /// 1-based line number.
        line: usize,
        /// Field name.
        field: &'static str,
        /// Text found.
        value: String,
    },

    /// The header is present but there are no samples.
    #[error("export contains no samples")]
    NoSamples,
}
