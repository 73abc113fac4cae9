use std::path::PathBuf;
use thiserror::Error;

/// Enum for errors in this crate
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// Error returned when a condition space or analysis is configured inconsistently
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Error returned when the output of a requested simulation run is missing
    #[error("No output for condition {condition}, rep {rep}: {} does not exist", path.display())]
    DataUnavailable {
        #[allow(missing_docs)]
        condition: String,
        #[allow(missing_docs)]
        rep: usize,
        #[allow(missing_docs)]
        path: PathBuf,
    },

    /// Error returned when a series is too short to estimate its correlation time
    #[error(
        "Series {tag} of condition {condition}, rep {rep} has {len} samples; at least {min} are needed"
    )]
    InsufficientData {
        #[allow(missing_docs)]
        condition: String,
        #[allow(missing_docs)]
        rep: usize,
        #[allow(missing_docs)]
        tag: String,
        #[allow(missing_docs)]
        len: usize,
        #[allow(missing_docs)]
        min: usize,
    },

    /// Error returned when the MBAR equations did not converge
    #[error("MBAR did not converge after {iterations} iterations (last relative change {delta:e})")]
    Estimation {
        #[allow(missing_docs)]
        iterations: usize,
        #[allow(missing_docs)]
        delta: f64,
    },

    /// Error returned when a linear system has no usable solution
    #[error("Singular matrix encountered while {0}")]
    Singular(&'static str),

    /// Error returned when a run does not record a tag that the analysis needs
    #[error("Tag {tag} is not recorded for condition {condition}, rep {rep}")]
    MissingTag {
        #[allow(missing_docs)]
        tag: String,
        #[allow(missing_docs)]
        condition: String,
        #[allow(missing_docs)]
        rep: usize,
    },

    /// Error returned when a reduced potential could not be evaluated
    #[error("Reduced potential of sample {n} at state {k} is not finite")]
    IncompletePotential {
        #[allow(missing_docs)]
        k: usize,
        #[allow(missing_docs)]
        n: usize,
    },

    /// Error returned when a file cannot be read or written
    #[error("I/O error on {}", path.display())]
    Io {
        #[allow(missing_docs)]
        path: PathBuf,
        #[allow(missing_docs)]
        #[source]
        source: std::io::Error,
    },

    /// Error returned when a table cannot be written
    #[error("Could not write table {}", path.display())]
    Table {
        #[allow(missing_docs)]
        path: PathBuf,
        #[allow(missing_docs)]
        #[source]
        source: csv::Error,
    },

    /// Error returned when a simulation output file is malformed
    #[error("{}:{line}: {message}", path.display())]
    Parse {
        #[allow(missing_docs)]
        path: PathBuf,
        #[allow(missing_docs)]
        line: usize,
        #[allow(missing_docs)]
        message: String,
    },

    /// Error returned when a builder's build() was called improperly
    #[error("Could not build: {0}")]
    BuilderError(String),

    /// Error returned when an array is the wrong length
    #[error("Array of length {0} is incorrect; length should be {1}")]
    ArrayLengthMismatch(usize, usize),
}

impl From<String> for AnalysisError {
    fn from(s: String) -> Self {
        Self::BuilderError(s)
    }
}

impl AnalysisError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn table(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        Self::Table {
            path: path.into(),
            source,
        }
    }
}

/// Result type for the remc-mbar crate
pub type Result<T> = std::result::Result<T, AnalysisError>;
