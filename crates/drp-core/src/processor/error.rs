use thiserror::Error;

use crate::data::DataKind;
use crate::error::DrpError;

/// How a failed batch is treated by the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorClass {
    /// The batch is kept, marked failed, and carried forward.
    Noncritical,
    /// A recognised data problem: the batch is dropped.
    Domain,
    /// Anything else: the batch is dropped and full detail is logged.
    Unclassified,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Noncritical => write!(f, "noncritical"),
            Self::Domain => write!(f, "domain"),
            Self::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// Errors raised while a processor handles one batch.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("{0}")]
    Noncritical(String),

    #[error("Header key '{key}' missing from {name}")]
    MissingHeaderKey { key: String, name: String },

    #[error("Missing calibration: {0}")]
    MissingCalibration(String),

    #[error("No sources found in {0}")]
    NoSources(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Expected {expected} input, received {found}")]
    WrongInput { expected: DataKind, found: DataKind },

    #[error("{0}")]
    Domain(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid FITS file: {0}")]
    Fits(String),

    #[error("Unexpected failure: {0}")]
    Unexpected(String),
}

impl ProcessorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Noncritical(_) => ErrorClass::Noncritical,
            Self::MissingHeaderKey { .. }
            | Self::MissingCalibration(_)
            | Self::NoSources(_)
            | Self::Database(_)
            | Self::WrongInput { .. }
            | Self::Domain(_) => ErrorClass::Domain,
            Self::Io(_) | Self::Fits(_) | Self::Unexpected(_) => ErrorClass::Unclassified,
        }
    }

    /// Short stable name of the error variant, used to group reports.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Noncritical(_) => "Noncritical",
            Self::MissingHeaderKey { .. } => "MissingHeaderKey",
            Self::MissingCalibration(_) => "MissingCalibration",
            Self::NoSources(_) => "NoSources",
            Self::Database(_) => "Database",
            Self::WrongInput { .. } => "WrongInput",
            Self::Domain(_) => "Domain",
            Self::Io(_) => "Io",
            Self::Fits(_) => "Fits",
            Self::Unexpected(_) => "Unexpected",
        }
    }
}

impl From<DrpError> for ProcessorError {
    fn from(err: DrpError) -> Self {
        match err {
            DrpError::MissingHeaderKey { key, name } => Self::MissingHeaderKey { key, name },
            DrpError::DataType { expected, found } => Self::WrongInput { expected, found },
            DrpError::HeaderType { .. } | DrpError::Table(_) => Self::Domain(err.to_string()),
            DrpError::CalibrationNotFound(msg) => Self::MissingCalibration(msg),
            DrpError::Io(e) => Self::Io(e),
            DrpError::Fits(msg) => Self::Fits(msg),
            other => Self::Unexpected(other.to_string()),
        }
    }
}
