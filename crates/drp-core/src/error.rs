use thiserror::Error;

use crate::data::DataKind;
use crate::report::ErrorReport;

#[derive(Error, Debug)]
pub enum DrpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid FITS file: {0}")]
    Fits(String),

    #[error("Header key '{key}' missing from {name}")]
    MissingHeaderKey { key: String, name: String },

    #[error("Header key '{key}' has type {found}, expected {expected}")]
    HeaderType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Cannot add {found} data to a container of {expected} data")]
    DataType { expected: DataKind, found: DataKind },

    #[error(
        "Processor '{processor}' requires '{missing}' as a prerequisite, \
         but only {preceding:?} run before it"
    )]
    Prerequisite {
        processor: String,
        missing: String,
        preceding: Vec<String>,
    },

    #[error("Malformed table: {0}")]
    Table(String),

    #[error("Unknown configuration '{name}' (available: {available:?})")]
    UnknownConfiguration { name: String, available: Vec<String> },

    #[error("Unknown instrument '{0}'")]
    UnknownInstrument(String),

    #[error("Unknown processor key '{0}'")]
    UnknownProcessor(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Directory watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Image format error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("No calibration images found for {0}")]
    CalibrationNotFound(String),

    #[error("Reduction aborted: {0}")]
    Aborted(Box<ErrorReport>),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, DrpError>;
