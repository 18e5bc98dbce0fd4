//! The processor contract and the reference processors built on it.
//!
//! Every step of a reduction implements [`Processor`]. The pipeline never
//! calls [`Processor::process`] directly; it goes through [`apply`], which
//! checks the input category, isolates panics, and records provenance on
//! every block that survives the step.

pub mod cache;
pub mod calibration;
pub mod csvlog;
pub mod database;
mod error;
pub mod plotter;
pub mod registry;
pub mod sources;
pub mod utils;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{SecondsFormat, Utc};

use crate::consts::{
    PACKAGE_NAME, PACKAGE_VERSION, REDUCER_KEY, REDUCTION_MACHINE_KEY, REDUCTION_SOFTWARE_KEY,
    REDUCTION_TIME_KEY,
};
use crate::data::{Batch, DataKind, Dataset};
use crate::error::{DrpError, Result};

pub use error::{ErrorClass, ProcessorError};

/// Result type of a single processing step.
pub type StepResult<T> = std::result::Result<T, ProcessorError>;

/// Closed set of processor categories, by input and output data kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessorKind {
    ImageToImage,
    ImageToSources,
    SourcesToSources,
}

impl ProcessorKind {
    pub fn input(self) -> DataKind {
        match self {
            Self::ImageToImage | Self::ImageToSources => DataKind::Image,
            Self::SourcesToSources => DataKind::SourceTable,
        }
    }

    pub fn output(self) -> DataKind {
        match self {
            Self::ImageToImage => DataKind::Image,
            Self::ImageToSources | Self::SourcesToSources => DataKind::SourceTable,
        }
    }
}

impl std::fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ImageToImage => write!(f, "image -> image"),
            Self::ImageToSources => write!(f, "image -> sources"),
            Self::SourcesToSources => write!(f, "sources -> sources"),
        }
    }
}

/// Something that must have run earlier in the same configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requirement {
    /// A processor with this key.
    Key(&'static str),
    /// Any processor of this category.
    Kind(ProcessorKind),
}

/// Summary of a step that precedes another in a configuration.
#[derive(Clone, Debug)]
pub struct PrecedingStep {
    pub key: &'static str,
    pub kind: ProcessorKind,
}

impl PrecedingStep {
    pub fn of(processor: &dyn Processor) -> Self {
        Self {
            key: processor.key(),
            kind: processor.kind(),
        }
    }
}

/// Run-wide values handed to every step.
#[derive(Clone, Debug)]
pub struct StepContext {
    /// Night being reduced, `YYYYMMDD`.
    pub night: String,
    /// Directory name of the night below the output and raw roots.
    pub night_sub_dir: String,
    pub output_root: PathBuf,
    pub raw_root: PathBuf,
}

impl StepContext {
    pub fn new(night: &str, raw_root: &Path, output_root: &Path) -> Self {
        Self {
            night: night.to_string(),
            night_sub_dir: night.to_string(),
            output_root: output_root.to_path_buf(),
            raw_root: raw_root.to_path_buf(),
        }
    }

    /// `{output_root}/{night_sub_dir}`
    pub fn night_output_dir(&self) -> PathBuf {
        self.output_root.join(&self.night_sub_dir)
    }

    /// `{output_root}/{night_sub_dir}/{sub_dir}`
    pub fn output_dir(&self, sub_dir: &str) -> PathBuf {
        self.night_output_dir().join(sub_dir)
    }

    /// `{raw_root}/{night_sub_dir}/{sub_dir}`
    pub fn raw_dir(&self, sub_dir: &str) -> PathBuf {
        self.raw_root.join(&self.night_sub_dir).join(sub_dir)
    }
}

/// One step of a reduction.
///
/// Implementations transform a whole [`Batch`] at once. They may rename
/// blocks, edit headers, and replace payloads, but the processing history
/// and failure flag are managed by [`apply`].
pub trait Processor: Send + Sync {
    /// Unique identifier, recorded in the history of every processed block.
    fn key(&self) -> &'static str;

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::ImageToImage
    }

    fn description(&self) -> String {
        self.key().to_string()
    }

    fn requirements(&self) -> &[Requirement] {
        &[]
    }

    /// Check that every [`Requirement`] is met by `preceding`.
    fn check_prerequisites(&self, preceding: &[PrecedingStep]) -> Result<()> {
        for req in self.requirements() {
            let met = match req {
                Requirement::Key(k) => preceding.iter().any(|p| p.key == *k),
                Requirement::Kind(kind) => preceding.iter().any(|p| p.kind == *kind),
            };
            if !met {
                return Err(DrpError::Prerequisite {
                    processor: self.key().to_string(),
                    missing: match req {
                        Requirement::Key(k) => k.to_string(),
                        Requirement::Kind(kind) => kind.to_string(),
                    },
                    preceding: preceding.iter().map(|p| p.key.to_string()).collect(),
                });
            }
        }
        Ok(())
    }

    fn process(&self, batch: Batch, ctx: &StepContext) -> StepResult<Batch>;

    /// Reorganise the dataset after every batch has gone through
    /// [`process`](Self::process). Splitting and merging processors
    /// override this.
    fn regroup(&self, dataset: Dataset) -> Dataset {
        dataset
    }

    /// Files this step writes that are worth attaching to a run summary.
    fn artifacts(&self, _ctx: &StepContext) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Apply `processor` to `batch`, enforcing the processor contract.
///
/// On success every output block gets one history record for this step and
/// the reducer provenance keys. On failure nothing is recorded.
pub fn apply(processor: &dyn Processor, batch: Batch, ctx: &StepContext) -> StepResult<Batch> {
    let kind = processor.kind();
    if let Some(found) = batch.kind() {
        if found != kind.input() {
            return Err(ProcessorError::WrongInput {
                expected: kind.input(),
                found,
            });
        }
    }

    let input_names = batch.base_names().join(", ");
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| processor.process(batch, ctx)));
    let mut output = match outcome {
        Ok(result) => result?,
        Err(payload) => return Err(ProcessorError::Unexpected(panic_message(payload.as_ref()))),
    };

    if let Some(found) = output.kind() {
        if found != kind.output() {
            return Err(ProcessorError::Unexpected(format!(
                "{} returned {found} data, expected {}",
                processor.key(),
                kind.output()
            )));
        }
    }

    if kind == ProcessorKind::ImageToSources {
        let rows: usize = output
            .iter()
            .filter_map(|b| b.as_sources())
            .map(|s| s.data().len())
            .sum();
        if rows == 0 {
            return Err(ProcessorError::NoSources(input_names));
        }
    }

    let provenance = Provenance::current();
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    for block in output.iter_mut() {
        block.state_mut().record_step(processor.key());
        let header = block.header_mut();
        header.insert(REDUCER_KEY, provenance.reducer.as_str());
        header.insert(REDUCTION_MACHINE_KEY, provenance.machine.as_str());
        header.insert(REDUCTION_TIME_KEY, stamp.as_str());
        header.insert(REDUCTION_SOFTWARE_KEY, provenance.software.as_str());
    }
    Ok(output)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "processor panicked".to_string()
    }
}

/// Who and what reduced the data, resolved once per process.
struct Provenance {
    reducer: String,
    machine: String,
    software: String,
}

impl Provenance {
    fn current() -> &'static Provenance {
        static PROVENANCE: OnceLock<Provenance> = OnceLock::new();
        PROVENANCE.get_or_init(|| Provenance {
            reducer: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| "unknown".to_string()),
            machine: std::fs::read_to_string("/etc/hostname")
                .map(|s| s.trim().to_string())
                .ok()
                .filter(|s| !s.is_empty())
                .or_else(|| std::env::var("HOSTNAME").ok())
                .unwrap_or_else(|| "unknown".to_string()),
            software: format!("{PACKAGE_NAME}-{PACKAGE_VERSION}"),
        })
    }
}
