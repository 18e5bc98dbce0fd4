//! Data containers passed between processors.
//!
//! The smallest unit is a [`DataBlock`] (one image or one source table).
//! Blocks are grouped into [`Batch`]es, which a processor handles atomically,
//! and batches are collected into a [`Dataset`], which a pipeline iterates.

mod batch;
mod block;
mod dataset;
pub mod fingerprint;
mod header;
mod history;
mod image;
pub mod storage;

pub use batch::Batch;
pub use block::{DataBlock, DataKind};
pub use dataset::Dataset;
pub use fingerprint::{fingerprint, FingerprintMode};
pub use header::{Header, HeaderValue};
pub use history::{ProcessingHistory, StepOutcome, StepRecord};
pub use image::{Image, SourceTable, Table};
pub(crate) use image::BlockState;
