//! Composition of processors into named configurations and their execution
//! over a [`Dataset`](crate::data::Dataset).

mod configuration;
mod instrument;
mod orchestrator;
mod types;

pub use configuration::ProcessorList;
pub use instrument::{
    configuration, generic_loader, get_instrument, instrument_names, CalRequirement,
    GenericInstrument, Instrument,
};
pub use orchestrator::{get_pipeline, Pipeline};
pub use types::{NoOpReporter, ProgressReporter};
