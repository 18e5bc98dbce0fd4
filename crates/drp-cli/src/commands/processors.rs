use anyhow::Result;
use clap::Args;
use drp_core::pipeline::{get_instrument, instrument_names};

use crate::summary::print_processors;

#[derive(Args)]
pub struct ProcessorsArgs {
    /// Also list the configurations of this instrument
    #[arg(short, long)]
    pub pipeline: Option<String>,
}

pub fn run(args: &ProcessorsArgs) -> Result<()> {
    match &args.pipeline {
        Some(name) => {
            let instrument = get_instrument(name).map_err(|e| {
                anyhow::anyhow!("{e} (available: {})", instrument_names().join(", "))
            })?;
            print_processors(Some(instrument.as_ref()));
        }
        None => print_processors(None),
    }
    Ok(())
}
