use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use drp_core::io::fits;

#[derive(Args)]
pub struct InfoArgs {
    /// Input FITS file
    pub file: PathBuf,

    /// Also report whether the data unit is fully written
    #[arg(long)]
    pub check: bool,
}

pub fn run(args: &InfoArgs) -> Result<()> {
    let (header, layout) = fits::read_header(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;

    println!("File:        {}", args.file.display());
    println!("Dimensions:  {}x{}", layout.width, layout.height);
    println!("BITPIX:      {}", layout.bitpix);
    if layout.bscale != 1.0 || layout.bzero != 0.0 {
        println!("Scaling:     {} * v + {}", layout.bscale, layout.bzero);
    }
    let data_mb = (layout.data_end()? - layout.data_offset) as f64 / (1024.0 * 1024.0);
    println!("Data size:   {:.1} MB", data_mb);
    if args.check {
        let complete = fits::is_complete(&args.file)?;
        println!("Complete:    {}", if complete { "yes" } else { "no" });
    }

    println!();
    for (key, value) in header.iter() {
        println!("{:<10}= {}", key, value);
    }

    Ok(())
}
