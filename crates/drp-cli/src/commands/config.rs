use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use drp_core::config::DrpConfig;

#[derive(Args)]
pub struct ConfigArgs {
    /// Write config to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print the built-in defaults instead of the effective configuration
    #[arg(long)]
    pub defaults: bool,
}

/// Print or save the configuration as TOML.
pub fn run(args: &ConfigArgs, config: &DrpConfig) -> Result<()> {
    let config = if args.defaults {
        DrpConfig::default()
    } else {
        config.clone()
    };
    let toml_str = config.to_toml()?;

    if let Some(ref path) = args.output {
        std::fs::write(path, &toml_str)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        println!("Config saved to {}", path.display());
    } else {
        print!("{}", toml_str);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let text = DrpConfig::default().to_toml().unwrap();
        let parsed = DrpConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.paths.raw_data_dir, DrpConfig::default().paths.raw_data_dir);
        assert_eq!(parsed.monitor.raw_sub_dir, DrpConfig::default().monitor.raw_sub_dir);
    }

    #[test]
    fn writes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drp.toml");
        let args = ConfigArgs {
            output: Some(path.clone()),
            defaults: true,
        };
        run(&args, &DrpConfig::default()).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[paths]"));
        assert!(DrpConfig::from_toml(&written).is_ok());
    }
}
