//! Config command handlers

use std::path::Path;

use anyhow::{bail, Result};

use marksync_core::{Config, SourceConfig, SourceKind};

use crate::output::{Output, OutputFormat};

/// Show the effective configuration
pub fn show(config: &Config, config_path: &Path, output: &Output) -> Result<()> {
    match output.format {
        OutputFormat::Json => output.json(config),
        OutputFormat::Quiet => {
            println!("{}", config_path.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:           {}", config.data_dir.display());
            println!("  debounce_ms:        {}", config.debounce_ms);
            println!("  mirror:             {:?}", config.mirror);
            println!("  mirror_interval_ms: {}", config.mirror_interval_ms);
            println!("  log_level:          {}", config.log_level);
            println!("  sources:            {}", config.sources.len());
            for source in &config.sources {
                println!(
                    "    - {} ({}) {}",
                    source.name,
                    source.kind.as_str(),
                    source.bookmark_path().display()
                );
            }
            println!();
            println!("Config file: {}", config_path.display());
        }
    }

    Ok(())
}

/// Write a starter configuration with a Chromium source
pub fn init(config_path: &Path, force: bool, output: &Output) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    let mut config = Config::default();
    config.sources.push(SourceConfig::new(
        "chromium",
        SourceKind::Chrome,
        "~/.config/chromium",
    ));
    config.save_to(config_path)?;

    output.success(&format!("Wrote {}", config_path.display()));
    Ok(())
}
