//! List command handler

use anyhow::{Context, Result};

use marksync_core::{Config, Tier};

use crate::output::Output;

/// List bookmarks from the disk tier, optionally filtered by tag
pub fn list(config: &Config, tag: Option<String>, output: &Output) -> Result<()> {
    let disk_path = config.disk_path();
    if !disk_path.exists() {
        output.message("No bookmarks stored yet. Run `marksync sync` first.");
        return Ok(());
    }

    let disk = Tier::open_disk(&disk_path)
        .with_context(|| format!("Failed to open disk tier at {:?}", disk_path))?;
    let records = match tag {
        Some(ref tag) => disk.records_with_tag(tag)?,
        None => disk.records()?,
    };

    output.print_records(&records);
    Ok(())
}
