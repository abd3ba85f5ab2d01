//! Status command handler

use anyhow::Result;

use marksync_core::{Config, Tier};

use crate::output::{Output, OutputFormat};

/// Show configured sources and the state of the disk tier
pub fn show(config: &Config, output: &Output) -> Result<()> {
    let disk_path = config.disk_path();
    let stored = if disk_path.exists() {
        Some(Tier::open_disk(&disk_path)?.count()?)
    } else {
        None
    };

    match output.format {
        OutputFormat::Json => {
            let sources: Vec<_> = config
                .sources
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "name": s.name,
                        "kind": s.kind.as_str(),
                        "path": s.bookmark_path(),
                        "available": s.bookmark_path().exists(),
                        "watch": s.watch,
                        "debounce_ms": config.debounce_for(s).as_millis() as u64,
                    })
                })
                .collect();
            output.json(&serde_json::json!({
                "disk": {
                    "path": disk_path,
                    "exists": stored.is_some(),
                    "records": stored,
                },
                "mirror": config.mirror,
                "sources": sources,
            }));
        }
        OutputFormat::Quiet => {
            println!("{}", stored.unwrap_or(0));
        }
        OutputFormat::Human => {
            println!("marksync Status");
            println!("===============");
            println!();
            println!("Storage:");
            println!("  Location: {}", disk_path.display());
            match stored {
                Some(count) => println!("  Bookmarks: {}", count),
                None => println!("  Bookmarks: (no disk tier yet)"),
            }
            println!("  Mirror:   {:?}", config.mirror);
            println!();
            println!("Sources:");
            if config.sources.is_empty() {
                println!("  (none configured)");
            }
            for source in &config.sources {
                let path = source.bookmark_path();
                println!(
                    "  {} ({}) {}{}",
                    source.name,
                    source.kind.as_str(),
                    path.display(),
                    if path.exists() { "" } else { " [missing]" }
                );
            }
        }
    }

    Ok(())
}
