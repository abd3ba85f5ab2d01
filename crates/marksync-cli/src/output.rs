//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use marksync_core::{Record, SourceStatus};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print any serializable value as pretty JSON
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("Failed to serialize output: {}", e),
        }
    }

    /// Print stored records
    pub fn print_records(&self, records: &[Record]) {
        match self.format {
            OutputFormat::Human => {
                if records.is_empty() {
                    println!("No bookmarks found.");
                    return;
                }
                for record in records {
                    let tags = if record.tags.is_empty() {
                        String::new()
                    } else {
                        format!(" [{}]", record.tags)
                    };
                    println!(
                        "{} | {}{}",
                        truncate(&record.title, 35),
                        truncate(&record.url, 60),
                        tags
                    );
                }
                println!("\n{} bookmark(s)", records.len());
            }
            OutputFormat::Json => self.json(records),
            OutputFormat::Quiet => {
                for record in records {
                    println!("{}", record.url);
                }
            }
        }
    }

    /// Print per-source results of a sync or daemon run
    pub fn print_statuses(&self, statuses: &[SourceStatus]) {
        match self.format {
            OutputFormat::Human => {
                if statuses.is_empty() {
                    println!("No sources ran.");
                    return;
                }
                for status in statuses {
                    println!(
                        "{} ({}): {} - {} url(s), {} run(s)",
                        status.id,
                        status.kind,
                        status.state,
                        status.stats.url_count,
                        status.stats.runs
                    );
                    if let Some(ref watermark) = status.watermark {
                        println!("  watermark: {}", watermark.format("%Y-%m-%d %H:%M:%S"));
                    }
                    if let Some(ref error) = status.error {
                        println!("  error:     {}", error);
                    }
                }
            }
            OutputFormat::Json => self.json(statuses),
            OutputFormat::Quiet => {
                for status in statuses.iter().filter(|s| s.error.is_some()) {
                    println!("{}", status.id);
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a warning to stderr unless quiet
    pub fn warn(&self, msg: &str) {
        if self.format != OutputFormat::Quiet {
            eprintln!("⚠ {}", msg);
        }
    }
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate("ブックマーク一覧です", 6), "ブック...");
    }
}
