//! Source readers and their descriptors
//!
//! A [`SourceReader`] turns one browser's native bookmark store into
//! [`SourceEntry`] values. What the engine may ask of it is declared up front
//! in a [`Capabilities`] value carried by the [`SourceDescriptor`], so the
//! lifecycle never has to probe a reader for optional behaviour.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::config::{Config, SourceConfig, SourceKind};
use crate::error::SourceError;
use crate::models::{SourceEntry, SourcePull};
use crate::watch::{file_specs, WatchSpec, DEFAULT_DEBOUNCE};

/// Reads bookmarks from one source
pub trait SourceReader: Send + fmt::Debug {
    /// The file this reader pulls from
    fn path(&self) -> &Path;

    /// Pull bookmarks
    ///
    /// With `since` unset the reader returns its whole bookmark set. With a
    /// watermark, readers that support incremental pulls may return only what
    /// changed after it; the returned [`SourcePull::complete`] tells which.
    fn read(&mut self, since: Option<DateTime<Utc>>) -> Result<SourcePull, SourceError>;

    /// What to watch for changes
    fn watch_specs(&self) -> Vec<WatchSpec> {
        file_specs(self.path())
    }

    /// Release anything a failed load left behind
    fn cleanup(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Optional behaviour a source declares at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// `read` honours a watermark
    pub incremental: bool,
    /// The source can be watched for changes
    pub watch: bool,
    /// Probe for an exclusive lock before each pull
    pub lock_check: bool,
    /// `cleanup` should run after a failed load
    pub cleanup: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            incremental: false,
            watch: true,
            lock_check: false,
            cleanup: false,
        }
    }
}

/// Identity and capabilities of one registered source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    /// Unique id, used as the buffer name and in logs
    pub id: String,
    /// Source kind, stored as each record's module
    pub kind: String,
    pub capabilities: Capabilities,
    /// Quiet period for this source's watch
    pub debounce: Duration,
}

impl SourceDescriptor {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            capabilities: Capabilities::default(),
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

/// Build the descriptor and reader for a configured source
pub fn from_config(
    config: &Config,
    source: &SourceConfig,
) -> (SourceDescriptor, Box<dyn SourceReader>) {
    match source.kind {
        SourceKind::Chrome => {
            let capabilities = Capabilities {
                watch: source.watch,
                lock_check: source.lock_check,
                ..ChromeJsonReader::CAPABILITIES
            };
            let descriptor = SourceDescriptor::new(&source.name, source.kind.as_str())
                .with_capabilities(capabilities)
                .with_debounce(config.debounce_for(source));
            let reader = ChromeJsonReader::new(source.bookmark_path());
            (descriptor, Box::new(reader))
        }
    }
}

/// Reader for Chromium-family `Bookmarks` JSON files
///
/// The file is rewritten as a whole on every change, so every pull is a full
/// one. Each URL carries the folder path it was filed under, starting with
/// the root folder's display name.
#[derive(Debug, Clone)]
pub struct ChromeJsonReader {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ChromeFile {
    roots: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChromeNode {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    children: Vec<ChromeNode>,
}

impl ChromeJsonReader {
    pub const CAPABILITIES: Capabilities = Capabilities {
        incremental: false,
        watch: true,
        lock_check: false,
        cleanup: false,
    };

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parse the contents of a `Bookmarks` file
    pub fn parse(&self, content: &str) -> Result<Vec<SourceEntry>, SourceError> {
        let file: ChromeFile = serde_json::from_str(content).map_err(|e| self.parse_error(e))?;

        let mut entries = Vec::new();
        for (key, value) in file.roots {
            // roots may also carry bookkeeping scalars
            if !value.is_object() {
                continue;
            }
            let root: ChromeNode = serde_json::from_value(value).map_err(|e| self.parse_error(e))?;
            debug!(root = %key, name = %root.name, "parsing root folder");
            let mut path = Vec::new();
            walk(&root, &mut path, &mut entries);
        }
        Ok(entries)
    }

    fn parse_error(&self, e: serde_json::Error) -> SourceError {
        SourceError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        }
    }
}

fn walk(node: &ChromeNode, path: &mut Vec<String>, out: &mut Vec<SourceEntry>) {
    match node.kind.as_str() {
        "url" => {
            if let Some(url) = node.url.as_deref().filter(|u| !u.is_empty()) {
                out.push(SourceEntry::new(url, &node.name).in_folder(path.iter().cloned()));
            }
        }
        "folder" => {
            path.push(node.name.clone());
            for child in &node.children {
                walk(child, path, out);
            }
            path.pop();
        }
        _ => {}
    }
}

impl SourceReader for ChromeJsonReader {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read(&mut self, _since: Option<DateTime<Utc>>) -> Result<SourcePull, SourceError> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| SourceError::from_io(e, self.path.clone()))?;
        Ok(SourcePull::full(self.parse(&content)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "checksum": "abc",
        "roots": {
            "bookmark_bar": {
                "children": [
                    { "type": "url", "name": "Rust", "url": "https://www.rust-lang.org/" },
                    {
                        "type": "folder",
                        "name": "dev",
                        "children": [
                            { "type": "url", "name": "Docs", "url": "https://docs.rs/" },
                            { "type": "url", "name": "Rust again", "url": "https://www.rust-lang.org/" }
                        ]
                    }
                ],
                "name": "Bookmarks bar",
                "type": "folder"
            },
            "other": { "children": [], "name": "Other bookmarks", "type": "folder" },
            "sync_transaction_version": "1"
        },
        "version": 1
    }"#;

    #[test]
    fn test_parse_collects_folder_paths() {
        let reader = ChromeJsonReader::new("/profile/Bookmarks");
        let entries = reader.parse(SAMPLE).unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].url, "https://www.rust-lang.org/");
        assert_eq!(entries[0].folders, vec!["Bookmarks bar"]);
        assert_eq!(entries[1].title, "Docs");
        assert_eq!(entries[1].folders, vec!["Bookmarks bar", "dev"]);
        assert!(entries.iter().all(|e| e.tags.is_empty()));
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        let reader = ChromeJsonReader::new("/profile/Bookmarks");
        let err = reader.parse("{ \"roots\": ").unwrap_err();
        assert!(matches!(err, SourceError::Parse { .. }));
    }

    #[test]
    fn test_read_full_pull() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Bookmarks");
        std::fs::write(&path, SAMPLE).unwrap();

        let mut reader = ChromeJsonReader::new(&path);
        let pull = reader.read(Some(Utc::now())).unwrap();
        assert!(pull.complete);
        assert_eq!(pull.entries.len(), 3);
    }

    #[test]
    fn test_read_missing_file_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let mut reader = ChromeJsonReader::new(temp_dir.path().join("Bookmarks"));
        let err = reader.read(None).unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { .. }));
    }

    #[test]
    fn test_watch_specs_target_profile_dir() {
        let reader = ChromeJsonReader::new("/profile/Bookmarks");
        let specs = reader.watch_specs();
        assert_eq!(specs[0].path, PathBuf::from("/profile"));
        assert!(specs[0].reset_on_trigger);
    }

    #[test]
    fn test_from_config() {
        let mut source = SourceConfig::new("brave", SourceKind::Chrome, "/home/u/brave");
        source.lock_check = true;
        source.debounce_ms = Some(100);

        let (descriptor, reader) = from_config(&Config::default(), &source);
        assert_eq!(descriptor.id, "brave");
        assert_eq!(descriptor.kind, "chrome");
        assert!(descriptor.capabilities.lock_check);
        assert!(!descriptor.capabilities.incremental);
        assert_eq!(descriptor.debounce, Duration::from_millis(100));
        assert_eq!(reader.path(), Path::new("/home/u/brave/Default/Bookmarks"));
    }
}
