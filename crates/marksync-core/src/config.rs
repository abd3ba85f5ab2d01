//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/marksync/config.toml)
//! 3. Environment variables (MARKSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix
const ENV_PREFIX: &str = "MARKSYNC";

/// File name of the disk tier inside the data directory
pub const DISK_FILE: &str = "marksync.db";

/// When the cache is mirrored to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorMode {
    /// After every merge into the cache
    #[default]
    Immediate,
    /// Once merges from all sources have been quiet for `mirror_interval_ms`
    Debounced,
}

impl std::str::FromStr for MirrorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "immediate" => Ok(MirrorMode::Immediate),
            "debounced" => Ok(MirrorMode::Debounced),
            other => Err(format!("unknown mirror mode '{}'", other)),
        }
    }
}

/// Bookmark source formats marksync can read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Chromium-family JSON `Bookmarks` file
    #[default]
    Chrome,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Chrome => "chrome",
        }
    }
}

/// One configured bookmark source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique id of this source
    pub name: String,

    #[serde(default)]
    pub kind: SourceKind,

    /// Browser profile root, e.g. ~/.config/chromium
    pub base_dir: PathBuf,

    /// Profile directory under `base_dir`
    #[serde(default = "default_profile")]
    pub profile: String,

    /// Bookmark file inside the profile directory
    #[serde(default = "default_bookmark_file")]
    pub bookmark_file: String,

    /// Watch the bookmark file for changes
    #[serde(default = "default_true")]
    pub watch: bool,

    /// Skip pulls while another process holds a write lock on the file
    #[serde(default)]
    pub lock_check: bool,

    /// Per-source override of the debounce interval
    #[serde(default)]
    pub debounce_ms: Option<u64>,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, kind: SourceKind, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind,
            base_dir: base_dir.into(),
            profile: default_profile(),
            bookmark_file: default_bookmark_file(),
            watch: true,
            lock_check: false,
            debounce_ms: None,
        }
    }

    /// Directory holding the bookmark file
    pub fn profile_dir(&self) -> PathBuf {
        expand_home(&self.base_dir).join(&self.profile)
    }

    /// Full path of the bookmark file
    pub fn bookmark_path(&self) -> PathBuf {
        self.profile_dir().join(&self.bookmark_file)
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the disk tier
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Quiet period before a burst of file events triggers a pull
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Cache to disk mirroring policy
    #[serde(default)]
    pub mirror: MirrorMode,

    /// Quiet period for the debounced mirror policy
    #[serde(default = "default_mirror_interval_ms")]
    pub mirror_interval_ms: u64,

    /// Default log filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            debounce_ms: default_debounce_ms(),
            mirror: MirrorMode::default(),
            mirror_interval_ms: default_mirror_interval_ms(),
            log_level: default_log_level(),
            sources: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (MARKSYNC_DATA_DIR, MARKSYNC_DEBOUNCE_MS, MARKSYNC_MIRROR)
    /// 2. Config file (~/.config/marksync/config.toml or MARKSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.data_dir = expand_home(&config.data_dir);
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        config.data_dir = expand_home(&config.data_dir);
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // MARKSYNC_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // MARKSYNC_DEBOUNCE_MS
        if let Ok(val) = std::env::var(format!("{}_DEBOUNCE_MS", ENV_PREFIX)) {
            match val.parse() {
                Ok(ms) => self.debounce_ms = ms,
                Err(_) => tracing::warn!(value = %val, "ignoring invalid MARKSYNC_DEBOUNCE_MS"),
            }
        }

        // MARKSYNC_MIRROR
        if let Ok(val) = std::env::var(format!("{}_MIRROR", ENV_PREFIX)) {
            match val.parse() {
                Ok(mode) => self.mirror = mode,
                Err(e) => tracing::warn!(error = %e, "ignoring invalid MARKSYNC_MIRROR"),
            }
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path())
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with MARKSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("marksync")
            .join("config.toml")
    }

    /// Get the path to the disk tier
    pub fn disk_path(&self) -> PathBuf {
        self.data_dir.join(DISK_FILE)
    }

    /// Debounce interval for a source, falling back to the global one
    pub fn debounce_for(&self, source: &SourceConfig) -> Duration {
        Duration::from_millis(source.debounce_ms.unwrap_or(self.debounce_ms))
    }

    pub fn mirror_interval(&self) -> Duration {
        Duration::from_millis(self.mirror_interval_ms)
    }
}

/// Replace a leading `~/` with the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("marksync")
}

fn default_debounce_ms() -> u64 {
    1500
}

fn default_mirror_interval_ms() -> u64 {
    4000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_profile() -> String {
    "Default".to_string()
}

fn default_bookmark_file() -> String {
    "Bookmarks".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            // Clear all the vars
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "MARKSYNC_DATA_DIR",
        "MARKSYNC_DEBOUNCE_MS",
        "MARKSYNC_MIRROR",
        "MARKSYNC_CONFIG",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.debounce_ms, 1500);
        assert_eq!(config.mirror, MirrorMode::Immediate);
        assert_eq!(config.mirror_interval(), Duration::from_secs(4));
        assert!(config.sources.is_empty());
        assert!(config.data_dir.ends_with("marksync"));
    }

    #[test]
    fn test_file_paths() {
        let config = Config::default();
        assert!(config.disk_path().ends_with("marksync.db"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("MARKSYNC_DATA_DIR", "/tmp/marksync-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/marksync-test"));
    }

    #[test]
    fn test_env_override_debounce_and_mirror() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("MARKSYNC_DEBOUNCE_MS", "250");
        env::set_var("MARKSYNC_MIRROR", "Debounced");
        config.apply_env_overrides();
        assert_eq!(config.debounce_ms, 250);
        assert_eq!(config.mirror, MirrorMode::Debounced);

        // Invalid values leave the current setting alone
        env::set_var("MARKSYNC_DEBOUNCE_MS", "soon");
        env::set_var("MARKSYNC_MIRROR", "sometimes");
        config.apply_env_overrides();
        assert_eq!(config.debounce_ms, 250);
        assert_eq!(config.mirror, MirrorMode::Debounced);
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_dir: PathBuf::from("/data/marksync"),
            mirror: MirrorMode::Debounced,
            sources: vec![SourceConfig::new(
                "chromium",
                SourceKind::Chrome,
                "/home/u/.config/chromium",
            )],
            ..Config::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("mirror = \"debounced\""));
        assert!(toml_str.contains("[[sources]]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.data_dir, config.data_dir);
        assert_eq!(parsed.mirror, config.mirror);
        assert_eq!(parsed.sources, config.sources);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            debounce_ms = 500

            [[sources]]
            name = "chromium"
            kind = "chrome"
            base_dir = "/home/u/.config/chromium"
            debounce_ms = 3000

            [[sources]]
            name = "brave"
            base_dir = "/home/u/.config/BraveSoftware/Brave-Browser"
            profile = "Profile 1"
            watch = false
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.sources.len(), 2);

        let chromium = &config.sources[0];
        assert_eq!(chromium.bookmark_file, "Bookmarks");
        assert!(chromium.watch);
        assert_eq!(config.debounce_for(chromium), Duration::from_millis(3000));
        assert_eq!(
            chromium.bookmark_path(),
            PathBuf::from("/home/u/.config/chromium/Default/Bookmarks")
        );

        let brave = &config.sources[1];
        assert_eq!(brave.kind, SourceKind::Chrome);
        assert!(!brave.watch);
        assert_eq!(config.debounce_for(brave), Duration::from_millis(500));
        assert!(brave.profile_dir().ends_with("Profile 1"));
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = tempfile::TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("data");
        env::set_var("MARKSYNC_DATA_DIR", &data_dir);

        let path = temp_dir.path().join("config.toml");
        let config = Config::load_from_path(&path).unwrap();
        // Should return defaults when file doesn't exist
        assert_eq!(config.debounce_ms, 1500);
        assert!(config.sources.is_empty());
        assert!(data_dir.exists());
    }

    #[test]
    fn test_save_and_reload() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("marksync").join("config.toml");

        let config = Config {
            data_dir: temp_dir.path().join("data"),
            debounce_ms: 900,
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.debounce_ms, 900);
        assert_eq!(loaded.data_dir, config.data_dir);
    }

    #[test]
    fn test_expand_home() {
        let expanded = expand_home(Path::new("~/.config/chromium"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join(".config/chromium"));
        }
        assert_eq!(expand_home(Path::new("/abs")), PathBuf::from("/abs"));
    }
}
