// src/config.rs

//! Configuration for the Kitchen
//!
//! Values come from, in increasing precedence: built-in defaults, a TOML
//! file, `GALLEY_*` environment variables, and command-line flags.
//!
//! ```toml
//! prefix = "/opt/galley/{id}/{version}"
//! sysconfdir = "/etc/galley"
//! state_dir = "/var/lib/galley/records"
//! source_cache = "/var/cache/galley/sources"
//! timeout = 3600
//! on_hash_mismatch = "abort"
//! ```

use crate::error::{Error, Result};
use crate::recipe::Recipe;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/galley/galley.toml";

/// What the fetcher does when a transfer succeeds but the checksum differs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchPolicy {
    /// Fail immediately; a bad checksum may mean tampering
    #[default]
    Abort,
    /// Keep trying the remaining mirrors, failing with a mismatch if none match
    TryMirrors,
}

/// Configuration for the Kitchen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KitchenConfig {
    /// Install prefix; may contain `{id}` and `{version}` for per-recipe prefixes
    pub prefix: String,
    /// Directory for configuration files (`{sysconfdir}` / `{etc}`)
    pub sysconfdir: PathBuf,
    /// Directory holding install records and recipe locks
    pub state_dir: PathBuf,
    /// Directory for verified source artifacts
    pub source_cache: PathBuf,
    /// Parent for scoped build directories (system temp dir when unset)
    pub build_root: Option<PathBuf>,
    /// Upper bound on all processes run for one recipe, in seconds
    pub timeout: u64,
    /// Per-request HTTP timeout, in seconds
    pub http_timeout: u64,
    /// Number of parallel jobs (`{jobs}`, `MAKEFLAGS`)
    pub jobs: u32,
    /// Keep build directory after completion (for debugging)
    pub keep_builddir: bool,
    /// Behaviour on checksum mismatch
    pub on_hash_mismatch: MismatchPolicy,
}

impl Default for KitchenConfig {
    fn default() -> Self {
        let jobs = std::thread::available_parallelism()
            .map(|p| p.get() as u32)
            .unwrap_or(4);

        Self {
            prefix: "/usr/local".to_string(),
            sysconfdir: PathBuf::from("/usr/local/etc"),
            state_dir: PathBuf::from("/var/lib/galley/records"),
            source_cache: PathBuf::from("/var/cache/galley/sources"),
            build_root: None,
            timeout: 3600,
            http_timeout: 30,
            jobs,
            keep_builddir: false,
            on_hash_mismatch: MismatchPolicy::Abort,
        }
    }
}

impl KitchenConfig {
    /// Parse a configuration from TOML
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigError(format!("Invalid config: {}", e)))
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Load the given file, the default file if it exists, or the defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::load(Path::new(DEFAULT_CONFIG_PATH))
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply `GALLEY_*` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(prefix) = lookup("GALLEY_PREFIX") {
            self.prefix = prefix;
        }
        if let Some(dir) = lookup("GALLEY_SYSCONFDIR") {
            self.sysconfdir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("GALLEY_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("GALLEY_CACHE_DIR") {
            self.source_cache = PathBuf::from(dir);
        }
    }

    /// Per-recipe process timeout
    pub fn recipe_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// HTTP request timeout
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout)
    }

    /// Resolve the install layout for a recipe
    pub fn layout_for(&self, recipe: &Recipe) -> InstallLayout {
        let prefix = self
            .prefix
            .replace("{id}", &recipe.id)
            .replace("{version}", &recipe.version);
        InstallLayout {
            prefix: PathBuf::from(prefix),
            sysconfdir: self.sysconfdir.clone(),
        }
    }
}

/// Where a recipe installs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstallLayout {
    pub prefix: PathBuf,
    pub sysconfdir: PathBuf,
}

impl InstallLayout {
    pub fn new(prefix: impl Into<PathBuf>, sysconfdir: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            sysconfdir: sysconfdir.into(),
        }
    }

    pub fn bin(&self) -> PathBuf {
        self.prefix.join("bin")
    }

    pub fn lib(&self) -> PathBuf {
        self.prefix.join("lib")
    }

    pub fn include(&self) -> PathBuf {
        self.prefix.join("include")
    }

    pub fn share(&self) -> PathBuf {
        self.prefix.join("share")
    }

    pub fn man(&self) -> PathBuf {
        self.share().join("man")
    }

    /// Roots whose contents make up an install manifest
    pub fn roots(&self) -> Vec<&Path> {
        if self.sysconfdir.starts_with(&self.prefix) {
            vec![self.prefix.as_path()]
        } else {
            vec![self.prefix.as_path(), self.sysconfdir.as_path()]
        }
    }
}
