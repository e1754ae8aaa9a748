// src/recipe/format.rs

//! Recipe file format definitions
//!
//! A recipe is plain data: where the source lives, what it hashes to, which
//! patches to apply, and the ordered build actions that turn it into an
//! installed package. There is no per-recipe code; one executor runs them all.
//!
//! # Example
//!
//! ```toml
//! id = "lame"
//! version = "3.100"
//! description = "High quality MPEG Audio Layer III (MP3) encoder"
//! homepage = "https://lame.sourceforge.io/"
//! url = "https://downloads.sourceforge.net/sourceforge/lame/lame-3.100.tar.gz"
//! sha256 = "ddfe36cab873794038ae2c1210557ad34857a4b6bdc515785d1da9e175b1da1e"
//!
//! [[build_steps]]
//! phase = "configure"
//! run = { program = "./configure", args = ["--prefix={prefix}"] }
//!
//! [[build_steps]]
//! phase = "install"
//! run = { program = "make", args = ["install"] }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A complete recipe for building one package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    /// Package identifier (e.g. "gnutls")
    pub id: String,

    /// Upstream version
    pub version: String,

    /// Rebuild counter for the same upstream version
    #[serde(default)]
    pub revision: u32,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub homepage: Option<String>,

    /// Primary source archive URL
    pub url: String,

    /// Mirrors tried in order when the primary is unreachable
    #[serde(default)]
    pub mirrors: Vec<String>,

    /// Expected checksum of the source archive
    pub sha256: String,

    /// Patches applied in order to the unpacked source
    #[serde(default)]
    pub patches: Vec<PatchInfo>,

    /// Build actions executed in order
    #[serde(default)]
    pub build_steps: Vec<BuildStep>,

    /// Verification run after a successful install
    #[serde(default)]
    pub test_step: Option<TestStep>,

    /// Extra template variables, available as `{name}` in every template
    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    /// Environment applied to every command the recipe runs
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Runtime dependencies (informational, never resolved here)
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Build-time dependencies (informational, never resolved here)
    #[serde(default)]
    pub build_dependencies: Vec<String>,
}

impl Recipe {
    /// Primary URL followed by the mirrors, in fetch order
    pub fn source_urls(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.url.as_str()).chain(self.mirrors.iter().map(String::as_str))
    }

    /// Archive file name taken from the primary URL
    pub fn archive_filename(&self) -> String {
        url_filename(&self.url).unwrap_or_else(|| format!("{}-{}.tar.gz", self.id, self.version))
    }

    /// `id-version`, or `id-version_revision` for rebuilds
    pub fn full_version(&self) -> String {
        if self.revision == 0 {
            format!("{}-{}", self.id, self.version)
        } else {
            format!("{}-{}_{}", self.id, self.version, self.revision)
        }
    }
}

/// Last path segment of a URL, ignoring query and fragment
pub(crate) fn url_filename(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// A patch fetched and applied before building
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchInfo {
    pub url: String,

    /// Expected checksum of the patch file
    pub sha256: String,

    /// Leading path components to strip (`patch -pN`)
    #[serde(default = "default_strip")]
    pub strip: u32,
}

fn default_strip() -> u32 {
    1
}

/// Build phase a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Configure,
    Build,
    Install,
    PostInstall,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configure => "configure",
            Self::Build => "build",
            Self::Install => "install",
            Self::PostInstall => "post_install",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a native build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStep {
    pub phase: Phase,

    #[serde(flatten)]
    pub action: BuildAction,

    /// Working directory, relative to the source root unless absolute
    #[serde(default)]
    pub workdir: Option<String>,
}

/// What a build step does
///
/// Paths and arguments are templates; see [`crate::recipe::template`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildAction {
    /// Run an external program
    Run(CommandTemplate),

    /// Replace literal text in a file; fails if `find` does not occur
    Inreplace {
        path: String,
        find: String,
        replace: String,
    },

    /// Rename a file or directory
    Move { from: String, to: String },

    /// Write a file; `contents` is taken literally
    WriteFile { path: String, contents: String },

    /// Keep only unexpired certificates from `source`, written to `output`
    FilterCertificates { source: CertSource, output: String },
}

impl BuildAction {
    /// Short label used in logs
    pub fn describe(&self) -> String {
        match self {
            Self::Run(cmd) => cmd.display(),
            Self::Inreplace { path, .. } => format!("inreplace {}", path),
            Self::Move { from, to } => format!("move {} -> {}", from, to),
            Self::WriteFile { path, .. } => format!("write {}", path),
            Self::FilterCertificates { output, .. } => format!("filter certificates -> {}", output),
        }
    }
}

/// An external command with templated program and arguments
///
/// Arguments are passed to the program directly, never through a shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandTemplate {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
        }
    }

    /// Unsubstituted command line, for logging
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Where the certificate filter reads PEM blocks from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertSource {
    /// A PEM bundle on disk
    Bundle(String),
    /// Standard output of a command (e.g. a system keychain export)
    Command(CommandTemplate),
}

/// Post-install verification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStep {
    pub command: CommandTemplate,

    /// Fixture files written into `{testpath}` before the command runs
    #[serde(default)]
    pub files: Vec<TestFile>,

    /// Substring that must appear in the command's stdout
    #[serde(default)]
    pub expect_output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFile {
    /// Path relative to `{testpath}`
    pub path: String,
    pub contents: String,
}
