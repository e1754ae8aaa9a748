// src/kitchen/mod.rs

//! Kitchen: turns recipes into installed packages
//!
//! The kitchen takes a recipe through:
//! 1. Fetch - download the source archive (primary, then mirrors) and verify it
//! 2. Unpack - extract into a scoped build directory
//! 3. Patch - fetch, verify and apply each patch in order
//! 4. Build - run the build steps, then the verification test
//! 5. Record - write the install record that makes re-runs no-ops
//!
//! [`RecipeExecutor`] drives the whole sequence; the other modules are the
//! pieces it is built from and can be used on their own.
//!
//! # Example
//!
//! ```ignore
//! use galley::kitchen::RecipeExecutor;
//! use galley::{KitchenConfig, parse_recipe_file};
//!
//! let recipe = parse_recipe_file(Path::new("recipes/lame.toml"))?;
//! let executor = RecipeExecutor::new(KitchenConfig::default())?;
//! let result = executor.execute(&recipe)?;
//! println!("installed {} files", result.record.files.len());
//! ```

pub mod archive;
pub mod certs;
pub mod executor;
pub mod fetch;
mod fsutil;
pub mod patch;
pub mod process;
pub mod record;
pub mod steps;

pub use certs::{Certificate, CertificateFilter, ExpiryCheck, FilterOutcome, X509Expiry};
pub use executor::{
    ExecutionError, ExecutionResult, ExecutionState, RecipeExecutor, Stage, StageError,
};
pub use fetch::{FetchError, FetchResult, FetchSource, Fetcher, HttpTransport, Transport};
pub use patch::{PatchApplier, PatchCommand, PatchError, PatchFailure, PatchTool};
pub use process::{CancelToken, CapturedOutput};
pub use record::{InstallRecord, ManifestEntry, RecordStore};
pub use steps::{BuildStepError, BuildStepRunner, StepFailure, StepReport, TestError, TestFailure};
