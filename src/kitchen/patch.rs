// src/kitchen/patch.rs

//! Applying patches to an unpacked source tree
//!
//! Patches are fetched through the same verified path as sources and then
//! applied strictly in order. The first failure stops the run; the tree is
//! then in an unknown half-patched state and must be thrown away, which the
//! executor does by discarding the whole build directory.

use crate::kitchen::fetch::{FetchError, Fetcher};
use crate::recipe::PatchInfo;
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::info;

/// Why a patch could not be applied
#[derive(Debug, Error)]
pub enum PatchFailure {
    #[error("fetch failed: {0}")]
    FetchFailed(#[source] FetchError),

    #[error("does not apply:\n{0}")]
    ApplyConflict(String),
}

/// Failure of the patch at position `index` in the recipe's list
#[derive(Debug, Error)]
#[error("patch #{index} ({url}) {reason}")]
pub struct PatchError {
    pub index: usize,
    pub url: String,
    #[source]
    pub reason: PatchFailure,
}

/// Applies one patch file to a source tree
///
/// `Err` carries the tool's diagnostic output.
pub trait PatchTool: Send + Sync {
    fn apply(&self, source_dir: &Path, patch_file: &Path, strip: u32) -> Result<(), String>;
}

/// `patch(1)`-backed tool
///
/// Each patch is dry-run first so a conflicting patch leaves the tree as it
/// was before that patch.
#[derive(Debug, Default)]
pub struct PatchCommand;

impl PatchCommand {
    fn run(source_dir: &Path, patch_file: &Path, strip: u32, dry_run: bool) -> Result<(), String> {
        let mut cmd = Command::new("patch");
        cmd.arg(format!("-p{}", strip))
            .args(["--forward", "--batch", "-i"])
            .arg(patch_file)
            .current_dir(source_dir)
            .stdin(Stdio::null());
        if dry_run {
            cmd.arg("--dry-run");
        }

        let output = cmd
            .output()
            .map_err(|e| format!("failed to run patch: {}", e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            ))
        }
    }
}

impl PatchTool for PatchCommand {
    fn apply(&self, source_dir: &Path, patch_file: &Path, strip: u32) -> Result<(), String> {
        Self::run(source_dir, patch_file, strip, true)?;
        Self::run(source_dir, patch_file, strip, false)
    }
}

/// Fetches and applies a recipe's patches in order
pub struct PatchApplier<'a> {
    fetcher: &'a Fetcher,
    tool: &'a dyn PatchTool,
}

impl<'a> PatchApplier<'a> {
    pub fn new(fetcher: &'a Fetcher, tool: &'a dyn PatchTool) -> Self {
        Self { fetcher, tool }
    }

    /// Apply every patch, stopping at the first failure
    ///
    /// Returns the number of patches applied.
    pub fn apply_all(&self, source_dir: &Path, patches: &[PatchInfo]) -> Result<usize, PatchError> {
        for (index, patch) in patches.iter().enumerate() {
            let fail = |reason| PatchError {
                index,
                url: patch.url.clone(),
                reason,
            };

            let fetched = self
                .fetcher
                .fetch(&[patch.url.as_str()], &patch.sha256)
                .map_err(|e| fail(PatchFailure::FetchFailed(e)))?;

            info!("Applying patch #{}: {}", index, patch.url);
            self.tool
                .apply(source_dir, &fetched.path, patch.strip)
                .map_err(|output| fail(PatchFailure::ApplyConflict(output)))?;
        }

        Ok(patches.len())
    }
}
