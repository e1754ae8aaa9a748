// src/commands/install.rs

//! Install command - build and install recipes

use super::{load_config, load_recipe, report_failure};
use crate::cli::GlobalOpts;
use anyhow::{Context, Result, bail};
use galley::{ExecutionResult, MismatchPolicy, RecipeExecutor};
use std::path::PathBuf;
use tracing::info;

/// Flags that only apply to `install`
#[derive(Debug, Default)]
pub struct InstallOptions {
    pub jobs: Option<u32>,
    pub timeout: Option<u64>,
    pub keep_builddir: bool,
    pub try_mirrors: bool,
}

fn print_result(result: &ExecutionResult) {
    let record = &result.record;
    if result.reused {
        println!(
            "[OK] {}-{} already installed ({} files)",
            record.id,
            record.version,
            record.files.len()
        );
        return;
    }

    if let Some(url) = result.source.as_ref().and_then(|s| s.url()) {
        println!("  source: {}", url);
    }
    println!(
        "[COMPLETE] Installed {}-{} into {} ({} files, {} steps)",
        record.id,
        record.version,
        record.layout.prefix.display(),
        record.files.len(),
        result.steps.len()
    );
}

/// Build and install each recipe
pub fn cmd_install(global: &GlobalOpts, paths: &[PathBuf], options: InstallOptions) -> Result<()> {
    let mut config = load_config(global)?;
    if let Some(jobs) = options.jobs {
        config.jobs = jobs;
    }
    if let Some(timeout) = options.timeout {
        config.timeout = timeout;
    }
    config.keep_builddir |= options.keep_builddir;
    if options.try_mirrors {
        config.on_hash_mismatch = MismatchPolicy::TryMirrors;
    }

    let recipes = paths
        .iter()
        .map(|path| load_recipe(path))
        .collect::<Result<Vec<_>>>()?;

    let executor = RecipeExecutor::new(config).context("Failed to set up the kitchen")?;
    println!(
        "Cooking {} recipe(s) with {} parallel jobs...",
        recipes.len(),
        executor.config().jobs
    );

    if let [recipe] = recipes.as_slice() {
        let result = executor.execute(recipe).inspect_err(report_failure)?;
        print_result(&result);
        info!("Successfully installed {}", recipe.full_version());
        return Ok(());
    }

    let results = executor.execute_batch(&recipes);
    let mut failed = 0;
    for result in &results {
        match result {
            Ok(result) => print_result(result),
            Err(err) => {
                report_failure(err);
                eprintln!("Error: {}", err);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} recipes failed", failed, recipes.len());
    }
    Ok(())
}
