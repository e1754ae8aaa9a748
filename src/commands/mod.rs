// src/commands/mod.rs
//! Command handlers for the galley CLI

mod certs;
mod fetch;
mod install;
mod validate;

pub use certs::cmd_certs;
pub use fetch::cmd_fetch;
pub use install::{InstallOptions, cmd_install};
pub use test::cmd_test;
pub use validate::cmd_validate;

use crate::cli::GlobalOpts;
use anyhow::{Context, Result};
use galley::{ExecutionError, KitchenConfig, Recipe, parse_recipe_file, validate_recipe};
use std::path::Path;

/// Build the effective configuration: file, then environment, then flags
pub(crate) fn load_config(global: &GlobalOpts) -> Result<KitchenConfig> {
    let mut config = KitchenConfig::load_or_default(global.config.as_deref())
        .context("Failed to load configuration")?;
    config.apply_env();

    if let Some(prefix) = &global.prefix {
        config.prefix = prefix.clone();
    }
    if let Some(dir) = &global.sysconfdir {
        config.sysconfdir = dir.clone();
    }
    if let Some(dir) = &global.state_dir {
        config.state_dir = dir.clone();
    }
    if let Some(dir) = &global.cache_dir {
        config.source_cache = dir.clone();
    }
    Ok(config)
}

/// Parse and validate a recipe, printing its warnings
pub(crate) fn load_recipe(path: &Path) -> Result<Recipe> {
    let recipe = parse_recipe_file(path)
        .with_context(|| format!("Failed to parse recipe: {}", path.display()))?;
    let warnings = validate_recipe(&recipe)
        .with_context(|| format!("Recipe validation failed: {}", path.display()))?;
    for warning in &warnings {
        eprintln!("Warning ({}): {}", recipe.id, warning);
    }
    Ok(recipe)
}

/// Print the failing step's captured output, verbatim, to stderr
pub(crate) fn report_failure(err: &ExecutionError) {
    if let Some(output) = err.captured_output() {
        eprint!("{}", output);
    }
}
