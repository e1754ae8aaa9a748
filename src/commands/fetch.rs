// src/commands/fetch.rs

//! Fetch command - download and verify sources without building

use super::{load_config, load_recipe, report_failure};
use crate::cli::GlobalOpts;
use anyhow::{Context, Result};
use galley::RecipeExecutor;
use galley::kitchen::FetchSource;
use std::path::Path;

pub fn cmd_fetch(global: &GlobalOpts, path: &Path) -> Result<()> {
    let recipe = load_recipe(path)?;
    let executor = RecipeExecutor::new(load_config(global)?).context("Failed to set up the kitchen")?;

    println!("Fetching sources for {}...", recipe.full_version());
    let fetched = executor.fetch_only(&recipe).inspect_err(report_failure)?;

    println!("\n[COMPLETE] Fetched {} file(s):", fetched.len());
    for result in &fetched {
        let origin = match &result.source {
            FetchSource::Cache => "cached".to_string(),
            FetchSource::Primary(url) => url.clone(),
            FetchSource::Mirror { index, url } => format!("mirror #{}: {}", index, url),
        };
        println!("  - {} ({})", result.path.display(), origin);
    }
    Ok(())
}
