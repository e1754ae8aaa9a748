// src/commands/validate.rs

//! Validate command - check recipes without running them

use anyhow::{Context, Result, bail};
use galley::{parse_recipe_file, validate_recipe};
use std::path::PathBuf;

pub fn cmd_validate(paths: &[PathBuf]) -> Result<()> {
    let mut invalid = 0;

    for path in paths {
        let checked = parse_recipe_file(path)
            .with_context(|| format!("Failed to parse recipe: {}", path.display()))
            .and_then(|recipe| {
                let warnings = validate_recipe(&recipe).context("Recipe validation failed")?;
                Ok((recipe, warnings))
            });

        match checked {
            Ok((recipe, warnings)) => {
                println!("{}: {}", path.display(), recipe.full_version());
                if !recipe.build_dependencies.is_empty() {
                    println!("  build dependencies: {}", recipe.build_dependencies.join(", "));
                }
                if !recipe.dependencies.is_empty() {
                    println!("  dependencies: {}", recipe.dependencies.join(", "));
                }
                for warning in &warnings {
                    println!("  Warning: {}", warning);
                }
                if warnings.is_empty() {
                    println!("  [OK] No issues found");
                } else {
                    println!("  [OK] {} warning(s)", warnings.len());
                }
            }
            Err(err) => {
                eprintln!("{}: {:#}", path.display(), err);
                invalid += 1;
            }
        }
    }

    if invalid > 0 {
        bail!("{} of {} recipes are invalid", invalid, paths.len());
    }
    Ok(())
}
