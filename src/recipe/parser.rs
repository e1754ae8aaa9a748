// src/recipe/parser.rs

//! Recipe file parsing and validation

use crate::config::InstallLayout;
use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::recipe::format::{BuildAction, CertSource, CommandTemplate, Phase, Recipe};
use crate::recipe::template::{TemplateVars, expand_args, substitute};
use std::path::Path;

/// Parse a recipe from a TOML string
pub fn parse_recipe(content: &str) -> Result<Recipe> {
    toml::from_str(content).map_err(|e| Error::ParseError(format!("Invalid recipe: {}", e)))
}

/// Parse a recipe from a file
pub fn parse_recipe_file(path: &Path) -> Result<Recipe> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::IoError(format!("Failed to read recipe file: {}", e)))?;

    parse_recipe(&content)
}

fn check_url(url: &str, what: &str) -> Result<()> {
    let parsed = url::Url::parse(url)
        .map_err(|e| Error::InvalidRecipe(format!("{} URL {:?} is invalid: {}", what, url, e)))?;
    match parsed.scheme() {
        "http" | "https" | "file" => Ok(()),
        scheme => Err(Error::InvalidRecipe(format!(
            "{} URL {:?} has unsupported scheme {:?}",
            what, url, scheme
        ))),
    }
}

fn check_checksum(checksum: &str, what: &str) -> Result<()> {
    Hash::parse_prefixed(checksum)
        .map(|_| ())
        .map_err(|e| Error::InvalidRecipe(format!("{} checksum is invalid: {}", what, e)))
}

fn check_command(cmd: &CommandTemplate, vars: &TemplateVars) -> Result<()> {
    substitute(&cmd.program, vars)?;
    expand_args(&cmd.args, vars)?;
    for value in cmd.env.values() {
        substitute(value, vars)?;
    }
    Ok(())
}

/// Validate a recipe for completeness and correctness
///
/// Hard errors (bad URLs, malformed checksums, unknown template variables)
/// are returned as `Err`; softer issues come back as warnings.
pub fn validate_recipe(recipe: &Recipe) -> Result<Vec<String>> {
    let mut warnings = Vec::new();

    if recipe.id.is_empty() {
        return Err(Error::InvalidRecipe("Recipe id cannot be empty".to_string()));
    }
    if recipe.id.contains(['/', '\\']) || recipe.id.starts_with('.') {
        return Err(Error::InvalidRecipe(format!(
            "Recipe id {:?} is not a valid file name",
            recipe.id
        )));
    }
    if recipe.version.is_empty() {
        return Err(Error::InvalidRecipe("Recipe version cannot be empty".to_string()));
    }

    check_url(&recipe.url, "Source")?;
    for mirror in &recipe.mirrors {
        check_url(mirror, "Mirror")?;
    }
    check_checksum(&recipe.sha256, "Source")?;

    for (index, patch) in recipe.patches.iter().enumerate() {
        check_url(&patch.url, &format!("Patch #{}", index))?;
        check_checksum(&patch.sha256, &format!("Patch #{}", index))?;
    }

    // Every template must resolve against the variables a real build sees
    let layout = InstallLayout::new("/prefix", "/etc");
    let mut vars = TemplateVars::for_recipe(recipe, &layout, Path::new("/source"), 1)?;
    for value in recipe.env.values() {
        substitute(value, &vars)?;
    }
    for step in &recipe.build_steps {
        if let Some(workdir) = &step.workdir {
            substitute(workdir, &vars)?;
        }
        match &step.action {
            BuildAction::Run(cmd) => check_command(cmd, &vars)?,
            BuildAction::Inreplace { path, find, .. } => {
                substitute(path, &vars)?;
                if find.is_empty() {
                    return Err(Error::InvalidRecipe(format!(
                        "inreplace of {} has an empty pattern",
                        path
                    )));
                }
            }
            BuildAction::Move { from, to } => {
                substitute(from, &vars)?;
                substitute(to, &vars)?;
            }
            BuildAction::WriteFile { path, .. } => {
                substitute(path, &vars)?;
            }
            BuildAction::FilterCertificates { source, output } => {
                match source {
                    CertSource::Bundle(path) => {
                        substitute(path, &vars)?;
                    }
                    CertSource::Command(cmd) => check_command(cmd, &vars)?,
                }
                substitute(output, &vars)?;
            }
        }
    }
    if let Some(test) = &recipe.test_step {
        vars.set("testpath", "/testpath");
        check_command(&test.command, &vars)?;
    }

    if recipe.description.is_none() {
        warnings.push("Missing description".to_string());
    }
    if recipe.homepage.is_none() {
        warnings.push("Missing homepage".to_string());
    }
    if recipe.build_steps.is_empty() {
        warnings.push("No build steps specified".to_string());
    } else if !recipe.build_steps.iter().any(|s| s.phase == Phase::Install) {
        warnings.push("No install step specified".to_string());
    }
    if recipe
        .build_steps
        .windows(2)
        .any(|pair| pair[1].phase < pair[0].phase)
    {
        warnings.push("Build step phases are not in configure/build/install order".to_string());
    }
    if recipe.test_step.is_none() {
        warnings.push("No test step specified".to_string());
    }

    Ok(warnings)
}
