// src/recipe/template.rs

//! Template substitution for recipe commands and paths
//!
//! Templates reference variables as `{name}`. `{{` and `}}` produce literal
//! braces; a brace not followed by an identifier and `}` is left alone.
//! Referencing an unknown variable is an error rather than an empty string.
//!
//! List variables (currently `{std_cmake_args}`) expand into several
//! arguments when they make up a whole argument, and are space-joined
//! anywhere else.

use crate::config::InstallLayout;
use crate::error::{Error, Result};
use crate::recipe::Recipe;
use std::collections::BTreeMap;
use std::path::Path;

/// Variable bindings for template substitution
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    scalars: BTreeMap<String, String>,
    lists: BTreeMap<String, Vec<String>>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a scalar variable
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.scalars.insert(name.into(), value.into());
        self
    }

    /// Bind a list variable
    pub fn set_list(&mut self, name: impl Into<String>, values: Vec<String>) -> &mut Self {
        self.lists.insert(name.into(), values);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scalars.contains_key(name) || self.lists.contains_key(name)
    }

    fn scalar(&self, name: &str) -> Option<String> {
        self.scalars
            .get(name)
            .cloned()
            .or_else(|| self.lists.get(name).map(|values| values.join(" ")))
    }

    /// Variables for building `recipe` into `layout`
    ///
    /// Recipe-defined variables may refer to the built-in ones.
    pub fn for_recipe(
        recipe: &Recipe,
        layout: &InstallLayout,
        source_dir: &Path,
        jobs: u32,
    ) -> Result<Self> {
        let mut vars = Self::new();
        let path = |p: &Path| p.to_string_lossy().into_owned();

        vars.set("id", recipe.id.as_str())
            .set("version", recipe.version.as_str())
            .set("prefix", path(&layout.prefix))
            .set("bin", path(&layout.bin()))
            .set("lib", path(&layout.lib()))
            .set("include", path(&layout.include()))
            .set("share", path(&layout.share()))
            .set("man", path(&layout.man()))
            .set("man1", path(&layout.man().join("man1")))
            .set("sysconfdir", path(&layout.sysconfdir))
            .set("etc", path(&layout.sysconfdir))
            .set("source", path(source_dir))
            .set("jobs", jobs.to_string())
            .set_list("std_cmake_args", std_cmake_args(&layout.prefix));

        for (name, template) in &recipe.variables {
            let value = substitute(template, &vars)?;
            vars.set(name.as_str(), value);
        }

        Ok(vars)
    }
}

/// Standard arguments for CMake-based builds
pub fn std_cmake_args(prefix: &Path) -> Vec<String> {
    vec![
        format!("-DCMAKE_INSTALL_PREFIX={}", prefix.display()),
        "-DCMAKE_INSTALL_LIBDIR=lib".to_string(),
        "-DCMAKE_BUILD_TYPE=Release".to_string(),
        "-DCMAKE_FIND_FRAMEWORK=LAST".to_string(),
        "-DCMAKE_VERBOSE_MAKEFILE=ON".to_string(),
        "-Wno-dev".to_string(),
    ]
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Substitute `{name}` references in a single string
pub fn substitute(template: &str, vars: &TemplateVars) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(after) = tail.strip_prefix("{{") {
            out.push('{');
            rest = after;
            continue;
        }
        if let Some(after) = tail.strip_prefix("}}") {
            out.push('}');
            rest = after;
            continue;
        }
        if tail.starts_with('{')
            && let Some(end) = tail.find('}')
            && is_identifier(&tail[1..end])
        {
            let name = &tail[1..end];
            let value = vars
                .scalar(name)
                .ok_or_else(|| Error::MissingVariable(name.to_string()))?;
            out.push_str(&value);
            rest = &tail[end + 1..];
            continue;
        }

        out.push_str(&tail[..1]);
        rest = &tail[1..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Substitute an argument list, expanding whole-argument list variables
pub fn expand_args(args: &[String], vars: &TemplateVars) -> Result<Vec<String>> {
    let mut expanded = Vec::with_capacity(args.len());
    for arg in args {
        let list = arg
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .filter(|name| is_identifier(name))
            .and_then(|name| vars.lists.get(name));

        match list {
            Some(values) => expanded.extend(values.iter().cloned()),
            None => expanded.push(substitute(arg, vars)?),
        }
    }
    Ok(expanded)
}
