// src/recipe/mod.rs

//! Recipes: declarative descriptions of how to build one package
//!
//! A recipe lists:
//! - The source archive, its mirrors and checksum
//! - Patches to apply, each with its own checksum
//! - Ordered build steps tagged configure/build/install/post_install
//! - An optional verification command
//!
//! Recipes are data. Loading them from TOML lives in [`parser`]; running them
//! is the job of [`crate::kitchen`].

mod format;
pub mod parser;
pub mod template;

pub use format::{
    BuildAction, BuildStep, CertSource, CommandTemplate, PatchInfo, Phase, Recipe, TestFile,
    TestStep,
};
pub(crate) use format::url_filename;
pub use parser::{parse_recipe, parse_recipe_file, validate_recipe};
pub use template::{TemplateVars, expand_args, substitute};
