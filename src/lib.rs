// src/lib.rs

//! Galley: build native packages from declarative recipes
//!
//! A recipe names a source archive and its checksum, the patches to apply,
//! and an ordered list of build steps. Galley fetches and verifies the
//! source, applies the patches, runs the steps, checks the result with the
//! recipe's test, and records what was installed so a repeated run is a
//! no-op.
//!
//! # Architecture
//!
//! - Recipes are plain data; one generic executor runs all of them
//! - Every download is verified against a declared checksum before use
//! - Build steps run without a shell; arguments come from template substitution
//! - Install records are written only after full success

pub mod config;
mod error;
pub mod hash;
pub mod kitchen;
pub mod recipe;

pub use config::{InstallLayout, KitchenConfig, MismatchPolicy};
pub use error::{Error, Result};
pub use hash::{Hash, HashAlgorithm, Hasher};
pub use kitchen::{ExecutionError, ExecutionResult, RecipeExecutor, Stage};
pub use recipe::{Recipe, parse_recipe, parse_recipe_file, validate_recipe};
