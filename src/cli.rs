// src/cli.rs
//! CLI definitions for galley
//!
//! This module contains the command-line interface definitions using clap.
//! The command implementations are in the `commands` module.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "galley")]
#[command(author = "Galley Contributors")]
#[command(version)]
#[command(about = "Fetch, verify, patch, build and install packages from recipes", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct GlobalOpts {
    /// Configuration file (default: /etc/galley/galley.toml if present)
    #[arg(short, long, global = true, env = "GALLEY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Install prefix; may contain {id} and {version}
    #[arg(long, global = true)]
    pub prefix: Option<String>,

    /// Directory for configuration files
    #[arg(long, global = true)]
    pub sysconfdir: Option<PathBuf>,

    /// Directory holding install records
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Directory for verified source downloads
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Verbose logging (debug level, including build output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build and install one or more recipes
    Install {
        /// Recipe files (TOML)
        #[arg(required = true)]
        recipes: Vec<PathBuf>,

        /// Number of parallel build jobs
        #[arg(short, long)]
        jobs: Option<u32>,

        /// Per-recipe timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Keep the build directory after completion
        #[arg(long)]
        keep_builddir: bool,

        /// On checksum mismatch, keep trying the remaining mirrors
        #[arg(long)]
        try_mirrors: bool,
    },

    /// Run the verification test of an installed recipe
    Test {
        /// Recipe file (TOML)
        recipe: PathBuf,
    },

    /// Download and verify a recipe's source and patches without building
    Fetch {
        /// Recipe file (TOML)
        recipe: PathBuf,
    },

    /// Check recipe files for errors and report warnings
    Validate {
        /// Recipe files (TOML)
        #[arg(required = true)]
        recipes: Vec<PathBuf>,
    },

    /// Keep only unexpired certificates from a PEM bundle
    Certs {
        /// PEM bundle to filter
        #[arg(short, long)]
        input: PathBuf,

        /// Output bundle, replaced atomically
        #[arg(short, long)]
        output: PathBuf,
    },
}
