// src/main.rs

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.global.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Install {
            recipes,
            jobs,
            timeout,
            keep_builddir,
            try_mirrors,
        } => commands::cmd_install(
            &cli.global,
            &recipes,
            commands::InstallOptions {
                jobs,
                timeout,
                keep_builddir,
                try_mirrors,
            },
        ),
        Commands::Test { recipe } => commands::cmd_test(&cli.global, &recipe),
        Commands::Fetch { recipe } => commands::cmd_fetch(&cli.global, &recipe),
        Commands::Validate { recipes } => commands::cmd_validate(&recipes),
        Commands::Certs { input, output } => commands::cmd_certs(&input, &output),
    }
}
