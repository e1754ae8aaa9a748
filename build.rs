// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Common argument: recipe file
fn recipe_arg() -> Arg {
    Arg::new("recipe")
        .required(true)
        .value_name("RECIPE")
        .help("Recipe file (TOML)")
}

fn recipes_arg() -> Arg {
    recipe_arg().num_args(1..).help("Recipe files (TOML)")
}

fn build_cli() -> Command {
    Command::new("galley")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Galley Contributors")
        .about("Fetch, verify, patch, build and install packages from recipes")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .global(true)
                .env("GALLEY_CONFIG")
                .help("Configuration file (default: /etc/galley/galley.toml if present)"),
        )
        .arg(Arg::new("prefix").long("prefix").global(true).help("Install prefix; may contain {id} and {version}"))
        .arg(Arg::new("sysconfdir").long("sysconfdir").global(true).help("Directory for configuration files"))
        .arg(Arg::new("state_dir").long("state-dir").global(true).help("Directory holding install records"))
        .arg(Arg::new("cache_dir").long("cache-dir").global(true).help("Directory for verified source downloads"))
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Verbose logging (debug level, including build output)"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("install")
                .about("Build and install one or more recipes")
                .arg(recipes_arg())
                .arg(Arg::new("jobs").short('j').long("jobs").help("Number of parallel build jobs"))
                .arg(Arg::new("timeout").long("timeout").help("Per-recipe timeout in seconds"))
                .arg(
                    Arg::new("keep_builddir")
                        .long("keep-builddir")
                        .action(ArgAction::SetTrue)
                        .help("Keep the build directory after completion"),
                )
                .arg(
                    Arg::new("try_mirrors")
                        .long("try-mirrors")
                        .action(ArgAction::SetTrue)
                        .help("On checksum mismatch, keep trying the remaining mirrors"),
                ),
        )
        .subcommand(
            Command::new("test")
                .about("Run the verification test of an installed recipe")
                .arg(recipe_arg()),
        )
        .subcommand(
            Command::new("fetch")
                .about("Download and verify a recipe's source and patches without building")
                .arg(recipe_arg()),
        )
        .subcommand(
            Command::new("validate")
                .about("Check recipe files for errors and report warnings")
                .arg(recipes_arg()),
        )
        .subcommand(
            Command::new("certs")
                .about("Keep only unexpired certificates from a PEM bundle")
                .arg(Arg::new("input").short('i').long("input").required(true).help("PEM bundle to filter"))
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .required(true)
                        .help("Output bundle, replaced atomically"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();

    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("galley.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
