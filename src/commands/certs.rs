// src/commands/certs.rs

//! Certs command - filter expired certificates out of a PEM bundle

use anyhow::{Context, Result};
use galley::kitchen::{CertificateFilter, X509Expiry};
use std::path::Path;
use std::time::SystemTime;

pub fn cmd_certs(input: &Path, output: &Path) -> Result<()> {
    let bundle = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;

    let check = X509Expiry;
    let outcome = CertificateFilter::new(&check)
        .write(&bundle, output, SystemTime::now())
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!(
        "[COMPLETE] Kept {} certificate(s) in {} ({} expired, {} malformed)",
        outcome.kept.len(),
        output.display(),
        outcome.expired,
        outcome.malformed
    );
    Ok(())
}
