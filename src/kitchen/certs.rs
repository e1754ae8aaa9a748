// src/kitchen/certs.rs

//! Certificate filtering for trust store exports
//!
//! A trust store export is a series of PEM blocks. Each block is checked on
//! its own: blocks whose expiry lies strictly after "now" are kept, expired
//! ones are dropped, and blocks that cannot be parsed are logged and
//! dropped without failing the batch.

use crate::kitchen::fsutil::atomic_write;
use regex::Regex;
use std::io;
use std::path::Path;
use std::sync::LazyLock;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use x509_cert::der::Decode;

/// A PEM certificate block with its parsed expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub pem: String,
    pub not_after: SystemTime,
}

/// Reads the expiry timestamp of a PEM certificate
pub trait ExpiryCheck: Send + Sync {
    fn not_after(&self, pem: &str) -> Result<SystemTime, String>;
}

/// X.509 DER parsing of the certificate's validity period
#[derive(Debug, Default)]
pub struct X509Expiry;

impl ExpiryCheck for X509Expiry {
    fn not_after(&self, block: &str) -> Result<SystemTime, String> {
        let parsed = pem::parse(block).map_err(|e| format!("invalid PEM: {e}"))?;
        if parsed.tag() != "CERTIFICATE" {
            return Err(format!("unexpected PEM tag {}", parsed.tag()));
        }
        let cert = x509_cert::Certificate::from_der(parsed.contents())
            .map_err(|e| format!("invalid certificate: {e}"))?;
        Ok(cert.tbs_certificate.validity.not_after.to_system_time())
    }
}

static PEM_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-----(BEGIN|END) CERTIFICATE-----").unwrap());

/// Split a PEM bundle into its certificate blocks, in order
///
/// A block runs from a BEGIN marker to the next END marker. A BEGIN that is
/// not closed before the next BEGIN (or the end of input) yields a truncated
/// block on its own, so it can never swallow the certificate after it.
pub fn extract_pem_blocks(input: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut open: Option<usize> = None;

    for marker in PEM_MARKER_RE.captures_iter(input) {
        let (Some(whole), Some(kind)) = (marker.get(0), marker.get(1)) else {
            continue;
        };
        match (kind.as_str(), open) {
            ("BEGIN", Some(start)) => {
                blocks.push(input[start..whole.start()].trim_end().to_string());
                open = Some(whole.start());
            }
            ("BEGIN", None) => open = Some(whole.start()),
            (_, Some(start)) => {
                blocks.push(input[start..whole.end()].to_string());
                open = None;
            }
            // END without BEGIN
            (_, None) => {}
        }
    }
    if let Some(start) = open {
        blocks.push(input[start..].trim_end().to_string());
    }

    blocks
}

/// Result of filtering one batch
#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub kept: Vec<Certificate>,
    pub expired: usize,
    pub malformed: usize,
}

/// Keep the certificates that are still valid at `now`
pub fn filter_unexpired(blocks: &[String], now: SystemTime, check: &dyn ExpiryCheck) -> FilterOutcome {
    let mut outcome = FilterOutcome::default();

    for (index, block) in blocks.iter().enumerate() {
        match check.not_after(block) {
            Ok(not_after) if not_after > now => outcome.kept.push(Certificate {
                pem: block.clone(),
                not_after,
            }),
            Ok(_) => {
                debug!("Dropping expired certificate #{}", index);
                outcome.expired += 1;
            }
            Err(reason) => {
                warn!("Dropping malformed certificate #{}: {}", index, reason);
                outcome.malformed += 1;
            }
        }
    }

    outcome
}

/// Concatenate certificates into a PEM bundle
pub fn render_bundle(certs: &[Certificate]) -> String {
    let mut out = String::new();
    for cert in certs {
        out.push_str(cert.pem.trim_end());
        out.push('\n');
    }
    out
}

/// Filters a PEM bundle and writes the survivors as one atomic replacement
pub struct CertificateFilter<'a> {
    check: &'a dyn ExpiryCheck,
}

impl<'a> CertificateFilter<'a> {
    pub fn new(check: &'a dyn ExpiryCheck) -> Self {
        Self { check }
    }

    pub fn filter(&self, input: &str, now: SystemTime) -> FilterOutcome {
        filter_unexpired(&extract_pem_blocks(input), now, self.check)
    }

    /// Filter `input` and replace `output` with the valid certificates
    pub fn write(&self, input: &str, output: &Path, now: SystemTime) -> io::Result<FilterOutcome> {
        let outcome = self.filter(input, now);
        atomic_write(output, render_bundle(&outcome.kept).as_bytes())?;
        info!(
            "Wrote {} certificates to {} ({} expired, {} malformed dropped)",
            outcome.kept.len(),
            output.display(),
            outcome.expired,
            outcome.malformed
        );
        Ok(outcome)
    }
}
