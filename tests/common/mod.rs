// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use flate2::Compression;
use flate2::write::GzEncoder;
use galley::KitchenConfig;
use galley::hash::sha256;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A scratch kitchen: config paths, a source directory, and a place for markers.
///
/// Keep the value alive for the duration of the test to prevent cleanup.
pub struct TestKitchen {
    pub dir: TempDir,
    pub config: KitchenConfig,
}

impl TestKitchen {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = KitchenConfig {
            prefix: dir.path().join("prefix/{id}").to_string_lossy().into_owned(),
            sysconfdir: dir.path().join("etc"),
            state_dir: dir.path().join("state"),
            source_cache: dir.path().join("cache"),
            build_root: Some(dir.path().join("build")),
            timeout: 60,
            jobs: 2,
            ..KitchenConfig::default()
        };
        fs::create_dir_all(dir.path().join("sources")).unwrap();
        Self { dir, config }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn prefix(&self, id: &str) -> PathBuf {
        self.path().join("prefix").join(id)
    }

    /// Write `bytes` under the sources directory and return its file URL and sha256
    pub fn publish(&self, name: &str, bytes: &[u8]) -> (String, String) {
        let path = self.path().join("sources").join(name);
        fs::write(&path, bytes).unwrap();
        (file_url(&path), sha256(bytes))
    }

    /// Publish a `<top>-<version>.tar.gz` source with a trivial `configure` script
    pub fn publish_source(&self, top: &str) -> (String, String) {
        let tarball = source_tarball(top, &[("configure", "#!/bin/sh\necho configured\n", 0o755)]);
        self.publish(&format!("{top}.tar.gz"), &tarball)
    }

    /// Count lines in a marker file appended to by build steps
    pub fn marker_lines(&self, name: &str) -> usize {
        fs::read_to_string(self.path().join(name))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }
}

pub fn file_url(path: &Path) -> String {
    url::Url::from_file_path(path).unwrap().to_string()
}

/// Build a gzipped tarball with every entry under `top/`
pub fn source_tarball(top: &str, entries: &[(&str, &str, u32)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, contents, mode) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(*mode);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{top}/{name}"), contents.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}
