// src/kitchen/record.rs

//! Install records
//!
//! A record is written once every stage of a recipe has succeeded and is the
//! only evidence the executor trusts when deciding to skip a re-run. It lists
//! every file the install created or changed together with its checksum, so
//! a record whose files were since removed or modified no longer counts.
//!
//! # Layout
//!
//! ```text
//! <state_dir>/
//!   gnutls-3.6.9.json   record for id "gnutls", version "3.6.9"
//!   gnutls.lock         held while any process executes "gnutls"
//! ```

use crate::config::InstallLayout;
use crate::error::{Error, Result};
use crate::hash::{Hash, HashAlgorithm, hash_bytes, hash_file};
use crate::kitchen::fsutil::atomic_write;
use crate::recipe::Recipe;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// One installed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: PathBuf,
    /// Checksum of the contents (of the link target for symlinks)
    pub sha256: String,
    pub size: u64,
}

/// Persisted proof that a recipe completed successfully
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub id: String,
    pub version: String,
    pub revision: u32,
    pub source_sha256: String,
    pub layout: InstallLayout,
    pub files: Vec<ManifestEntry>,
    pub installed_at: DateTime<Utc>,
}

fn same_checksum(a: &str, b: &str) -> bool {
    match (Hash::parse_prefixed(a), Hash::parse_prefixed(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

impl InstallRecord {
    pub fn new(recipe: &Recipe, layout: InstallLayout, files: Vec<ManifestEntry>) -> Self {
        Self {
            id: recipe.id.clone(),
            version: recipe.version.clone(),
            revision: recipe.revision,
            source_sha256: recipe.sha256.clone(),
            layout,
            files,
            installed_at: Utc::now(),
        }
    }

    /// Whether this record describes `recipe` installed into `layout`
    pub fn matches(&self, recipe: &Recipe, layout: &InstallLayout) -> bool {
        self.id == recipe.id
            && self.version == recipe.version
            && self.revision == recipe.revision
            && same_checksum(&self.source_sha256, &recipe.sha256)
            && &self.layout == layout
    }

    /// Manifest entries whose file is missing or no longer matches
    pub fn changed_files(&self) -> Vec<&ManifestEntry> {
        self.files
            .iter()
            .filter(|entry| match digest(&entry.path) {
                Ok((sha256, size)) => sha256 != entry.sha256 || size != entry.size,
                Err(_) => true,
            })
            .collect()
    }

    /// True when every recorded file is present with its recorded checksum
    pub fn is_intact(&self) -> bool {
        let changed = self.changed_files();
        for entry in &changed {
            debug!("Installed file changed or missing: {}", entry.path.display());
        }
        changed.is_empty()
    }
}

/// Checksum and size of a regular file or symlink
fn digest(path: &Path) -> io::Result<(String, u64)> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(path)?;
        let hash = hash_bytes(HashAlgorithm::Sha256, target.as_os_str().as_bytes());
        return Ok((hash.to_string(), 0));
    }
    let hash = hash_file(HashAlgorithm::Sha256, path)?;
    Ok((hash.to_string(), meta.len()))
}

/// Size and modification time of every file under a set of roots
#[derive(Debug, Default)]
pub struct Snapshot {
    files: HashMap<PathBuf, (u64, Option<SystemTime>)>,
}

fn walk(roots: &[&Path]) -> Vec<(PathBuf, fs::Metadata)> {
    roots
        .iter()
        .filter(|root| root.exists())
        .flat_map(|root| WalkDir::new(root).follow_links(false))
        .filter_map(|entry| entry.ok())
        .filter(|entry| !entry.file_type().is_dir())
        .filter_map(|entry| {
            let meta = entry.path().symlink_metadata().ok()?;
            Some((entry.into_path(), meta))
        })
        .collect()
}

impl Snapshot {
    pub fn capture(roots: &[&Path]) -> Self {
        let files = walk(roots)
            .into_iter()
            .map(|(path, meta)| (path, (meta.len(), meta.modified().ok())))
            .collect();
        Self { files }
    }

    /// Files under `roots` that are new or changed since the snapshot
    pub fn changes(&self, roots: &[&Path]) -> io::Result<Vec<ManifestEntry>> {
        let mut entries = Vec::new();
        for (path, meta) in walk(roots) {
            let current = (meta.len(), meta.modified().ok());
            if self.files.get(&path) == Some(&current) {
                continue;
            }
            let (sha256, size) = digest(&path)?;
            entries.push(ManifestEntry { path, sha256, size });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Manifest for a finished install: the changes plus whatever the
    /// previous install of the same recipe recorded and is still on disk
    ///
    /// Installers that preserve timestamps or skip up-to-date files leave
    /// those files unchanged, so they only show up through `previous`.
    pub fn manifest(
        &self,
        roots: &[&Path],
        previous: Option<&InstallRecord>,
    ) -> io::Result<Vec<ManifestEntry>> {
        let mut entries = self.changes(roots)?;
        let Some(previous) = previous else {
            return Ok(entries);
        };

        let seen: HashSet<PathBuf> = entries.iter().map(|e| e.path.clone()).collect();
        for entry in &previous.files {
            if seen.contains(&entry.path) || !roots.iter().any(|root| entry.path.starts_with(root)) {
                continue;
            }
            match digest(&entry.path) {
                Ok((sha256, size)) => entries.push(ManifestEntry {
                    path: entry.path.clone(),
                    sha256,
                    size,
                }),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("Previously installed file is gone: {}", entry.path.display());
                }
                Err(e) => return Err(e),
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

/// Exclusive per-recipe lock, released on drop
#[derive(Debug)]
pub struct RecipeLock {
    _file: File,
    path: PathBuf,
}

impl RecipeLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Directory of install records
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, id: &str, version: &str) -> PathBuf {
        self.dir
            .join(format!("{}-{}.json", id, version.replace('/', "_")))
    }

    /// Load the record for `id` at `version`
    ///
    /// An unreadable record is treated as absent so the recipe simply runs
    /// again.
    pub fn load(&self, id: &str, version: &str) -> Result<Option<InstallRecord>> {
        let path = self.record_path(id, version);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Ignoring corrupt install record {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Persist a record, replacing any previous one atomically
    pub fn save(&self, record: &InstallRecord) -> Result<PathBuf> {
        let path = self.record_path(&record.id, &record.version);
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::ParseError(format!("Failed to serialize install record: {}", e)))?;
        atomic_write(&path, &json)?;
        info!("Wrote install record {}", path.display());
        Ok(path)
    }

    /// Remove the record for `id` at `version`, if any
    pub fn remove(&self, id: &str, version: &str) -> Result<bool> {
        match fs::remove_file(self.record_path(id, version)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Take the exclusive lock for `id`, blocking until it is free
    pub fn lock(&self, id: &str) -> Result<RecipeLock> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.lock", id));
        let file = File::create(&path)?;
        file.lock_exclusive()
            .map_err(|e| Error::IoError(format!("Failed to lock {}: {}", path.display(), e)))?;
        debug!("Acquired recipe lock {}", path.display());
        Ok(RecipeLock { _file: file, path })
    }
}
