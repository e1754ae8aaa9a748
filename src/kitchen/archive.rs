// src/kitchen/archive.rs

//! Source archive extraction
//!
//! Supports: .tar.gz, .tgz, .tar.xz, .txz, .tar.bz2, .tbz2, .tar.zst, .tar

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;
use xz2::read::XzDecoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarXz,
    TarBz2,
    TarZst,
}

impl ArchiveFormat {
    /// Detect the format from a file name
    pub fn from_filename(name: &str) -> Option<Self> {
        let name = name.to_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Some(Self::TarXz)
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            Some(Self::TarBz2)
        } else if name.ends_with(".tar.zst") {
            Some(Self::TarZst)
        } else if name.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }

    /// Detect the format from leading magic bytes
    pub fn from_magic(magic: &[u8]) -> Option<Self> {
        if magic.starts_with(&[0x1F, 0x8B]) {
            Some(Self::TarGz)
        } else if magic.starts_with(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00]) {
            Some(Self::TarXz)
        } else if magic.starts_with(b"BZh") {
            Some(Self::TarBz2)
        } else if magic.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) {
            Some(Self::TarZst)
        } else if magic.len() >= 262 && &magic[257..262] == b"ustar" {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

fn sniff(path: &Path) -> io::Result<Option<ArchiveFormat>> {
    let mut magic = Vec::with_capacity(512);
    File::open(path)?.take(512).read_to_end(&mut magic)?;
    Ok(ArchiveFormat::from_magic(&magic))
}

/// Extract `archive` into `dest`
///
/// `filename` is the archive's original name; cached artifacts are stored
/// under their checksum, so the name on disk says nothing about the format.
/// Magic bytes are the fallback when the name is not recognised.
pub fn extract_archive(archive: &Path, filename: &str, dest: &Path) -> io::Result<()> {
    let format = match ArchiveFormat::from_filename(filename) {
        Some(format) => format,
        None => sniff(archive)?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown archive format: {}", filename),
            )
        })?,
    };

    debug!("Extracting {} as {:?}", filename, format);
    fs::create_dir_all(dest)?;

    let file = BufReader::new(File::open(archive)?);
    let reader: Box<dyn Read> = match format {
        ArchiveFormat::Tar => Box::new(file),
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(file)),
        ArchiveFormat::TarXz => Box::new(XzDecoder::new(file)),
        ArchiveFormat::TarBz2 => Box::new(BzDecoder::new(file)),
        ArchiveFormat::TarZst => Box::new(zstd::stream::read::Decoder::new(file)?),
    };

    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);
    tar.unpack(dest)
}

/// Find the source root inside an extraction directory
///
/// Archives usually wrap everything in one top-level directory; when they
/// do, that directory is the root.
pub fn source_root(extracted: &Path) -> io::Result<PathBuf> {
    let entries: Vec<_> = fs::read_dir(extracted)?.filter_map(|e| e.ok()).collect();

    if entries.len() == 1 && entries[0].file_type().map(|t| t.is_dir()).unwrap_or(false) {
        return Ok(entries[0].path());
    }
    Ok(extracted.to_path_buf())
}
