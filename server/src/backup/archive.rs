//! Compressed archive creation and extraction.
//!
//! All functions here block and are meant for `spawn_blocking`.

use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::errors::DockyardError;

/// Size and SHA-256 of a written archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub size: u64,
    pub checksum: String,
}

/// Writer that hashes and counts everything passing through
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (W, ArchiveSummary) {
        let summary = ArchiveSummary {
            size: self.written,
            checksum: hex::encode(self.hasher.finalize()),
        };
        (self.inner, summary)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Pack the contents of `src_dir` into a gzip'd tar at `dest`
pub fn create_archive(src_dir: &Path, dest: &Path) -> Result<ArchiveSummary, DockyardError> {
    let file = fs::File::create(dest)?;
    let hashing = HashingWriter::new(BufWriter::new(file));
    let encoder = GzEncoder::new(hashing, Compression::default());

    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", src_dir)?;
    let encoder = builder.into_inner()?;
    let hashing = encoder.finish()?;

    let (mut writer, summary) = hashing.finish();
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(summary)
}

/// Unpack a gzip'd tar into `dest_dir`.
///
/// Entries that would land outside `dest_dir` are refused by `tar`.
pub fn extract_archive(archive: &Path, dest_dir: &Path) -> Result<(), DockyardError> {
    fs::create_dir_all(dest_dir)?;
    let file = fs::File::open(archive)?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_preserve_permissions(false);
    archive.unpack(dest_dir).map_err(|e| {
        DockyardError::IntegrityCheckFailed(format!("archive could not be extracted: {}", e))
    })?;
    Ok(())
}

/// SHA-256 of a file's contents
pub fn file_checksum(path: &Path) -> Result<String, DockyardError> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
