use std::collections::HashSet;
use std::fmt::Display;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::asset::{
    is_plain_file_name, sanitize_file_name, ImageAsset, ARCHIVE_SUFFIX, ERROR_LOG_SUFFIX,
};

/// Stands in for a name prefix that sanitizes to nothing.
const FALLBACK_PREFIX: &str = "batch";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to write zip entry: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("failed to write archive bytes: {0}")]
    Io(#[from] io::Error),
}

/// Bytes ready to be persisted or streamed, plus the filename to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltArtifact {
    pub bytes: Vec<u8>,
    pub filename: String,
}

/// `<prefix>_<unixSeconds>.cache.zip`
pub fn archive_name(name_prefix: &str) -> String {
    format!("{name_prefix}_{}{ARCHIVE_SUFFIX}", Utc::now().timestamp())
}

/// `<prefix>_<unixSeconds>.error.log`
pub fn error_log_name(name_prefix: &str) -> String {
    format!("{name_prefix}_{}{ERROR_LOG_SUFFIX}", Utc::now().timestamp())
}

/// Package artifacts for delivery.
///
/// A single image is returned unwrapped under its own name; a single error
/// log is renamed to the batch-qualified [`error_log_name`]. Anything else
/// becomes a zip with one deflated entry per artifact. Entry names that
/// repeat get a `_<n>` suffix on their stem.
pub fn build(
    mut artifacts: Vec<ImageAsset>,
    name_prefix: &str,
) -> Result<BuiltArtifact, ArchiveError> {
    if artifacts.len() == 1 {
        if let Some(single) = artifacts.pop() {
            let filename = if single.is_error_log() {
                error_log_name(name_prefix)
            } else {
                sanitize_file_name(&single.name, "item")
            };
            return Ok(BuiltArtifact {
                bytes: single.bytes,
                filename,
            });
        }
    }

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    let mut used = HashSet::with_capacity(artifacts.len());
    for artifact in &artifacts {
        let entry = unique_entry_name(&sanitize_file_name(&artifact.name, "item"), &mut used);
        zip.start_file(entry, options)?;
        zip.write_all(&artifact.bytes)?;
    }
    let bytes = zip.finish()?.into_inner();

    Ok(BuiltArtifact {
        bytes,
        filename: archive_name(name_prefix),
    })
}

/// `image.jpg.error.log` repeats as `image_1.jpg.error.log`, `image_2...`.
fn unique_entry_name(name: &str, used: &mut HashSet<String>) -> String {
    let (stem, extension) = name.split_at(name.find('.').unwrap_or(name.len()));
    let mut candidate = name.to_string();
    let mut n = 0;
    while !used.insert(candidate.clone()) {
        n += 1;
        candidate = format!("{stem}_{n}{extension}");
    }
    candidate
}

/// `dir/filename`, refusing anything that would land outside `dir`.
fn join_in(dir: &Path, filename: &str) -> io::Result<PathBuf> {
    if is_plain_file_name(filename) {
        Ok(dir.join(filename))
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to write outside the output directory: {filename:?}"),
        ))
    }
}

/// Write a built artifact into `dir`, returning the full path.
pub async fn persist(dir: &Path, artifact: &BuiltArtifact) -> io::Result<PathBuf> {
    let path = join_in(dir, &artifact.filename)?;
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(&path, &artifact.bytes).await?;
    Ok(path)
}

/// Write `<prefix>_<unixSeconds>.error.log` describing `error` into `dir`.
///
/// The returned path is the intended location even when the write itself
/// fails, so callers can always record a terminal artifact path. A prefix
/// carrying path segments is cut down to its last one.
pub async fn write_error_log(
    dir: &Path,
    name_prefix: &str,
    error: impl Display,
) -> (PathBuf, io::Result<()>) {
    let prefix = sanitize_file_name(name_prefix, FALLBACK_PREFIX);
    let path = dir.join(error_log_name(&prefix));
    let contents = error.to_string();
    let written = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, contents.as_bytes()).await
    }
    .await;
    (path, written)
}
