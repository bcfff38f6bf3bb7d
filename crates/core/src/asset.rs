//! Named byte payloads flowing between the form layer, the inference client
//! and the archive builder.

use std::fmt::Display;
use std::path::{Component, Path};

use chrono::{DateTime, Local};

pub const ARCHIVE_SUFFIX: &str = ".cache.zip";
pub const ERROR_LOG_SUFFIX: &str = ".error.log";

/// Suffixes recognised as persisted artifacts when the output directory is
/// scanned at startup.
pub const RESULT_SUFFIXES: [&str; 4] = [ARCHIVE_SUFFIX, ERROR_LOG_SUFFIX, ".jpg", ".png"];

/// An image (or error log) together with the filename it should be delivered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAsset {
    pub bytes: Vec<u8>,
    pub name: String,
}

impl ImageAsset {
    pub fn new(bytes: Vec<u8>, name: impl Into<String>) -> Self {
        Self {
            bytes,
            name: name.into(),
        }
    }

    /// Placeholder artifact recording why `original_name` could not be processed.
    pub fn error_placeholder(original_name: &str, error: impl Display) -> Self {
        Self {
            bytes: format!("Failed processing file {original_name}: {error}").into_bytes(),
            name: format!("{original_name}{ERROR_LOG_SUFFIX}"),
        }
    }

    pub fn is_error_log(&self) -> bool {
        self.name.ends_with(ERROR_LOG_SUFFIX)
    }
}

/// `<prefix>_<yyyymmdd_hhmmss>_<nanos:09>.<ext>`
pub fn result_name(name_prefix: &str, extension: &str) -> String {
    result_name_at(name_prefix, extension, Local::now())
}

pub fn result_name_at(name_prefix: &str, extension: &str, at: DateTime<Local>) -> String {
    format!(
        "{name_prefix}_{}_{:09}.{extension}",
        at.format("%Y%m%d_%H%M%S"),
        at.timestamp_subsec_nanos()
    )
}

/// Reduce a client-supplied name (upload filename, name prefix) to its last
/// path segment. Names with nothing usable left become `fallback`.
pub fn sanitize_file_name(raw: &str, fallback: &str) -> String {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if matches!(last, "" | "." | "..") || last.contains('\0') {
        fallback.to_string()
    } else {
        last.to_string()
    }
}

/// True when `name` is one normal path component, so joining it onto a
/// directory stays inside that directory.
pub fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    !name.contains(['/', '\\', '\0'])
        && matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
}

pub fn is_result_file(file_name: &str) -> bool {
    RESULT_SUFFIXES
        .iter()
        .any(|suffix| file_name.ends_with(suffix))
}
