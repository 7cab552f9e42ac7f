use std::io::{Read, Seek};
use std::path::Path;

use lofty::error::LoftyError;

mod artwork;
mod properties;
mod tags;

pub use artwork::{guess_mime, image_dimensions, mime_extension};
pub use properties::FsPropertyExtractor;
pub use tags::LoftyTagExtractor;

/// Seekable byte stream handed to extractors. Callers own the stream and
/// release it when extraction returns.
pub trait MediaStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> MediaStream for T {}

/// Reads embedded tags from an audio stream.
pub trait TagExtractor: Send + Sync {
    fn extract(&self, stream: &mut dyn MediaStream, path: &Path) -> Result<TagInfo, MetadataError>;
}

/// Reads properties the file system reports about a file.
pub trait FilePropertyExtractor: Send + Sync {
    fn properties(
        &self,
        stream: &mut dyn MediaStream,
        path: &Path,
    ) -> Result<FileProperties, MetadataError>;
}

#[derive(Debug, Default, Clone)]
pub struct TagInfo {
    pub title: Option<String>,
    pub artists: Vec<String>,
    pub album_artists: Vec<String>,
    pub album: Option<String>,
    pub track_no: Option<u32>,
    pub disc_no: Option<u32>,
    pub year: Option<i32>,
    pub duration_ms: Option<u32>,
    pub genres: Vec<String>,
    pub cover: Option<CoverArt>,
}

#[derive(Debug, Default, Clone)]
pub struct FileProperties {
    pub title: Option<String>,
    pub size: u64,
    pub modified: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverArt {
    pub data: Vec<u8>,
    pub mime: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Io,
    CorruptTag,
    Unsupported,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
    Unsupported(String),
}

impl MetadataError {
    pub fn kind(&self) -> FailureKind {
        match self {
            MetadataError::Io(_) => FailureKind::Io,
            MetadataError::Lofty(_) => FailureKind::CorruptTag,
            MetadataError::Unsupported(_) => FailureKind::Unsupported,
        }
    }
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
            MetadataError::Unsupported(value) => write!(f, "unsupported file: {}", value),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

/// Parses "3" or "3/12" style position values.
pub fn parse_number(text: &str) -> Option<u32> {
    let head = text.split('/').next().unwrap_or(text).trim();
    head.parse().ok()
}

pub fn parse_year(text: &str) -> Option<i32> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 4 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

pub fn parse_genres(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for part in text.split(&[';', ',', '/', '|', '\0'][..]) {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

/// Splits a multi-valued artist field. `/` is left alone since it shows up
/// inside real names.
pub fn split_artists(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in text.split(&[';', '\0'][..]) {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !out.iter().any(|seen| seen.eq_ignore_ascii_case(trimmed)) {
            out.push(trimmed.to_string());
        }
    }
    out
}
