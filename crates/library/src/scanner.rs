use std::collections::BTreeSet;
use std::io::{Seek, SeekFrom};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bitflags::bitflags;
use common::{
    album_id, artist_id, folder_album_id, image_id, normalize_name, path_to_slash_string,
    track_id, AlbumMetadata, ArtistMetadata, ImageMetadata, ImageSource, TrackMetadata,
};
use crossbeam_channel::{bounded, Receiver};
use metadata::{
    image_dimensions, CoverArt, FailureKind, FileProperties, FilePropertyExtractor,
    FsPropertyExtractor, LoftyTagExtractor, MediaStream, MetadataError, TagExtractor, TagInfo,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::source::{FileHandle, FolderSource};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ScanTypes: u8 {
        const TAGLIB = 0b01;
        const FILE_PROPERTIES = 0b10;
    }
}

impl Default for ScanTypes {
    fn default() -> Self {
        ScanTypes::TAGLIB | ScanTypes::FILE_PROPERTIES
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&MetadataError> for ScanFailure {
    fn from(err: &MetadataError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Everything one audio file contributes to the library. Ids reference
/// each other but only cover what this file knows about.
#[derive(Clone, Debug)]
pub struct FileMetadata {
    pub path: String,
    pub track: TrackMetadata,
    pub album: AlbumMetadata,
    pub artists: Vec<ArtistMetadata>,
    pub images: Vec<ImageMetadata>,
    pub cover: Option<CoverArt>,
    pub failure: Option<ScanFailure>,
}

pub struct AudioMetadataScanner {
    source: Arc<dyn FolderSource>,
    tags: Arc<dyn TagExtractor>,
    properties: Arc<dyn FilePropertyExtractor>,
    scan_types: ScanTypes,
    parallelism: usize,
}

impl AudioMetadataScanner {
    pub fn new(source: Arc<dyn FolderSource>, scan_types: ScanTypes, parallelism: usize) -> Self {
        Self {
            source,
            tags: Arc::new(LoftyTagExtractor),
            properties: Arc::new(FsPropertyExtractor),
            scan_types,
            parallelism: parallelism.max(1),
        }
    }

    pub fn with_extractors(
        mut self,
        tags: Arc<dyn TagExtractor>,
        properties: Arc<dyn FilePropertyExtractor>,
    ) -> Self {
        self.tags = tags;
        self.properties = properties;
        self
    }

    /// Scans `files` on a pool of `parallelism` workers. Results arrive in
    /// completion order. Cancelling `cancel` stops feeding new files; the
    /// stream still yields whatever was already in flight.
    pub fn scan_music_files<I>(&self, files: I, cancel: &CancellationToken) -> ScanStream
    where
        I: IntoIterator<Item = FileHandle>,
        I::IntoIter: Send + 'static,
    {
        let (work_tx, work_rx) = bounded::<FileHandle>(self.parallelism);
        let (out_tx, out_rx) = bounded::<FileMetadata>(self.parallelism);
        let mut handles = Vec::with_capacity(self.parallelism + 1);
        let skipped = Arc::new(AtomicBool::new(false));

        let feeder_cancel = cancel.clone();
        let feeder_skipped = Arc::clone(&skipped);
        let files = files.into_iter();
        let feeder = thread::Builder::new()
            .name("scan-feeder".to_string())
            .spawn(move || {
                for file in files {
                    if feeder_cancel.is_cancelled() {
                        debug!("Scan canceled; no more files queued");
                        feeder_skipped.store(true, Ordering::SeqCst);
                        break;
                    }
                    if work_tx.send(file).is_err() {
                        break;
                    }
                }
            });
        match feeder {
            Ok(handle) => handles.push(handle),
            Err(err) => warn!("Failed to start scan feeder: {}", err),
        }

        for worker_no in 0..self.parallelism {
            let work_rx = work_rx.clone();
            let out_tx = out_tx.clone();
            let worker = FileWorker {
                source: Arc::clone(&self.source),
                tags: Arc::clone(&self.tags),
                properties: Arc::clone(&self.properties),
                scan_types: self.scan_types,
            };
            let cancel = cancel.clone();
            let skipped = Arc::clone(&skipped);
            let spawned = thread::Builder::new()
                .name(format!("scan-worker-{}", worker_no))
                .spawn(move || {
                    for file in work_rx.iter() {
                        if cancel.is_cancelled() {
                            skipped.store(true, Ordering::SeqCst);
                            break;
                        }
                        if out_tx.send(worker.scan(&file)).is_err() {
                            break;
                        }
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => warn!("Failed to start scan worker {}: {}", worker_no, err),
            }
        }

        ScanStream {
            results: Some(out_rx),
            handles,
            skipped,
        }
    }
}

/// Lazy, finite sequence of scan results. Dropping it stops the workers.
pub struct ScanStream {
    results: Option<Receiver<FileMetadata>>,
    handles: Vec<JoinHandle<()>>,
    skipped: Arc<AtomicBool>,
}

impl ScanStream {
    /// Whether cancellation left files unscanned. Only meaningful once the
    /// stream is exhausted.
    pub fn was_canceled(&self) -> bool {
        self.skipped.load(Ordering::SeqCst)
    }
}

impl Iterator for ScanStream {
    type Item = FileMetadata;

    fn next(&mut self) -> Option<FileMetadata> {
        self.results.as_ref()?.recv().ok()
    }
}

impl Drop for ScanStream {
    fn drop(&mut self) {
        // Workers blocked on a full result channel exit once it disconnects.
        self.results.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

struct FileWorker {
    source: Arc<dyn FolderSource>,
    tags: Arc<dyn TagExtractor>,
    properties: Arc<dyn FilePropertyExtractor>,
    scan_types: ScanTypes,
}

impl FileWorker {
    fn scan(&self, file: &FileHandle) -> FileMetadata {
        let mut failure = None;
        let mut tags = TagInfo::default();
        let mut properties = None;

        match self.source.open_read(file) {
            Ok(mut stream) => {
                if self.scan_types.contains(ScanTypes::TAGLIB) {
                    match guarded(|| self.tags.extract(stream.as_mut(), &file.path)) {
                        Ok(info) => tags = info,
                        Err(err) => {
                            warn!("Failed to read tags for {:?}: {}", file.path, err);
                            failure = Some(ScanFailure::from(&err));
                        }
                    }
                }
                if self.scan_types.contains(ScanTypes::FILE_PROPERTIES) {
                    let result = rewind(stream.as_mut()).and_then(|_| {
                        guarded(|| self.properties.properties(stream.as_mut(), &file.path))
                    });
                    match result {
                        Ok(props) => properties = Some(props),
                        Err(err) => {
                            warn!("Failed to read properties for {:?}: {}", file.path, err);
                            failure.get_or_insert_with(|| ScanFailure::from(&err));
                        }
                    }
                }
            }
            Err(err) => {
                warn!("Failed to open {:?}: {}", file.path, err);
                failure = Some(ScanFailure {
                    kind: FailureKind::Io,
                    message: err.to_string(),
                });
            }
        }

        build_file_metadata(&file.path, tags, properties, failure)
    }
}

fn rewind(stream: &mut dyn MediaStream) -> Result<(), MetadataError> {
    stream.seek(SeekFrom::Start(0))?;
    Ok(())
}

/// Runs an extractor, turning a panic inside it into a tag failure.
fn guarded<T>(
    extract: impl FnOnce() -> Result<T, MetadataError>,
) -> Result<T, MetadataError> {
    match catch_unwind(AssertUnwindSafe(extract)) {
        Ok(result) => result,
        Err(_) => Err(MetadataError::Unsupported(
            "extractor panicked".to_string(),
        )),
    }
}

pub fn build_file_metadata(
    path: &Path,
    tags: TagInfo,
    properties: Option<FileProperties>,
    failure: Option<ScanFailure>,
) -> FileMetadata {
    let path_string = path_to_slash_string(path);
    let track_key = track_id(&path_string);

    let title = tags
        .title
        .clone()
        .or_else(|| properties.as_ref().and_then(|p| p.title.clone()))
        .unwrap_or_default();
    let genres: BTreeSet<String> = tags.genres.iter().cloned().collect();

    let track_artist_ids = distinct_ids(&tags.artists);
    let album_artist_ids = distinct_ids(&tags.album_artists);

    let album_key = match tags.album.as_deref() {
        Some(title) => {
            let primary = tags
                .album_artists
                .first()
                .or_else(|| tags.artists.first())
                .map(String::as_str)
                .unwrap_or("");
            album_id(primary, title)
        }
        None => {
            let folder = path.parent().map(path_to_slash_string).unwrap_or_default();
            folder_album_id(&folder)
        }
    };

    let mut images = Vec::new();
    if let Some(cover) = &tags.cover {
        let source = ImageSource::Embedded {
            path: path_string.clone(),
        };
        let dimensions = image_dimensions(&cover.data);
        images.push(ImageMetadata {
            id: image_id(&source),
            source,
            mime: cover.mime.clone(),
            width: dimensions.map(|(w, _)| w),
            height: dimensions.map(|(_, h)| h),
        });
    }
    let image_ids: BTreeSet<String> = images.iter().map(|image| image.id.clone()).collect();

    let track = TrackMetadata {
        id: track_key.clone(),
        path: path_string.clone(),
        title,
        track_no: tags.track_no,
        disc_no: tags.disc_no.or_else(|| disc_number_from_path(path)),
        duration_ms: tags.duration_ms.unwrap_or(0),
        artist_ids: track_artist_ids.iter().map(|(id, _)| id.clone()).collect(),
        album_id: album_key.clone(),
        genres: genres.clone(),
        image_ids: image_ids.clone(),
        file_size: properties.as_ref().map(|p| p.size),
        modified: properties.as_ref().and_then(|p| p.modified),
    };

    let album_credit = if album_artist_ids.is_empty() {
        &track_artist_ids
    } else {
        &album_artist_ids
    };
    let album = AlbumMetadata {
        id: album_key.clone(),
        name: tags.album.clone().unwrap_or_default(),
        artist_ids: album_credit.iter().map(|(id, _)| id.clone()).collect(),
        track_ids: BTreeSet::from([track_key.clone()]),
        image_ids,
        year: tags.year,
    };

    let mut artists: Vec<ArtistMetadata> = Vec::new();
    for (id, name) in track_artist_ids.iter().chain(album_artist_ids.iter()) {
        if artists.iter().any(|artist| &artist.id == id) {
            continue;
        }
        let performs = track_artist_ids.iter().any(|(other, _)| other == id);
        artists.push(ArtistMetadata {
            id: id.clone(),
            name: name.clone(),
            track_ids: if performs {
                BTreeSet::from([track_key.clone()])
            } else {
                BTreeSet::new()
            },
            album_ids: BTreeSet::from([album_key.clone()]),
            image_ids: BTreeSet::new(),
            genres: if performs { genres.clone() } else { BTreeSet::new() },
        });
    }

    FileMetadata {
        path: path_string,
        track,
        album,
        artists,
        images,
        cover: tags.cover,
        failure,
    }
}

/// (id, display name) for each distinct normalized name.
fn distinct_ids(names: &[String]) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for name in names {
        let trimmed = name.trim();
        if normalize_name(trimmed).is_empty() {
            continue;
        }
        let id = artist_id(trimmed);
        if !out.iter().any(|(seen, _)| seen == &id) {
            out.push((id, trimmed.to_string()));
        }
    }
    out
}

/// Disc number from a parent folder named like "CD2", "Disc 2" or
/// "Disc II".
fn disc_number_from_path(path: &Path) -> Option<u32> {
    let folder = path.parent()?.file_name()?.to_str()?;
    parse_disc_number(folder)
}

const DISC_KEYWORDS: &[&str] = &[
    "cd", "disc", "disk", "dvd", "medium", "media", "format", "vol", "volume", "part", "side",
    "lp",
];

fn parse_disc_number(name: &str) -> Option<u32> {
    let cleaned = normalize_disc_name(name);
    if cleaned.is_empty() {
        return None;
    }

    for prefix in DISC_KEYWORDS {
        if let Some(rest) = cleaned.strip_prefix(prefix) {
            // "cd2" is a disc, "cdc" is not: numerals need a separator.
            let separated = rest.starts_with(' ');
            let rest = rest.trim();
            if rest.chars().all(|c| c.is_ascii_digit()) || separated {
                if let Some(num) = parse_number_token(rest) {
                    return Some(num);
                }
            }
        }
    }

    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    if tokens.len() < 2 {
        return None;
    }
    let (last, leading) = tokens.split_last()?;
    let num = parse_number_token(last)?;
    if leading.iter().any(|token| DISC_KEYWORDS.contains(token)) {
        return Some(num);
    }
    None
}

fn normalize_disc_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| match ch {
            '_' | '-' | '.' => ' ',
            other => other.to_ascii_lowercase(),
        })
        .collect();
    cleaned.trim().to_string()
}

fn parse_number_token(token: &str) -> Option<u32> {
    if token.is_empty() {
        return None;
    }
    if token.chars().all(|c| c.is_ascii_digit()) {
        return token.parse().ok();
    }
    roman_to_u32(token)
}

fn roman_to_u32(input: &str) -> Option<u32> {
    let mut total = 0u32;
    let mut prev = 0u32;
    for ch in input.chars().rev() {
        let value = match ch {
            'i' => 1,
            'v' => 5,
            'x' => 10,
            'l' => 50,
            'c' => 100,
            'd' => 500,
            'm' => 1000,
            _ => return None,
        };
        if value < prev {
            total = total.saturating_sub(value);
        } else {
            total = total.saturating_add(value);
            prev = value;
        }
    }
    if total == 0 {
        None
    } else {
        Some(total)
    }
}
