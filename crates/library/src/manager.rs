use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{
    image_id, path_to_slash_string, AlbumMetadata, ArtistMetadata, ImageMetadata, ImageSource,
    PlaylistMetadata, TrackMetadata,
};
use metadata::{
    guess_mime, image_dimensions, mime_extension, CoverArt, FilePropertyExtractor, FsPropertyExtractor, LoftyTagExtractor,
    TagExtractor,
};
use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{InstanceCache, LibraryContext, Model};
use crate::config::LibraryConfig;
use crate::playlist::{ParsedPlaylist, PlaylistParser};
use crate::repository::{MetadataRepository, Record};
use crate::scanner::{AudioMetadataScanner, FileMetadata};
use crate::source::{FileHandle, FolderSource};
use crate::LibraryError;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub folder: PathBuf,
    pub files_scanned: usize,
    pub files_failed: usize,
    pub tracks_added: usize,
    pub playlists: usize,
    pub playlist_entries_skipped: usize,
    pub canceled: bool,
}

#[derive(Clone, Debug)]
pub enum ScanEvent {
    Started { folder: PathBuf },
    Completed(ScanSummary),
}

/// Owns the five repositories and drives scans into them.
pub struct FileMetadataManager {
    context: Arc<LibraryContext>,
    source: Arc<dyn FolderSource>,
    config: LibraryConfig,
    tags: Arc<dyn TagExtractor>,
    properties: Arc<dyn FilePropertyExtractor>,
    tracks: MetadataRepository<TrackMetadata>,
    albums: MetadataRepository<AlbumMetadata>,
    artists: MetadataRepository<ArtistMetadata>,
    images: MetadataRepository<ImageMetadata>,
    playlists: MetadataRepository<PlaylistMetadata>,
    subscribers: Mutex<Vec<UnboundedSender<ScanEvent>>>,
    scan_lock: Mutex<()>,
}

impl FileMetadataManager {
    pub fn new(
        context: Arc<LibraryContext>,
        source: Arc<dyn FolderSource>,
        config: LibraryConfig,
    ) -> Self {
        Self {
            context,
            source,
            config,
            tags: Arc::new(LoftyTagExtractor),
            properties: Arc::new(FsPropertyExtractor),
            tracks: MetadataRepository::new(),
            albums: MetadataRepository::new(),
            artists: MetadataRepository::new(),
            images: MetadataRepository::new(),
            playlists: MetadataRepository::new(),
            subscribers: Mutex::new(Vec::new()),
            scan_lock: Mutex::new(()),
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

    pub fn set_data_folder(&self, folder: &Path) {
        self.tracks.set_data_folder(folder);
        self.albums.set_data_folder(folder);
        self.artists.set_data_folder(folder);
        self.images.set_data_folder(folder);
        self.playlists.set_data_folder(folder);
    }

    pub fn init(&self) -> Result<(), LibraryError> {
        self.tracks.init()?;
        self.albums.init()?;
        self.artists.init()?;
        self.images.init()?;
        self.playlists.init()?;
        Ok(())
    }

    pub fn tracks(&self) -> &MetadataRepository<TrackMetadata> {
        &self.tracks
    }

    pub fn albums(&self) -> &MetadataRepository<AlbumMetadata> {
        &self.albums
    }

    pub fn artists(&self) -> &MetadataRepository<ArtistMetadata> {
        &self.artists
    }

    pub fn images(&self) -> &MetadataRepository<ImageMetadata> {
        &self.images
    }

    pub fn playlists(&self) -> &MetadataRepository<PlaylistMetadata> {
        &self.playlists
    }

    pub fn context(&self) -> &Arc<LibraryContext> {
        &self.context
    }

    pub fn subscribe(&self) -> UnboundedReceiver<ScanEvent> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Scans every audio and playlist file below `folder` and merges the
    /// results into the repositories. Scans on one manager run one at a
    /// time. A canceled scan keeps everything committed before the
    /// cancellation and returns `LibraryError::Canceled`.
    pub fn scan_folder(
        &self,
        folder: &Path,
        cancel: &CancellationToken,
    ) -> Result<ScanSummary, LibraryError> {
        let _guard = self.scan_lock.lock();
        if !self.tracks.is_initialized() {
            return Err(LibraryError::NotInitialized("call init before scanning"));
        }

        info!("Library scan started: {:?}", folder);
        self.publish(ScanEvent::Started {
            folder: folder.to_path_buf(),
        });

        let mut summary = ScanSummary {
            folder: folder.to_path_buf(),
            ..Default::default()
        };
        let result = self.run_scan(folder, cancel, &mut summary);
        summary.canceled = matches!(result, Err(LibraryError::Canceled));

        match &result {
            Ok(()) => info!(
                "Library scan finished: {} files ({} failed), {} new tracks, {} playlists",
                summary.files_scanned,
                summary.files_failed,
                summary.tracks_added,
                summary.playlists
            ),
            Err(LibraryError::Canceled) => info!(
                "Library scan canceled after {} files",
                summary.files_scanned
            ),
            Err(err) => warn!("Library scan failed: {}", err),
        }
        self.publish(ScanEvent::Completed(summary.clone()));
        result.map(|_| summary)
    }

    fn run_scan(
        &self,
        folder: &Path,
        cancel: &CancellationToken,
        summary: &mut ScanSummary,
    ) -> Result<(), LibraryError> {
        let files = self.source.list_files(folder, true)?;

        let mut audio = Vec::new();
        let mut playlists = Vec::new();
        let mut covers: HashMap<String, ImageMetadata> = HashMap::new();
        for file in files {
            let ext = file.extension().unwrap_or_default();
            if self.config.is_audio(&ext) {
                audio.push(file);
            } else if self.config.is_playlist(&ext) {
                playlists.push(file);
            } else if file
                .file_name()
                .map_or(false, |name| self.config.is_cover(&name))
            {
                let key = parent_key(&path_to_slash_string(&file.path));
                covers.entry(key).or_insert_with(|| folder_cover(self.source.as_ref(), &file));
            }
        }
        info!(
            "Found {} audio files, {} playlists and {} folder covers",
            audio.len(),
            playlists.len(),
            covers.len()
        );
        self.images.add_or_update(covers.values().cloned().collect())?;

        let scanner = AudioMetadataScanner::new(
            Arc::clone(&self.source),
            self.config.scan_types,
            self.config.degrees_of_parallelism,
        )
        .with_extractors(Arc::clone(&self.tags), Arc::clone(&self.properties));

        let batch_size = self.config.batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);
        let mut stream = scanner.scan_music_files(audio, cancel);
        for mut file in stream.by_ref() {
            summary.files_scanned += 1;
            if file.failure.is_some() {
                summary.files_failed += 1;
            }
            if let Some(cover) = covers.get(&parent_key(&file.path)) {
                file.album.image_ids.insert(cover.id.clone());
            }
            batch.push(file);
            if batch.len() >= batch_size {
                summary.tracks_added += self.commit_batch(std::mem::take(&mut batch))?;
            }
        }
        let canceled = stream.was_canceled();
        drop(stream);
        summary.tracks_added += self.commit_batch(batch)?;
        if canceled {
            return Err(LibraryError::Canceled);
        }

        for file in playlists {
            if cancel.is_cancelled() {
                return Err(LibraryError::Canceled);
            }
            match self.import_playlist(&file) {
                Ok(parsed) => {
                    summary.playlists += 1;
                    summary.playlist_entries_skipped += parsed.skipped.len();
                }
                Err(err) => {
                    warn!("Failed to import playlist {:?}: {}", file.path, err);
                    summary.files_failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Upserts one batch of scanned files. Returns how many tracks were new.
    fn commit_batch(&self, files: Vec<FileMetadata>) -> Result<usize, LibraryError> {
        if files.is_empty() {
            return Ok(0);
        }
        let mut tracks = Vec::with_capacity(files.len());
        let mut albums = Vec::with_capacity(files.len());
        let mut artists = Vec::new();
        let mut images = Vec::new();

        for file in files {
            let FileMetadata {
                track,
                album,
                artists: file_artists,
                images: file_images,
                cover,
                ..
            } = file;
            for mut image in file_images {
                if let Some(cover) = cover.as_ref().filter(|_| self.config.persist_cover_art) {
                    self.persist_cover(&mut image, cover);
                }
                images.push(image);
            }
            artists.extend(file_artists);
            albums.push(album);
            tracks.push(track);
        }

        self.images.add_or_update(images)?;
        self.artists.add_or_update(artists)?;
        self.albums.add_or_update(albums)?;
        let summary = self.tracks.add_or_update(tracks)?;
        Ok(summary.added)
    }

    /// Copies embedded cover bytes into the data folder and points the
    /// image at the copy. Failures leave the embedded source in place.
    fn persist_cover(&self, image: &mut ImageMetadata, cover: &CoverArt) {
        let folder = match self.tracks.data_folder() {
            Some(folder) => folder,
            None => return,
        };
        let path = folder.join("images").join(format!(
            "{}.{}",
            image.id,
            mime_extension(cover.mime.as_deref())
        ));
        match self.source.write_bytes(&path, &cover.data) {
            Ok(()) => {
                image.source = ImageSource::File {
                    path: path_to_slash_string(&path),
                };
            }
            Err(err) => warn!("Failed to store cover {:?}: {}", path, err),
        }
    }

    /// Parses one playlist file against the tracks known so far and stores
    /// the result.
    pub fn import_playlist(&self, file: &FileHandle) -> Result<ParsedPlaylist, LibraryError> {
        let mut xml = String::new();
        {
            let mut stream = self.source.open_read(file)?;
            stream.read_to_string(&mut xml)?;
        }
        let parsed = PlaylistParser::new(&self.tracks).parse(&file.path, &xml)?;
        self.playlists
            .add_or_update(vec![parsed.playlist.clone()])?;
        Ok(parsed)
    }

    pub fn track_model(&self, id: &str) -> Option<Arc<Model<TrackMetadata>>> {
        resolve_model(&self.tracks, &self.context.tracks, id)
    }

    pub fn album_model(&self, id: &str) -> Option<Arc<Model<AlbumMetadata>>> {
        resolve_model(&self.albums, &self.context.albums, id)
    }

    pub fn artist_model(&self, id: &str) -> Option<Arc<Model<ArtistMetadata>>> {
        resolve_model(&self.artists, &self.context.artists, id)
    }

    pub fn image_model(&self, id: &str) -> Option<Arc<Model<ImageMetadata>>> {
        resolve_model(&self.images, &self.context.images, id)
    }

    pub fn playlist_model(&self, id: &str) -> Option<Arc<Model<PlaylistMetadata>>> {
        resolve_model(&self.playlists, &self.context.playlists, id)
    }

    fn publish(&self, event: ScanEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Looks `id` up in `repo` and returns the shared model for it, creating
/// the model on first use and refreshing it with the latest record.
fn resolve_model<M: Record + PartialEq>(
    repo: &MetadataRepository<M>,
    cache: &InstanceCache<Model<M>>,
    id: &str,
) -> Option<Arc<Model<M>>> {
    let record = repo.get_by_id(id)?;
    let model = cache.get_or_create(id, || Model::new(id, record.clone()));
    model.refresh(record);
    Some(model)
}

fn parent_key(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(path_to_slash_string)
        .unwrap_or_default()
}

fn folder_cover(source: &dyn FolderSource, file: &FileHandle) -> ImageMetadata {
    let image = ImageSource::File {
        path: path_to_slash_string(&file.path),
    };
    let bytes = match read_all(source, file) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("Failed to read folder cover {}: {}", file.path.display(), err);
            Vec::new()
        }
    };
    let mime = guess_mime(&bytes).unwrap_or_else(|| match file.extension().as_deref() {
        Some("png") => "image/png".to_string(),
        _ => "image/jpeg".to_string(),
    });
    let dimensions = image_dimensions(&bytes);
    ImageMetadata {
        id: image_id(&image),
        source: image,
        mime: Some(mime),
        width: dimensions.map(|(width, _)| width),
        height: dimensions.map(|(_, height)| height),
    }
}

fn read_all(source: &dyn FolderSource, file: &FileHandle) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    source.open_read(file)?.read_to_end(&mut bytes)?;
    Ok(bytes)
}
