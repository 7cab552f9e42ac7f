use std::collections::BTreeMap;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::{DynamicImage, ImageFormat};
use library::{
    FileHandle, FileMetadataManager, FolderSource, ImageSource, LibraryConfig, LibraryContext,
    LibraryError, MediaStream, MetadataError, RepositoryEvent, ScanEvent, TagExtractor, TagInfo,
};
use metadata::{split_artists, CoverArt, FsPropertyExtractor};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Files held in memory. Contents are `key=value` lines read by `LineTags`.
#[derive(Default)]
struct MemoryFolder {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
}

impl MemoryFolder {
    fn add(&self, path: &str, contents: impl Into<Vec<u8>>) {
        self.files.lock().insert(PathBuf::from(path), contents.into());
    }

    fn contains(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path)
    }
}

impl FolderSource for MemoryFolder {
    fn list_files(&self, folder: &Path, recursive: bool) -> io::Result<Vec<FileHandle>> {
        let files = self.files.lock();
        Ok(files
            .keys()
            .filter(|path| {
                if recursive {
                    path.starts_with(folder)
                } else {
                    path.parent() == Some(folder)
                }
            })
            .map(|path| FileHandle::new(path.clone()))
            .collect())
    }

    fn open_read(&self, file: &FileHandle) -> io::Result<Box<dyn MediaStream>> {
        let files = self.files.lock();
        let bytes = files
            .get(&file.path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn write_bytes(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        self.files.lock().insert(path.to_path_buf(), bytes.to_vec());
        Ok(())
    }
}

/// Parses `key=value` lines. A file starting with `corrupt` fails.
/// Optionally cancels a token once `cancel_after` files were read.
#[derive(Default)]
struct LineTags {
    seen: AtomicUsize,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl TagExtractor for LineTags {
    fn extract(&self, stream: &mut dyn MediaStream, _path: &Path) -> Result<TagInfo, MetadataError> {
        let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = &self.cancel_after {
            if seen >= *limit {
                token.cancel();
            }
        }

        let mut text = String::new();
        stream.read_to_string(&mut text)?;
        if text.starts_with("corrupt") {
            return Err(MetadataError::Unsupported("corrupt header".to_string()));
        }

        let mut info = TagInfo::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "title" => info.title = Some(value.to_string()),
                "artist" => info.artists = split_artists(value),
                "album_artist" => info.album_artists = split_artists(value),
                "album" => info.album = Some(value.to_string()),
                "track" => info.track_no = value.parse().ok(),
                "disc" => info.disc_no = value.parse().ok(),
                "year" => info.year = value.parse().ok(),
                "genre" => info.genres.push(value.to_string()),
                "cover" => {
                    info.cover = Some(CoverArt {
                        data: value.as_bytes().to_vec(),
                        mime: Some("image/png".to_string()),
                    })
                }
                _ => {}
            }
        }
        Ok(info)
    }
}

fn song(title: &str, artist: &str, album: &str, disc: u32, track: u32) -> String {
    format!(
        "title={}\nartist={}\nalbum={}\ndisc={}\ntrack={}\n",
        title, artist, album, disc, track
    )
}

fn config() -> LibraryConfig {
    LibraryConfig {
        degrees_of_parallelism: 4,
        batch_size: 16,
        ..LibraryConfig::default()
    }
}

fn manager_with(
    context: Arc<LibraryContext>,
    source: Arc<MemoryFolder>,
    tags: LineTags,
    config: LibraryConfig,
    data: &Path,
) -> FileMetadataManager {
    let manager = FileMetadataManager::new(context, source, config)
        .with_extractors(Arc::new(tags), Arc::new(FsPropertyExtractor));
    manager.set_data_folder(data);
    manager.init().unwrap();
    manager
}

fn manager(source: Arc<MemoryFolder>, data: &TempDir) -> FileMetadataManager {
    manager_with(
        LibraryContext::new(),
        source,
        LineTags::default(),
        config(),
        data.path(),
    )
}

fn scan(manager: &FileMetadataManager) -> Result<library::ScanSummary, LibraryError> {
    manager.scan_folder(Path::new("/music"), &CancellationToken::new())
}

#[test]
fn two_hundred_tracks_come_back_in_disc_then_track_order() {
    let source = Arc::new(MemoryFolder::default());
    // Insert in a scrambled order so neither listing nor completion order
    // matches the canonical one.
    for i in 0..200u32 {
        let n = (i * 37) % 200;
        let disc = n / 100 + 1;
        let track = n % 100 + 1;
        source.add(
            &format!("/music/Big/{:03}.mp3", (n * 53) % 200),
            song(&format!("Song {}-{}", disc, track), "Band", "Big", disc, track),
        );
    }
    let data = tempfile::tempdir().unwrap();
    let manager = manager(Arc::clone(&source), &data);

    let summary = scan(&manager).unwrap();
    assert_eq!(summary.files_scanned, 200);
    assert_eq!(summary.tracks_added, 200);
    assert_eq!(manager.albums().count(), 1);

    let album = manager.albums().get_items(0, 1).remove(0);
    assert_eq!(album.track_ids.len(), 200);
    let tracks = manager.tracks().get_tracks_by_album_id(&album.id, 0, 500);
    let positions: Vec<(Option<u32>, Option<u32>)> =
        tracks.iter().map(|t| (t.disc_no, t.track_no)).collect();
    let mut expected = positions.clone();
    expected.sort();
    assert_eq!(positions, expected);
    assert_eq!(positions[0], (Some(1), Some(1)));
    assert_eq!(positions[199], (Some(2), Some(100)));

    let page = manager.tracks().get_items(100, 10);
    assert_eq!(page.len(), 10);
    assert_eq!((page[0].disc_no, page[0].track_no), (Some(2), Some(1)));
}

#[test]
fn track_with_two_artists_is_listed_under_both() {
    let source = Arc::new(MemoryFolder::default());
    source.add("/music/Duo/01.mp3", song("Together", "Alpha; Beta", "Duo", 1, 1));
    let data = tempfile::tempdir().unwrap();
    let manager = manager(Arc::clone(&source), &data);
    scan(&manager).unwrap();

    assert_eq!(manager.artists().count(), 2);
    let track = manager.tracks().get_by_path("/music/Duo/01.mp3").unwrap();
    for artist in manager.artists().get_items(0, 10) {
        assert!(artist.track_ids.contains(&track.id));
        let tracks = manager.tracks().get_tracks_by_artist_id(&artist.id, 0, 10);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, track.id);
    }
    let names: Vec<String> = manager
        .artists()
        .get_items(0, 10)
        .into_iter()
        .map(|a| a.name)
        .collect();
    assert_eq!(names, vec!["Alpha", "Beta"]);
}

#[test]
fn album_and_artist_sets_accumulate_across_batches() {
    let source = Arc::new(MemoryFolder::default());
    source.add("/music/Mix/01.mp3", song("One", "Solo", "Mix", 1, 1) + "genre=Rock\n");
    source.add("/music/Mix/02.mp3", song("Two", "Solo", "Mix", 1, 2) + "genre=Jazz\n");
    let data = tempfile::tempdir().unwrap();
    let config = LibraryConfig {
        batch_size: 1,
        degrees_of_parallelism: 1,
        ..LibraryConfig::default()
    };
    let manager = manager_with(
        LibraryContext::new(),
        Arc::clone(&source),
        LineTags::default(),
        config,
        data.path(),
    );
    scan(&manager).unwrap();

    let album = manager.albums().get_items(0, 1).remove(0);
    assert_eq!(album.track_ids.len(), 2);
    let artist = manager.artists().get_items(0, 1).remove(0);
    assert_eq!(artist.track_ids.len(), 2);
    assert!(artist.genres.contains("Rock") && artist.genres.contains("Jazz"));
}

#[test]
fn rescanning_is_idempotent() {
    let source = Arc::new(MemoryFolder::default());
    source.add("/music/A/01.mp3", song("One", "Solo", "A", 1, 1));
    source.add("/music/A/02.mp3", song("Two", "Solo", "A", 1, 2));
    let data = tempfile::tempdir().unwrap();
    let manager = manager(Arc::clone(&source), &data);

    scan(&manager).unwrap();
    let before = manager.tracks().get_items(0, 10);
    let mut events = manager.tracks().subscribe();

    let summary = scan(&manager).unwrap();
    assert_eq!(summary.tracks_added, 0);
    assert_eq!(manager.tracks().get_items(0, 10), before);
    assert_eq!(manager.albums().count(), 1);
    assert_eq!(manager.artists().count(), 1);

    while let Ok(event) = events.try_recv() {
        assert!(matches!(event, RepositoryEvent::Updated(_)));
    }
}

#[test]
fn removed_tracks_stay_removed_after_reload() {
    let source = Arc::new(MemoryFolder::default());
    source.add("/music/A/01.mp3", song("One", "Solo", "A", 1, 1));
    source.add("/music/A/02.mp3", song("Two", "Solo", "A", 1, 2));
    let data = tempfile::tempdir().unwrap();
    {
        let manager = manager(Arc::clone(&source), &data);
        scan(&manager).unwrap();
        let track = manager.tracks().get_by_path("/music/A/01.mp3").unwrap();
        let removed = manager.tracks().remove_by_id(&track.id).unwrap();
        assert_eq!(removed.id, track.id);
        assert_eq!(manager.tracks().count(), 1);
        assert!(matches!(
            manager.tracks().remove_by_id(&track.id),
            Err(LibraryError::InvalidArgument(_))
        ));
    }

    let reloaded = manager(Arc::clone(&source), &data);
    assert_eq!(reloaded.tracks().count(), 1);
    assert!(reloaded.tracks().get_by_path("/music/A/01.mp3").is_none());
    assert!(reloaded.tracks().get_by_path("/music/A/02.mp3").is_some());
}

#[test]
fn playlists_resolve_by_path_and_by_tags() {
    let source = Arc::new(MemoryFolder::default());
    source.add("/music/Big/001.mp3", song("First", "Band", "Big", 1, 1));
    source.add("/music/Duo/01.mp3", song("Solo Run", "Alpha; Beta", "Duo", 1, 1));
    source.add(
        "/music/lists/trip.zpl",
        r#"<?zpl version="2.0"?>
<smil>
  <head><title>Trip</title></head>
  <body>
    <seq>
      <media src="..\Big\001.mp3"/>
      <media src="gone.mp3" trackTitle="Nowhere" trackArtist="Nobody"/>
      <media src="D:\elsewhere\01.mp3" trackTitle="solo run" trackArtist="Alpha" albumTitle="Duo"/>
    </seq>
  </body>
</smil>"#,
    );
    let data = tempfile::tempdir().unwrap();
    let manager = manager(Arc::clone(&source), &data);

    let summary = scan(&manager).unwrap();
    assert_eq!(summary.playlists, 1);
    assert_eq!(summary.playlist_entries_skipped, 1);

    let playlist = manager
        .playlists()
        .get_by_key("/music/lists/trip.zpl")
        .unwrap();
    assert_eq!(playlist.name, "Trip");
    let first = manager.tracks().get_by_path("/music/Big/001.mp3").unwrap();
    let second = manager.tracks().get_by_path("/music/Duo/01.mp3").unwrap();
    assert_eq!(playlist.track_ids, vec![first.id, second.id]);
}

#[test]
fn broken_playlists_count_as_failures() {
    let source = Arc::new(MemoryFolder::default());
    source.add("/music/lists/bad.wpl", "<playlist/>");
    let data = tempfile::tempdir().unwrap();
    let manager = manager(Arc::clone(&source), &data);

    let summary = scan(&manager).unwrap();
    assert_eq!(summary.playlists, 0);
    assert_eq!(summary.files_failed, 1);
    assert_eq!(manager.playlists().count(), 0);
}

#[test]
fn unreadable_tags_fall_back_to_file_properties() {
    let source = Arc::new(MemoryFolder::default());
    source.add("/music/Odd/07 - Mystery.mp3", "corrupt bytes");
    let data = tempfile::tempdir().unwrap();
    let manager = manager(Arc::clone(&source), &data);

    let summary = scan(&manager).unwrap();
    assert_eq!(summary.files_scanned, 1);
    assert_eq!(summary.files_failed, 1);
    let track = manager
        .tracks()
        .get_by_path("/music/Odd/07 - Mystery.mp3")
        .unwrap();
    assert_eq!(track.title, "07 - Mystery");
    assert_eq!(track.file_size, Some("corrupt bytes".len() as u64));
}

#[test]
fn folder_covers_attach_to_albums() {
    let source = Arc::new(MemoryFolder::default());
    source.add("/music/A/01.mp3", song("One", "Solo", "A", 1, 1));
    source.add("/music/A/Folder.jpg", vec![0u8; 4]);
    let data = tempfile::tempdir().unwrap();
    let manager = manager(Arc::clone(&source), &data);
    scan(&manager).unwrap();

    let images = manager.images().get_items(0, 10);
    assert_eq!(images.len(), 1);
    assert_eq!(
        images[0].source,
        ImageSource::File {
            path: "/music/A/Folder.jpg".to_string()
        }
    );
    let album = manager.albums().get_items(0, 1).remove(0);
    assert!(album.image_ids.contains(&images[0].id));
}

#[test]
fn folder_covers_carry_their_pixel_size() {
    let mut png = Cursor::new(Vec::new());
    DynamicImage::new_rgb8(300, 200)
        .write_to(&mut png, ImageFormat::Png)
        .unwrap();
    let source = Arc::new(MemoryFolder::default());
    source.add("/music/A/01.mp3", song("One", "Solo", "A", 1, 1));
    // Extension says jpeg, the bytes say png.
    source.add("/music/A/cover.jpg", png.into_inner());
    let data = tempfile::tempdir().unwrap();
    let manager = manager(Arc::clone(&source), &data);
    scan(&manager).unwrap();

    let image = manager.images().get_items(0, 1).remove(0);
    assert_eq!(image.mime.as_deref(), Some("image/png"));
    assert_eq!((image.width, image.height), (Some(300), Some(200)));
}

#[test]
fn embedded_covers_are_copied_when_enabled() {
    let source = Arc::new(MemoryFolder::default());
    source.add("/music/A/01.mp3", song("One", "Solo", "A", 1, 1) + "cover=PIXELS\n");
    let data = tempfile::tempdir().unwrap();
    let config = LibraryConfig {
        persist_cover_art: true,
        ..config()
    };
    let manager = manager_with(
        LibraryContext::new(),
        Arc::clone(&source),
        LineTags::default(),
        config,
        data.path(),
    );
    scan(&manager).unwrap();

    let image = manager.images().get_items(0, 1).remove(0);
    let stored = data.path().join("images").join(format!("{}.png", image.id));
    assert!(source.contains(&stored));
    assert!(matches!(image.source, ImageSource::File { .. }));
    let track = manager.tracks().get_by_path("/music/A/01.mp3").unwrap();
    assert!(track.image_ids.contains(&image.id));
}

#[test]
fn canceled_scan_keeps_committed_tracks() {
    let source = Arc::new(MemoryFolder::default());
    for i in 0..50u32 {
        source.add(
            &format!("/music/Long/{:02}.mp3", i),
            song(&format!("Part {}", i), "Band", "Long", 1, i + 1),
        );
    }
    let data = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let tags = LineTags {
        seen: AtomicUsize::new(0),
        cancel_after: Some((5, cancel.clone())),
    };
    let config = LibraryConfig {
        degrees_of_parallelism: 1,
        batch_size: 2,
        ..LibraryConfig::default()
    };
    let manager = manager_with(
        LibraryContext::new(),
        Arc::clone(&source),
        tags,
        config,
        data.path(),
    );
    let mut events = manager.subscribe();

    let result = manager.scan_folder(Path::new("/music"), &cancel);
    assert!(matches!(result, Err(LibraryError::Canceled)));
    let stored = manager.tracks().count();
    assert!(stored >= 5 && stored < 50, "stored {}", stored);

    assert!(matches!(events.try_recv(), Ok(ScanEvent::Started { .. })));
    match events.try_recv() {
        Ok(ScanEvent::Completed(summary)) => {
            assert!(summary.canceled);
            assert_eq!(summary.files_scanned, stored);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn cancel_during_the_last_file_is_not_a_canceled_scan() {
    let source = Arc::new(MemoryFolder::default());
    for i in 0..3u32 {
        source.add(
            &format!("/music/Short/{:02}.mp3", i),
            song(&format!("Part {}", i), "Band", "Short", 1, i + 1),
        );
    }
    let data = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let tags = LineTags {
        seen: AtomicUsize::new(0),
        cancel_after: Some((3, cancel.clone())),
    };
    let config = LibraryConfig {
        degrees_of_parallelism: 1,
        ..LibraryConfig::default()
    };
    let manager = manager_with(
        LibraryContext::new(),
        Arc::clone(&source),
        tags,
        config,
        data.path(),
    );

    let summary = manager.scan_folder(Path::new("/music"), &cancel).unwrap();
    assert!(cancel.is_cancelled());
    assert!(!summary.canceled);
    assert_eq!(summary.files_scanned, 3);
    assert_eq!(manager.tracks().count(), 3);
}

#[test]
fn managers_sharing_a_context_share_models() {
    let source = Arc::new(MemoryFolder::default());
    source.add("/music/A/01.mp3", song("One", "Solo", "A", 1, 1));
    let context = LibraryContext::new();
    let first_data = tempfile::tempdir().unwrap();
    let second_data = tempfile::tempdir().unwrap();
    let first = manager_with(
        Arc::clone(&context),
        Arc::clone(&source),
        LineTags::default(),
        config(),
        first_data.path(),
    );
    let second = manager_with(
        Arc::clone(&context),
        Arc::clone(&source),
        LineTags::default(),
        config(),
        second_data.path(),
    );
    scan(&first).unwrap();
    scan(&second).unwrap();

    let id = first.tracks().get_items(0, 1).remove(0).id;
    let a = first.track_model(&id).unwrap();
    let b = second.track_model(&id).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.snapshot().title, "One");
    assert!(first.track_model("missing").is_none());

    let separate_data = tempfile::tempdir().unwrap();
    let separate = manager(Arc::clone(&source), &separate_data);
    scan(&separate).unwrap();
    let c = separate.track_model(&id).unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
}

#[test]
fn scanning_requires_init() {
    let source = Arc::new(MemoryFolder::default());
    let manager = FileMetadataManager::new(LibraryContext::new(), source, config());
    assert!(matches!(
        scan(&manager),
        Err(LibraryError::NotInitialized(_))
    ));
}
