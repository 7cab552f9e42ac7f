use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

const ID_SEP: char = '\x1f';

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub id: String,
    pub path: String,
    pub title: String,
    pub track_no: Option<u32>,
    pub disc_no: Option<u32>,
    pub duration_ms: u32,
    pub artist_ids: BTreeSet<String>,
    pub album_id: String,
    pub genres: BTreeSet<String>,
    pub image_ids: BTreeSet<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub modified: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumMetadata {
    pub id: String,
    pub name: String,
    pub artist_ids: BTreeSet<String>,
    pub track_ids: BTreeSet<String>,
    pub image_ids: BTreeSet<String>,
    pub year: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistMetadata {
    pub id: String,
    pub name: String,
    pub track_ids: BTreeSet<String>,
    pub album_ids: BTreeSet<String>,
    pub image_ids: BTreeSet<String>,
    pub genres: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub id: String,
    pub source: ImageSource,
    pub mime: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    /// Picture embedded in the tags of the audio file at `path`.
    Embedded { path: String },
    /// Standalone image file.
    File { path: String },
}

impl ImageSource {
    pub fn locator(&self) -> String {
        match self {
            ImageSource::Embedded { path } => format!("embedded:{}", path),
            ImageSource::File { path } => format!("file:{}", path),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistMetadata {
    pub id: String,
    pub name: String,
    pub track_ids: Vec<String>,
    pub path: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl TrackMetadata {
    pub fn merge(&mut self, incoming: TrackMetadata) {
        merge_string(&mut self.path, incoming.path);
        merge_string(&mut self.title, incoming.title);
        merge_option(&mut self.track_no, incoming.track_no);
        merge_option(&mut self.disc_no, incoming.disc_no);
        if incoming.duration_ms > 0 {
            self.duration_ms = incoming.duration_ms;
        }
        merge_string(&mut self.album_id, incoming.album_id);
        merge_option(&mut self.file_size, incoming.file_size);
        merge_option(&mut self.modified, incoming.modified);
        self.artist_ids.extend(incoming.artist_ids);
        self.genres.extend(incoming.genres);
        self.image_ids.extend(incoming.image_ids);
    }
}

impl AlbumMetadata {
    pub fn merge(&mut self, incoming: AlbumMetadata) {
        merge_string(&mut self.name, incoming.name);
        merge_option(&mut self.year, incoming.year);
        self.artist_ids.extend(incoming.artist_ids);
        self.track_ids.extend(incoming.track_ids);
        self.image_ids.extend(incoming.image_ids);
    }
}

impl ArtistMetadata {
    pub fn merge(&mut self, incoming: ArtistMetadata) {
        merge_string(&mut self.name, incoming.name);
        self.track_ids.extend(incoming.track_ids);
        self.album_ids.extend(incoming.album_ids);
        self.image_ids.extend(incoming.image_ids);
        self.genres.extend(incoming.genres);
    }
}

impl ImageMetadata {
    pub fn merge(&mut self, incoming: ImageMetadata) {
        self.source = incoming.source;
        merge_option(&mut self.mime, incoming.mime);
        merge_option(&mut self.width, incoming.width);
        merge_option(&mut self.height, incoming.height);
    }
}

impl PlaylistMetadata {
    pub fn merge(&mut self, incoming: PlaylistMetadata) {
        merge_string(&mut self.name, incoming.name);
        merge_string(&mut self.path, incoming.path);
        if !incoming.track_ids.is_empty() {
            self.track_ids = incoming.track_ids;
        }
        self.attributes.extend(incoming.attributes);
    }
}

fn merge_string(current: &mut String, incoming: String) {
    if !incoming.is_empty() {
        *current = incoming;
    }
}

fn merge_option<T>(current: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *current = incoming;
    }
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

fn keyed_id(kind: &str, parts: &[&str]) -> String {
    let mut key = String::from(kind);
    for part in parts {
        key.push(ID_SEP);
        key.push_str(part);
    }
    stable_id(&key)
}

pub fn track_id(path: &str) -> String {
    keyed_id("track", &[path])
}

pub fn artist_id(name: &str) -> String {
    keyed_id("artist", &[&normalize_name(name)])
}

pub fn album_id(album_artist: &str, title: &str) -> String {
    keyed_id(
        "album",
        &[&normalize_name(album_artist), &normalize_name(title)],
    )
}

pub fn folder_album_id(folder: &str) -> String {
    keyed_id("album", &[folder])
}

pub fn image_id(source: &ImageSource) -> String {
    keyed_id("image", &[&source.locator()])
}

pub fn playlist_id(path: &str) -> String {
    keyed_id("playlist", &[path])
}

/// Trims, collapses inner whitespace and lowercases.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn path_to_slash_string(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .map(|c| match c {
            Component::RootDir => String::new(),
            other => other.as_os_str().to_string_lossy().to_string(),
        })
        .collect();
    parts.join("/")
}

/// Resolves `reference` against `base` lexically. Both `/` and `\` separate
/// components and `..` pops the previous component.
pub fn resolve_reference(base: &Path, reference: &str) -> PathBuf {
    let cleaned = reference.replace('\\', "/");
    let mut out = if cleaned.starts_with('/') {
        PathBuf::from("/")
    } else {
        base.to_path_buf()
    };
    for part in cleaned.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_id_is_deterministic() {
        let first = stable_id("Artist/Album/Track.mp3");
        let second = stable_id("Artist/Album/Track.mp3");
        assert_eq!(first, second);
        assert_ne!(first, stable_id("Artist/Album/Track2.mp3"));
    }

    #[test]
    fn artist_id_ignores_case_and_spacing() {
        assert_eq!(artist_id("The  Beatles "), artist_id("the beatles"));
        assert_ne!(artist_id("The Beatles"), artist_id("Beatles"));
    }

    #[test]
    fn ids_are_namespaced_by_kind() {
        assert_ne!(track_id("a"), playlist_id("a"));
        assert_ne!(folder_album_id("a"), track_id("a"));
    }

    #[test]
    fn artist_merge_unions_sets_and_takes_new_name() {
        let mut artist = ArtistMetadata {
            id: "x".into(),
            name: "Old".into(),
            track_ids: ["t1", "t2"].iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        artist.merge(ArtistMetadata {
            id: "x".into(),
            name: "New".into(),
            track_ids: ["t2", "t3"].iter().map(|s| s.to_string()).collect(),
            genres: ["Rock".to_string()].into_iter().collect(),
            ..Default::default()
        });
        assert_eq!(artist.name, "New");
        assert_eq!(artist.track_ids.len(), 3);
        assert!(artist.genres.contains("Rock"));
    }

    #[test]
    fn track_merge_keeps_known_scalars() {
        let mut track = TrackMetadata {
            id: "t".into(),
            title: "Song".into(),
            track_no: Some(3),
            duration_ms: 1000,
            ..Default::default()
        };
        track.merge(TrackMetadata {
            id: "t".into(),
            track_no: Some(4),
            ..Default::default()
        });
        assert_eq!(track.title, "Song");
        assert_eq!(track.track_no, Some(4));
        assert_eq!(track.duration_ms, 1000);
    }

    #[test]
    fn playlist_merge_replaces_order() {
        let mut playlist = PlaylistMetadata {
            track_ids: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        playlist.merge(PlaylistMetadata {
            track_ids: vec!["b".into(), "a".into()],
            ..Default::default()
        });
        assert_eq!(playlist.track_ids, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn resolve_reference_handles_parent_and_backslashes() {
        let base = Path::new("/music/lists");
        let resolved = resolve_reference(base, "..\\Album\\01.mp3");
        assert_eq!(path_to_slash_string(&resolved), "/music/Album/01.mp3");
        let absolute = resolve_reference(base, "/other/a.flac");
        assert_eq!(path_to_slash_string(&absolute), "/other/a.flac");
    }
}
