use std::collections::BTreeMap;
use std::path::Path;

use common::{
    album_id, artist_id, path_to_slash_string, playlist_id, resolve_reference, PlaylistMetadata,
    TrackMetadata,
};
use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, warn};

use crate::repository::MetadataRepository;
use crate::LibraryError;

/// One `smil/body/seq/media` element.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MediaEntry {
    pub src: Option<String>,
    pub album_title: Option<String>,
    pub album_artist: Option<String>,
    pub track_title: Option<String>,
    pub track_artist: Option<String>,
    pub duration: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SmilDocument {
    pub title: Option<String>,
    pub meta: Vec<(String, String)>,
    pub media: Vec<MediaEntry>,
}

/// Looks up previously scanned tracks for playlist entries.
pub trait TrackResolver {
    fn track_by_path(&self, path: &str) -> Option<String>;

    fn track_by_tags(
        &self,
        title: &str,
        artist: Option<&str>,
        album: Option<&str>,
        album_artist: Option<&str>,
    ) -> Option<String>;
}

impl TrackResolver for MetadataRepository<TrackMetadata> {
    fn track_by_path(&self, path: &str) -> Option<String> {
        self.get_by_path(path).map(|track| track.id)
    }

    fn track_by_tags(
        &self,
        title: &str,
        artist: Option<&str>,
        album: Option<&str>,
        album_artist: Option<&str>,
    ) -> Option<String> {
        let artist_key = artist.map(artist_id);
        let album_key = album.map(|album| album_id(album_artist.or(artist).unwrap_or(""), album));
        self.find_track(title, artist_key.as_deref(), album_key.as_deref())
            .or_else(|| self.find_track(title, artist_key.as_deref(), None))
            .map(|track| track.id)
    }
}

#[derive(Clone, Debug)]
pub struct ParsedPlaylist {
    pub playlist: PlaylistMetadata,
    pub skipped: Vec<MediaEntry>,
}

pub struct PlaylistParser<'a, R: TrackResolver + ?Sized> {
    resolver: &'a R,
}

impl<'a, R: TrackResolver + ?Sized> PlaylistParser<'a, R> {
    pub fn new(resolver: &'a R) -> Self {
        Self { resolver }
    }

    /// Parses the playlist stored at `path` and resolves its entries.
    /// Entries that match no track are skipped.
    pub fn parse(&self, path: &Path, xml: &str) -> Result<ParsedPlaylist, LibraryError> {
        let document = parse_smil(xml)?;
        let path_string = path_to_slash_string(path);
        let base = path.parent().unwrap_or_else(|| Path::new(""));

        let mut track_ids = Vec::new();
        let mut skipped = Vec::new();
        for entry in document.media {
            match self.resolve(base, &entry) {
                Some(id) => track_ids.push(id),
                None => {
                    warn!(
                        "Playlist {:?}: no track for entry {:?}",
                        path,
                        entry.src.as_deref().or(entry.track_title.as_deref())
                    );
                    skipped.push(entry);
                }
            }
        }

        let name = document
            .title
            .filter(|title| !title.trim().is_empty())
            .or_else(|| {
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
            })
            .unwrap_or_default();
        let attributes: BTreeMap<String, String> = document.meta.into_iter().collect();

        debug!(
            "Playlist {:?}: {} resolved, {} skipped",
            path,
            track_ids.len(),
            skipped.len()
        );
        Ok(ParsedPlaylist {
            playlist: PlaylistMetadata {
                id: playlist_id(&path_string),
                name,
                track_ids,
                path: path_string,
                attributes,
            },
            skipped,
        })
    }

    fn resolve(&self, base: &Path, entry: &MediaEntry) -> Option<String> {
        if let Some(src) = entry.src.as_deref().filter(|src| !src.trim().is_empty()) {
            let resolved = path_to_slash_string(&resolve_reference(base, src));
            if let Some(id) = self.resolver.track_by_path(&resolved) {
                return Some(id);
            }
            if let Some(id) = self.resolver.track_by_path(&src.replace('\\', "/")) {
                return Some(id);
            }
        }
        let title = entry.track_title.as_deref()?;
        self.resolver.track_by_tags(
            title,
            entry.track_artist.as_deref(),
            entry.album_title.as_deref(),
            entry.album_artist.as_deref(),
        )
    }
}

/// Reads the SMIL structure without resolving anything.
pub fn parse_smil(xml: &str) -> Result<SmilDocument, LibraryError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut document = SmilDocument::default();
    let mut stack: Vec<String> = Vec::new();
    let mut saw_root = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = local_name(&e);
                if stack.is_empty() {
                    if name != "smil" {
                        return Err(LibraryError::InvalidPlaylist(format!(
                            "root element is {}",
                            name
                        )));
                    }
                    saw_root = true;
                }
                if name == "title" && in_path(&stack, &["smil", "head"]) {
                    let raw = reader.read_text(e.name())?;
                    let text = unescape(&raw)
                        .map_err(quick_xml::Error::from)?
                        .trim()
                        .to_string();
                    document.title = Some(text);
                    continue;
                }
                handle_element(&mut document, &stack, &name, &e);
                stack.push(name);
            }
            Event::Empty(e) => {
                let name = local_name(&e);
                if stack.is_empty() && name != "smil" {
                    return Err(LibraryError::InvalidPlaylist(format!(
                        "root element is {}",
                        name
                    )));
                }
                saw_root = saw_root || stack.is_empty();
                handle_element(&mut document, &stack, &name, &e);
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(LibraryError::InvalidPlaylist("missing smil root".to_string()));
    }
    Ok(document)
}

fn handle_element(document: &mut SmilDocument, stack: &[String], name: &str, e: &BytesStart) {
    if name == "meta" && in_path(stack, &["smil", "head"]) {
        let attrs = attributes(e);
        if let Some(key) = attrs.get("name") {
            let value = attrs.get("content").cloned().unwrap_or_default();
            document.meta.push((key.clone(), value));
        }
    } else if name == "media" && in_path(stack, &["smil", "body", "seq"]) {
        let mut attrs = attributes(e);
        document.media.push(MediaEntry {
            src: attrs.remove("src"),
            album_title: attrs.remove("albumtitle"),
            album_artist: attrs.remove("albumartist"),
            track_title: attrs.remove("tracktitle"),
            track_artist: attrs.remove("trackartist"),
            duration: attrs.remove("duration"),
        });
    }
}

fn in_path(stack: &[String], path: &[&str]) -> bool {
    stack.len() == path.len() && stack.iter().zip(path).all(|(a, b)| a == b)
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase()
}

/// Attribute values keyed by lowercased local name. Malformed attributes
/// are ignored.
fn attributes(e: &BytesStart) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for attr in e.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_ascii_lowercase();
        if let Ok(value) = attr.unescape_value() {
            out.insert(key, value.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const PLAYLIST: &str = r#"<?wpl version="1.0"?>
<smil>
  <head>
    <meta name="Generator" content="Zune -- 4.8"/>
    <meta name="ItemCount" content="3"/>
    <title>Road &amp; Trip</title>
  </head>
  <body>
    <seq>
      <media src="..\Music\b.mp3" albumTitle="Second" albumArtist="Band" trackTitle="B" trackArtist="Band" duration="1000"/>
      <media src="missing.mp3"/>
      <media src="/lib/a.mp3"></media>
    </seq>
  </body>
</smil>"#;

    struct FakeResolver {
        paths: HashMap<String, String>,
    }

    impl TrackResolver for FakeResolver {
        fn track_by_path(&self, path: &str) -> Option<String> {
            self.paths.get(path).cloned()
        }

        fn track_by_tags(
            &self,
            _title: &str,
            _artist: Option<&str>,
            _album: Option<&str>,
            _album_artist: Option<&str>,
        ) -> Option<String> {
            None
        }
    }

    #[test]
    fn reads_head_and_media() {
        let document = parse_smil(PLAYLIST).unwrap();
        assert_eq!(document.title.as_deref(), Some("Road & Trip"));
        assert_eq!(document.meta.len(), 2);
        assert_eq!(document.media.len(), 3);
        assert_eq!(document.media[0].album_title.as_deref(), Some("Second"));
        assert_eq!(document.media[0].duration.as_deref(), Some("1000"));
        assert_eq!(document.media[2].src.as_deref(), Some("/lib/a.mp3"));
    }

    #[test]
    fn unresolved_entries_are_skipped_in_order() {
        let resolver = FakeResolver {
            paths: HashMap::from([
                ("/lib/a.mp3".to_string(), "track-a".to_string()),
                ("/Music/b.mp3".to_string(), "track-b".to_string()),
            ]),
        };
        let parsed = PlaylistParser::new(&resolver)
            .parse(Path::new("/lists/trip.zpl"), PLAYLIST)
            .unwrap();
        assert_eq!(parsed.playlist.track_ids, vec!["track-b", "track-a"]);
        assert_eq!(parsed.skipped.len(), 1);
        assert_eq!(parsed.playlist.name, "Road & Trip");
        assert_eq!(parsed.playlist.path, "/lists/trip.zpl");
        assert_eq!(
            parsed.playlist.attributes.get("ItemCount").map(String::as_str),
            Some("3")
        );
    }

    #[test]
    fn rejects_other_roots() {
        assert!(matches!(
            parse_smil("<playlist><item/></playlist>"),
            Err(LibraryError::InvalidPlaylist(_))
        ));
        assert!(parse_smil("").is_err());
    }

    #[test]
    fn name_falls_back_to_file_stem() {
        let resolver = FakeResolver {
            paths: HashMap::new(),
        };
        let parsed = PlaylistParser::new(&resolver)
            .parse(Path::new("/lists/mix.wpl"), "<smil><body><seq/></body></smil>")
            .unwrap();
        assert_eq!(parsed.playlist.name, "mix");
        assert!(parsed.playlist.track_ids.is_empty());
    }
}
