use std::path::Path;

use lofty::picture::{Picture, PictureType};
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};
use lofty::probe::Probe;
use lofty::tag::Tag;

use crate::{
    guess_mime, parse_genres, parse_number, parse_year, split_artists, CoverArt, MediaStream,
    MetadataError, TagExtractor, TagInfo,
};

/// Tag extraction backed by lofty. The format is sniffed from the stream
/// contents, so the path is only used for diagnostics.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoftyTagExtractor;

impl TagExtractor for LoftyTagExtractor {
    fn extract(&self, stream: &mut dyn MediaStream, path: &Path) -> Result<TagInfo, MetadataError> {
        let tagged_file = Probe::new(stream).guess_file_type()?.read()?;
        let properties = tagged_file.properties();

        let mut info = TagInfo::default();

        let duration_ms = properties.duration().as_millis();
        if duration_ms > 0 {
            info.duration_ms = Some(duration_ms.min(u128::from(u32::MAX)) as u32);
        }

        let tag = match tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
            Some(tag) => tag,
            None => {
                tracing::debug!("No tags in {:?}", path);
                return Ok(info);
            }
        };

        info.title = non_empty(tag.get_string(&ItemKey::TrackTitle));
        info.album = non_empty(tag.get_string(&ItemKey::AlbumTitle));
        info.artists = collect_artists(tag, &ItemKey::TrackArtist);
        info.album_artists = collect_artists(tag, &ItemKey::AlbumArtist);
        info.track_no = tag.get_string(&ItemKey::TrackNumber).and_then(parse_number);
        info.disc_no = tag.get_string(&ItemKey::DiscNumber).and_then(parse_number);
        info.year = tag
            .get_string(&ItemKey::Year)
            .or_else(|| tag.get_string(&ItemKey::RecordingDate))
            .and_then(parse_year);
        for value in tag.get_strings(&ItemKey::Genre) {
            for genre in parse_genres(value) {
                if !info.genres.contains(&genre) {
                    info.genres.push(genre);
                }
            }
        }
        info.cover = pick_picture(tag.pictures()).map(|picture| {
            let data = picture.data().to_vec();
            let mime = guess_mime(&data);
            CoverArt { data, mime }
        });

        Ok(info)
    }
}

fn collect_artists(tag: &Tag, key: &ItemKey) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in tag.get_strings(key) {
        for name in split_artists(value) {
            if !out.iter().any(|seen| seen.eq_ignore_ascii_case(&name)) {
                out.push(name);
            }
        }
    }
    out
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

fn pick_picture(pictures: &[Picture]) -> Option<&Picture> {
    for picture in pictures {
        if picture.pic_type() == PictureType::CoverFront {
            return Some(picture);
        }
    }
    pictures.first()
}
