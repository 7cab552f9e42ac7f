use std::cmp::Ordering;

use common::{
    normalize_name, AlbumMetadata, ArtistMetadata, ImageMetadata, PlaylistMetadata, TrackMetadata,
};

use crate::repository::Record;

impl Record for TrackMetadata {
    const KIND: &'static str = "tracks";

    fn id(&self) -> &str {
        &self.id
    }

    fn merge(&mut self, incoming: Self) {
        TrackMetadata::merge(self, incoming);
    }

    fn canonical_cmp(&self, other: &Self) -> Ordering {
        compare_position(self.disc_no, other.disc_no)
            .then_with(|| compare_position(self.track_no, other.track_no))
    }

    fn lookup_key(&self) -> Option<&str> {
        Some(self.path.as_str()).filter(|path| !path.is_empty())
    }
}

impl Record for AlbumMetadata {
    const KIND: &'static str = "albums";

    fn id(&self) -> &str {
        &self.id
    }

    fn merge(&mut self, incoming: Self) {
        AlbumMetadata::merge(self, incoming);
    }

    fn canonical_cmp(&self, other: &Self) -> Ordering {
        normalize_name(&self.name).cmp(&normalize_name(&other.name))
    }
}

impl Record for ArtistMetadata {
    const KIND: &'static str = "artists";

    fn id(&self) -> &str {
        &self.id
    }

    fn merge(&mut self, incoming: Self) {
        ArtistMetadata::merge(self, incoming);
    }

    fn canonical_cmp(&self, other: &Self) -> Ordering {
        normalize_name(&self.name).cmp(&normalize_name(&other.name))
    }
}

impl Record for ImageMetadata {
    const KIND: &'static str = "images";

    fn id(&self) -> &str {
        &self.id
    }

    fn merge(&mut self, incoming: Self) {
        ImageMetadata::merge(self, incoming);
    }

    fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.source.locator().cmp(&other.source.locator())
    }
}

impl Record for PlaylistMetadata {
    const KIND: &'static str = "playlists";

    fn id(&self) -> &str {
        &self.id
    }

    fn merge(&mut self, incoming: Self) {
        PlaylistMetadata::merge(self, incoming);
    }

    fn canonical_cmp(&self, other: &Self) -> Ordering {
        normalize_name(&self.name).cmp(&normalize_name(&other.name))
    }

    fn lookup_key(&self) -> Option<&str> {
        Some(self.path.as_str()).filter(|path| !path.is_empty())
    }
}

/// Ascending with absent positions last.
fn compare_position(a: Option<u32>, b: Option<u32>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_positions_sort_last() {
        assert_eq!(compare_position(Some(9), None), Ordering::Less);
        assert_eq!(compare_position(None, Some(0)), Ordering::Greater);
        assert_eq!(compare_position(Some(1), Some(2)), Ordering::Less);
    }

    #[test]
    fn tracks_order_by_disc_then_number() {
        let track = |disc, no| TrackMetadata {
            disc_no: disc,
            track_no: no,
            ..Default::default()
        };
        assert_eq!(
            track(Some(1), Some(9)).canonical_cmp(&track(Some(2), Some(1))),
            Ordering::Less
        );
        assert_eq!(
            track(None, Some(1)).canonical_cmp(&track(Some(5), None)),
            Ordering::Greater
        );
    }
}
