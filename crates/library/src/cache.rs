use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use common::{AlbumMetadata, ArtistMetadata, ImageMetadata, PlaylistMetadata, TrackMetadata};
use parking_lot::{Mutex, RwLock};

/// Map from id to a shared instance. Each id is constructed at most once;
/// concurrent callers for the same id wait for the first construction and
/// share its result. Different ids construct in parallel.
pub struct InstanceCache<V> {
    slots: Mutex<HashMap<String, Arc<OnceLock<Arc<V>>>>>,
}

impl<V> Default for InstanceCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> InstanceCache<V> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create<F>(&self, id: &str, factory: F) -> Arc<V>
    where
        F: FnOnce() -> V,
    {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(id.to_string()).or_default())
        };
        Arc::clone(slot.get_or_init(|| Arc::new(factory())))
    }

    pub fn get(&self, id: &str) -> Option<Arc<V>> {
        let slots = self.slots.lock();
        slots.get(id).and_then(|slot| slot.get().cloned())
    }

    /// Installs `value` for `id`, returning the instance it displaced.
    pub fn replace(&self, id: &str, value: V) -> Option<Arc<V>> {
        let slot = Arc::new(OnceLock::new());
        let _ = slot.set(Arc::new(value));
        let previous = self.slots.lock().insert(id.to_string(), slot);
        previous.and_then(|slot| slot.get().cloned())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<V>> {
        let previous = self.slots.lock().remove(id);
        previous.and_then(|slot| slot.get().cloned())
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

/// Shared handle for one library entity. Identity stays fixed while the
/// record behind it is refreshed.
pub struct Model<M> {
    id: String,
    record: RwLock<M>,
}

impl<M: Clone + PartialEq> Model<M> {
    pub fn new(id: impl Into<String>, record: M) -> Self {
        Self {
            id: id.into(),
            record: RwLock::new(record),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> M {
        self.record.read().clone()
    }

    /// Swaps in a newer record. Returns whether anything changed.
    pub fn refresh(&self, record: M) -> bool {
        let mut current = self.record.write();
        if *current == record {
            return false;
        }
        *current = record;
        true
    }
}

/// Instance caches shared by every manager that reads the same library.
/// Build one per process (or per test) and hand it to each manager.
#[derive(Default)]
pub struct LibraryContext {
    pub tracks: InstanceCache<Model<TrackMetadata>>,
    pub albums: InstanceCache<Model<AlbumMetadata>>,
    pub artists: InstanceCache<Model<ArtistMetadata>>,
    pub images: InstanceCache<Model<ImageMetadata>>,
    pub playlists: InstanceCache<Model<PlaylistMetadata>>,
}

impl LibraryContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drops every cached instance.
    pub fn clear(&self) {
        self.tracks.clear();
        self.albums.clear();
        self.artists.clear();
        self.images.clear();
        self.playlists.clear();
    }
}
