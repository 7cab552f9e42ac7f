use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{normalize_name, TrackMetadata};
use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::LibraryError;

const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// An entity kind stored in a `MetadataRepository`.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// File stem of the backing database inside the data folder.
    const KIND: &'static str;

    fn id(&self) -> &str;

    /// Folds `incoming` (same id) into `self`.
    fn merge(&mut self, incoming: Self);

    /// Canonical order for range reads. Ties fall back to insertion order.
    fn canonical_cmp(&self, other: &Self) -> Ordering;

    /// Optional unique lookup key besides the id, such as a source path.
    fn lookup_key(&self) -> Option<&str> {
        None
    }
}

#[derive(Clone, Debug)]
pub enum RepositoryEvent<T> {
    Added(Vec<T>),
    Updated(Vec<T>),
    Removed(T),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub added: usize,
    pub updated: usize,
}

#[derive(Serialize)]
struct StoredRecordRef<'a, T> {
    seq: u64,
    item: &'a T,
}

#[derive(Deserialize)]
struct StoredRecord<T> {
    seq: u64,
    item: T,
}

struct Entry<T> {
    seq: u64,
    item: T,
}

struct Index<T> {
    items: HashMap<String, Entry<T>>,
    by_key: HashMap<String, String>,
    order: Vec<String>,
    next_seq: u64,
}

impl<T: Record> Index<T> {
    fn new() -> Self {
        Self {
            items: HashMap::new(),
            by_key: HashMap::new(),
            order: Vec::new(),
            next_seq: 0,
        }
    }

    fn from_entries(entries: Vec<Entry<T>>) -> Self {
        let mut index = Self::new();
        for entry in entries {
            index.next_seq = index.next_seq.max(entry.seq + 1);
            let id = entry.item.id().to_string();
            if let Some(key) = entry.item.lookup_key() {
                index.by_key.insert(key.to_string(), id.clone());
            }
            index.order.push(id.clone());
            index.items.insert(id, entry);
        }
        let items = &index.items;
        index
            .order
            .sort_by(|a, b| compare_entries(&items[a], &items[b]));
        index
    }

    /// Stores the entries and moves them to their canonical positions.
    fn apply(&mut self, entries: Vec<Entry<T>>) {
        let changed: HashSet<String> = entries
            .iter()
            .map(|entry| entry.item.id().to_string())
            .collect();
        self.order.retain(|id| !changed.contains(id));

        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            self.next_seq = self.next_seq.max(entry.seq + 1);
            let id = entry.item.id().to_string();
            if let Some(old) = self.items.get(&id) {
                if let Some(key) = old.item.lookup_key() {
                    self.by_key.remove(key);
                }
            }
            if let Some(key) = entry.item.lookup_key() {
                self.by_key.insert(key.to_string(), id.clone());
            }
            self.items.insert(id.clone(), entry);
            ids.push(id);
        }

        let items = &self.items;
        let order = &mut self.order;
        for id in ids {
            let entry = &items[&id];
            let pos = order
                .partition_point(|other| compare_entries(&items[other], entry) == Ordering::Less);
            order.insert(pos, id);
        }
    }

    fn remove(&mut self, id: &str) -> Option<T> {
        let entry = self.items.remove(id)?;
        if let Some(key) = entry.item.lookup_key() {
            self.by_key.remove(key);
        }
        self.order.retain(|other| other != id);
        Some(entry.item)
    }
}

fn compare_entries<T: Record>(a: &Entry<T>, b: &Entry<T>) -> Ordering {
    a.item
        .canonical_cmp(&b.item)
        .then_with(|| a.seq.cmp(&b.seq))
}

#[derive(Default)]
struct Storage {
    folder: Option<PathBuf>,
    db: Option<Arc<Database>>,
}

/// Persisted, indexed store for one entity kind.
///
/// Mutations serialize on the storage lock and commit to redb before the
/// in-memory index is touched, so readers only ever observe committed
/// records. Reads take the index read lock and never wait on each other.
pub struct MetadataRepository<T: Record> {
    storage: Mutex<Storage>,
    index: RwLock<Index<T>>,
    subscribers: Mutex<Vec<UnboundedSender<RepositoryEvent<T>>>>,
}

impl<T: Record> Default for MetadataRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Record> MetadataRepository<T> {
    pub fn new() -> Self {
        Self {
            storage: Mutex::new(Storage::default()),
            index: RwLock::new(Index::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Binds the repository to `folder`. Any previously loaded state is
    /// dropped; `init` must be called again.
    pub fn set_data_folder(&self, folder: impl Into<PathBuf>) {
        let mut storage = self.storage.lock();
        storage.folder = Some(folder.into());
        storage.db = None;
        *self.index.write() = Index::new();
    }

    pub fn data_folder(&self) -> Option<PathBuf> {
        self.storage.lock().folder.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.storage.lock().db.is_some()
    }

    /// Loads every persisted record into memory. Calling it again on an
    /// initialized repository is a no-op.
    pub fn init(&self) -> Result<(), LibraryError> {
        let mut storage = self.storage.lock();
        if storage.db.is_some() {
            return Ok(());
        }
        let folder = storage
            .folder
            .clone()
            .ok_or(LibraryError::NotInitialized("data folder not set"))?;
        let path = database_path(&folder, T::KIND);
        let db = open_or_create_db(&path)?;

        let write_txn = db.begin_write()?;
        let _ = write_txn.open_table(RECORDS_TABLE)?;
        write_txn.commit()?;

        let mut entries = Vec::new();
        {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(RECORDS_TABLE)?;
            for entry in table.iter()? {
                let entry = entry?;
                let id = entry.0.value().to_string();
                let record: StoredRecord<T> =
                    bincode::deserialize(entry.1.value()).map_err(|err| {
                        LibraryError::StorageCorrupt {
                            path: path.clone(),
                            reason: format!("record {}: {}", id, err),
                        }
                    })?;
                if record.item.id() != id {
                    return Err(LibraryError::StorageCorrupt {
                        path: path.clone(),
                        reason: format!("record stored under {} has id {}", id, record.item.id()),
                    });
                }
                entries.push(Entry {
                    seq: record.seq,
                    item: record.item,
                });
            }
        }

        info!("Loaded {} {} from {:?}", entries.len(), T::KIND, path);
        *self.index.write() = Index::from_entries(entries);
        storage.db = Some(Arc::new(db));
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.index.read().order.len()
    }

    /// Range read in canonical order.
    pub fn get_items(&self, offset: usize, limit: usize) -> Vec<T> {
        let index = self.index.read();
        index
            .order
            .iter()
            .skip(offset)
            .take(limit)
            .map(|id| index.items[id].item.clone())
            .collect()
    }

    pub fn get_by_id(&self, id: &str) -> Option<T> {
        self.index.read().items.get(id).map(|entry| entry.item.clone())
    }

    pub fn get_by_key(&self, key: &str) -> Option<T> {
        let index = self.index.read();
        let id = index.by_key.get(key)?;
        index.items.get(id).map(|entry| entry.item.clone())
    }

    /// Filtered range read in canonical order.
    pub fn find<F>(&self, offset: usize, limit: usize, mut predicate: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let index = self.index.read();
        index
            .order
            .iter()
            .map(|id| &index.items[id].item)
            .filter(|item| predicate(item))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Inserts new records and merges existing ones. Duplicate ids within
    /// the batch are folded together in order. Events are published after
    /// the batch has been committed.
    pub fn add_or_update(&self, items: Vec<T>) -> Result<UpsertSummary, LibraryError> {
        if items.is_empty() {
            return Ok(UpsertSummary::default());
        }
        let storage = self.storage.lock();
        let db = storage
            .db
            .clone()
            .ok_or(LibraryError::NotInitialized("repository not initialized"))?;

        let mut pending: Vec<(Entry<T>, bool)> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        {
            let index = self.index.read();
            let mut next_seq = index.next_seq;
            for item in items {
                let id = item.id().to_string();
                if id.is_empty() {
                    warn!("Skipping {} record without id", T::KIND);
                    continue;
                }
                if let Some(&pos) = positions.get(&id) {
                    pending[pos].0.item.merge(item);
                    continue;
                }
                let (entry, is_new) = match index.items.get(&id) {
                    Some(existing) => {
                        let mut merged = existing.item.clone();
                        merged.merge(item);
                        (
                            Entry {
                                seq: existing.seq,
                                item: merged,
                            },
                            false,
                        )
                    }
                    None => {
                        let seq = next_seq;
                        next_seq += 1;
                        (Entry { seq, item }, true)
                    }
                };
                positions.insert(id, pending.len());
                pending.push((entry, is_new));
            }
        }

        let write_txn = db.begin_write()?;
        let mut committed = Vec::with_capacity(pending.len());
        {
            let mut table = write_txn.open_table(RECORDS_TABLE)?;
            for (entry, is_new) in pending {
                let stored = StoredRecordRef {
                    seq: entry.seq,
                    item: &entry.item,
                };
                match bincode::serialize(&stored) {
                    Ok(bytes) => {
                        table.insert(entry.item.id(), bytes.as_slice())?;
                        committed.push((entry, is_new));
                    }
                    Err(err) => warn!(
                        "Skipping {} record {}: {}",
                        T::KIND,
                        entry.item.id(),
                        err
                    ),
                }
            }
        }
        write_txn.commit()?;

        let mut added = Vec::new();
        let mut updated = Vec::new();
        for (entry, is_new) in &committed {
            if *is_new {
                added.push(entry.item.clone());
            } else {
                updated.push(entry.item.clone());
            }
        }
        self.index
            .write()
            .apply(committed.into_iter().map(|(entry, _)| entry).collect());

        let summary = UpsertSummary {
            added: added.len(),
            updated: updated.len(),
        };
        debug!(
            "Upserted {}: {} added, {} updated",
            T::KIND,
            summary.added,
            summary.updated
        );
        if !added.is_empty() {
            self.publish(RepositoryEvent::Added(added));
        }
        if !updated.is_empty() {
            self.publish(RepositoryEvent::Updated(updated));
        }
        drop(storage);
        Ok(summary)
    }

    /// Removes the record with `item`'s id. Unknown ids are rejected.
    pub fn remove(&self, item: &T) -> Result<T, LibraryError> {
        self.remove_by_id(item.id())
    }

    pub fn remove_by_id(&self, id: &str) -> Result<T, LibraryError> {
        let storage = self.storage.lock();
        let db = storage
            .db
            .clone()
            .ok_or(LibraryError::NotInitialized("repository not initialized"))?;
        if !self.index.read().items.contains_key(id) {
            return Err(LibraryError::InvalidArgument(format!(
                "no {} record with id {}",
                T::KIND,
                id
            )));
        }

        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(RECORDS_TABLE)?;
            table.remove(id)?;
        }
        write_txn.commit()?;

        let removed = self
            .index
            .write()
            .remove(id)
            .ok_or_else(|| LibraryError::InvalidArgument(id.to_string()))?;
        self.publish(RepositoryEvent::Removed(removed.clone()));
        drop(storage);
        Ok(removed)
    }

    /// Registers a listener. Events arrive in commit order; a listener
    /// that drops its receiver is forgotten on the next publish.
    pub fn subscribe(&self) -> UnboundedReceiver<RepositoryEvent<T>> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn publish(&self, event: RepositoryEvent<T>) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl MetadataRepository<TrackMetadata> {
    /// Tracks credited to `artist_id`, by disc then track number.
    pub fn get_tracks_by_artist_id(
        &self,
        artist_id: &str,
        offset: usize,
        limit: usize,
    ) -> Vec<TrackMetadata> {
        self.find(offset, limit, |track| track.artist_ids.contains(artist_id))
    }

    /// Tracks of `album_id`, by disc then track number.
    pub fn get_tracks_by_album_id(
        &self,
        album_id: &str,
        offset: usize,
        limit: usize,
    ) -> Vec<TrackMetadata> {
        self.find(offset, limit, |track| track.album_id == album_id)
    }

    pub fn get_by_path(&self, path: &str) -> Option<TrackMetadata> {
        self.get_by_key(path)
    }

    /// First track in canonical order whose title matches and whose artist
    /// and album ids match when given.
    pub fn find_track(
        &self,
        title: &str,
        artist_id: Option<&str>,
        album_id: Option<&str>,
    ) -> Option<TrackMetadata> {
        let title = normalize_name(title);
        if title.is_empty() {
            return None;
        }
        self.find(0, 1, |track| {
            normalize_name(&track.title) == title
                && artist_id.map_or(true, |id| track.artist_ids.contains(id))
                && album_id.map_or(true, |id| track.album_id == id)
        })
        .into_iter()
        .next()
    }
}

/// Leading bytes of every redb file.
const REDB_MAGIC: &[u8] = b"redb";

/// Rejects a non-empty file that is not a redb database. redb would
/// otherwise treat it as uninitialized and overwrite it.
fn check_header(path: &Path) -> Result<(), LibraryError> {
    let mut header = Vec::with_capacity(REDB_MAGIC.len());
    fs::File::open(path)?
        .take(REDB_MAGIC.len() as u64)
        .read_to_end(&mut header)?;
    if header.is_empty() || header == REDB_MAGIC {
        return Ok(());
    }
    Err(LibraryError::StorageCorrupt {
        path: path.to_path_buf(),
        reason: "not a redb database".to_string(),
    })
}

fn database_path(folder: &Path, kind: &str) -> PathBuf {
    folder.join(format!("{}.redb", kind))
}

fn open_or_create_db(path: &Path) -> Result<Database, LibraryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let result = if path.exists() {
        check_header(path)?;
        Database::open(path)
    } else {
        Database::create(path)
    };
    match result {
        Ok(db) => Ok(db),
        Err(redb::DatabaseError::Storage(redb::StorageError::Corrupted(reason))) => {
            Err(LibraryError::StorageCorrupt {
                path: path.to_path_buf(),
                reason,
            })
        }
        Err(err) => Err(err.into()),
    }
}
