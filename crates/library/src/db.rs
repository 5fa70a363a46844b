use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use common::tags::{DATE_ADDED, LOC};
use common::{now_secs, uri, Track};
use tracing::{debug, info, warn};

use crate::index::{fingerprint, TagIndex};
use crate::migrations::Migrator;
pub use crate::store::SaveBatch;
use crate::store::{LibraryRecord, Snapshot, SnapshotStore, StoredEntry, DB_VERSION};
use crate::scan::ScanChange;
use crate::search::Query;
use crate::LibraryError;

const DEFAULT_NAME: &str = "library";

/// URI to `__modified` of every known track, as handed to scan workers.
pub type KnownTracks = HashMap<String, Option<f64>>;

#[derive(Clone, Debug)]
pub struct SearchHit {
    pub track: Arc<Track>,
    pub tags: BTreeSet<String>,
}

impl AsRef<Track> for SearchHit {
    fn as_ref(&self) -> &Track {
        &self.track
    }
}

#[derive(Clone, Debug)]
struct Entry {
    track: Arc<Track>,
    key: u64,
    attrs: BTreeMap<String, String>,
    /// Revision of the last unsaved change.
    changed: Option<u64>,
}

/// The authoritative set of tracks, keyed by location URI.
pub struct TrackDb {
    name: String,
    entries: HashMap<String, Entry>,
    libraries: Vec<LibraryRecord>,
    next_key: u64,
    deleted: Vec<(u64, u64)>,
    revision: u64,
    meta_changed: Option<u64>,
    index: TagIndex,
    store: Option<Arc<SnapshotStore>>,
}

impl TrackDb {
    pub fn in_memory(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
            libraries: Vec::new(),
            next_key: 0,
            deleted: Vec::new(),
            revision: 0,
            meta_changed: None,
            index: TagIndex::default(),
            store: None,
        }
    }

    /// Opens the store at `path`, creating it when absent and migrating it
    /// when it was written by an older version.
    pub fn open(path: &Path) -> Result<Self, LibraryError> {
        let store = SnapshotStore::open(path)?;
        match store.read_version()? {
            None => info!("Creating track database at {:?}", path),
            Some(version) if version > DB_VERSION => {
                return Err(LibraryError::VersionTooNew(version));
            }
            Some(version) if version < DB_VERSION => {
                store.backup(version)?;
                store.migrate(&Migrator::standard(), version, DB_VERSION)?;
            }
            Some(_) => {}
        }
        let snapshot = store.read()?;
        let mut db = Self::from_snapshot(snapshot, path)?;
        db.store = Some(Arc::new(store));
        info!("Loaded {} tracks from {:?}", db.len(), path);
        Ok(db)
    }

    fn from_snapshot(snapshot: Snapshot, path: &Path) -> Result<Self, LibraryError> {
        let mut db = Self::in_memory(snapshot.name.as_deref().unwrap_or(DEFAULT_NAME));
        db.libraries = snapshot.libraries;
        db.next_key = snapshot.next_key;
        for StoredEntry { key, tags, attrs } in snapshot.tracks {
            db.next_key = db.next_key.max(key + 1);
            let track = Track::from_tags(tags).map_err(|err| LibraryError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("record {key}: {err}"),
            })?;
            let loc = track.loc().to_string();
            if db.entries.contains_key(&loc) {
                warn!("Dropping duplicate record {} for {}", key, loc);
                db.revision += 1;
                db.deleted.push((key, db.revision));
                continue;
            }
            db.entries.insert(
                loc,
                Entry {
                    track: Arc::new(track),
                    key,
                    attrs,
                    changed: None,
                },
            );
        }

        let current = fingerprint(db.entries.values().map(|entry| entry.track.as_ref()));
        db.index = match snapshot.index {
            Some((hash, data)) if hash == current => TagIndex::from_data(data),
            _ => {
                info!("Rebuilding tag index");
                db.meta_changed = Some(db.revision);
                TagIndex::build(db.entries.values().map(|entry| entry.track.as_ref()))
            }
        };
        Ok(db)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
        self.touch_meta();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, uri: &str) -> Option<&Arc<Track>> {
        self.entries.get(uri).map(|entry| &entry.track)
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.entries.contains_key(uri)
    }

    /// Inserts or replaces a track. The location is normalized first, so the
    /// stored track is reachable through `get(track.loc())`.
    pub fn put(&mut self, mut track: Track) -> Result<Arc<Track>, LibraryError> {
        let loc = uri::normalize(track.loc())
            .map_err(|_| LibraryError::InvalidLocation(track.loc().to_string()))?;
        if loc != track.loc() {
            track.set_tag(LOC, [loc.clone()])?;
        }
        let revision = self.bump();
        if let Some(entry) = self.entries.get_mut(&loc) {
            if track.date_added().is_none() {
                if let Some(added) = entry.track.first(DATE_ADDED) {
                    track.set_tag(DATE_ADDED, [added.to_string()])?;
                }
            }
            self.index.remove(&entry.track);
            entry.track = Arc::new(track);
            entry.changed = Some(revision);
            self.index.insert(&entry.track);
            return Ok(entry.track.clone());
        }

        if track.date_added().is_none() {
            track.set_number(DATE_ADDED, now_secs());
        }
        let key = self.next_key;
        self.next_key += 1;
        self.meta_changed = Some(revision);
        let track = Arc::new(track);
        self.index.insert(&track);
        self.entries.insert(
            loc,
            Entry {
                track: track.clone(),
                key,
                attrs: BTreeMap::new(),
                changed: Some(revision),
            },
        );
        Ok(track)
    }

    /// Removes a track. Idempotent.
    pub fn remove(&mut self, uri: &str) -> bool {
        let Some(entry) = self.entries.remove(uri) else {
            return false;
        };
        let revision = self.bump();
        self.index.remove(&entry.track);
        self.deleted.push((entry.key, revision));
        true
    }

    /// Edits a track in place. The location cannot be changed this way.
    pub fn modify(&mut self, uri: &str, edit: impl FnOnce(&mut Track)) -> bool {
        let revision = self.revision + 1;
        let Some(entry) = self.entries.get_mut(uri) else {
            return false;
        };
        self.revision = revision;
        self.index.remove(&entry.track);
        let track = Arc::make_mut(&mut entry.track);
        edit(track);
        if track.loc() != uri {
            if let Err(err) = track.set_tag(LOC, [uri]) {
                warn!("Could not restore location of {}: {}", uri, err);
            }
        }
        entry.changed = Some(revision);
        self.index.insert(&entry.track);
        true
    }

    pub fn attrs(&self, uri: &str) -> Option<&BTreeMap<String, String>> {
        self.entries.get(uri).map(|entry| &entry.attrs)
    }

    pub fn set_attr(&mut self, uri: &str, name: &str, value: &str) -> bool {
        let revision = self.revision + 1;
        let Some(entry) = self.entries.get_mut(uri) else {
            return false;
        };
        self.revision = revision;
        entry.attrs.insert(name.to_string(), value.to_string());
        entry.changed = Some(revision);
        true
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<Track>> {
        self.entries.values().map(|entry| &entry.track)
    }

    pub fn snapshot(&self) -> Vec<Arc<Track>> {
        self.all().cloned().collect()
    }

    pub fn libraries(&self) -> &[LibraryRecord] {
        &self.libraries
    }

    /// Adds or replaces a library record; the location is stored in URI form.
    pub fn add_library(&mut self, mut record: LibraryRecord) -> Result<(), LibraryError> {
        record.location = uri::normalize(&record.location)?;
        match self
            .libraries
            .iter_mut()
            .find(|existing| existing.location == record.location)
        {
            Some(existing) if *existing == record => return Ok(()),
            Some(existing) => *existing = record,
            None => self.libraries.push(record),
        }
        self.touch_meta();
        Ok(())
    }

    pub fn remove_library(&mut self, location: &str) -> bool {
        let location = uri::normalize(location).unwrap_or_else(|_| location.to_string());
        let before = self.libraries.len();
        self.libraries.retain(|record| record.location != location);
        if self.libraries.len() == before {
            return false;
        }
        self.touch_meta();
        true
    }

    /// `__modified` of every track under `prefix` (a directory URI).
    pub fn known_tracks(&self, prefix: &str) -> KnownTracks {
        self.entries
            .iter()
            .filter(|(loc, _)| uri::is_under(loc, prefix))
            .map(|(loc, entry)| (loc.clone(), entry.track.modified()))
            .collect()
    }

    /// Applies one candidate update produced by a scan. Refreshed tracks
    /// keep their user-owned tags.
    pub fn apply(&mut self, change: ScanChange) -> Result<(), LibraryError> {
        match change {
            ScanChange::Add(tags) | ScanChange::Update(tags) => {
                let loc = tags.first(LOC).unwrap_or_default().to_string();
                if self.contains(&loc) {
                    self.modify(&loc, |track| track.refresh_tags(tags));
                } else {
                    self.put(Track::from_tags(tags)?)?;
                }
            }
            ScanChange::Remove(uri) => {
                self.remove(&uri);
            }
        }
        Ok(())
    }

    /// Tracks that may match `query`, narrowed through the tag index when
    /// the query has an indexed exact term.
    pub fn candidates(&self, query: &Query) -> Vec<Arc<Track>> {
        let mut narrowed: Option<HashSet<&str>> = None;
        for (tag, value) in query.exact_terms() {
            let Some(uris) = self.index.lookup(tag, value) else {
                continue;
            };
            let uris: HashSet<&str> = uris.into_iter().collect();
            narrowed = Some(match narrowed {
                Some(current) => current.intersection(&uris).copied().collect(),
                None => uris,
            });
        }
        match narrowed {
            Some(uris) => uris
                .into_iter()
                .filter_map(|uri| self.get(uri).cloned())
                .collect(),
            None => self.snapshot(),
        }
    }

    pub fn search(&self, query: &Query) -> Vec<SearchHit> {
        search_tracks(&self.candidates(query), query)
    }

    pub fn store(&self) -> Option<Arc<SnapshotStore>> {
        self.store.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.meta_changed.is_some()
            || !self.deleted.is_empty()
            || self.entries.values().any(|entry| entry.changed.is_some())
    }

    pub fn prepare_save(&self) -> SaveBatch {
        let puts: Vec<StoredEntry> = self
            .entries
            .values()
            .filter(|entry| entry.changed.is_some())
            .map(|entry| StoredEntry {
                key: entry.key,
                tags: entry.track.tags().clone(),
                attrs: entry.attrs.clone(),
            })
            .collect();
        let deletes: Vec<u64> = self.deleted.iter().map(|(key, _)| *key).collect();
        let index = if puts.is_empty() && deletes.is_empty() && self.meta_changed.is_none() {
            None
        } else {
            let hash = fingerprint(self.entries.values().map(|entry| entry.track.as_ref()));
            Some((hash, self.index.to_data()))
        };
        SaveBatch {
            revision: self.revision,
            name: self.name.clone(),
            next_key: self.next_key,
            libraries: self.libraries.clone(),
            puts,
            deletes,
            index,
        }
    }

    /// Marks everything included in a committed batch as clean. Changes
    /// made after the batch was prepared stay dirty.
    pub fn finish_save(&mut self, revision: u64) {
        for entry in self.entries.values_mut() {
            if entry.changed.is_some_and(|changed| changed <= revision) {
                entry.changed = None;
            }
        }
        self.deleted.retain(|(_, deleted)| *deleted > revision);
        if self.meta_changed.is_some_and(|changed| changed <= revision) {
            self.meta_changed = None;
        }
    }

    /// Saves synchronously. A no-op for in-memory databases.
    pub fn save(&mut self) -> Result<(), LibraryError> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        if !self.is_dirty() {
            return Ok(());
        }
        let batch = self.prepare_save();
        store.commit(&batch)?;
        self.finish_save(batch.revision());
        debug!("Saved track database ({} track writes)", batch.track_writes());
        Ok(())
    }

    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn touch_meta(&mut self) {
        let revision = self.bump();
        self.meta_changed = Some(revision);
    }
}

/// Evaluates `query` over a set of tracks, keeping matches in input order.
pub fn search_tracks(tracks: &[Arc<Track>], query: &Query) -> Vec<SearchHit> {
    tracks
        .iter()
        .filter_map(|track| {
            let result = query.evaluate(track);
            result.matched.then(|| SearchHit {
                track: track.clone(),
                tags: result.tags,
            })
        })
        .collect()
}
