//! On-disk snapshot of the track database.
//!
//! Everything lives in one redb table keyed by strings: one `tracks-<n>`
//! record per track holding `(tag map, key, attrs)`, plus the metadata keys
//! below. Every write happens inside a single redb write transaction, so a
//! reader sees either the previous complete snapshot or the new one.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use common::TagMap;
use redb::{
    Database, DatabaseError, ReadableTable, StorageError, TableDefinition, TableError,
    WriteTransaction,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::index::IndexData;
use crate::migrations::Migrator;
use crate::{decode_value, encode_value, LibraryError};

pub const DB_VERSION: u32 = 2;

pub(crate) const TRACKDB_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("trackdb");

pub(crate) const VERSION_KEY: &str = "_dbversion";
pub(crate) const NAME_KEY: &str = "name";
pub(crate) const NEXT_KEY: &str = "_key";
pub(crate) const LIBRARIES_KEY: &str = "_serial_libraries";
pub(crate) const INDEX_KEY: &str = "_tag_index";
pub(crate) const INDEX_HASH_KEY: &str = "_tag_index_hash";
pub(crate) const TRACK_PREFIX: &str = "tracks-";

/// Leading bytes of every redb file. `Database::open` repairs rather than
/// rejects a file without them, so they are checked first.
const REDB_MAGIC: [u8; 9] = [b'r', b'e', b'd', b'b', 0x1A, 0x0A, 0xA9, 0x0D, 0x0A];

/// Serialized form of one track record.
pub(crate) type StoredTrack = (TagMap, String, BTreeMap<String, String>);

/// A configured scan root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRecord {
    pub location: String,
    pub monitored: bool,
    /// Seconds between automatic rescans; 0 means manual only.
    pub scan_interval: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoredEntry {
    pub key: u64,
    pub tags: TagMap,
    pub attrs: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub name: Option<String>,
    pub next_key: u64,
    pub libraries: Vec<LibraryRecord>,
    /// Sorted by ascending storage key.
    pub tracks: Vec<StoredEntry>,
    pub index: Option<(String, IndexData)>,
}

/// Everything a save writes. Produced by the track database, committed by
/// whoever owns the store handle.
#[derive(Clone, Debug, Default)]
pub struct SaveBatch {
    pub(crate) revision: u64,
    pub(crate) name: String,
    pub(crate) next_key: u64,
    pub(crate) libraries: Vec<LibraryRecord>,
    pub(crate) puts: Vec<StoredEntry>,
    pub(crate) deletes: Vec<u64>,
    pub(crate) index: Option<(String, IndexData)>,
}

impl SaveBatch {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn track_writes(&self) -> usize {
        self.puts.len() + self.deletes.len()
    }
}

pub fn track_key(key: u64) -> String {
    format!("{TRACK_PREFIX}{key}")
}

pub(crate) fn parse_track_key(key: &str) -> Option<u64> {
    key.strip_prefix(TRACK_PREFIX)?.parse().ok()
}

pub struct SnapshotStore {
    path: PathBuf,
    db: Database,
}

impl SnapshotStore {
    pub fn open(path: &Path) -> Result<Self, LibraryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let existing = fs::metadata(path).map(|meta| meta.len() > 0).unwrap_or(false);
        let db = if existing {
            check_header(path)?;
            Database::open(path).map_err(|err| open_error(path, err))?
        } else {
            Database::create(path)?
        };
        debug!("Opened snapshot store {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            db,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Version recorded in the store. `None` for a store that has never been
    /// written; records without a version key predate versioning and count
    /// as version 1.
    pub fn read_version(&self) -> Result<Option<u32>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(TRACKDB_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if let Some(value) = table.get(VERSION_KEY)? {
            return self.decode(VERSION_KEY, value.value()).map(Some);
        }
        for entry in table.iter()? {
            let (key, _) = entry?;
            if key.value().starts_with(TRACK_PREFIX) {
                return Ok(Some(1));
            }
        }
        Ok(None)
    }

    pub fn read(&self) -> Result<Snapshot, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(TRACKDB_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Snapshot::default()),
            Err(err) => return Err(err.into()),
        };

        let mut snapshot = Snapshot::default();
        let mut index_hash: Option<String> = None;
        let mut index_data: Option<IndexData> = None;
        for entry in table.iter()? {
            let (key, value) = entry?;
            let key = key.value();
            let bytes = value.value();
            match key {
                VERSION_KEY => {}
                NAME_KEY => snapshot.name = Some(self.decode(key, bytes)?),
                NEXT_KEY => snapshot.next_key = self.decode(key, bytes)?,
                LIBRARIES_KEY => snapshot.libraries = self.decode(key, bytes)?,
                INDEX_HASH_KEY => index_hash = Some(self.decode(key, bytes)?),
                INDEX_KEY => match decode_value(bytes) {
                    Ok(data) => index_data = Some(data),
                    Err(err) => warn!("Discarding unreadable tag index: {}", err),
                },
                _ => {
                    let Some(number) = parse_track_key(key) else {
                        debug!("Ignoring unknown snapshot key {:?}", key);
                        continue;
                    };
                    let (tags, _, attrs): StoredTrack = self.decode(key, bytes)?;
                    snapshot.tracks.push(StoredEntry {
                        key: number,
                        tags,
                        attrs,
                    });
                }
            }
        }
        snapshot.tracks.sort_by_key(|entry| entry.key);
        snapshot.index = index_hash.zip(index_data);
        Ok(snapshot)
    }

    pub fn commit(&self, batch: &SaveBatch) -> Result<(), LibraryError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TRACKDB_TABLE)?;
            table.insert(VERSION_KEY, encode_value(&DB_VERSION)?.as_slice())?;
            table.insert(NAME_KEY, encode_value(&batch.name)?.as_slice())?;
            table.insert(NEXT_KEY, encode_value(&batch.next_key)?.as_slice())?;
            table.insert(LIBRARIES_KEY, encode_value(&batch.libraries)?.as_slice())?;
            for entry in &batch.puts {
                let key = track_key(entry.key);
                let bytes = encode_value(&(&entry.tags, &key, &entry.attrs))?;
                table.insert(key.as_str(), bytes.as_slice())?;
            }
            for key in &batch.deletes {
                table.remove(track_key(*key).as_str())?;
            }
            if let Some((hash, data)) = &batch.index {
                table.insert(INDEX_HASH_KEY, encode_value(hash)?.as_slice())?;
                table.insert(INDEX_KEY, encode_value(data)?.as_slice())?;
            }
        }
        write_txn.commit()?;
        debug!(
            "Committed snapshot revision {} ({} track writes)",
            batch.revision,
            batch.track_writes()
        );
        Ok(())
    }

    /// Copies the store file to `<file>-<version>.bak`.
    pub fn backup(&self, version: u32) -> Result<PathBuf, LibraryError> {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(format!("-{version}.bak"));
        let backup = self.path.with_file_name(name);
        fs::copy(&self.path, &backup)?;
        info!("Backed up {:?} to {:?}", self.path, backup);
        Ok(backup)
    }

    /// Runs `migrator` from `from` up to `to` in one write transaction.
    pub fn migrate(&self, migrator: &Migrator, from: u32, to: u32) -> Result<(), LibraryError> {
        let write_txn = self.db.begin_write()?;
        migrator.run(&write_txn, from, to)?;
        write_txn.commit()?;
        Ok(())
    }

    pub(crate) fn database(&self) -> &Database {
        &self.db
    }

    fn decode<T: for<'de> Deserialize<'de>>(&self, key: &str, bytes: &[u8]) -> Result<T, LibraryError> {
        decode_value(bytes).map_err(|err| LibraryError::Corrupt {
            path: self.path.clone(),
            reason: format!("record {key:?}: {err}"),
        })
    }
}

pub(crate) fn write_version(txn: &WriteTransaction, version: u32) -> Result<(), LibraryError> {
    let mut table = txn.open_table(TRACKDB_TABLE)?;
    table.insert(VERSION_KEY, encode_value(&version)?.as_slice())?;
    Ok(())
}

fn check_header(path: &Path) -> Result<(), LibraryError> {
    let mut header = [0u8; REDB_MAGIC.len()];
    let mut file = fs::File::open(path)?;
    let complete = match file.read_exact(&mut header) {
        Ok(()) => true,
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => false,
        Err(err) => return Err(err.into()),
    };
    if !complete || header != REDB_MAGIC {
        return Err(LibraryError::Corrupt {
            path: path.to_path_buf(),
            reason: "not a track database file".to_string(),
        });
    }
    Ok(())
}

fn open_error(path: &Path, err: DatabaseError) -> LibraryError {
    match err {
        DatabaseError::DatabaseAlreadyOpen => LibraryError::from(err),
        DatabaseError::Storage(StorageError::Io(io))
            if matches!(io.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) =>
        {
            LibraryError::Io(io)
        }
        other => LibraryError::Corrupt {
            path: path.to_path_buf(),
            reason: other.to_string(),
        },
    }
}
