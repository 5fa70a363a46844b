use common::tags::LOC;
use common::uri;
use redb::{ReadableTable, WriteTransaction};
use tracing::{info, warn};

use crate::store::{
    self, LibraryRecord, StoredTrack, LIBRARIES_KEY, TRACKDB_TABLE, TRACK_PREFIX,
};
use crate::{decode_value, encode_value, LibraryError};

pub type MigrationFn = fn(&WriteTransaction) -> Result<(), LibraryError>;

/// Rewrites a store from version `from` to version `to` in place.
#[derive(Clone, Copy)]
pub struct Migration {
    pub from: u32,
    pub to: u32,
    pub apply: MigrationFn,
}

pub struct Migrator {
    steps: Vec<Migration>,
}

impl Migrator {
    pub fn new(steps: Vec<Migration>) -> Self {
        Self { steps }
    }

    /// Migrations shipped with this build.
    pub fn standard() -> Self {
        Self::new(vec![Migration {
            from: 1,
            to: 2,
            apply: paths_to_uris,
        }])
    }

    pub fn latest(&self) -> u32 {
        self.steps.iter().map(|step| step.to).max().unwrap_or(1)
    }

    /// Applies steps in ascending order, taking the longest step available
    /// from each version, and records each new version as it goes.
    pub fn run(&self, txn: &WriteTransaction, from: u32, to: u32) -> Result<(), LibraryError> {
        let mut current = from;
        while current < to {
            let step = self
                .steps
                .iter()
                .filter(|step| step.from == current && step.to > current && step.to <= to)
                .max_by_key(|step| step.to)
                .ok_or(LibraryError::NoMigration(current))?;
            info!("Migrating database from version {} to {}", step.from, step.to);
            (step.apply)(txn)?;
            store::write_version(txn, step.to)?;
            current = step.to;
        }
        Ok(())
    }
}

/// Version 1 stored plain filesystem paths in `__loc` and in library
/// records. Version 2 stores `file://` URIs.
pub fn paths_to_uris(txn: &WriteTransaction) -> Result<(), LibraryError> {
    let mut table = txn.open_table(TRACKDB_TABLE)?;

    let mut rewrites: Vec<(String, Vec<u8>)> = Vec::new();
    let mut drops: Vec<String> = Vec::new();
    let mut libraries: Option<Vec<LibraryRecord>> = None;
    for entry in table.iter()? {
        let (key, value) = entry?;
        let key = key.value();
        if key == LIBRARIES_KEY {
            libraries = Some(decode_value(value.value())?);
            continue;
        }
        if !key.starts_with(TRACK_PREFIX) {
            continue;
        }
        let (mut tags, stored_key, attrs): StoredTrack = decode_value(value.value())?;
        let location = tags.first(LOC).unwrap_or_default().to_string();
        match uri::normalize(&location) {
            Ok(normalized) => {
                if normalized != location {
                    tags.set_one(LOC, normalized);
                    let bytes = encode_value(&(&tags, &stored_key, &attrs))?;
                    rewrites.push((key.to_string(), bytes));
                }
            }
            Err(err) => {
                warn!("Dropping record {} with unusable location {:?}: {}", key, location, err);
                drops.push(key.to_string());
            }
        }
    }

    for (key, bytes) in &rewrites {
        table.insert(key.as_str(), bytes.as_slice())?;
    }
    for key in &drops {
        table.remove(key.as_str())?;
    }
    if let Some(mut libraries) = libraries {
        libraries.retain_mut(|record| match uri::normalize(&record.location) {
            Ok(normalized) => {
                record.location = normalized;
                true
            }
            Err(err) => {
                warn!("Dropping library {:?}: {}", record.location, err);
                false
            }
        });
        table.insert(LIBRARIES_KEY, encode_value(&libraries)?.as_slice())?;
    }
    info!(
        "Converted {} track locations to URIs ({} dropped)",
        rewrites.len(),
        drops.len()
    );
    Ok(())
}
