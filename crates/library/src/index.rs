//! Exact-value inverted index over a few high-cardinality tags.

use std::collections::{BTreeMap, HashMap, HashSet};

use common::{fold, Track};

pub const INDEXED_TAGS: &[&str] = &["artist", "albumartist", "album", "genre"];

/// Persisted form: tag -> folded value -> URIs.
pub type IndexData = BTreeMap<String, BTreeMap<String, Vec<String>>>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagIndex {
    tags: HashMap<String, HashMap<String, HashSet<String>>>,
}

impl TagIndex {
    pub fn build<'a>(tracks: impl IntoIterator<Item = &'a Track>) -> Self {
        let mut index = Self::default();
        for track in tracks {
            index.insert(track);
        }
        index
    }

    pub fn is_indexed(tag: &str) -> bool {
        INDEXED_TAGS.contains(&tag)
    }

    pub fn insert(&mut self, track: &Track) {
        for tag in INDEXED_TAGS {
            let Some(values) = track.get(tag) else {
                continue;
            };
            let by_value = self.tags.entry(tag.to_string()).or_default();
            for value in values {
                by_value
                    .entry(fold(value))
                    .or_default()
                    .insert(track.loc().to_string());
            }
        }
    }

    pub fn remove(&mut self, track: &Track) {
        for tag in INDEXED_TAGS {
            let (Some(values), Some(by_value)) = (track.get(tag), self.tags.get_mut(*tag)) else {
                continue;
            };
            for value in values {
                let key = fold(value);
                if let Some(uris) = by_value.get_mut(&key) {
                    uris.remove(track.loc());
                    if uris.is_empty() {
                        by_value.remove(&key);
                    }
                }
            }
        }
    }

    /// URIs of tracks with a value of `tag` that folds to the same key as
    /// `value`. `None` when `tag` is not indexed. The result is a superset
    /// of exact matches under either case mode.
    pub fn lookup(&self, tag: &str, value: &str) -> Option<Vec<&str>> {
        if !Self::is_indexed(tag) {
            return None;
        }
        let uris = self
            .tags
            .get(tag)
            .and_then(|by_value| by_value.get(&fold(value)))
            .map(|uris| uris.iter().map(|uri| uri.as_str()).collect())
            .unwrap_or_default();
        Some(uris)
    }

    pub fn to_data(&self) -> IndexData {
        self.tags
            .iter()
            .map(|(tag, by_value)| {
                let values = by_value
                    .iter()
                    .map(|(value, uris)| {
                        let mut uris: Vec<String> = uris.iter().cloned().collect();
                        uris.sort();
                        (value.clone(), uris)
                    })
                    .collect();
                (tag.clone(), values)
            })
            .collect()
    }

    pub fn from_data(data: IndexData) -> Self {
        let tags = data
            .into_iter()
            .map(|(tag, values)| {
                let by_value = values
                    .into_iter()
                    .map(|(value, uris)| (value, uris.into_iter().collect()))
                    .collect();
                (tag, by_value)
            })
            .collect();
        Self { tags }
    }
}

/// Fingerprint of the indexed content of a track set, independent of
/// iteration order.
pub fn fingerprint<'a>(tracks: impl IntoIterator<Item = &'a Track>) -> String {
    let mut rows: Vec<String> = tracks
        .into_iter()
        .map(|track| {
            let mut row = track.loc().to_string();
            for tag in INDEXED_TAGS {
                row.push('\x1e');
                if let Some(values) = track.get(tag) {
                    row.push_str(&values.join("\x1f"));
                }
            }
            row
        })
        .collect();
    rows.sort();

    let mut hasher = blake3::Hasher::new();
    for row in &rows {
        hasher.update(row.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(loc: &str, artist: &str, album: &str) -> Track {
        let mut track = Track::new(loc).unwrap();
        track.set_tag("artist", [artist]).unwrap();
        track.set_tag("album", [album]).unwrap();
        track
    }

    #[test]
    fn lookup_folds_case_and_marks() {
        let a = track("file:///m/a.mp3", "Björk", "Post");
        let b = track("file:///m/b.mp3", "bjork", "Debut");
        let index = TagIndex::build([&a, &b]);
        let mut hits = index.lookup("artist", "BJORK").unwrap();
        hits.sort();
        assert_eq!(hits, vec!["file:///m/a.mp3", "file:///m/b.mp3"]);
        assert_eq!(index.lookup("album", "post").unwrap(), vec!["file:///m/a.mp3"]);
        assert!(index.lookup("title", "x").is_none());
    }

    #[test]
    fn removal_drops_empty_buckets() {
        let a = track("file:///m/a.mp3", "A", "X");
        let mut index = TagIndex::build([&a]);
        index.remove(&a);
        assert!(index.lookup("artist", "a").unwrap().is_empty());
        assert!(index.to_data().values().all(|values| values.is_empty()));
    }

    #[test]
    fn persisted_form_restores_the_same_index() {
        let a = track("file:///m/a.mp3", "A", "X");
        let b = track("file:///m/b.mp3", "B", "X");
        let index = TagIndex::build([&a, &b]);
        assert_eq!(TagIndex::from_data(index.to_data()), index);
    }

    #[test]
    fn fingerprint_ignores_order_but_sees_changes() {
        let a = track("file:///m/a.mp3", "A", "X");
        let b = track("file:///m/b.mp3", "B", "X");
        assert_eq!(fingerprint([&a, &b]), fingerprint([&b, &a]));
        let b2 = track("file:///m/b.mp3", "B", "Y");
        assert_ne!(fingerprint([&a, &b]), fingerprint([&a, &b2]));
    }
}
