use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const LOC: &str = "__loc";
pub const LENGTH: &str = "__length";
pub const BITRATE: &str = "__bitrate";
pub const MODIFIED: &str = "__modified";
pub const DATE_ADDED: &str = "__date_added";
pub const LAST_PLAYED: &str = "__last_played";
pub const PLAYCOUNT: &str = "__playcount";
pub const RATING: &str = "__rating";
pub const LAST_ERROR: &str = "__last_error";

/// Internal tags owned by the user rather than the file. A rescan never
/// overwrites them.
pub const USER_OWNED_TAGS: &[&str] = &[PLAYCOUNT, LAST_PLAYED, RATING, DATE_ADDED];

/// Marker used by exact matches to mean "tag absent or empty".
pub const NULL_VALUE: &str = "__null__";

pub fn is_internal(tag: &str) -> bool {
    tag.starts_with("__")
}

/// Multi-valued, case-preserving tag map.
///
/// Every stored list is non-empty and holds only non-empty strings; empty
/// values are dropped on assignment and a tag whose list ends up empty is
/// removed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, Vec<String>>",
    into = "BTreeMap<String, Vec<String>>"
)]
pub struct TagMap {
    tags: BTreeMap<String, Vec<String>>,
}

impl TagMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tag: &str) -> Option<&[String]> {
        self.tags.get(tag).map(|values| values.as_slice())
    }

    pub fn first(&self, tag: &str) -> Option<&str> {
        self.tags
            .get(tag)
            .and_then(|values| values.first())
            .map(|value| value.as_str())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.tags.contains_key(tag)
    }

    /// Replaces the values of `tag`. Returns false when nothing was stored
    /// (empty tag name or no non-empty values), in which case any previous
    /// values are removed.
    pub fn set<I, S>(&mut self, tag: &str, values: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if tag.is_empty() {
            return false;
        }
        let values: Vec<String> = values
            .into_iter()
            .map(Into::into)
            .filter(|value| !value.is_empty())
            .collect();
        if values.is_empty() {
            self.tags.remove(tag);
            return false;
        }
        self.tags.insert(tag.to_string(), values);
        true
    }

    pub fn set_one(&mut self, tag: &str, value: impl Into<String>) -> bool {
        self.set(tag, [value.into()])
    }

    pub fn push(&mut self, tag: &str, value: impl Into<String>) -> bool {
        let value = value.into();
        if tag.is_empty() || value.is_empty() {
            return false;
        }
        self.tags.entry(tag.to_string()).or_default().push(value);
        true
    }

    pub fn remove(&mut self, tag: &str) -> Option<Vec<String>> {
        self.tags.remove(tag)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(|name| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.tags
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Copies `tags` from `other`, leaving tags absent from `other` untouched.
    pub fn copy_from(&mut self, other: &TagMap, tags: &[&str]) {
        for tag in tags {
            if let Some(values) = other.get(tag) {
                self.set(tag, values.iter().cloned());
            }
        }
    }
}

impl From<BTreeMap<String, Vec<String>>> for TagMap {
    fn from(raw: BTreeMap<String, Vec<String>>) -> Self {
        let mut map = TagMap::new();
        for (tag, values) in raw {
            map.set(&tag, values);
        }
        map
    }
}

impl From<TagMap> for BTreeMap<String, Vec<String>> {
    fn from(map: TagMap) -> Self {
        map.tags
    }
}

impl<S: Into<String>> FromIterator<(S, S)> for TagMap {
    fn from_iter<T: IntoIterator<Item = (S, S)>>(iter: T) -> Self {
        let mut map = TagMap::new();
        for (tag, value) in iter {
            let tag = tag.into();
            map.push(&tag, value);
        }
        map
    }
}

/// Formats a number the way numeric tags are stored: integers without a
/// fractional part, everything else with the shortest round-tripping form.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

pub fn parse_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_values_are_filtered() {
        let mut tags = TagMap::new();
        assert!(tags.set("artist", ["", "A", ""]));
        assert_eq!(tags.get("artist"), Some(&["A".to_string()][..]));
        assert!(!tags.set("genre", [""]));
        assert!(!tags.contains("genre"));
    }

    #[test]
    fn setting_only_empty_values_removes_tag() {
        let mut tags = TagMap::new();
        tags.set_one("title", "Hey");
        tags.set("title", Vec::<String>::new());
        assert!(!tags.contains("title"));
    }

    #[test]
    fn empty_tag_name_is_rejected() {
        let mut tags = TagMap::new();
        assert!(!tags.set_one("", "value"));
        assert!(!tags.push("", "value"));
        assert!(tags.is_empty());
    }

    #[test]
    fn first_value_gives_single_valued_semantics() {
        let tags: TagMap = [("artist", "A"), ("artist", "B")].into_iter().collect();
        assert_eq!(tags.first("artist"), Some("A"));
        assert_eq!(tags.get("artist").map(|v| v.len()), Some(2));
    }

    #[test]
    fn decoding_restores_invariants() {
        let mut raw = BTreeMap::new();
        raw.insert("title".to_string(), vec!["".to_string()]);
        raw.insert("album".to_string(), vec!["X".to_string(), "".to_string()]);
        let bytes = bincode::serialize(&raw).unwrap();
        let tags: TagMap = bincode::deserialize(&bytes).unwrap();
        assert!(!tags.contains("title"));
        assert_eq!(tags.get("album"), Some(&["X".to_string()][..]));
    }

    #[test]
    fn serialization_round_trips() {
        let mut tags = TagMap::new();
        tags.set("artist", ["A", "B"]);
        tags.set_one(LOC, "file:///music/a.mp3");
        tags.set_one(PLAYCOUNT, "3");
        let bytes = bincode::serialize(&tags).unwrap();
        let back: TagMap = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, tags);
    }

    #[test]
    fn numbers_format_compactly() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(1.5), "1.5");
        assert_eq!(parse_number(&format_number(1700000000.123)), Some(1700000000.123));
        assert_eq!(parse_number("abc"), None);
    }
}
