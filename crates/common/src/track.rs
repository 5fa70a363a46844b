use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::tags::{
    self, format_number, parse_number, TagMap, DATE_ADDED, LAST_PLAYED, LENGTH, LOC, MODIFIED,
    PLAYCOUNT, RATING,
};
use crate::uri;

/// Sorts below every real value.
const UNKNOWN_SORT: &str = "\u{ffff}\u{ffff}\u{ffff}\u{ffff}";
const LEADING_PUNCTUATION: &[char] = &[
    ' ', '`', '~', '!', '@', '#', '$', '%', '^', '&', '*', '(', ')', '_', '+', '-', '=', '{', '}',
    '|', '[', ']', '\\', '"', ';', '\'', '<', '>', '?', ',', '.', '/',
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TrackError {
    #[error("track has no location")]
    MissingLocation,
    #[error("the location tag cannot be removed")]
    LocationRequired,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortOptions {
    /// Leading words cut from sort keys, matched case-insensitively.
    pub articles: Vec<String>,
}

impl Default for SortOptions {
    fn default() -> Self {
        Self {
            articles: vec!["the".to_string()],
        }
    }
}

/// A catalog entry: a location URI plus its tag map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    tags: TagMap,
}

impl Track {
    pub fn new(loc: impl Into<String>) -> Result<Self, TrackError> {
        let mut tags = TagMap::new();
        if !tags.set_one(LOC, loc) {
            return Err(TrackError::MissingLocation);
        }
        Ok(Self { tags })
    }

    pub fn from_tags(tags: TagMap) -> Result<Self, TrackError> {
        if tags.first(LOC).is_none() {
            return Err(TrackError::MissingLocation);
        }
        Ok(Self { tags })
    }

    pub fn loc(&self) -> &str {
        self.tags.first(LOC).unwrap_or_default()
    }

    pub fn tags(&self) -> &TagMap {
        &self.tags
    }

    pub fn into_tags(self) -> TagMap {
        self.tags
    }

    pub fn get(&self, tag: &str) -> Option<&[String]> {
        self.tags.get(tag)
    }

    pub fn first(&self, tag: &str) -> Option<&str> {
        self.tags.first(tag)
    }

    pub fn set_tag<I, S>(&mut self, tag: &str, values: I) -> Result<bool, TrackError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if tag == LOC {
            let values: Vec<String> = values.into_iter().map(Into::into).collect();
            if values.iter().all(|value| value.is_empty()) {
                return Err(TrackError::LocationRequired);
            }
            return Ok(self.tags.set(tag, values));
        }
        Ok(self.tags.set(tag, values))
    }

    pub fn set_number(&mut self, tag: &str, value: f64) {
        if tag != LOC {
            self.tags.set_one(tag, format_number(value));
        }
    }

    pub fn remove_tag(&mut self, tag: &str) -> Result<Option<Vec<String>>, TrackError> {
        if tag == LOC {
            return Err(TrackError::LocationRequired);
        }
        Ok(self.tags.remove(tag))
    }

    /// Replaces all file-derived tags with `fresh`, keeping the location and
    /// the user-owned internal tags of this track.
    pub fn refresh_tags(&mut self, fresh: TagMap) {
        let mut merged = fresh;
        merged.set_one(LOC, self.loc().to_string());
        merged.copy_from(&self.tags, tags::USER_OWNED_TAGS);
        for tag in tags::USER_OWNED_TAGS {
            if !self.tags.contains(tag) {
                merged.remove(tag);
            }
        }
        self.tags = merged;
    }

    pub fn title(&self) -> Option<&str> {
        self.tags.first("title")
    }

    pub fn artists(&self) -> &[String] {
        self.tags.get("artist").unwrap_or_default()
    }

    pub fn album(&self) -> Option<&str> {
        self.tags.first("album")
    }

    pub fn length(&self) -> Option<f64> {
        self.number(LENGTH).filter(|len| *len > 0.0)
    }

    pub fn modified(&self) -> Option<f64> {
        self.number(MODIFIED)
    }

    pub fn date_added(&self) -> Option<f64> {
        self.number(DATE_ADDED)
    }

    pub fn last_played(&self) -> Option<f64> {
        self.number(LAST_PLAYED)
    }

    pub fn playcount(&self) -> u64 {
        self.number(PLAYCOUNT)
            .filter(|count| *count >= 0.0)
            .map(|count| count as u64)
            .unwrap_or(0)
    }

    /// Rating on a 0..=100 scale.
    pub fn rating(&self) -> Option<f64> {
        self.number(RATING).map(|rating| rating.clamp(0.0, 100.0))
    }

    pub fn number(&self, tag: &str) -> Option<f64> {
        self.tags.first(tag).and_then(parse_number)
    }

    /// Title when present, otherwise the file name decoded from the URI.
    pub fn display_name(&self) -> String {
        if let Some(title) = self.title() {
            return title.to_string();
        }
        uri::file_name(self.loc()).unwrap_or_else(|| self.loc().to_string())
    }

    /// Key suitable for ordering tracks by `tag`. An explicit `<tag>sort`
    /// value wins; otherwise the key is derived from the primary tag.
    pub fn sort_key(&self, tag: &str, options: &SortOptions) -> String {
        if tag == "tracknumber" || tag == "discnumber" {
            return match self.tags.first(tag) {
                Some(value) => format!("{:08}", split_numerical(value).0),
                None => UNKNOWN_SORT.to_string(),
            };
        }
        if tags::is_internal(tag) {
            return match self.number(tag) {
                Some(value) => format!("{:020.6}", value),
                None => self.tags.first(tag).unwrap_or(UNKNOWN_SORT).to_string(),
            };
        }
        let explicit = format!("{tag}sort");
        if let Some(values) = self.tags.get(&explicit) {
            return values.join(" / ").to_lowercase();
        }
        match self.tags.get(tag) {
            Some(values) => values
                .iter()
                .map(|value| format_sort(value, options))
                .collect::<Vec<_>>()
                .join(" / "),
            None => UNKNOWN_SORT.to_string(),
        }
    }
}

impl AsRef<Track> for Track {
    fn as_ref(&self) -> &Track {
        self
    }
}

/// Folds a value for case-insensitive comparison: combining marks are
/// removed and the result lowercased.
pub fn fold(value: &str) -> String {
    strip_marks(value).to_lowercase()
}

pub fn strip_marks(value: &str) -> String {
    value.nfd().filter(|c| !is_combining_mark(*c)).nfc().collect()
}

/// Splits values such as `3/12` into their numeric parts, zero when missing.
pub fn split_numerical(value: &str) -> (u32, u32) {
    let mut parts = value.splitn(3, '/');
    let one = parts
        .next()
        .and_then(|part| part.trim().parse().ok())
        .unwrap_or(0);
    let two = parts
        .next()
        .and_then(|part| part.trim().parse().ok())
        .unwrap_or(0);
    (one, two)
}

fn format_sort(value: &str, options: &SortOptions) -> String {
    let stripped = value.trim_start_matches(LEADING_PUNCTUATION);
    let stripped = if stripped.is_empty() {
        value.trim_start()
    } else {
        stripped
    };
    let folded = fold(stripped);
    cut_article(&folded, &options.articles).to_string()
}

fn cut_article<'a>(value: &'a str, articles: &[String]) -> &'a str {
    for article in articles {
        let article = article.to_lowercase();
        if article.is_empty() {
            continue;
        }
        let rest = match value.strip_prefix(article.as_str()) {
            Some(rest) => rest,
            None => continue,
        };
        if article.ends_with('\'') {
            return rest;
        }
        if let Some(rest) = rest.strip_prefix(' ') {
            return rest;
        }
    }
    value
}
