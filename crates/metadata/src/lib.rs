use std::path::Path;

use common::tags::{format_number, BITRATE, LENGTH};
use common::TagMap;
use lofty::error::LoftyError;
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};
use lofty::tag::Tag;

/// Extensions the lofty reader claims, compared case-insensitively.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "oga", "opus", "m4a", "mp4", "aac", "wav", "aif", "aiff", "ape", "wv",
    "mpc", "spx",
];

const TEXT_KEYS: &[(ItemKey, &str)] = &[
    (ItemKey::TrackTitle, "title"),
    (ItemKey::TrackArtist, "artist"),
    (ItemKey::AlbumArtist, "albumartist"),
    (ItemKey::AlbumTitle, "album"),
    (ItemKey::Composer, "composer"),
    (ItemKey::TrackNumber, "tracknumber"),
    (ItemKey::DiscNumber, "discnumber"),
    (ItemKey::RecordingDate, "date"),
    (ItemKey::Comment, "comment"),
    (ItemKey::TrackArtistSortOrder, "artistsort"),
    (ItemKey::AlbumTitleSortOrder, "albumsort"),
    (ItemKey::TrackTitleSortOrder, "titlesort"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadTags {
    pub tags: TagMap,
    pub display_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TagError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tag error: {0}")]
    Lofty(#[from] LoftyError),
    #[error("unsupported format: {0}")]
    Unsupported(String),
}

/// Extracts a tag map from one audio file. Callers pass absolute paths.
pub trait TagReader: Send + Sync {
    fn understands(&self, path: &Path) -> bool;

    fn read(&self, path: &Path) -> Result<ReadTags, TagError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoftyTagReader;

impl TagReader for LoftyTagReader {
    fn understands(&self, path: &Path) -> bool {
        has_supported_extension(path, SUPPORTED_EXTENSIONS)
    }

    fn read(&self, path: &Path) -> Result<ReadTags, TagError> {
        if !self.understands(path) {
            return Err(TagError::Unsupported(path.display().to_string()));
        }
        let tagged_file = lofty::read_from_path(path)?;
        let properties = tagged_file.properties();

        let mut tags = TagMap::new();
        let duration = properties.duration().as_secs_f64();
        if duration > 0.0 {
            tags.set_one(LENGTH, format_number(round_millis(duration)));
        }
        if let Some(kbps) = properties.audio_bitrate().or(properties.overall_bitrate()) {
            tags.set_one(BITRATE, format_number(f64::from(kbps) * 1000.0));
        }

        if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
            read_text_tags(tag, &mut tags);
        }

        let display_name = tags
            .first("title")
            .map(|title| title.to_string())
            .unwrap_or_else(|| file_stem(path));
        Ok(ReadTags { tags, display_name })
    }
}

pub fn has_supported_extension(path: &Path, extensions: &[&str]) -> bool {
    let Some(ext) = path.extension() else {
        return false;
    };
    let ext = ext.to_string_lossy().to_ascii_lowercase();
    extensions.iter().any(|candidate| *candidate == ext)
}

pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown Track".to_string())
}

fn read_text_tags(tag: &Tag, tags: &mut TagMap) {
    for (key, name) in TEXT_KEYS {
        for value in tag.get_strings(key) {
            let value = value.trim();
            if !value.is_empty() {
                tags.push(name, value);
            }
        }
    }
    let mut genres = Vec::new();
    for value in tag.get_strings(&ItemKey::Genre) {
        genres.extend(parse_genres(value));
    }
    tags.set("genre", genres);
}

fn round_millis(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}

fn parse_genres(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for part in text.split(&[';', ',', '/', '|', '\0'][..]) {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        out.push(trimmed.to_string());
    }
    if out.is_empty() {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
    }
    out
}
