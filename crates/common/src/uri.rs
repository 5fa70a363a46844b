//! Location URIs.
//!
//! Tracks are keyed by URI. Local files use the `file://` scheme with
//! percent-encoded paths; raw bytes of non-UTF-8 file names are
//! percent-encoded as-is so they survive the round trip.

use std::env;
use std::path::{Path, PathBuf};

use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum UriError {
    #[error("empty location")]
    Empty,
    #[error("path cannot be expressed as a file uri: {0:?}")]
    Path(PathBuf),
    #[error("invalid uri {0:?}: {1}")]
    Parse(String, url::ParseError),
    #[error("cannot resolve relative path {0:?}: {1}")]
    Cwd(PathBuf, std::io::Error),
}

/// Returns the canonical URI form of a location, which may be a URI or a
/// filesystem path. `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(location: &str) -> Result<String, UriError> {
    let trimmed = location.trim();
    if trimmed.is_empty() {
        return Err(UriError::Empty);
    }
    if has_scheme(trimmed) {
        let url =
            Url::parse(trimmed).map_err(|err| UriError::Parse(trimmed.to_string(), err))?;
        return Ok(url.into());
    }
    from_path(Path::new(trimmed))
}

pub fn from_path(path: &Path) -> Result<String, UriError> {
    let absolute = absolute(path)?;
    let url = Url::from_file_path(&absolute).map_err(|_| UriError::Path(absolute.clone()))?;
    reparse(url)
}

/// URI of a directory with a trailing slash, suitable as a prefix for
/// everything below it.
pub fn dir_prefix(path: &Path) -> Result<String, UriError> {
    let absolute = absolute(path)?;
    let url =
        Url::from_directory_path(&absolute).map_err(|_| UriError::Path(absolute.clone()))?;
    reparse(url)
}

pub fn to_path(uri: &str) -> Option<PathBuf> {
    let url = Url::parse(uri).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    url.to_file_path().ok()
}

pub fn is_local(uri: &str) -> bool {
    uri.starts_with("file://")
}

/// True when `uri` lies strictly below the directory `prefix` produced by
/// [`dir_prefix`].
pub fn is_under(uri: &str, prefix: &str) -> bool {
    uri.len() > prefix.len() && uri.starts_with(prefix)
}

/// Last path segment, percent-decoded.
pub fn file_name(uri: &str) -> Option<String> {
    if let Some(path) = to_path(uri) {
        return path
            .file_name()
            .map(|name| name.to_string_lossy().to_string());
    }
    let url = Url::parse(uri).ok()?;
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    Some(segment.to_string())
}

pub fn has_scheme(location: &str) -> bool {
    let Some(idx) = location.find("://") else {
        return false;
    };
    let scheme = &location[..idx];
    let mut chars = scheme.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn absolute(path: &Path) -> Result<PathBuf, UriError> {
    if path.as_os_str().is_empty() {
        return Err(UriError::Empty);
    }
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = env::current_dir().map_err(|err| UriError::Cwd(path.to_path_buf(), err))?;
    Ok(cwd.join(path))
}

// Serializing and parsing again collapses dot segments, which
// `from_file_path` leaves in place.
fn reparse(url: Url) -> Result<String, UriError> {
    let text = String::from(url);
    let url = Url::parse(&text).map_err(|err| UriError::Parse(text.clone(), err))?;
    Ok(url.into())
}
