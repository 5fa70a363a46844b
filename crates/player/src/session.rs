//! Playback session persisted across restarts.

use std::fs;
use std::path::{Path, PathBuf};

use library::Playlist;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::{RepeatMode, ShuffleMode};
use crate::PlayerError;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub playlist: Playlist,
    pub queue: Vec<String>,
    pub shuffle: ShuffleMode,
    pub repeat: RepeatMode,
    pub dynamic: bool,
}

/// Reads a saved session. A missing file is not an error.
pub fn load_session(path: &Path) -> Result<Option<SessionState>, PlayerError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let session: SessionState = serde_json::from_str(&contents)?;
    info!(
        "Restored session: playlist {:?} ({} entries), {} queued",
        session.playlist.name(),
        session.playlist.len(),
        session.queue.len()
    );
    Ok(Some(session))
}

pub fn save_session(path: &Path, session: &SessionState) -> Result<(), PlayerError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, serde_json::to_vec_pretty(session)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
