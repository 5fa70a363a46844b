use std::collections::HashSet;

use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::db::TrackDb;

/// Ordered list of track URIs with a cursor and a shuffle history.
///
/// The cursor is `None` before playback starts, otherwise a valid index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    name: String,
    uris: Vec<String>,
    position: Option<usize>,
    shuffle_history: Vec<String>,
}

impl Playlist {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_uris(name: &str, uris: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            uris,
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn len(&self) -> usize {
        self.uris.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }

    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.uris.get(index).map(|uri| uri.as_str())
    }

    pub fn position(&self) -> Option<usize> {
        self.position
    }

    pub fn current(&self) -> Option<&str> {
        self.position.and_then(|index| self.get(index))
    }

    pub fn set_current(&mut self, index: Option<usize>) -> bool {
        match index {
            Some(index) if index >= self.uris.len() => false,
            _ => {
                self.position = index;
                true
            }
        }
    }

    pub fn append(&mut self, uri: impl Into<String>) {
        self.uris.push(uri.into());
    }

    pub fn extend<I: IntoIterator<Item = String>>(&mut self, uris: I) {
        self.uris.extend(uris);
    }

    /// Inserts before `index` (clamped to the end). The cursor follows its
    /// track.
    pub fn insert(&mut self, index: usize, uri: impl Into<String>) {
        let index = index.min(self.uris.len());
        self.uris.insert(index, uri.into());
        if let Some(position) = self.position {
            if index <= position {
                self.position = Some(position + 1);
            }
        }
    }

    /// Removes the entry at `index`. Removing at or below the cursor shifts
    /// it down by one, so removing the first track while it is current
    /// leaves the playlist not started.
    pub fn remove(&mut self, index: usize) -> Option<String> {
        if index >= self.uris.len() {
            return None;
        }
        let uri = self.uris.remove(index);
        if let Some(position) = self.position {
            if index <= position {
                self.position = position.checked_sub(1);
            }
        }
        if !self.uris.contains(&uri) {
            self.shuffle_history.retain(|played| *played != uri);
        }
        Some(uri)
    }

    pub fn clear(&mut self) {
        self.uris.clear();
        self.position = None;
        self.shuffle_history.clear();
    }

    /// Rewinds to "not started" and forgets the shuffle history.
    pub fn reset(&mut self) {
        self.position = None;
        self.shuffle_history.clear();
    }

    pub fn shuffle_history(&self) -> &[String] {
        &self.shuffle_history
    }

    pub fn peek_next(&self) -> Option<usize> {
        let next = self.position.map_or(0, |position| position + 1);
        (next < self.uris.len()).then_some(next)
    }

    /// Moves to the next entry in order. At the end the cursor stays put.
    pub fn next(&mut self) -> Option<usize> {
        let next = self.peek_next()?;
        self.position = Some(next);
        Some(next)
    }

    /// Moves back one entry. At the start the cursor is clamped unless
    /// `wrap` is set.
    pub fn prev(&mut self, wrap: bool) -> Option<usize> {
        if self.uris.is_empty() {
            return None;
        }
        let prev = match self.position {
            Some(0) | None if wrap => self.uris.len() - 1,
            Some(0) | None => 0,
            Some(position) => position - 1,
        };
        self.position = Some(prev);
        Some(prev)
    }

    pub fn mark_played(&mut self) {
        if let Some(uri) = self.current().map(|uri| uri.to_string()) {
            if self.shuffle_history.last() != Some(&uri) {
                self.shuffle_history.push(uri);
            }
        }
    }

    /// Picks a random entry that is not in the shuffle history. When every
    /// entry has been played, the history is cleared if `repeat` is set,
    /// otherwise the playlist is exhausted.
    ///
    /// With `by_album`, playback continues through consecutive entries with
    /// the same album before a new random album group is chosen.
    pub fn next_shuffle<R: Rng + ?Sized>(
        &mut self,
        by_album: bool,
        repeat: bool,
        db: &TrackDb,
        rng: &mut R,
    ) -> Option<usize> {
        if self.uris.is_empty() {
            return None;
        }
        if self.unplayed().is_empty() {
            if !repeat {
                return None;
            }
            self.shuffle_history.clear();
        }

        let picked = if by_album {
            self.next_in_album(db).or_else(|| self.random_album_start(db, rng))
        } else {
            self.unplayed().choose(rng).copied()
        };
        let picked = picked?;
        self.position = Some(picked);
        self.mark_played();
        Some(picked)
    }

    pub fn prev_shuffle(&mut self) -> Option<usize> {
        if self.shuffle_history.len() < 2 {
            return None;
        }
        self.shuffle_history.pop();
        let previous = self.shuffle_history.last()?;
        let index = self.index_of(previous)?;
        self.position = Some(index);
        Some(index)
    }

    fn index_of(&self, uri: &str) -> Option<usize> {
        if let Some(position) = self.position {
            if self.get(position) == Some(uri) {
                return Some(position);
            }
        }
        self.uris.iter().position(|candidate| candidate == uri)
    }

    fn unplayed(&self) -> Vec<usize> {
        let played: HashSet<&str> = self.shuffle_history.iter().map(|uri| uri.as_str()).collect();
        (0..self.uris.len())
            .filter(|index| !played.contains(self.uris[*index].as_str()))
            .collect()
    }

    fn album_of(&self, index: usize, db: &TrackDb) -> Option<String> {
        db.get(&self.uris[index])
            .and_then(|track| track.album().map(|album| album.to_string()))
    }

    fn next_in_album(&self, db: &TrackDb) -> Option<usize> {
        let position = self.position?;
        let next = position + 1;
        if next >= self.uris.len() {
            return None;
        }
        let album = self.album_of(position, db)?;
        if self.album_of(next, db).as_deref() != Some(album.as_str()) {
            return None;
        }
        if self.shuffle_history.contains(&self.uris[next]) {
            return None;
        }
        Some(next)
    }

    fn random_album_start<R: Rng + ?Sized>(&self, db: &TrackDb, rng: &mut R) -> Option<usize> {
        let unplayed: HashSet<usize> = self.unplayed().into_iter().collect();
        let mut starts = Vec::new();
        let mut group_start = 0;
        for index in 0..=self.uris.len() {
            let boundary = index == self.uris.len()
                || (index > 0 && self.album_of(index, db) != self.album_of(index - 1, db))
                || (index > 0 && self.album_of(index, db).is_none());
            if index > 0 && boundary {
                if let Some(first) = (group_start..index).find(|i| unplayed.contains(i)) {
                    starts.push(first);
                }
                group_start = index;
            }
        }
        starts.choose(rng).copied()
    }
}
