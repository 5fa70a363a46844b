//! Playback progression.
//!
//! [`PlaybackEngine`] owns the active playlist, the priority queue and the
//! progression modes, and drives an [`AudioPipeline`]. It is synchronous and
//! borrows the [`TrackDb`] per call; the engine service serializes every
//! call on one task.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use common::tags::{LAST_ERROR, LAST_PLAYED, PLAYCOUNT};
use common::Track;
use library::{Playlist, TrackDb};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::pipeline::{AudioPipeline, PipelineEvent, PlayItem};
use crate::session::SessionState;
use crate::PlayerError;

/// Consecutive failures after which a track is skipped by progression.
pub const FAILURE_LIMIT: u32 = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShuffleMode {
    #[default]
    Off,
    Track,
    Album,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    Off,
    All,
    One,
}

impl FromStr for ShuffleMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(ShuffleMode::Off),
            "track" | "by_track" => Ok(ShuffleMode::Track),
            "album" | "by_album" => Ok(ShuffleMode::Album),
            other => Err(format!("unknown shuffle mode {other:?} (expected off, track or album)")),
        }
    }
}

impl FromStr for RepeatMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(RepeatMode::Off),
            "all" => Ok(RepeatMode::All),
            "one" => Ok(RepeatMode::One),
            other => Err(format!("unknown repeat mode {other:?} (expected off, all or one)")),
        }
    }
}

impl fmt::Display for ShuffleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShuffleMode::Off => "off",
            ShuffleMode::Track => "track",
            ShuffleMode::Album => "album",
        })
    }
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RepeatMode::Off => "off",
            RepeatMode::All => "all",
            RepeatMode::One => "one",
        })
    }
}

/// When a play counts: after `fraction` of the track or `max_secs`,
/// whichever comes first.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayCountRule {
    pub fraction: f64,
    pub max_secs: f64,
}

impl Default for PlayCountRule {
    fn default() -> Self {
        Self {
            fraction: 0.5,
            max_secs: 240.0,
        }
    }
}

impl PlayCountRule {
    pub fn threshold(&self, length: Option<f64>) -> f64 {
        match length {
            Some(length) => (length * self.fraction).min(self.max_secs),
            None => self.max_secs,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub play_count: PlayCountRule,
    /// Tracks requested from the dynamic extender per lookup.
    pub dynamic_batch: usize,
    /// Playlist entries, from the end, passed to the extender as seeds.
    pub dynamic_seeds: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            play_count: PlayCountRule::default(),
            dynamic_batch: 5,
            dynamic_seeds: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    Queue,
    Playlist,
}

struct NowPlaying {
    uri: String,
    generation: u64,
    source: Source,
    /// Accumulated listening time, excluding pauses.
    played: Duration,
    /// Clock reading when playback last (re)started; `None` while paused.
    resumed_at: Option<Duration>,
    counted: bool,
}

impl NowPlaying {
    fn played(&self, now: Duration) -> Duration {
        self.played
            + self
                .resumed_at
                .map(|at| now.saturating_sub(at))
                .unwrap_or_default()
    }
}

/// A dynamic-extension lookup the caller must run and report back through
/// [`PlaybackEngine::complete_dynamic`].
#[derive(Clone, Debug)]
pub struct DynamicRequest {
    pub ticket: u64,
    pub seeds: Vec<Arc<Track>>,
    pub count: usize,
}

#[derive(Clone, Debug)]
pub enum Advance {
    Started(String),
    Stopped,
    NeedsDynamic(DynamicRequest),
    Unchanged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Finish {
    Skipped,
    Completed,
    Failed,
}

pub struct PlaybackEngine {
    pipeline: Box<dyn AudioPipeline>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    rng: StdRng,
    playlist: Playlist,
    queue: VecDeque<String>,
    state: PlayState,
    now: Option<NowPlaying>,
    shuffle: ShuffleMode,
    repeat: RepeatMode,
    dynamic: bool,
    stop_after_current: bool,
    generation: u64,
    next_ticket: u64,
    pending_dynamic: Option<u64>,
    failures: HashMap<String, u32>,
}

impl PlaybackEngine {
    pub fn new(
        pipeline: Box<dyn AudioPipeline>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
        rng: StdRng,
    ) -> Self {
        Self {
            pipeline,
            clock,
            settings,
            rng,
            playlist: Playlist::new("default"),
            queue: VecDeque::new(),
            state: PlayState::Stopped,
            now: None,
            shuffle: ShuffleMode::Off,
            repeat: RepeatMode::Off,
            dynamic: false,
            stop_after_current: false,
            generation: 0,
            next_ticket: 0,
            pending_dynamic: None,
            failures: HashMap::new(),
        }
    }

    pub fn state(&self) -> PlayState {
        self.state
    }

    pub fn current(&self) -> Option<&str> {
        self.now.as_ref().map(|now| now.uri.as_str())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn position(&self) -> f64 {
        match self.state {
            PlayState::Stopped => 0.0,
            _ => self.pipeline.position(),
        }
    }

    pub fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    pub fn playlist_mut(&mut self) -> &mut Playlist {
        &mut self.playlist
    }

    /// Replaces the active playlist. Whatever is playing keeps playing.
    pub fn load_playlist(&mut self, playlist: Playlist) {
        info!("Loaded playlist {:?} ({} entries)", playlist.name(), playlist.len());
        self.playlist = playlist;
        self.pending_dynamic = None;
        self.announce_next();
    }

    pub fn queue(&self) -> impl Iterator<Item = &str> {
        self.queue.iter().map(|uri| uri.as_str())
    }

    pub fn enqueue(&mut self, uri: impl Into<String>) {
        self.queue.push_back(uri.into());
        self.announce_next();
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
        self.announce_next();
    }

    pub fn shuffle(&self) -> ShuffleMode {
        self.shuffle
    }

    pub fn set_shuffle(&mut self, mode: ShuffleMode) {
        let turning_on = mode != ShuffleMode::Off && self.shuffle == ShuffleMode::Off;
        if turning_on && self.now.as_ref().is_some_and(|now| now.source == Source::Playlist) {
            self.playlist.mark_played();
        }
        self.shuffle = mode;
        self.announce_next();
    }

    pub fn repeat(&self) -> RepeatMode {
        self.repeat
    }

    pub fn set_repeat(&mut self, mode: RepeatMode) {
        self.repeat = mode;
        self.announce_next();
    }

    pub fn dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn set_dynamic(&mut self, enabled: bool) {
        self.dynamic = enabled;
    }

    pub fn stop_after_current(&self) -> bool {
        self.stop_after_current
    }

    pub fn set_stop_after_current(&mut self, enabled: bool) {
        self.stop_after_current = enabled;
    }

    pub fn failures(&self, uri: &str) -> u32 {
        self.failures.get(uri).copied().unwrap_or(0)
    }

    /// Starts playback. With an index, jumps to that playlist entry; without
    /// one, resumes when paused or starts the current (else next) entry
    /// when stopped.
    pub fn play(&mut self, db: &mut TrackDb, index: Option<usize>) -> Result<Advance, PlayerError> {
        if let Some(index) = index {
            let Some(uri) = self.playlist.get(index).map(|uri| uri.to_string()) else {
                return Err(PlayerError::InvalidArgument(format!(
                    "playlist has no entry {index} ({} entries)",
                    self.playlist.len()
                )));
            };
            self.settle(db, Finish::Skipped);
            self.pending_dynamic = None;
            self.failures.remove(&uri);
            self.playlist.set_current(Some(index));
            if self.shuffle != ShuffleMode::Off {
                self.playlist.mark_played();
            }
            return Ok(self.start_or_advance(db, uri, Source::Playlist));
        }

        match self.state {
            PlayState::Playing => Ok(Advance::Unchanged),
            PlayState::Paused => {
                self.resume();
                Ok(Advance::Unchanged)
            }
            PlayState::Stopped => {
                self.pending_dynamic = None;
                match self.playlist.current().map(|uri| uri.to_string()) {
                    Some(uri) => Ok(self.start_or_advance(db, uri, Source::Playlist)),
                    None => Ok(self.advance(db, true)),
                }
            }
        }
    }

    pub fn pause(&mut self) {
        if self.state != PlayState::Playing {
            return;
        }
        let elapsed = self.clock.elapsed();
        if let Some(now) = self.now.as_mut() {
            now.played = now.played(elapsed);
            now.resumed_at = None;
        }
        self.pipeline.pause();
        self.state = PlayState::Paused;
        debug!("Paused");
    }

    pub fn resume(&mut self) {
        if self.state != PlayState::Paused {
            return;
        }
        let elapsed = self.clock.elapsed();
        if let Some(now) = self.now.as_mut() {
            now.resumed_at = Some(elapsed);
        }
        self.pipeline.resume();
        self.state = PlayState::Playing;
        debug!("Resumed");
    }

    pub fn toggle_pause(&mut self, db: &mut TrackDb) -> Result<Advance, PlayerError> {
        match self.state {
            PlayState::Playing => {
                self.pause();
                Ok(Advance::Unchanged)
            }
            PlayState::Paused | PlayState::Stopped => self.play(db, None),
        }
    }

    pub fn stop(&mut self, db: &mut TrackDb) -> Advance {
        self.settle(db, Finish::Skipped);
        self.pending_dynamic = None;
        self.stop_after_current = false;
        self.halt()
    }

    /// User-requested advance. A skip before the play-count threshold does
    /// not count the track.
    pub fn next(&mut self, db: &mut TrackDb) -> Advance {
        self.settle(db, Finish::Skipped);
        self.advance(db, true)
    }

    /// Steps back: through the shuffle history when shuffling, otherwise to
    /// the previous entry. At the start the cursor wraps only with
    /// `repeat=all`.
    pub fn prev(&mut self, db: &mut TrackDb) -> Advance {
        let index = match self.shuffle {
            ShuffleMode::Off => self.playlist.prev(self.repeat == RepeatMode::All),
            _ => self
                .playlist
                .prev_shuffle()
                .or_else(|| self.playlist.position()),
        };
        let Some(uri) = index.and_then(|index| self.playlist.get(index)).map(|uri| uri.to_string())
        else {
            return Advance::Unchanged;
        };
        self.settle(db, Finish::Skipped);
        self.pending_dynamic = None;
        match self.try_start(db, uri, Source::Playlist) {
            Some(uri) => Advance::Started(uri),
            None => self.halt(),
        }
    }

    pub fn seek(&mut self, secs: f64) -> Result<(), PlayerError> {
        if self.state == PlayState::Stopped {
            return Err(PlayerError::InvalidArgument("nothing is playing".to_string()));
        }
        if !secs.is_finite() || secs < 0.0 {
            return Err(PlayerError::InvalidArgument(format!("invalid position {secs}")));
        }
        self.pipeline.seek(secs)?;
        Ok(())
    }

    pub fn tick(&mut self, db: &mut TrackDb) {
        if self.state == PlayState::Playing {
            self.account(db);
        }
    }

    /// Handles end-of-stream or a failure reported by the pipeline. Events
    /// for anything but the track currently playing are discarded.
    pub fn handle_event(&mut self, db: &mut TrackDb, event: PipelineEvent) -> Advance {
        let current = self.now.as_ref().map(|now| now.generation);
        if self.state == PlayState::Stopped || current != Some(event.generation()) {
            debug!(
                "Discarding stale pipeline event for generation {} (current {:?})",
                event.generation(),
                current
            );
            return Advance::Unchanged;
        }

        match event {
            PipelineEvent::EndOfStream { .. } => self.settle(db, Finish::Completed),
            PipelineEvent::Error { message, .. } => {
                self.settle(db, Finish::Failed);
                if let Some(uri) = self.current().map(|uri| uri.to_string()) {
                    warn!("Playback of {} failed: {}", uri, message);
                    self.record_failure(db, &uri, &message);
                }
            }
        }

        if self.stop_after_current {
            self.stop_after_current = false;
            info!("Stopping after current track");
            return self.halt();
        }
        self.advance(db, true)
    }

    /// Applies the result of a dynamic lookup. New URIs are appended to the
    /// playlist and progression is retried once; without any, playback
    /// stays stopped. Results for a superseded request are ignored.
    pub fn complete_dynamic(
        &mut self,
        db: &mut TrackDb,
        ticket: u64,
        uris: Option<Vec<String>>,
    ) -> Advance {
        if self.pending_dynamic != Some(ticket) {
            debug!("Ignoring superseded dynamic result {}", ticket);
            return Advance::Unchanged;
        }
        self.pending_dynamic = None;

        let present: HashSet<String> = self.playlist.uris().iter().cloned().collect();
        let fresh: Vec<String> = uris
            .unwrap_or_default()
            .into_iter()
            .filter(|uri| !present.contains(uri))
            .collect();
        if fresh.is_empty() {
            info!("Dynamic extension found nothing; stopping");
            return self.halt();
        }
        info!("Dynamic extension appended {} tracks", fresh.len());
        self.playlist.extend(fresh);
        self.advance(db, false)
    }

    pub fn session(&self) -> SessionState {
        SessionState {
            playlist: self.playlist.clone(),
            queue: self.queue.iter().cloned().collect(),
            shuffle: self.shuffle,
            repeat: self.repeat,
            dynamic: self.dynamic,
        }
    }

    /// Restores a saved session without starting playback.
    pub fn restore(&mut self, db: &mut TrackDb, session: SessionState) {
        self.stop(db);
        self.playlist = session.playlist;
        self.queue = session.queue.into();
        self.shuffle = session.shuffle;
        self.repeat = session.repeat;
        self.dynamic = session.dynamic;
        self.announce_next();
    }

    /// The progression algorithm: priority queue, repeat-one, playlist
    /// order or shuffle, repeat-all wrap, then dynamic extension.
    fn advance(&mut self, db: &mut TrackDb, allow_dynamic: bool) -> Advance {
        self.pending_dynamic = None;
        let mut attempts = self.queue.len() + 2 * self.playlist.len() + 2;
        while attempts > 0 {
            attempts -= 1;
            let Some((uri, source)) = self.pick_next(db) else {
                break;
            };
            if let Some(uri) = self.try_start(db, uri, source) {
                return Advance::Started(uri);
            }
        }
        if allow_dynamic && self.dynamic && self.repeat != RepeatMode::All {
            if let Some(request) = self.dynamic_request(db) {
                self.halt();
                self.pending_dynamic = Some(request.ticket);
                debug!("Requesting {} tracks from the dynamic extender", request.count);
                return Advance::NeedsDynamic(request);
            }
        }
        self.halt()
    }

    fn pick_next(&mut self, db: &TrackDb) -> Option<(String, Source)> {
        if let Some(uri) = self.queue.pop_front() {
            return Some((uri, Source::Queue));
        }
        if self.repeat == RepeatMode::One {
            if let Some(now) = self.now.as_ref() {
                if !self.is_blocked(&now.uri) {
                    return Some((now.uri.clone(), now.source));
                }
            }
        }
        if let Some(index) = self.step_playlist(db) {
            return self.playlist_entry(index);
        }
        if self.repeat == RepeatMode::All && !self.playlist.is_empty() {
            self.playlist.reset();
            let index = match self.shuffle {
                ShuffleMode::Off => {
                    self.playlist.set_current(Some(0));
                    Some(0)
                }
                _ => self.step_playlist(db),
            };
            return index.and_then(|index| self.playlist_entry(index));
        }
        None
    }

    fn step_playlist(&mut self, db: &TrackDb) -> Option<usize> {
        match self.shuffle {
            ShuffleMode::Off => self.playlist.next(),
            ShuffleMode::Track => self.playlist.next_shuffle(false, false, db, &mut self.rng),
            ShuffleMode::Album => self.playlist.next_shuffle(true, false, db, &mut self.rng),
        }
    }

    fn playlist_entry(&self, index: usize) -> Option<(String, Source)> {
        self.playlist
            .get(index)
            .map(|uri| (uri.to_string(), Source::Playlist))
    }

    fn start_or_advance(&mut self, db: &mut TrackDb, uri: String, source: Source) -> Advance {
        match self.try_start(db, uri, source) {
            Some(uri) => Advance::Started(uri),
            None => self.advance(db, true),
        }
    }

    // None when the track is skipped or the pipeline refused it.
    fn try_start(&mut self, db: &mut TrackDb, uri: String, source: Source) -> Option<String> {
        if self.is_blocked(&uri) {
            debug!("Skipping {}: failed {} times in a row", uri, FAILURE_LIMIT);
            return None;
        }
        self.generation += 1;
        let length = db.get(&uri).and_then(|track| track.length());
        let item = PlayItem {
            uri,
            generation: self.generation,
            length,
        };
        match self.pipeline.play(&item) {
            Ok(()) => {
                info!("Playing {}", item.uri);
                self.now = Some(NowPlaying {
                    uri: item.uri.clone(),
                    generation: item.generation,
                    source,
                    played: Duration::ZERO,
                    resumed_at: Some(self.clock.elapsed()),
                    counted: false,
                });
                self.state = PlayState::Playing;
                self.announce_next();
                Some(item.uri)
            }
            Err(err) => {
                warn!("Cannot play {}: {}", item.uri, err);
                self.now = None;
                self.record_failure(db, &item.uri, &err.to_string());
                None
            }
        }
    }

    fn halt(&mut self) -> Advance {
        self.pipeline.stop();
        self.pipeline.set_next(None);
        self.now = None;
        if self.state != PlayState::Stopped {
            info!("Stopped");
        }
        self.state = PlayState::Stopped;
        Advance::Stopped
    }

    /// Closes the accounting of the current track. The track stays current
    /// so repeat-one can replay it.
    fn settle(&mut self, db: &mut TrackDb, finish: Finish) {
        self.account(db);
        let elapsed = self.clock.elapsed();
        let Some(now) = self.now.as_mut() else {
            return;
        };
        now.played = now.played(elapsed);
        now.resumed_at = None;
        if finish == Finish::Completed {
            self.failures.remove(&now.uri);
        }
    }

    fn account(&mut self, db: &mut TrackDb) {
        let elapsed = self.clock.elapsed();
        let Some(now) = self.now.as_mut() else {
            return;
        };
        if now.counted {
            return;
        }
        let length = db.get(&now.uri).and_then(|track| track.length());
        let threshold = self.settings.play_count.threshold(length);
        if now.played(elapsed).as_secs_f64() < threshold {
            return;
        }
        now.counted = true;
        let when = self.clock.wall_secs();
        let updated = db.modify(&now.uri, |track| {
            let count = track.playcount() + 1;
            track.set_number(PLAYCOUNT, count as f64);
            track.set_number(LAST_PLAYED, when);
        });
        if updated {
            debug!("Counted a play of {}", now.uri);
        }
    }

    fn record_failure(&mut self, db: &mut TrackDb, uri: &str, message: &str) {
        let count = self.failures.entry(uri.to_string()).or_insert(0);
        *count += 1;
        if *count >= FAILURE_LIMIT {
            warn!("{} failed {} times in a row; skipping it", uri, *count);
        }
        db.modify(uri, |track| {
            if let Err(err) = track.set_tag(LAST_ERROR, [message]) {
                warn!("Cannot record error on {}: {}", uri, err);
            }
        });
    }

    fn is_blocked(&self, uri: &str) -> bool {
        self.failures(uri) >= FAILURE_LIMIT
    }

    fn dynamic_request(&mut self, db: &TrackDb) -> Option<DynamicRequest> {
        let mut seeds: Vec<Arc<Track>> = self
            .playlist
            .uris()
            .iter()
            .rev()
            .filter_map(|uri| db.get(uri).cloned())
            .take(self.settings.dynamic_seeds.max(1))
            .collect();
        if seeds.is_empty() {
            if let Some(track) = self.current().and_then(|uri| db.get(uri)) {
                seeds.push(Arc::clone(track));
            }
        }
        if seeds.is_empty() {
            return None;
        }
        self.next_ticket += 1;
        Some(DynamicRequest {
            ticket: self.next_ticket,
            seeds,
            count: self.settings.dynamic_batch.max(1),
        })
    }

    fn announce_next(&mut self) {
        if self.state == PlayState::Stopped {
            return;
        }
        let upcoming = if let Some(uri) = self.queue.front() {
            Some(uri.clone())
        } else if self.repeat == RepeatMode::One {
            self.current().map(|uri| uri.to_string())
        } else if self.shuffle == ShuffleMode::Off {
            self.playlist
                .peek_next()
                .or_else(|| (self.repeat == RepeatMode::All && !self.playlist.is_empty()).then_some(0))
                .and_then(|index| self.playlist.get(index))
                .map(|uri| uri.to_string())
        } else {
            None
        };
        self.pipeline.set_next(upcoming.as_deref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pipeline::PipelineError;
    use parking_lot::Mutex;
    use rand::SeedableRng;

    #[derive(Default)]
    struct Recorder {
        plays: Vec<(String, u64)>,
        next: Option<String>,
        stops: usize,
    }

    struct RecordingPipeline {
        log: Arc<Mutex<Recorder>>,
        failing: HashSet<String>,
    }

    impl AudioPipeline for RecordingPipeline {
        fn play(&mut self, item: &PlayItem) -> Result<(), PipelineError> {
            self.log
                .lock()
                .plays
                .push((item.uri.clone(), item.generation));
            if self.failing.contains(&item.uri) {
                return Err(PipelineError::Other("decoder exploded".to_string()));
            }
            Ok(())
        }

        fn pause(&mut self) {}

        fn resume(&mut self) {}

        fn stop(&mut self) {
            self.log.lock().stops += 1;
        }

        fn seek(&mut self, _secs: f64) -> Result<(), PipelineError> {
            Ok(())
        }

        fn position(&self) -> f64 {
            0.0
        }

        fn set_next(&mut self, uri: Option<&str>) {
            self.log.lock().next = uri.map(|uri| uri.to_string());
        }
    }

    struct Fixture {
        engine: PlaybackEngine,
        db: TrackDb,
        clock: Arc<ManualClock>,
        log: Arc<Mutex<Recorder>>,
    }

    fn uri(n: usize) -> String {
        format!("file:///m/t{n}.mp3")
    }

    fn fixture(n: usize, failing: &[usize]) -> Fixture {
        let mut db = TrackDb::in_memory("test");
        for i in 1..=n {
            let mut track = Track::new(uri(i)).unwrap();
            track.set_tag("title", [format!("T{i}")]).unwrap();
            track.set_number("__length", 100.0);
            db.put(track).unwrap();
        }
        let clock = Arc::new(ManualClock::new(1_700_000_000.0));
        let log = Arc::new(Mutex::new(Recorder::default()));
        let pipeline = RecordingPipeline {
            log: Arc::clone(&log),
            failing: failing.iter().map(|i| uri(*i)).collect(),
        };
        let mut engine = PlaybackEngine::new(
            Box::new(pipeline),
            clock.clone(),
            EngineSettings::default(),
            StdRng::seed_from_u64(7),
        );
        engine.load_playlist(Playlist::with_uris("test", (1..=n).map(uri).collect()));
        Fixture {
            engine,
            db,
            clock,
            log,
        }
    }

    fn started(advance: Advance) -> Option<String> {
        match advance {
            Advance::Started(uri) => Some(uri),
            _ => None,
        }
    }

    fn eos(f: &mut Fixture) -> Advance {
        let generation = f.engine.generation();
        f.engine
            .handle_event(&mut f.db, PipelineEvent::EndOfStream { generation })
    }

    #[test]
    fn sequential_progression_stops_at_the_end() {
        let mut f = fixture(3, &[]);
        assert_eq!(started(f.engine.play(&mut f.db, Some(0)).unwrap()), Some(uri(1)));
        assert_eq!(started(f.engine.next(&mut f.db)), Some(uri(2)));
        assert_eq!(started(f.engine.next(&mut f.db)), Some(uri(3)));
        assert!(matches!(f.engine.next(&mut f.db), Advance::Stopped));
        assert_eq!(f.engine.state(), PlayState::Stopped);
        assert_eq!(f.engine.current(), None);
    }

    #[test]
    fn repeat_all_wraps_to_the_first_entry() {
        let mut f = fixture(3, &[]);
        f.engine.set_repeat(RepeatMode::All);
        f.engine.play(&mut f.db, Some(2)).unwrap();
        assert_eq!(started(eos(&mut f)), Some(uri(1)));
        assert_eq!(f.engine.playlist().position(), Some(0));
    }

    #[test]
    fn repeat_one_replays_the_current_track() {
        let mut f = fixture(3, &[]);
        f.engine.set_repeat(RepeatMode::One);
        f.engine.play(&mut f.db, Some(1)).unwrap();
        f.clock.advance(Duration::from_secs(100));
        assert_eq!(started(eos(&mut f)), Some(uri(2)));
        f.clock.advance(Duration::from_secs(100));
        assert_eq!(started(eos(&mut f)), Some(uri(2)));
        assert_eq!(f.db.get(&uri(2)).unwrap().playcount(), 2);
    }

    #[test]
    fn shuffle_plays_each_track_once_then_stops() {
        let mut f = fixture(3, &[]);
        f.engine.set_shuffle(ShuffleMode::Track);
        let mut played: Vec<String> = (0..3)
            .map(|_| started(f.engine.next(&mut f.db)).unwrap())
            .collect();
        assert!(matches!(f.engine.next(&mut f.db), Advance::Stopped));
        played.sort();
        assert_eq!(played, vec![uri(1), uri(2), uri(3)]);
    }

    #[test]
    fn queued_tracks_preempt_the_playlist() {
        let mut f = fixture(3, &[]);
        f.engine.play(&mut f.db, Some(0)).unwrap();
        f.engine.enqueue("file:///m/t9.mp3");
        assert_eq!(f.log.lock().next.as_deref(), Some("file:///m/t9.mp3"));
        assert_eq!(started(eos(&mut f)).as_deref(), Some("file:///m/t9.mp3"));
        assert_eq!(started(eos(&mut f)), Some(uri(2)));
    }

    #[test]
    fn play_count_needs_the_threshold() {
        let mut f = fixture(3, &[]);
        f.engine.play(&mut f.db, Some(0)).unwrap();
        f.clock.advance(Duration::from_secs(40));
        f.engine.next(&mut f.db);
        let first = f.db.get(&uri(1)).unwrap();
        assert_eq!(first.playcount(), 0);
        assert_eq!(first.last_played(), None);

        f.clock.advance(Duration::from_secs(60));
        f.engine.next(&mut f.db);
        let second = f.db.get(&uri(2)).unwrap();
        assert_eq!(second.playcount(), 1);
        assert_eq!(second.last_played(), Some(f.clock.wall_secs()));
    }

    #[test]
    fn end_of_stream_after_a_seek_is_not_a_play() {
        let mut f = fixture(2, &[]);
        f.engine.play(&mut f.db, Some(0)).unwrap();
        f.engine.seek(95.0).unwrap();
        f.clock.advance(Duration::from_secs(5));
        assert_eq!(started(eos(&mut f)), Some(uri(2)));
        let first = f.db.get(&uri(1)).unwrap();
        assert_eq!(first.playcount(), 0);
        assert_eq!(first.last_played(), None);
    }

    #[test]
    fn paused_time_does_not_count() {
        let mut f = fixture(2, &[]);
        f.engine.play(&mut f.db, Some(0)).unwrap();
        f.clock.advance(Duration::from_secs(30));
        f.engine.pause();
        f.clock.advance(Duration::from_secs(300));
        f.engine.play(&mut f.db, None).unwrap();
        assert_eq!(f.engine.state(), PlayState::Playing);
        f.clock.advance(Duration::from_secs(10));
        f.engine.tick(&mut f.db);
        assert_eq!(f.db.get(&uri(1)).unwrap().playcount(), 0);
        f.clock.advance(Duration::from_secs(10));
        f.engine.tick(&mut f.db);
        f.engine.tick(&mut f.db);
        assert_eq!(f.db.get(&uri(1)).unwrap().playcount(), 1);
        f.engine.next(&mut f.db);
        assert_eq!(f.db.get(&uri(1)).unwrap().playcount(), 1);
    }

    #[test]
    fn stale_end_of_stream_is_discarded() {
        let mut f = fixture(3, &[]);
        f.engine.play(&mut f.db, Some(0)).unwrap();
        let stale = f.engine.generation();
        f.engine.next(&mut f.db);
        let advance = f
            .engine
            .handle_event(&mut f.db, PipelineEvent::EndOfStream { generation: stale });
        assert!(matches!(advance, Advance::Unchanged));
        assert_eq!(f.engine.current(), Some(uri(2).as_str()));
        assert_eq!(f.db.get(&uri(1)).unwrap().playcount(), 0);
    }

    #[test]
    fn pipeline_errors_mark_the_track_and_advance() {
        let mut f = fixture(3, &[]);
        f.engine.play(&mut f.db, Some(0)).unwrap();
        let generation = f.engine.generation();
        let advance = f.engine.handle_event(
            &mut f.db,
            PipelineEvent::Error {
                generation,
                message: "bad frame".to_string(),
            },
        );
        assert_eq!(started(advance), Some(uri(2)));
        let first = f.db.get(&uri(1)).unwrap();
        assert_eq!(first.first(LAST_ERROR), Some("bad frame"));
        assert_eq!(first.playcount(), 0);
        assert_eq!(f.engine.failures(&uri(1)), 1);
    }

    #[test]
    fn tracks_failing_three_times_are_skipped() {
        let mut f = fixture(2, &[2]);
        f.engine.set_repeat(RepeatMode::All);
        f.engine.play(&mut f.db, Some(0)).unwrap();
        for _ in 0..4 {
            assert_eq!(started(eos(&mut f)), Some(uri(1)));
        }
        let attempts = f
            .log
            .lock()
            .plays
            .iter()
            .filter(|(played, _)| *played == uri(2))
            .count();
        assert_eq!(attempts, 3);
        assert_eq!(f.engine.failures(&uri(2)), 3);
        assert_eq!(f.db.get(&uri(2)).unwrap().first(LAST_ERROR), Some("pipeline failure: decoder exploded"));
    }

    #[test]
    fn stop_after_current_is_one_shot() {
        let mut f = fixture(3, &[]);
        f.engine.play(&mut f.db, Some(0)).unwrap();
        f.engine.set_stop_after_current(true);
        f.clock.advance(Duration::from_secs(100));
        assert!(matches!(eos(&mut f), Advance::Stopped));
        assert!(!f.engine.stop_after_current());
        assert_eq!(f.db.get(&uri(1)).unwrap().playcount(), 1);
        assert_eq!(started(f.engine.next(&mut f.db)), Some(uri(2)));
    }

    #[test]
    fn prev_clamps_without_repeat_and_wraps_with_it() {
        let mut f = fixture(3, &[]);
        f.engine.play(&mut f.db, Some(0)).unwrap();
        assert_eq!(started(f.engine.prev(&mut f.db)), Some(uri(1)));
        f.engine.set_repeat(RepeatMode::All);
        assert_eq!(started(f.engine.prev(&mut f.db)), Some(uri(3)));
    }

    #[test]
    fn prev_walks_back_through_shuffle_history() {
        let mut f = fixture(4, &[]);
        f.engine.set_shuffle(ShuffleMode::Track);
        let first = started(f.engine.next(&mut f.db)).unwrap();
        let _second = started(f.engine.next(&mut f.db)).unwrap();
        assert_eq!(started(f.engine.prev(&mut f.db)), Some(first));
    }

    #[test]
    fn dynamic_extension_appends_and_continues() {
        let mut f = fixture(1, &[]);
        f.engine.set_dynamic(true);
        f.engine.play(&mut f.db, Some(0)).unwrap();
        let Advance::NeedsDynamic(request) = eos(&mut f) else {
            panic!("expected a dynamic request");
        };
        assert_eq!(request.count, 5);
        assert_eq!(request.seeds.len(), 1);
        assert_eq!(request.seeds[0].loc(), uri(1));
        assert_eq!(f.engine.state(), PlayState::Stopped);

        let advance = f.engine.complete_dynamic(
            &mut f.db,
            request.ticket,
            Some(vec![uri(1), "file:///m/new.mp3".to_string()]),
        );
        assert_eq!(started(advance).as_deref(), Some("file:///m/new.mp3"));
        assert_eq!(f.engine.playlist().len(), 2);
    }

    #[test]
    fn empty_or_superseded_dynamic_results_stop() {
        let mut f = fixture(1, &[]);
        f.engine.set_dynamic(true);
        f.engine.play(&mut f.db, Some(0)).unwrap();
        let Advance::NeedsDynamic(request) = eos(&mut f) else {
            panic!("expected a dynamic request");
        };
        assert!(matches!(
            f.engine.complete_dynamic(&mut f.db, request.ticket + 1, Some(vec![uri(5)])),
            Advance::Unchanged
        ));
        assert!(matches!(
            f.engine.complete_dynamic(&mut f.db, request.ticket, None),
            Advance::Stopped
        ));
        assert_eq!(f.engine.playlist().len(), 1);
    }

    #[test]
    fn out_of_range_play_is_rejected() {
        let mut f = fixture(2, &[]);
        assert!(matches!(
            f.engine.play(&mut f.db, Some(5)),
            Err(PlayerError::InvalidArgument(_))
        ));
        assert!(f.engine.seek(3.0).is_err());
    }

    #[test]
    fn session_restores_without_playing() {
        let mut f = fixture(3, &[]);
        f.engine.play(&mut f.db, Some(1)).unwrap();
        f.engine.enqueue(uri(3));
        f.engine.set_shuffle(ShuffleMode::Album);
        f.engine.set_repeat(RepeatMode::All);
        let session = f.engine.session();

        let mut g = fixture(0, &[]);
        g.engine.restore(&mut f.db, session.clone());
        assert_eq!(g.engine.state(), PlayState::Stopped);
        assert_eq!(g.engine.playlist().position(), Some(1));
        assert_eq!(g.engine.queue().collect::<Vec<_>>(), vec![uri(3).as_str()]);
        assert_eq!(g.engine.session(), session);
    }

    #[test]
    fn mode_names_parse() {
        assert_eq!("album".parse::<ShuffleMode>(), Ok(ShuffleMode::Album));
        assert_eq!("ONE".parse::<RepeatMode>(), Ok(RepeatMode::One));
        assert!("sideways".parse::<RepeatMode>().is_err());
        assert_eq!(PlayCountRule::default().threshold(Some(100.0)), 50.0);
        assert_eq!(PlayCountRule::default().threshold(Some(1000.0)), 240.0);
        assert_eq!(PlayCountRule::default().threshold(None), 240.0);
    }
}
