//! The engine task.
//!
//! One task owns the [`TrackDb`] and the [`PlaybackEngine`]. User commands
//! arrive through an [`EngineHandle`]; scans, snapshot commits, query
//! evaluation and dynamic lookups run on blocking workers and post their
//! results back on a single ordered channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::{uri, SortOptions, Track};
use library::db::{search_tracks, KnownTracks};
use library::playlist_io::read_playlist;
use library::scan::{root_prefix, ScanSink};
use library::search::sort_tracks;
use library::{
    LibraryError, Playlist, Query, QueryOptions, ScanChange, ScanProgress, ScanSummary, Scanner,
    SearchHit, TrackDb,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{resolve_path, PlayerConfig};
use crate::dynamic::DynamicExtender;
use crate::engine::{Advance, DynamicRequest, PlayState, PlaybackEngine, RepeatMode, ShuffleMode};
use crate::pipeline::PipelineEvent;
use crate::session::save_session;
use crate::PlayerError;

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;
const RESULT_SORT: &[&str] = &["artist", "album", "discnumber", "tracknumber", "title"];

#[derive(Clone, Debug)]
pub struct ServiceOptions {
    pub query: QueryOptions,
    pub sort: SortOptions,
    pub save_debounce: Duration,
    pub dynamic_timeout: Duration,
    pub tick: Duration,
    pub session_path: Option<PathBuf>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            query: QueryOptions::default(),
            sort: SortOptions::default(),
            save_debounce: Duration::from_secs(5),
            dynamic_timeout: Duration::from_secs(10),
            tick: Duration::from_secs(1),
            session_path: None,
        }
    }
}

impl ServiceOptions {
    pub fn from_config(config: &PlayerConfig, config_path: &Path) -> Self {
        Self {
            query: config.query_options(),
            sort: config.sort_options(),
            save_debounce: config.save_debounce(),
            dynamic_timeout: config.dynamic_timeout(),
            tick: config.pipeline_tick(),
            session_path: Some(resolve_path(config_path, &config.session_path)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    TrackStarted { uri: String },
    Stopped,
    ScanProgress(ScanProgress),
    ScanFinished(ScanSummary),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: PlayState,
    pub current: Option<String>,
    pub title: Option<String>,
    pub position: f64,
    pub length: Option<f64>,
    pub playlist: String,
    pub playlist_len: usize,
    pub playlist_position: Option<usize>,
    pub queued: usize,
    pub shuffle: ShuffleMode,
    pub repeat: RepeatMode,
    pub dynamic: bool,
    pub stop_after_current: bool,
    pub tracks: usize,
    pub scanning: Option<ScanProgress>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackRow {
    pub uri: String,
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub length: Option<f64>,
    /// Tags that contributed to the match.
    pub matched: Vec<String>,
}

impl TrackRow {
    fn from_hit(hit: SearchHit) -> Self {
        let track = &hit.track;
        Self {
            uri: track.loc().to_string(),
            title: track.display_name(),
            artist: track.artists().first().cloned(),
            album: track.album().map(|album| album.to_string()),
            length: track.length(),
            matched: hit.tags.into_iter().collect(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, PlayerError>>;

enum Command {
    Play { index: Option<usize>, reply: Reply<()> },
    Pause(Reply<()>),
    TogglePause(Reply<()>),
    Stop(Reply<()>),
    Next(Reply<()>),
    Prev(Reply<()>),
    Seek { secs: f64, reply: Reply<()> },
    Enqueue { uris: Vec<String>, reply: Reply<usize> },
    Query { text: String, reply: Reply<Vec<TrackRow>> },
    Status(Reply<StatusReport>),
    Scan {
        roots: Option<Vec<String>>,
        force: bool,
        reply: Option<Reply<()>>,
    },
    SetPlaylist { playlist: Playlist, reply: Reply<usize> },
    SetShuffle { mode: ShuffleMode, reply: Reply<()> },
    SetRepeat { mode: RepeatMode, reply: Reply<()> },
    SetDynamic { enabled: bool, reply: Reply<()> },
    SetStopAfterCurrent { enabled: bool, reply: Reply<()> },
    Shutdown(oneshot::Sender<()>),
}

enum Internal {
    ScanChange(ScanChange),
    ScanProgress(ScanProgress),
    ScanFinished(ScanSummary),
    SaveFinished {
        revision: u64,
        result: Result<(), LibraryError>,
    },
    Dynamic {
        ticket: u64,
        uris: Option<Vec<String>>,
    },
}

/// Forwards scanner output to the engine task in order.
struct ChannelSink {
    tx: mpsc::UnboundedSender<Internal>,
}

impl ScanSink for ChannelSink {
    fn change(&mut self, change: ScanChange) {
        let _ = self.tx.send(Internal::ScanChange(change));
    }

    fn progress(&mut self, progress: &ScanProgress) {
        let _ = self.tx.send(Internal::ScanProgress(progress.clone()));
    }
}

#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, PlayerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| PlayerError::NotRunning)?;
        rx.await.map_err(|_| PlayerError::NotRunning)?
    }

    pub async fn play(&self, index: Option<usize>) -> Result<(), PlayerError> {
        self.request(|reply| Command::Play { index, reply }).await
    }

    pub async fn pause(&self) -> Result<(), PlayerError> {
        self.request(Command::Pause).await
    }

    pub async fn toggle_pause(&self) -> Result<(), PlayerError> {
        self.request(Command::TogglePause).await
    }

    pub async fn stop(&self) -> Result<(), PlayerError> {
        self.request(Command::Stop).await
    }

    pub async fn next(&self) -> Result<(), PlayerError> {
        self.request(Command::Next).await
    }

    pub async fn prev(&self) -> Result<(), PlayerError> {
        self.request(Command::Prev).await
    }

    pub async fn seek(&self, secs: f64) -> Result<(), PlayerError> {
        self.request(|reply| Command::Seek { secs, reply }).await
    }

    /// Adds locations to the priority queue; returns the queue length.
    pub async fn enqueue(&self, uris: Vec<String>) -> Result<usize, PlayerError> {
        self.request(|reply| Command::Enqueue { uris, reply }).await
    }

    pub async fn query(&self, text: &str) -> Result<Vec<TrackRow>, PlayerError> {
        let text = text.to_string();
        self.request(|reply| Command::Query { text, reply }).await
    }

    pub async fn status(&self) -> Result<StatusReport, PlayerError> {
        self.request(Command::Status).await
    }

    /// Starts a scan of every library. Returns once the scan is started or
    /// queued behind a running one.
    pub async fn scan(&self, force: bool) -> Result<(), PlayerError> {
        self.request(|reply| Command::Scan {
            roots: None,
            force,
            reply: Some(reply),
        })
        .await
    }

    /// Queues an incremental scan of some roots without waiting.
    pub async fn request_scan(&self, roots: Vec<String>) -> Result<(), PlayerError> {
        self.commands
            .send(Command::Scan {
                roots: Some(roots),
                force: false,
                reply: None,
            })
            .await
            .map_err(|_| PlayerError::NotRunning)
    }

    /// Replaces the active playlist; returns its length.
    pub async fn set_playlist(&self, playlist: Playlist) -> Result<usize, PlayerError> {
        self.request(|reply| Command::SetPlaylist { playlist, reply })
            .await
    }

    pub async fn load_playlist(&self, path: PathBuf) -> Result<usize, PlayerError> {
        let file = tokio::task::spawn_blocking(move || read_playlist(&path))
            .await
            .map_err(|err| PlayerError::Io(std::io::Error::other(err)))??;
        self.set_playlist(file.into_playlist()).await
    }

    pub async fn set_shuffle(&self, mode: ShuffleMode) -> Result<(), PlayerError> {
        self.request(|reply| Command::SetShuffle { mode, reply }).await
    }

    pub async fn set_repeat(&self, mode: RepeatMode) -> Result<(), PlayerError> {
        self.request(|reply| Command::SetRepeat { mode, reply }).await
    }

    pub async fn set_dynamic(&self, enabled: bool) -> Result<(), PlayerError> {
        self.request(|reply| Command::SetDynamic { enabled, reply })
            .await
    }

    pub async fn set_stop_after_current(&self, enabled: bool) -> Result<(), PlayerError> {
        self.request(|reply| Command::SetStopAfterCurrent { enabled, reply })
            .await
    }

    /// Asks the engine to save and exit, waiting until it has.
    pub async fn shutdown(&self) -> Result<(), PlayerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(tx))
            .await
            .map_err(|_| PlayerError::NotRunning)?;
        rx.await.map_err(|_| PlayerError::NotRunning)
    }
}

struct RunningScan {
    cancel: CancellationToken,
    progress: ScanProgress,
}

pub struct EngineService {
    db: TrackDb,
    engine: PlaybackEngine,
    scanner: Arc<Scanner>,
    extender: Arc<dyn DynamicExtender>,
    catalog: Option<Arc<RwLock<Vec<Arc<Track>>>>>,
    options: ServiceOptions,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<EngineEvent>,
    pipeline_events: mpsc::UnboundedReceiver<PipelineEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    cancel: CancellationToken,
    scan: Option<RunningScan>,
    pending_scan: Option<(Vec<String>, bool)>,
    save_at: Option<Instant>,
    saving: bool,
    shutdown_ack: Option<oneshot::Sender<()>>,
}

impl EngineService {
    pub fn new(
        db: TrackDb,
        engine: PlaybackEngine,
        pipeline_events: mpsc::UnboundedReceiver<PipelineEvent>,
        scanner: Arc<Scanner>,
        extender: Arc<dyn DynamicExtender>,
        options: ServiceOptions,
    ) -> (Self, EngineHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let handle = EngineHandle {
            commands: command_tx,
            events: events.clone(),
        };
        let service = Self {
            db,
            engine,
            scanner,
            extender,
            catalog: None,
            options,
            commands,
            events,
            pipeline_events,
            internal_tx,
            internal_rx,
            cancel: CancellationToken::new(),
            scan: None,
            pending_scan: None,
            save_at: None,
            saving: false,
            shutdown_ack: None,
        };
        (service, handle)
    }

    /// Keeps `catalog` in step with the database after every scan, for
    /// extenders that search the local library.
    pub fn with_catalog(mut self, catalog: Arc<RwLock<Vec<Arc<Track>>>>) -> Self {
        *catalog.write() = self.db.snapshot();
        self.catalog = Some(catalog);
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(mut self) -> Result<(), PlayerError> {
        let mut tick = tokio::time::interval(self.options.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Engine started with {} tracks", self.db.len());

        loop {
            let save_at = self.save_at;
            let running = tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => false,
                },
                Some(message) = self.internal_rx.recv() => {
                    self.handle_internal(message);
                    true
                }
                Some(event) = self.pipeline_events.recv() => {
                    // Commands issued before the event was seen take effect first.
                    let mut running = true;
                    while let Ok(command) = self.commands.try_recv() {
                        running = self.handle_command(command);
                        if !running {
                            break;
                        }
                    }
                    if running {
                        let advance = self.engine.handle_event(&mut self.db, event);
                        self.follow(advance);
                    }
                    running
                }
                _ = wait_until(save_at) => {
                    self.start_save();
                    true
                }
                _ = tick.tick() => {
                    self.engine.tick(&mut self.db);
                    true
                }
            };
            if !running {
                break;
            }
            self.schedule_save();
        }

        let result = self.shutdown().await;
        if let Some(ack) = self.shutdown_ack.take() {
            let _ = ack.send(());
        }
        result
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Play { index, reply } => {
                let result = self.engine.play(&mut self.db, index).map(|advance| self.follow(advance));
                let _ = reply.send(result);
            }
            Command::Pause(reply) => {
                self.engine.pause();
                let _ = reply.send(Ok(()));
            }
            Command::TogglePause(reply) => {
                let result = self
                    .engine
                    .toggle_pause(&mut self.db)
                    .map(|advance| self.follow(advance));
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                let advance = self.engine.stop(&mut self.db);
                self.follow(advance);
                let _ = reply.send(Ok(()));
            }
            Command::Next(reply) => {
                let advance = self.engine.next(&mut self.db);
                self.follow(advance);
                let _ = reply.send(Ok(()));
            }
            Command::Prev(reply) => {
                let advance = self.engine.prev(&mut self.db);
                self.follow(advance);
                let _ = reply.send(Ok(()));
            }
            Command::Seek { secs, reply } => {
                let _ = reply.send(self.engine.seek(secs));
            }
            Command::Enqueue { uris, reply } => {
                let _ = reply.send(self.enqueue(uris));
            }
            Command::Query { text, reply } => self.query(text, reply),
            Command::Status(reply) => {
                let _ = reply.send(Ok(self.status()));
            }
            Command::Scan {
                roots,
                force,
                reply,
            } => {
                self.start_scan(roots, force);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            Command::SetPlaylist { playlist, reply } => {
                let len = playlist.len();
                self.engine.load_playlist(playlist);
                let _ = reply.send(Ok(len));
            }
            Command::SetShuffle { mode, reply } => {
                info!("Shuffle {}", mode);
                self.engine.set_shuffle(mode);
                let _ = reply.send(Ok(()));
            }
            Command::SetRepeat { mode, reply } => {
                info!("Repeat {}", mode);
                self.engine.set_repeat(mode);
                let _ = reply.send(Ok(()));
            }
            Command::SetDynamic { enabled, reply } => {
                info!("Dynamic extension {}", if enabled { "on" } else { "off" });
                self.engine.set_dynamic(enabled);
                let _ = reply.send(Ok(()));
            }
            Command::SetStopAfterCurrent { enabled, reply } => {
                self.engine.set_stop_after_current(enabled);
                let _ = reply.send(Ok(()));
            }
            Command::Shutdown(ack) => {
                self.shutdown_ack = Some(ack);
                return false;
            }
        }
        true
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::ScanChange(change) => {
                if let Err(err) = self.db.apply(change) {
                    warn!("Dropping scan result: {}", err);
                }
            }
            Internal::ScanProgress(progress) => {
                if let Some(scan) = self.scan.as_mut() {
                    scan.progress = progress.clone();
                }
                self.publish(EngineEvent::ScanProgress(progress));
            }
            Internal::ScanFinished(summary) => {
                self.scan = None;
                if let Some(catalog) = &self.catalog {
                    *catalog.write() = self.db.snapshot();
                }
                self.publish(EngineEvent::ScanFinished(summary));
                if let Some((roots, force)) = self.pending_scan.take() {
                    self.start_scan(Some(roots), force);
                }
            }
            Internal::SaveFinished { revision, result } => {
                self.saving = false;
                match result {
                    Ok(()) => self.db.finish_save(revision),
                    Err(err) => error!("Failed to save track database: {}", err),
                }
            }
            Internal::Dynamic { ticket, uris } => {
                let advance = self.engine.complete_dynamic(&mut self.db, ticket, uris);
                self.follow(advance);
            }
        }
    }

    fn follow(&mut self, advance: Advance) {
        match advance {
            Advance::Started(uri) => self.publish(EngineEvent::TrackStarted { uri }),
            Advance::Stopped => self.publish(EngineEvent::Stopped),
            Advance::NeedsDynamic(request) => {
                self.publish(EngineEvent::Stopped);
                self.request_dynamic(request);
            }
            Advance::Unchanged => {}
        }
    }

    fn publish(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn enqueue(&mut self, uris: Vec<String>) -> Result<usize, PlayerError> {
        let normalized = uris
            .iter()
            .map(|location| uri::normalize(location).map_err(LibraryError::from))
            .collect::<Result<Vec<_>, _>>()?;
        for uri in normalized {
            self.engine.enqueue(uri);
        }
        Ok(self.engine.queue().count())
    }

    fn query(&mut self, text: String, reply: Reply<Vec<TrackRow>>) {
        let query = match Query::compile(&text, &self.options.query) {
            Ok(query) => query,
            Err(err) => {
                debug!("Rejected query {:?}: {}", text, err);
                let _ = reply.send(Err(err.into()));
                return;
            }
        };
        let candidates = self.db.candidates(&query);
        let sort = self.options.sort.clone();
        tokio::task::spawn_blocking(move || {
            let mut hits = search_tracks(&candidates, &query);
            sort_tracks(&mut hits, RESULT_SORT, &sort);
            let rows = hits.into_iter().map(TrackRow::from_hit).collect();
            let _ = reply.send(Ok(rows));
        });
    }

    fn status(&self) -> StatusReport {
        let current = self.engine.current().map(|uri| uri.to_string());
        let track = current.as_deref().and_then(|uri| self.db.get(uri));
        let playlist = self.engine.playlist();
        StatusReport {
            state: self.engine.state(),
            title: track.map(|track| track.display_name()),
            length: track.and_then(|track| track.length()),
            current,
            position: self.engine.position(),
            playlist: playlist.name().to_string(),
            playlist_len: playlist.len(),
            playlist_position: playlist.position(),
            queued: self.engine.queue().count(),
            shuffle: self.engine.shuffle(),
            repeat: self.engine.repeat(),
            dynamic: self.engine.dynamic(),
            stop_after_current: self.engine.stop_after_current(),
            tracks: self.db.len(),
            scanning: self.scan.as_ref().map(|scan| scan.progress.clone()),
        }
    }

    fn start_scan(&mut self, roots: Option<Vec<String>>, force: bool) {
        let roots = roots.unwrap_or_else(|| {
            self.db
                .libraries()
                .iter()
                .map(|record| record.location.clone())
                .collect()
        });
        if self.scan.is_some() {
            let (mut queued, queued_force) = self.pending_scan.take().unwrap_or_default();
            for root in roots {
                if !queued.contains(&root) {
                    queued.push(root);
                }
            }
            debug!("Scan running; {} roots queued", queued.len());
            self.pending_scan = Some((queued, queued_force || force));
            return;
        }
        if roots.is_empty() {
            info!("No libraries configured; nothing to scan");
            return;
        }

        let mut known = KnownTracks::new();
        for root in &roots {
            if let Some(prefix) = root_prefix(root) {
                known.extend(self.db.known_tracks(&prefix));
            }
        }
        let cancel = self.cancel.child_token();
        self.scan = Some(RunningScan {
            cancel: cancel.clone(),
            progress: ScanProgress::default(),
        });
        info!("Scanning {} libraries (force={})", roots.len(), force);

        let scanner = Arc::clone(&self.scanner);
        let tx = self.internal_tx.clone();
        tokio::task::spawn_blocking(move || {
            let mut sink = ChannelSink { tx: tx.clone() };
            let summary = scanner.scan(&roots, &known, force, &cancel, &mut sink);
            let _ = tx.send(Internal::ScanFinished(summary));
        });
    }

    fn request_dynamic(&self, request: DynamicRequest) {
        let extender = Arc::clone(&self.extender);
        let tx = self.internal_tx.clone();
        let deadline = self.options.dynamic_timeout;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let DynamicRequest {
                ticket,
                seeds,
                count,
            } = request;
            let lookup = tokio::task::spawn_blocking(move || extender.similar(&seeds, count));
            let uris = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio::time::timeout(deadline, lookup) => match result {
                    Ok(Ok(uris)) => uris,
                    Ok(Err(err)) => {
                        warn!("Dynamic lookup failed: {}", err);
                        None
                    }
                    Err(_) => {
                        warn!("Dynamic lookup timed out after {:?}", deadline);
                        None
                    }
                },
            };
            let _ = tx.send(Internal::Dynamic { ticket, uris });
        });
    }

    fn schedule_save(&mut self) {
        if self.save_at.is_none() && !self.saving && self.db.is_dirty() && self.db.store().is_some() {
            self.save_at = Some(Instant::now() + self.options.save_debounce);
        }
    }

    /// Commits the pending changes on a worker. Changes made meanwhile are
    /// picked up by the next save.
    fn start_save(&mut self) {
        self.save_at = None;
        if self.saving {
            return;
        }
        let Some(store) = self.db.store() else {
            return;
        };
        let batch = self.db.prepare_save();
        let revision = batch.revision();
        self.saving = true;
        let tx = self.internal_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = store.commit(&batch);
            if result.is_ok() {
                debug!("Committed {} track writes", batch.track_writes());
            }
            let _ = tx.send(Internal::SaveFinished { revision, result });
        });
    }

    async fn shutdown(&mut self) -> Result<(), PlayerError> {
        info!("Engine shutting down");
        self.cancel.cancel();
        self.pending_scan = None;
        if let Some(scan) = self.scan.as_ref() {
            scan.cancel.cancel();
        }
        while self.saving || self.scan.is_some() {
            match self.internal_rx.recv().await {
                Some(message) => self.handle_internal(message),
                None => break,
            }
        }

        if let Some(path) = self.options.session_path.clone() {
            if let Err(err) = save_session(&path, &self.engine.session()) {
                warn!("Failed to save session to {:?}: {}", path, err);
            }
        }
        self.engine.stop(&mut self.db);
        self.final_save().await?;
        info!("Engine stopped");
        Ok(())
    }

    async fn final_save(&mut self) -> Result<(), PlayerError> {
        let Some(store) = self.db.store() else {
            return Ok(());
        };
        if !self.db.is_dirty() {
            return Ok(());
        }
        let batch = self.db.prepare_save();
        let revision = batch.revision();
        let writes = tokio::task::spawn_blocking(move || {
            store.commit(&batch).map(|()| batch.track_writes())
        })
        .await
        .map_err(|err| PlayerError::Io(std::io::Error::other(err)))??;
        self.db.finish_save(revision);
        debug!("Committed {} track writes before exit", writes);
        Ok(())
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
