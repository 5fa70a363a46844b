//! Library scanner: walks scan roots and reconciles them against the
//! known tracks.
//!
//! The scanner never touches the database itself. It reads a snapshot of
//! `(uri, __modified)` pairs and emits [`ScanChange`]s through a
//! [`ScanSink`], so it can run on a worker while the owner of the database
//! applies changes in order.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::tags::{format_number, LOC, MODIFIED};
use common::{unix_secs, uri, TagMap};
use metadata::TagReader;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::db::{KnownTracks, TrackDb};
use crate::LibraryError;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// A candidate update produced by a scan worker.
#[derive(Clone, Debug, PartialEq)]
pub enum ScanChange {
    Add(TagMap),
    /// Fresh file tags for a known track; user-owned tags are kept.
    Update(TagMap),
    Remove(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub files_seen: u64,
    pub files_added: u64,
    pub files_updated: u64,
    pub files_removed: u64,
    pub current_path: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    #[default]
    Completed,
    Cancelled,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub status: ScanStatus,
    pub progress: ScanProgress,
    /// Tag read failures, skipped.
    pub failed: u64,
    /// Audio, or files of unknown type, the tag reader cannot handle.
    pub unsupported: u64,
    /// Images, text and other non-audio files, never offered to the reader.
    pub ignored: u64,
    /// Roots whose enumeration hit errors; removals were suppressed there
    /// unless the scan was forced.
    pub incomplete_roots: Vec<String>,
}

/// Receives scan output in order.
pub trait ScanSink {
    fn change(&mut self, change: ScanChange);

    fn progress(&mut self, _progress: &ScanProgress) {}
}

pub struct Scanner {
    reader: Arc<dyn TagReader>,
}

impl Scanner {
    pub fn new(reader: Arc<dyn TagReader>) -> Self {
        Self { reader }
    }

    /// Scans every root (directory URIs or paths) against `known`.
    ///
    /// With `force`, every supported file is re-read regardless of its
    /// mtime and missing files are removed even when enumeration hit
    /// errors. Cancellation is observed between files; removals are skipped
    /// once cancelled.
    pub fn scan(
        &self,
        roots: &[String],
        known: &KnownTracks,
        force: bool,
        cancel: &CancellationToken,
        sink: &mut dyn ScanSink,
    ) -> ScanSummary {
        let mut run = ScanRun {
            reader: self.reader.as_ref(),
            known,
            force,
            cancel,
            sink,
            summary: ScanSummary::default(),
            last_progress: None,
        };
        for root in roots {
            if cancel.is_cancelled() {
                break;
            }
            run.scan_root(root);
        }
        if cancel.is_cancelled() {
            run.summary.status = ScanStatus::Cancelled;
        }
        run.summary.progress.current_path = None;
        run.sink.progress(&run.summary.progress);
        info!(
            "Scan {:?}: {} seen, {} added, {} updated, {} removed, {} failed",
            run.summary.status,
            run.summary.progress.files_seen,
            run.summary.progress.files_added,
            run.summary.progress.files_updated,
            run.summary.progress.files_removed,
            run.summary.failed
        );
        run.summary
    }

    /// Scans the database's own library records and applies the result.
    pub fn scan_db(
        &self,
        db: &mut TrackDb,
        force: bool,
        cancel: &CancellationToken,
        on_progress: &mut dyn FnMut(&ScanProgress),
    ) -> Result<ScanSummary, LibraryError> {
        let roots: Vec<String> = db
            .libraries()
            .iter()
            .map(|record| record.location.clone())
            .collect();
        self.scan_roots_into(db, &roots, force, cancel, on_progress)
    }

    pub fn scan_roots_into(
        &self,
        db: &mut TrackDb,
        roots: &[String],
        force: bool,
        cancel: &CancellationToken,
        on_progress: &mut dyn FnMut(&ScanProgress),
    ) -> Result<ScanSummary, LibraryError> {
        let mut known = KnownTracks::new();
        for root in roots {
            if let Some(prefix) = root_prefix(root) {
                known.extend(db.known_tracks(&prefix));
            }
        }
        let mut sink = DbSink {
            db,
            on_progress,
            error: None,
        };
        let summary = self.scan(roots, &known, force, cancel, &mut sink);
        match sink.error {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}

struct DbSink<'a> {
    db: &'a mut TrackDb,
    on_progress: &'a mut dyn FnMut(&ScanProgress),
    error: Option<LibraryError>,
}

impl ScanSink for DbSink<'_> {
    fn change(&mut self, change: ScanChange) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = self.db.apply(change) {
            self.error = Some(err);
        }
    }

    fn progress(&mut self, progress: &ScanProgress) {
        (self.on_progress)(progress);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileClass {
    Track,
    Unsupported,
    Ignored,
}

fn classify(reader: &dyn TagReader, path: &Path) -> FileClass {
    let mime = mime_guess::from_path(path).first();
    let non_audio = mime.as_ref().is_some_and(|mime| {
        let kind = mime.type_();
        kind == mime_guess::mime::IMAGE
            || kind == mime_guess::mime::TEXT
            || mime.subtype() == mime_guess::mime::PDF
    });
    if non_audio {
        FileClass::Ignored
    } else if reader.understands(path) {
        FileClass::Track
    } else {
        FileClass::Unsupported
    }
}

struct ScanRun<'a> {
    reader: &'a dyn TagReader,
    known: &'a KnownTracks,
    force: bool,
    cancel: &'a CancellationToken,
    sink: &'a mut dyn ScanSink,
    summary: ScanSummary,
    last_progress: Option<Instant>,
}

impl ScanRun<'_> {
    fn scan_root(&mut self, root: &str) {
        let Some(path) = root_path(root) else {
            warn!("Skipping scan root {:?}: not a local directory", root);
            return;
        };
        let Some(prefix) = root_prefix(root) else {
            warn!("Skipping scan root {:?}: cannot form a location prefix", root);
            return;
        };
        info!("Scanning {:?}", path);

        let mut seen: HashSet<String> = HashSet::new();
        let mut visited: HashSet<PathBuf> = HashSet::new();
        visited.insert(canonical(&path));
        let mut pending = vec![path.clone()];
        let mut complete = true;

        while let Some(dir) = pending.pop() {
            let mut walker = WalkDir::new(&dir).follow_links(false).into_iter();
            while let Some(entry) = walker.next() {
                if self.cancel.is_cancelled() {
                    return;
                }
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!("Cannot read {:?}: {}", err.path().unwrap_or(dir.as_path()), err);
                        complete = false;
                        continue;
                    }
                };
                // Walk roots were marked visited when queued.
                if entry.depth() == 0 {
                    continue;
                }
                let file_type = entry.file_type();
                if file_type.is_dir() {
                    if !visited.insert(canonical(entry.path())) {
                        walker.skip_current_dir();
                    }
                    continue;
                }
                if file_type.is_symlink() {
                    match fs::metadata(entry.path()) {
                        Ok(meta) if meta.is_dir() => {
                            if visited.insert(canonical(entry.path())) {
                                pending.push(entry.path().to_path_buf());
                            } else {
                                debug!("Not following {:?} again", entry.path());
                            }
                            continue;
                        }
                        Ok(meta) if meta.is_file() => {}
                        Ok(_) => continue,
                        Err(err) => {
                            warn!("Broken link {:?}: {}", entry.path(), err);
                            continue;
                        }
                    }
                } else if !file_type.is_file() {
                    continue;
                }
                self.scan_file(entry.path(), &mut seen);
            }
        }

        if self.cancel.is_cancelled() {
            return;
        }
        if !complete {
            self.summary.incomplete_roots.push(root.to_string());
            if !self.force {
                warn!(
                    "Enumeration of {:?} was incomplete; not removing missing tracks",
                    path
                );
                return;
            }
        }
        let known = self.known;
        let mut missing: Vec<&String> = known
            .keys()
            .filter(|loc| uri::is_under(loc, &prefix) && !seen.contains(*loc))
            .collect();
        missing.sort();
        for loc in missing {
            self.summary.progress.files_removed += 1;
            self.sink.change(ScanChange::Remove(loc.clone()));
        }
    }

    fn scan_file(&mut self, path: &Path, seen: &mut HashSet<String>) {
        self.summary.progress.files_seen += 1;
        self.report(path);
        match classify(self.reader, path) {
            FileClass::Track => {}
            FileClass::Unsupported => {
                debug!("Unsupported format {:?}", path);
                self.summary.unsupported += 1;
                return;
            }
            FileClass::Ignored => {
                self.summary.ignored += 1;
                return;
            }
        }
        let loc = match uri::from_path(path) {
            Ok(loc) => loc,
            Err(err) => {
                warn!("Skipping {:?}: {}", path, err);
                return;
            }
        };
        seen.insert(loc.clone());

        let mtime = match fs::metadata(path).and_then(|meta| meta.modified()) {
            Ok(modified) => unix_secs(modified),
            Err(err) => {
                warn!("Cannot stat {:?}: {}", path, err);
                return;
            }
        };
        let known = self.known;
        let existing = known.get(&loc);
        if let Some(modified) = existing {
            let stale = modified.map_or(true, |modified| mtime > modified);
            if !stale && !self.force {
                return;
            }
        }

        let mut tags = match self.reader.read(path) {
            Ok(read) => read.tags,
            Err(err) => {
                warn!("Failed to read tags for {:?}: {}", path, err);
                self.summary.failed += 1;
                return;
            }
        };
        tags.set_one(LOC, loc);
        tags.set_one(MODIFIED, format_number(mtime));
        if existing.is_some() {
            self.summary.progress.files_updated += 1;
            self.sink.change(ScanChange::Update(tags));
        } else {
            self.summary.progress.files_added += 1;
            self.sink.change(ScanChange::Add(tags));
        }
    }

    fn report(&mut self, path: &Path) {
        let now = Instant::now();
        if self
            .last_progress
            .is_some_and(|last| now.duration_since(last) < PROGRESS_INTERVAL)
        {
            return;
        }
        self.last_progress = Some(now);
        self.summary.progress.current_path = Some(path.display().to_string());
        self.sink.progress(&self.summary.progress);
    }
}

/// Directory URI (trailing slash) covering everything under `root`.
pub fn root_prefix(root: &str) -> Option<String> {
    root_path(root).and_then(|path| uri::dir_prefix(&path).ok())
}

fn root_path(root: &str) -> Option<PathBuf> {
    if uri::has_scheme(root) {
        uri::to_path(root)
    } else {
        Some(PathBuf::from(root))
    }
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::tags::PLAYCOUNT;
    use metadata::{ReadTags, TagError};
    use common::Track;
    use std::time::SystemTime;

    /// Reads `key=value` lines from `.trk` files.
    struct FakeReader;

    impl TagReader for FakeReader {
        fn understands(&self, path: &Path) -> bool {
            metadata::has_supported_extension(path, &["trk"])
        }

        fn read(&self, path: &Path) -> Result<ReadTags, TagError> {
            let text = fs::read_to_string(path)?;
            if text.starts_with("corrupt") {
                return Err(TagError::Unsupported("corrupt".to_string()));
            }
            let tags: TagMap = text
                .lines()
                .filter_map(|line| line.split_once('='))
                .collect();
            let display_name = tags.first("title").unwrap_or("?").to_string();
            Ok(ReadTags { tags, display_name })
        }
    }

    #[derive(Default)]
    struct Recorder {
        changes: Vec<ScanChange>,
        progress: Vec<ScanProgress>,
    }

    impl ScanSink for Recorder {
        fn change(&mut self, change: ScanChange) {
            self.changes.push(change);
        }

        fn progress(&mut self, progress: &ScanProgress) {
            self.progress.push(progress.clone());
        }
    }

    fn scanner() -> Scanner {
        Scanner::new(Arc::new(FakeReader))
    }

    fn root(dir: &Path) -> Vec<String> {
        vec![uri::from_path(dir).unwrap()]
    }

    fn scan(db: &mut TrackDb, dir: &Path, force: bool) -> ScanSummary {
        scanner()
            .scan_roots_into(db, &root(dir), force, &CancellationToken::new(), &mut |_| {})
            .unwrap()
    }

    fn set_mtime(path: &Path, secs: u64) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn scan_adds_and_query_finds() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hey.trk"), "title=Hey\nartist=A\n").unwrap();
        fs::write(dir.path().join("hoy.TRK"), "title=Hoy\nartist=B\n").unwrap();
        fs::write(dir.path().join("cover.jpg"), "jpeg").unwrap();

        let mut db = TrackDb::in_memory("test");
        let summary = scan(&mut db, dir.path(), false);
        assert_eq!(db.len(), 2);
        assert_eq!(summary.progress.files_added, 2);
        assert_eq!(summary.unsupported, 0);
        assert_eq!(summary.ignored, 1);
        assert_eq!(summary.status, ScanStatus::Completed);

        let options = crate::QueryOptions::default();
        let t1 = db.get(&uri::from_path(&dir.path().join("hey.trk")).unwrap()).unwrap().clone();
        let t2 = db.get(&uri::from_path(&dir.path().join("hoy.TRK")).unwrap()).unwrap().clone();
        let by_artist = crate::Query::compile("artist=A", &options).unwrap();
        assert!(by_artist.matches(&t1));
        assert!(!by_artist.matches(&t2));
        assert!(crate::Query::compile("he", &options).unwrap().matches(&t1));
    }

    #[test]
    fn second_scan_without_changes_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.trk"), "title=A\n").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.trk"), "title=B\n").unwrap();

        let mut db = TrackDb::in_memory("test");
        scan(&mut db, dir.path(), false);
        let known = db.known_tracks(&root_prefix(&root(dir.path())[0]).unwrap());
        let mut recorder = Recorder::default();
        let summary = scanner().scan(
            &root(dir.path()),
            &known,
            false,
            &CancellationToken::new(),
            &mut recorder,
        );
        assert!(recorder.changes.is_empty());
        assert_eq!(summary.progress.files_seen, 2);
        assert_eq!(summary.progress.files_added, 0);
        assert_eq!(summary.progress.files_updated, 0);
        assert_eq!(summary.progress.files_removed, 0);
    }

    #[test]
    fn modified_files_refresh_but_keep_user_tags() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.trk");
        fs::write(&file, "title=Old\n").unwrap();
        set_mtime(&file, 1_000_000);

        let mut db = TrackDb::in_memory("test");
        scan(&mut db, dir.path(), false);
        let loc = uri::from_path(&file).unwrap();
        db.modify(&loc, |t| t.set_number(PLAYCOUNT, 7.0));

        fs::write(&file, "title=New\n").unwrap();
        set_mtime(&file, 2_000_000);
        let summary = scan(&mut db, dir.path(), false);
        assert_eq!(summary.progress.files_updated, 1);
        let track = db.get(&loc).unwrap();
        assert_eq!(track.title(), Some("New"));
        assert_eq!(track.playcount(), 7);
        assert_eq!(track.modified(), Some(2_000_000.0));
    }

    #[test]
    fn deleted_files_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.trk"), "title=A\n").unwrap();
        fs::write(dir.path().join("b.trk"), "title=B\n").unwrap();
        let mut db = TrackDb::in_memory("test");
        // A track outside the root must survive.
        db.put(Track::new("file:///elsewhere/x.trk").unwrap()).unwrap();
        scan(&mut db, dir.path(), false);
        assert_eq!(db.len(), 3);

        fs::remove_file(dir.path().join("b.trk")).unwrap();
        let summary = scan(&mut db, dir.path(), false);
        assert_eq!(summary.progress.files_removed, 1);
        assert_eq!(db.len(), 2);
        assert!(db.contains("file:///elsewhere/x.trk"));
    }

    #[test]
    fn tag_read_failures_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("good.trk"), "title=Fine\n").unwrap();
        fs::write(dir.path().join("bad.trk"), "corrupt").unwrap();
        let mut db = TrackDb::in_memory("test");
        let summary = scan(&mut db, dir.path(), false);
        assert_eq!(db.len(), 1);
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn files_are_sorted_by_media_type() {
        let reader = FakeReader;
        for name in ["cover.jpg", "folder.PNG", "notes.txt", "booklet.pdf"] {
            assert_eq!(classify(&reader, Path::new(name)), FileClass::Ignored, "{name}");
        }
        assert_eq!(classify(&reader, Path::new("a.trk")), FileClass::Track);
        assert_eq!(classify(&reader, Path::new("take.wav")), FileClass::Unsupported);
        assert_eq!(classify(&reader, Path::new("README")), FileClass::Unsupported);

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.trk"), "title=A\n").unwrap();
        fs::write(dir.path().join("take.flac"), "fLaC").unwrap();
        fs::write(dir.path().join("cover.jpg"), "jpeg").unwrap();
        fs::write(dir.path().join("notes.txt"), "liner notes").unwrap();
        let mut db = TrackDb::in_memory("test");
        let summary = scan(&mut db, dir.path(), false);
        assert_eq!(db.len(), 1);
        assert_eq!(summary.progress.files_seen, 4);
        assert_eq!(summary.unsupported, 1);
        assert_eq!(summary.ignored, 2);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_directories_hold_back_removals_unless_forced() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(dir.path().join("a.trk"), "title=A\n").unwrap();
        fs::write(locked.join("b.trk"), "title=B\n").unwrap();
        let mut db = TrackDb::in_memory("test");
        scan(&mut db, dir.path(), false);
        assert_eq!(db.len(), 2);

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read_dir(&locked).is_ok() {
            // Permission bits do not bind this user (root).
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }
        let hidden = uri::from_path(&locked.join("b.trk")).unwrap();
        let unforced = scan(&mut db, dir.path(), false);
        let kept = db.contains(&hidden);
        let forced = scan(&mut db, dir.path(), true);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(unforced.incomplete_roots, root(dir.path()));
        assert_eq!(unforced.progress.files_removed, 0);
        assert!(kept);
        assert_eq!(forced.incomplete_roots, root(dir.path()));
        assert_eq!(forced.progress.files_removed, 1);
        assert!(!db.contains(&hidden));
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn forced_scan_rereads_everything() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.trk"), "title=A\n").unwrap();
        let mut db = TrackDb::in_memory("test");
        scan(&mut db, dir.path(), false);
        let summary = scan(&mut db, dir.path(), true);
        assert_eq!(summary.progress.files_updated, 1);
    }

    #[test]
    fn cancelled_scan_reports_status_and_skips_removal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.trk"), "title=A\n").unwrap();
        let mut known = KnownTracks::new();
        known.insert(
            format!("{}gone.trk", root_prefix(&root(dir.path())[0]).unwrap()),
            Some(1.0),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut recorder = Recorder::default();
        let summary = scanner().scan(&root(dir.path()), &known, false, &cancel, &mut recorder);
        assert_eq!(summary.status, ScanStatus::Cancelled);
        assert!(recorder.changes.is_empty());
        // The final progress report is always delivered.
        assert!(!recorder.progress.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directories_are_followed_once() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        let outside = dir.path().join("outside");
        fs::create_dir_all(music.join("sub")).unwrap();
        fs::create_dir_all(&outside).unwrap();
        fs::write(music.join("sub/a.trk"), "title=A\n").unwrap();
        fs::write(outside.join("b.trk"), "title=B\n").unwrap();
        std::os::unix::fs::symlink(&outside, music.join("linked")).unwrap();
        // A cycle back to the root.
        std::os::unix::fs::symlink(&music, music.join("sub/loop")).unwrap();

        let mut db = TrackDb::in_memory("test");
        let summary = scan(&mut db, &music, false);
        assert_eq!(db.len(), 2);
        assert_eq!(summary.progress.files_seen, 2);
        assert!(db.contains(&uri::from_path(&music.join("linked/b.trk")).unwrap()));
    }

    #[test]
    fn progress_is_rate_limited_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        for n in 0..50 {
            fs::write(dir.path().join(format!("{n}.trk")), format!("title=T{n}\n")).unwrap();
        }
        let mut recorder = Recorder::default();
        scanner().scan(
            &root(dir.path()),
            &KnownTracks::new(),
            false,
            &CancellationToken::new(),
            &mut recorder,
        );
        assert!(recorder.progress.len() < 50);
        let seen: Vec<u64> = recorder.progress.iter().map(|p| p.files_seen).collect();
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(seen.last(), Some(&50));
        assert_eq!(recorder.changes.len(), 50);
    }
}
