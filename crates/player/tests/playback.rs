use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{uri, Track};
use library::{Playlist, Scanner, TrackDb};
use metadata::LoftyTagReader;
use parking_lot::RwLock;
use player::{
    ClockPipeline, EngineEvent, EngineHandle, EngineService, LocalExtender, PlayState,
    PlaybackEngine, ServiceOptions, SystemClock,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::broadcast;

fn audio_file(dir: &Path, name: &str, length: f64) -> Track {
    let path = dir.join(name);
    fs::write(&path, b"not really audio").unwrap();
    let mut track = Track::new(uri::from_path(&path).unwrap()).unwrap();
    track.set_number("__length", length);
    track.set_tag("title", [name]).unwrap();
    track
}

fn spawn(db: TrackDb) -> EngineHandle {
    let (pipeline_tx, pipeline_rx) = tokio::sync::mpsc::unbounded_channel();
    let engine = PlaybackEngine::new(
        Box::new(ClockPipeline::new(pipeline_tx)),
        Arc::new(SystemClock::default()),
        Default::default(),
        StdRng::seed_from_u64(3),
    );
    let catalog = Arc::new(RwLock::new(Vec::new()));
    let (service, handle) = EngineService::new(
        db,
        engine,
        pipeline_rx,
        Arc::new(Scanner::new(Arc::new(LoftyTagReader))),
        Arc::new(LocalExtender::new(Arc::clone(&catalog))),
        ServiceOptions::default(),
    );
    tokio::spawn(service.with_catalog(catalog).run());
    handle
}

async fn next_event(events: &mut broadcast::Receiver<EngineEvent>) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn playlist_plays_through_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let first = audio_file(dir.path(), "first.mp3", 0.05);
    let second = audio_file(dir.path(), "second.mp3", 0.05);
    let uris = vec![first.loc().to_string(), second.loc().to_string()];
    let mut db = TrackDb::in_memory("it");
    db.put(first).unwrap();
    db.put(second).unwrap();

    let handle = spawn(db);
    let mut events = handle.subscribe();
    handle
        .set_playlist(Playlist::with_uris("both", uris.clone()))
        .await
        .unwrap();
    handle.play(None).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        EngineEvent::TrackStarted { uri: uris[0].clone() }
    );
    assert_eq!(
        next_event(&mut events).await,
        EngineEvent::TrackStarted { uri: uris[1].clone() }
    );
    assert_eq!(next_event(&mut events).await, EngineEvent::Stopped);

    let status = handle.status().await.unwrap();
    assert_eq!(status.state, PlayState::Stopped);
    assert_eq!(status.current, None);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_files_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let present = audio_file(dir.path(), "present.mp3", 30.0);
    let gone = audio_file(dir.path(), "gone.mp3", 30.0);
    fs::remove_file(dir.path().join("gone.mp3")).unwrap();
    let uris = vec![gone.loc().to_string(), present.loc().to_string()];
    let mut db = TrackDb::in_memory("it");
    db.put(present).unwrap();
    db.put(gone).unwrap();

    let handle = spawn(db);
    handle
        .set_playlist(Playlist::with_uris("p", uris.clone()))
        .await
        .unwrap();
    handle.play(Some(0)).await.unwrap();

    let status = handle.status().await.unwrap();
    assert_eq!(status.state, PlayState::Playing);
    assert_eq!(status.current.as_deref(), Some(uris[1].as_str()));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn playlist_files_load_into_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let one = audio_file(dir.path(), "one.mp3", 30.0);
    let mut db = TrackDb::in_memory("it");
    db.put(one).unwrap();
    let list = dir.path().join("evening.m3u");
    fs::write(&list, "#EXTM3U\n#EXTINF:30,One\none.mp3\nhttp://radio.example/stream\n").unwrap();

    let handle = spawn(db);
    assert_eq!(handle.load_playlist(list).await.unwrap(), 2);
    let status = handle.status().await.unwrap();
    assert_eq!(status.playlist, "evening");
    assert_eq!(status.playlist_len, 2);

    assert!(handle
        .load_playlist(dir.path().join("nothing.m3u"))
        .await
        .is_err());
    handle.shutdown().await.unwrap();
}
