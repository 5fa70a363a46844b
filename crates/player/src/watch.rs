use std::time::Duration;

use common::uri;
use library::LibraryRecord;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::service::EngineHandle;

/// Starts a filesystem watcher for every monitored library. Dropping the
/// returned watchers stops them.
pub fn start_watchers(
    handle: &EngineHandle,
    libraries: &[LibraryRecord],
    debounce: Duration,
    cancel: &CancellationToken,
) -> Vec<RecommendedWatcher> {
    let mut watchers = Vec::new();
    for library in libraries.iter().filter(|library| library.monitored) {
        match setup_watcher(handle.clone(), library.location.clone(), debounce, cancel.clone()) {
            Ok(watcher) => {
                info!(
                    "Watching {} for changes (debounce {}s)",
                    library.location,
                    debounce.as_secs()
                );
                watchers.push(watcher);
            }
            Err(err) => warn!("Failed to watch {}: {}", library.location, err),
        }
    }
    watchers
}

fn setup_watcher(
    handle: EngineHandle,
    root: String,
    debounce: Duration,
    cancel: CancellationToken,
) -> Result<RecommendedWatcher, Box<dyn std::error::Error>> {
    let path = uri::to_path(&root).ok_or_else(|| format!("{root} is not a local directory"))?;
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        NotifyConfig::default(),
    )?;

    watcher.watch(&path, RecursiveMode::Recursive)?;

    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = watch_loop(handle, root, rx, debounce) => {}
        }
    });

    Ok(watcher)
}

/// Waits for a quiet period after a relevant event, then asks for an
/// incremental scan of the root.
async fn watch_loop(
    handle: EngineHandle,
    root: String,
    mut rx: UnboundedReceiver<Event>,
    debounce: Duration,
) {
    while let Some(event) = rx.recv().await {
        if !is_relevant_event(&event) {
            continue;
        }
        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        debug!("Changes under {}; requesting scan", root);
        if handle.request_scan(vec![root.clone()]).await.is_err() {
            return;
        }
    }
}

fn is_relevant_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Rescans libraries that carry a scan interval, each on its own timer.
pub fn start_periodic_scans(
    handle: &EngineHandle,
    libraries: &[LibraryRecord],
    cancel: &CancellationToken,
) {
    for library in libraries.iter().filter(|library| library.scan_interval > 0) {
        let handle = handle.clone();
        let cancel = cancel.clone();
        let root = library.location.clone();
        let period = Duration::from_secs(library.scan_interval);
        info!("Rescanning {} every {}s", root, library.scan_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if handle.request_scan(vec![root.clone()]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind};

    #[test]
    fn only_content_changes_trigger_scans() {
        assert!(is_relevant_event(&Event::new(EventKind::Create(CreateKind::File))));
        assert!(!is_relevant_event(&Event::new(EventKind::Access(AccessKind::Any))));
    }
}
