use std::sync::Arc;

use library::{LibraryRecord, Scanner, TrackDb};
use metadata::LoftyTagReader;
use parking_lot::RwLock;
use player::config::{config_path_from_env, load_or_create_config, resolve_path};
use player::session::load_session;
use player::watch::{start_periodic_scans, start_watchers};
use player::{
    control, ClockPipeline, EngineService, LocalExtender, PlaybackEngine, ServiceOptions,
    SystemClock,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }

    let db_path = resolve_path(&config_path, &config.db_path);
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut db = match TrackDb::open(&db_path) {
        Ok(db) => db,
        Err(err) => {
            error!("Cannot open track database {:?}: {}", db_path, err);
            return Err(err.into());
        }
    };
    for library in &config.libraries {
        let record = LibraryRecord {
            location: library.path.clone(),
            monitored: library.monitored,
            scan_interval: library.scan_interval,
        };
        if let Err(err) = db.add_library(record) {
            warn!("Ignoring library {:?}: {}", library.path, err);
        }
    }
    let libraries = db.libraries().to_vec();

    let (pipeline_tx, pipeline_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut engine = PlaybackEngine::new(
        Box::new(ClockPipeline::new(pipeline_tx)),
        Arc::new(SystemClock::default()),
        config.engine_settings(),
        StdRng::from_os_rng(),
    );
    engine.set_dynamic(config.dynamic.enabled);
    let session_path = resolve_path(&config_path, &config.session_path);
    match load_session(&session_path) {
        Ok(Some(session)) => engine.restore(&mut db, session),
        Ok(None) => {}
        Err(err) => warn!("Ignoring unreadable session {:?}: {}", session_path, err),
    }

    let scanner = Arc::new(Scanner::new(Arc::new(LoftyTagReader)));
    let catalog = Arc::new(RwLock::new(Vec::new()));
    let extender = Arc::new(LocalExtender::new(Arc::clone(&catalog)));
    let options = ServiceOptions::from_config(&config, &config_path);
    let (service, handle) =
        EngineService::new(db, engine, pipeline_rx, scanner, extender, options);
    let service = service.with_catalog(catalog);
    let cancel = service.cancel_token();
    let engine_task = tokio::spawn(service.run());

    let socket_path = resolve_path(&config_path, &config.control_socket);
    let control_task = tokio::spawn(control::serve(socket_path, handle.clone(), cancel.clone()));

    let _watchers = start_watchers(&handle, &libraries, config.watch_debounce(), &cancel);
    start_periodic_scans(&handle, &libraries, &cancel);
    if let Err(err) = handle.scan(false).await {
        warn!("Initial scan not started: {}", err);
    }

    shutdown_signal().await;

    if let Err(err) = handle.shutdown().await {
        warn!("Engine did not acknowledge shutdown: {}", err);
    }
    match engine_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("Engine stopped with error: {}", err),
        Err(err) => error!("Engine task failed: {}", err),
    }
    match control_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("Control socket failed: {}", err),
        Err(err) => error!("Control task failed: {}", err),
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Shutdown signal received.");
}
