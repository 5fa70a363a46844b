//! Local control socket.
//!
//! Clients send one JSON [`Request`] per line and read one JSON
//! [`Response`] line back. Connections may issue any number of requests.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{RepeatMode, ShuffleMode};
use crate::service::{EngineHandle, StatusReport, TrackRow};
use crate::PlayerError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Play {
        #[serde(default)]
        index: Option<usize>,
    },
    Pause,
    TogglePause,
    Stop,
    Next,
    Prev,
    Seek { secs: f64 },
    Query { text: String },
    Enqueue { uris: Vec<String> },
    Status,
    Scan {
        #[serde(default)]
        force: bool,
    },
    Load { path: PathBuf },
    Shuffle { mode: ShuffleMode },
    Repeat { mode: RepeatMode },
    Dynamic { enabled: bool },
    StopAfterCurrent { enabled: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<usize>,
    },
    Status(StatusReport),
    Tracks { tracks: Vec<TrackRow> },
    Error { kind: ErrorKind, message: String },
}

impl Response {
    fn ok() -> Self {
        Response::Ok { count: None }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Response::Error {
            kind: ErrorKind::BadRequest,
            message: message.into(),
        }
    }
}

impl From<PlayerError> for Response {
    fn from(err: PlayerError) -> Self {
        let kind = if err.is_bad_request() {
            ErrorKind::BadRequest
        } else {
            ErrorKind::Failed
        };
        Response::Error {
            kind,
            message: err.to_string(),
        }
    }
}

/// Runs one request against the engine.
pub async fn dispatch(handle: &EngineHandle, request: Request) -> Response {
    let result = match request {
        Request::Play { index } => handle.play(index).await.map(|_| Response::ok()),
        Request::Pause => handle.pause().await.map(|_| Response::ok()),
        Request::TogglePause => handle.toggle_pause().await.map(|_| Response::ok()),
        Request::Stop => handle.stop().await.map(|_| Response::ok()),
        Request::Next => handle.next().await.map(|_| Response::ok()),
        Request::Prev => handle.prev().await.map(|_| Response::ok()),
        Request::Seek { secs } => handle.seek(secs).await.map(|_| Response::ok()),
        Request::Query { text } => handle
            .query(&text)
            .await
            .map(|tracks| Response::Tracks { tracks }),
        Request::Enqueue { uris } => handle
            .enqueue(uris)
            .await
            .map(|count| Response::Ok { count: Some(count) }),
        Request::Status => handle.status().await.map(Response::Status),
        Request::Scan { force } => handle.scan(force).await.map(|_| Response::ok()),
        Request::Load { path } => handle
            .load_playlist(path)
            .await
            .map(|count| Response::Ok { count: Some(count) }),
        Request::Shuffle { mode } => handle.set_shuffle(mode).await.map(|_| Response::ok()),
        Request::Repeat { mode } => handle.set_repeat(mode).await.map(|_| Response::ok()),
        Request::Dynamic { enabled } => handle.set_dynamic(enabled).await.map(|_| Response::ok()),
        Request::StopAfterCurrent { enabled } => handle
            .set_stop_after_current(enabled)
            .await
            .map(|_| Response::ok()),
    };
    result.unwrap_or_else(Response::from)
}

/// Serves the control socket at `path` until `cancel` fires. A stale
/// socket file left by an earlier run is replaced.
pub async fn serve(
    path: PathBuf,
    handle: EngineHandle,
    cancel: CancellationToken,
) -> Result<(), PlayerError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    remove_stale(&path).await?;
    let listener = UnixListener::bind(&path)?;
    info!("Control socket listening on {:?}", path);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let handle = handle.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(stream, handle, cancel).await {
                            debug!("Control connection closed: {}", err);
                        }
                    });
                }
                Err(err) => warn!("Control socket accept failed: {}", err),
            },
        }
    }

    drop(listener);
    if let Err(err) = tokio::fs::remove_file(&path).await {
        debug!("Failed to remove control socket {:?}: {}", path, err);
    }
    Ok(())
}

async fn remove_stale(path: &Path) -> Result<(), PlayerError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("Removed stale control socket {:?}", path);
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn serve_connection(
    stream: UnixStream,
    handle: EngineHandle,
    cancel: CancellationToken,
) -> Result<(), PlayerError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                debug!("Control request {:?}", request);
                dispatch(&handle, request).await
            }
            Err(err) => Response::bad_request(format!("malformed request: {err}")),
        };
        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
    }
    Ok(())
}
