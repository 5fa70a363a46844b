pub mod clock;
pub mod config;
pub mod control;
pub mod dynamic;
pub mod engine;
pub mod pipeline;
pub mod service;
pub mod session;
pub mod watch;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dynamic::{DynamicExtender, LocalExtender};
pub use engine::{Advance, EngineSettings, PlayCountRule, PlayState, PlaybackEngine, RepeatMode, ShuffleMode};
pub use pipeline::{AudioPipeline, ClockPipeline, PipelineError, PipelineEvent, PlayItem};
pub use service::{EngineEvent, EngineHandle, EngineService, ServiceOptions, StatusReport};

use library::{LibraryError, QueryError};

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error(transparent)]
    Library(#[from] LibraryError),
    #[error("invalid query: {0}")]
    Query(#[from] QueryError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("engine is not running")]
    NotRunning,
}

impl PlayerError {
    /// Errors caused by the request rather than the engine.
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            PlayerError::Query(_)
                | PlayerError::InvalidArgument(_)
                | PlayerError::Library(LibraryError::InvalidLocation(_))
                | PlayerError::Library(LibraryError::Uri(_))
                | PlayerError::Library(LibraryError::Playlist { .. })
        )
    }
}
