//! The audio pipeline seam.
//!
//! Decoding and output live behind [`AudioPipeline`]. The engine tags every
//! `play` with a generation number and the pipeline reports end-of-stream
//! and failures with that number, so events about a track the engine has
//! already moved past can be recognized and dropped.

use std::time::Duration;

use common::uri;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Clone, Debug, PartialEq)]
pub struct PlayItem {
    pub uri: String,
    pub generation: u64,
    /// `__length` of the track when known.
    pub length: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    EndOfStream { generation: u64 },
    Error { generation: u64, message: String },
}

impl PipelineEvent {
    pub fn generation(&self) -> u64 {
        match self {
            PipelineEvent::EndOfStream { generation } | PipelineEvent::Error { generation, .. } => {
                *generation
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no such file: {0}")]
    NotFound(String),
    #[error("cannot play {0}: length unknown")]
    UnknownLength(String),
    #[error("cannot seek: {0}")]
    Seek(String),
    #[error("pipeline failure: {0}")]
    Other(String),
}

pub trait AudioPipeline: Send {
    fn play(&mut self, item: &PlayItem) -> Result<(), PipelineError>;
    fn pause(&mut self);
    fn resume(&mut self);
    fn stop(&mut self);
    fn seek(&mut self, secs: f64) -> Result<(), PipelineError>;
    /// Seconds into the current track.
    fn position(&self) -> f64;
    /// Pre-announces the track that will follow, for gapless transitions.
    fn set_next(&mut self, _uri: Option<&str>) {}
}

struct Playing {
    generation: u64,
    length: f64,
    /// Position at the last resume or seek.
    offset: f64,
    resumed_at: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

impl Playing {
    fn position(&self) -> f64 {
        let running = self
            .resumed_at
            .map(|at| at.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        (self.offset + running).min(self.length)
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Simulated pipeline that produces no sound: position advances in real
/// time and end-of-stream fires once `__length` seconds have elapsed.
pub struct ClockPipeline {
    events: UnboundedSender<PipelineEvent>,
    current: Option<Playing>,
}

impl ClockPipeline {
    pub fn new(events: UnboundedSender<PipelineEvent>) -> Self {
        Self {
            events,
            current: None,
        }
    }

    fn arm(&mut self) {
        let Some(playing) = self.current.as_mut() else {
            return;
        };
        playing.disarm();
        let remaining = (playing.length - playing.offset).max(0.0);
        let generation = playing.generation;
        let events = self.events.clone();
        playing.resumed_at = Some(Instant::now());
        playing.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(remaining)).await;
            let _ = events.send(PipelineEvent::EndOfStream { generation });
        }));
    }
}

impl AudioPipeline for ClockPipeline {
    fn play(&mut self, item: &PlayItem) -> Result<(), PipelineError> {
        self.stop();
        if let Some(path) = uri::to_path(&item.uri) {
            if !path.is_file() {
                return Err(PipelineError::NotFound(item.uri.clone()));
            }
        }
        let length = item
            .length
            .filter(|length| length.is_finite() && *length > 0.0)
            .ok_or_else(|| PipelineError::UnknownLength(item.uri.clone()))?;
        self.current = Some(Playing {
            generation: item.generation,
            length,
            offset: 0.0,
            resumed_at: None,
            timer: None,
        });
        self.arm();
        Ok(())
    }

    fn pause(&mut self) {
        if let Some(playing) = self.current.as_mut() {
            playing.offset = playing.position();
            playing.resumed_at = None;
            playing.disarm();
        }
    }

    fn resume(&mut self) {
        if self
            .current
            .as_ref()
            .is_some_and(|playing| playing.resumed_at.is_none())
        {
            self.arm();
        }
    }

    fn stop(&mut self) {
        if let Some(mut playing) = self.current.take() {
            playing.disarm();
        }
    }

    fn seek(&mut self, secs: f64) -> Result<(), PipelineError> {
        let Some(playing) = self.current.as_mut() else {
            return Err(PipelineError::Seek("nothing is playing".to_string()));
        };
        if !secs.is_finite() || secs < 0.0 {
            return Err(PipelineError::Seek(format!("invalid position {secs}")));
        }
        playing.offset = secs.min(playing.length);
        if playing.resumed_at.is_some() {
            self.arm();
        }
        Ok(())
    }

    fn position(&self) -> f64 {
        self.current.as_ref().map(Playing::position).unwrap_or(0.0)
    }
}

impl Drop for ClockPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn item(generation: u64, length: Option<f64>) -> PlayItem {
        PlayItem {
            uri: "http://radio.example/stream".to_string(),
            generation,
            length,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn end_of_stream_fires_after_length() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pipeline = ClockPipeline::new(tx);
        pipeline.play(&item(7, Some(3.0))).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
        assert!((pipeline.position() - 2.0).abs() < 0.01);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await, Some(PipelineEvent::EndOfStream { generation: 7 }));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_holds_position_and_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pipeline = ClockPipeline::new(tx);
        pipeline.play(&item(1, Some(2.0))).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        pipeline.pause();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        assert!((pipeline.position() - 1.0).abs() < 0.01);
        pipeline.resume();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(rx.recv().await, Some(PipelineEvent::EndOfStream { generation: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_end_of_stream() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pipeline = ClockPipeline::new(tx);
        pipeline.play(&item(1, Some(1.0))).unwrap();
        pipeline.stop();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(pipeline.position(), 0.0);
    }

    #[tokio::test]
    async fn unplayable_items_are_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pipeline = ClockPipeline::new(tx);
        assert!(matches!(
            pipeline.play(&item(1, None)),
            Err(PipelineError::UnknownLength(_))
        ));
        let missing = PlayItem {
            uri: "file:///definitely/not/here.mp3".to_string(),
            generation: 2,
            length: Some(10.0),
        };
        assert!(matches!(pipeline.play(&missing), Err(PipelineError::NotFound(_))));
        assert!(pipeline.seek(1.0).is_err());
    }
}
