//! Folds diagnostic lines into running state and emits progress/completion events.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::events::{CompletionFact, EventEmitter, ProgressSnapshot, TranscodeEvent};
use crate::media::SharedMediaFile;
use crate::patterns;

#[derive(Debug, Default)]
struct ReducerState {
    total_duration: Option<Duration>,
    last_progress: Option<ProgressSnapshot>,
    progress_events: u64,
    completion_events: u64,
}

/// Per-invocation reducer. Never shared across invocations.
pub struct ProgressReducer {
    emitter: Arc<EventEmitter>,
    media: Option<SharedMediaFile>,
    state: Mutex<ReducerState>,
}

impl ProgressReducer {
    pub fn new(emitter: Arc<EventEmitter>) -> Self {
        Self {
            emitter,
            media: None,
            state: Mutex::new(ReducerState::default()),
        }
    }

    /// Reducer whose events go nowhere.
    pub fn detached() -> Self {
        Self::new(Arc::new(EventEmitter::new()))
    }

    /// Attach stream descriptors and duration to `media` as they are discovered.
    pub fn with_media(mut self, media: SharedMediaFile) -> Self {
        self.media = Some(media);
        self
    }

    /// Input duration, zero until discovered.
    pub fn total_duration(&self) -> Duration {
        self.state.lock().total_duration.unwrap_or_default()
    }

    pub fn last_progress(&self) -> Option<ProgressSnapshot> {
        self.state.lock().last_progress.clone()
    }

    /// Number of (progress, completion) events emitted so far.
    pub fn emitted(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.progress_events, state.completion_events)
    }

    /// Interpret one diagnostic line. Any error is fatal for the invocation.
    pub fn consume_line(&self, line: &str) -> Result<()> {
        if let Some(media) = &self.media {
            if let Some(video) = patterns::match_video_stream(line) {
                let codec = video.codec.clone();
                if media.lock().attach_video(video) {
                    debug!(codec = %codec, "Video stream detected");
                }
            }
            if let Some(audio) = patterns::match_audio_stream(line) {
                let codec = audio.codec.clone();
                if media.lock().attach_audio(audio) {
                    debug!(codec = %codec, "Audio stream detected");
                }
            }
        }

        if let Some(duration) = patterns::match_duration(line)? {
            let mut state = self.state.lock();
            if state.total_duration.is_none() {
                state.total_duration = Some(duration);
                info!(seconds = duration.as_secs_f64(), "Input duration detected");
                if let Some(media) = &self.media {
                    media.lock().attach_duration(duration);
                }
            }
        }

        if let Some(fields) = patterns::match_progress(line)? {
            let snapshot = {
                let mut state = self.state.lock();
                let snapshot =
                    ProgressSnapshot::new(fields, state.total_duration.unwrap_or_default());
                state.last_progress = Some(snapshot.clone());
                state.progress_events += 1;
                snapshot
            };
            return self.emitter.notify(&TranscodeEvent::Progress(snapshot));
        }

        if patterns::is_completion(line) {
            let fact = {
                let mut state = self.state.lock();
                state.completion_events += 1;
                CompletionFact {
                    total_duration: state.total_duration.unwrap_or_default(),
                    last_progress: state.last_progress.clone(),
                }
            };
            debug!("Completion marker seen");
            return self.emitter.notify(&TranscodeEvent::Completed(fact));
        }

        Ok(())
    }
}
