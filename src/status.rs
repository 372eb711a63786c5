//! Load status and progress reporting

use std::fmt;
use std::sync::Arc;

use web_time::Instant;

use crate::render::RenderThrottle;
use crate::task::FrameError;
use crate::volume::FrameId;

/// Progress of one load generation, delivered to every registered observer
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub success: bool,
    /// `None` for reports not tied to a single frame (already loaded, empty volume)
    pub frame_index: Option<usize>,
    pub frame_id: Option<FrameId>,
    pub frames_loaded: usize,
    pub frames_processed: usize,
    pub num_frames: usize,
    pub error: Option<FrameError>,
}

impl ProgressReport {
    /// Report for a generation that has nothing left to do
    pub(crate) fn completed(frames_loaded: usize, num_frames: usize) -> Self {
        Self {
            success: true,
            frame_index: None,
            frame_id: None,
            frames_loaded,
            frames_processed: num_frames,
            num_frames,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.frames_processed == self.num_frames
    }

    /// Frames that were processed but failed
    pub fn frames_failed(&self) -> usize {
        self.frames_processed - self.frames_loaded
    }
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressReport) + Send + Sync>;

/// Observers of a load generation, invoked in registration order
#[derive(Clone, Default)]
pub struct ProgressObservers {
    callbacks: Vec<ProgressCallback>,
}

impl ProgressObservers {
    pub fn subscribe(&mut self, callback: ProgressCallback) {
        self.callbacks.push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Drop every observer; nothing registered so far will be invoked again
    pub fn clear(&mut self) {
        self.callbacks.clear();
    }

    pub fn take(&mut self) -> ProgressObservers {
        std::mem::take(self)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProgressCallback> {
        self.callbacks.iter()
    }

    pub fn notify(&self, report: &ProgressReport) {
        for callback in &self.callbacks {
            callback(report);
        }
    }
}

impl fmt::Debug for ProgressObservers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressObservers")
            .field("len", &self.callbacks.len())
            .finish()
    }
}

/// Load status attached to a volume
#[derive(Debug, Clone, Default)]
pub struct LoadStatus {
    pub loaded: bool,
    pub loading: bool,
    pub cached_frames: Vec<bool>,
    pub callbacks: ProgressObservers,
}

impl LoadStatus {
    pub fn new(num_frames: usize) -> Self {
        Self {
            cached_frames: vec![false; num_frames],
            ..Default::default()
        }
    }

    pub fn num_cached(&self) -> usize {
        self.cached_frames.iter().filter(|&&cached| cached).count()
    }

    pub fn all_cached(&self) -> bool {
        self.cached_frames.iter().all(|&cached| cached)
    }

    /// Copy of the flags and frame states, without callbacks
    pub fn snapshot(&self) -> LoadStatus {
        LoadStatus {
            loaded: self.loaded,
            loading: self.loading,
            cached_frames: self.cached_frames.clone(),
            callbacks: ProgressObservers::default(),
        }
    }
}

/// Status plus the bookkeeping of the current load generation
#[derive(Debug)]
pub(crate) struct LoadState {
    pub status: LoadStatus,
    pub generation: u64,
    pub frames_loaded: usize,
    pub frames_processed: usize,
    pub throttle: RenderThrottle,
    pub started: Option<Instant>,
}

impl LoadState {
    pub fn new(num_frames: usize) -> Self {
        Self {
            status: LoadStatus::new(num_frames),
            generation: 0,
            frames_loaded: 0,
            frames_processed: 0,
            throttle: RenderThrottle::disabled(num_frames),
            started: None,
        }
    }

    pub fn num_frames(&self) -> usize {
        self.status.cached_frames.len()
    }

    /// Whether a completion tagged with `generation` may still touch this state
    pub fn accepts(&self, generation: u64) -> bool {
        self.status.loading && self.generation == generation
    }

    pub fn report(
        &self,
        success: bool,
        frame_index: usize,
        frame_id: &FrameId,
        error: Option<FrameError>,
    ) -> ProgressReport {
        ProgressReport {
            success,
            frame_index: Some(frame_index),
            frame_id: Some(frame_id.clone()),
            frames_loaded: self.frames_loaded,
            frames_processed: self.frames_processed,
            num_frames: self.num_frames(),
            error,
        }
    }
}
