#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dicom_streaming_volume::{
    Element, FrameError, FrameLoader, FrameSlot, FrameTask, ProgressCallback, ProgressReport,
    RenderSink, ScheduledJob, Scheduler, Volume, VolumeGeometry, VolumeId, task::write_scaled,
};

/// Holds submitted jobs until the test runs them, in any order it likes
#[derive(Default)]
pub struct ManualScheduler {
    jobs: Mutex<Vec<ScheduledJob>>,
    submitted: AtomicUsize,
}

impl ManualScheduler {
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    /// Remove queued jobs without running them, as if a worker had picked them up
    pub fn take_jobs(&self, count: usize) -> Vec<ScheduledJob> {
        let mut jobs = self.jobs.lock().unwrap();
        let count = count.min(jobs.len());
        jobs.drain(..count).collect()
    }

    pub fn run_next(&self, count: usize) {
        for job in self.take_jobs(count) {
            (job.run)();
        }
    }

    pub fn run_all(&self) {
        let jobs: Vec<_> = self.jobs.lock().unwrap().drain(..).collect();
        for job in jobs {
            (job.run)();
        }
    }

    pub fn run_all_reversed(&self) {
        let jobs: Vec<_> = self.jobs.lock().unwrap().drain(..).collect();
        for job in jobs.into_iter().rev() {
            (job.run)();
        }
    }
}

impl Scheduler for ManualScheduler {
    fn submit(&self, job: ScheduledJob) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        self.jobs.lock().unwrap().push(job);
    }

    fn cancel_by_tag(&self, tag: VolumeId) {
        self.jobs.lock().unwrap().retain(|job| job.cancel_tag != tag);
    }
}

#[derive(Default)]
pub struct RecordingRender {
    pub updated: Mutex<Vec<usize>>,
    pub renders: AtomicUsize,
}

impl RecordingRender {
    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn updated(&self) -> Vec<usize> {
        self.updated.lock().unwrap().clone()
    }
}

impl RenderSink for RecordingRender {
    fn mark_frame_updated(&self, index: usize) {
        self.updated.lock().unwrap().push(index);
    }

    fn request_render(&self) {
        self.renders.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fills frame `i` with the raw value `i + 1`, failing or panicking for chosen indices
#[derive(Default)]
pub struct FakeLoader {
    failing: HashSet<usize>,
    panicking: HashSet<usize>,
    calls: AtomicUsize,
}

impl FakeLoader {
    pub fn failing(indices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            failing: indices.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn panicking(indices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            panicking: indices.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<T: Element> FrameLoader<T> for FakeLoader {
    fn load_frame(&self, task: &FrameTask, slot: &mut FrameSlot<T>) -> Result<(), FrameError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&task.frame_index) {
            return Err(FrameError::Fetch(format!("{} unavailable", task.frame_id)));
        }
        if self.panicking.contains(&task.frame_index) {
            panic!("decoder crashed on {}", task.frame_id);
        }
        let raw = vec![(task.frame_index + 1) as f64; slot.len()];
        write_scaled(slot, &raw, &task.scaling)
    }
}

pub fn frame_ids(num_frames: usize) -> Vec<String> {
    (0..num_frames).map(|i| format!("frame-{i}")).collect()
}

pub fn volume<T: Element>(num_frames: usize) -> Arc<Volume<T>> {
    Arc::new(Volume::new(
        frame_ids(num_frames),
        VolumeGeometry::new(4, 3, (0.8, 0.8, 2.5)),
    ))
}

/// Progress callback that records every report it receives
pub fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<ProgressReport>>>) {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    let callback: ProgressCallback = Arc::new(move |report: &ProgressReport| {
        sink.lock().unwrap().push(report.clone());
    });
    (callback, reports)
}

pub fn terminal_count(reports: &[ProgressReport]) -> usize {
    reports.iter().filter(|report| report.is_terminal()).count()
}
