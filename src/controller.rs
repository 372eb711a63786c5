//! Volume load controller
//!
//! Drives the progressive load of one [`Volume`]: submits one task per
//! missing frame, integrates completions that arrive in any order, reports
//! progress, throttles re-renders and supports cancellation and decaching.
//!
//! Completions are serialized: each one updates the frame state and
//! counters and notifies observers before the next one starts. A completion
//! that belongs to a cancelled or superseded load generation changes
//! nothing.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::channel::oneshot;
use log::{debug, error, info, warn};
use web_time::Instant;

use crate::buffer::FrameSlot;
use crate::cache::{FrameEntry, VolumeCache};
use crate::decache::{self, DecacheSummary};
use crate::element::Element;
use crate::enums::{FrameOrder, FrameStorage};
use crate::metadata::{InMemoryMetadata, MetadataProvider};
use crate::ordering::FrameOrdering;
use crate::render::{NoopRenderSink, RenderSink, RenderThrottle};
use crate::scaling::{FrameScaling, ScalingRecord};
use crate::scheduler::{ScheduledJob, Scheduler};
use crate::status::{LoadStatus, ProgressCallback, ProgressObservers, ProgressReport};
use crate::task::{FrameError, FrameLoader, FrameTask, write_scaled};
use crate::volume::{Volume, VolumeError};

/// Tuning of a progressive load
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    /// Fraction of the frames between two automatic re-renders
    pub render_percentage: f64,
    pub auto_render: bool,
    pub frame_order: FrameOrder,
    /// Copy frames that are already cached individually instead of fetching them
    pub reuse_cached_frames: bool,
    pub frame_storage: FrameStorage,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            render_percentage: 0.02,
            auto_render: true,
            frame_order: FrameOrder::default(),
            reuse_cached_frames: true,
            frame_storage: FrameStorage::default(),
        }
    }
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the re-render fraction, clamped to `(0, 1]`
    pub fn with_render_percentage(mut self, percentage: f64) -> Self {
        self.render_percentage = if percentage.is_finite() && percentage > 0.0 {
            percentage.min(1.0)
        } else {
            Self::default().render_percentage
        };
        self
    }

    pub fn with_auto_render(mut self, auto_render: bool) -> Self {
        self.auto_render = auto_render;
        self
    }

    pub fn with_frame_order(mut self, frame_order: FrameOrder) -> Self {
        self.frame_order = frame_order;
        self
    }

    pub fn with_reuse_cached_frames(mut self, reuse: bool) -> Self {
        self.reuse_cached_frames = reuse;
        self
    }

    pub fn with_frame_storage(mut self, frame_storage: FrameStorage) -> Self {
        self.frame_storage = frame_storage;
        self
    }
}

/// External collaborators of a controller
pub struct LoadContext<T: Element> {
    pub scheduler: Arc<dyn Scheduler>,
    pub loader: Arc<dyn FrameLoader<T>>,
    pub cache: Arc<dyn VolumeCache<T>>,
    pub render: Arc<dyn RenderSink>,
    pub metadata: Arc<dyn MetadataProvider>,
    /// Overrides `LoadOptions::frame_order` when set
    pub ordering: Option<Arc<dyn FrameOrdering>>,
}

impl<T: Element> LoadContext<T> {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        loader: Arc<dyn FrameLoader<T>>,
        cache: Arc<dyn VolumeCache<T>>,
    ) -> Self {
        Self {
            scheduler,
            loader,
            cache,
            render: Arc::new(NoopRenderSink),
            metadata: Arc::new(InMemoryMetadata::new()),
            ordering: None,
        }
    }

    pub fn with_render(mut self, render: Arc<dyn RenderSink>) -> Self {
        self.render = render;
        self
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_ordering(mut self, ordering: Arc<dyn FrameOrdering>) -> Self {
        self.ordering = Some(ordering);
        self
    }
}

thread_local! {
    // controllers whose completion this thread is delivering, so their
    // observers may call back in without deadlocking on the dispatch lock
    static DISPATCHING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct DispatchScope {
    key: usize,
}

impl DispatchScope {
    fn enter(key: usize) -> Self {
        DISPATCHING.with(|keys| keys.borrow_mut().push(key));
        Self { key }
    }

    fn is_dispatching(key: usize) -> bool {
        DISPATCHING.with(|keys| keys.borrow().contains(&key))
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        DISPATCHING.with(|keys| {
            let mut keys = keys.borrow_mut();
            if let Some(position) = keys.iter().rposition(|&key| key == self.key) {
                keys.remove(position);
            }
        });
    }
}

struct Shared<T: Element> {
    volume: Arc<Volume<T>>,
    context: LoadContext<T>,
    options: LoadOptions,
    dispatch: Mutex<()>,
    /// Tasks waiting for a task of an earlier generation to release their slot
    parked: Mutex<HashMap<usize, FrameTask>>,
}

/// Loads a volume's frames into its shared buffer
pub struct VolumeLoadController<T: Element> {
    shared: Arc<Shared<T>>,
}

impl<T: Element> Clone for VolumeLoadController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Element> VolumeLoadController<T> {
    pub fn new(volume: Arc<Volume<T>>, context: LoadContext<T>, options: LoadOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                volume,
                context,
                options,
                dispatch: Mutex::new(()),
                parked: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn volume(&self) -> &Arc<Volume<T>> {
        &self.shared.volume
    }

    pub fn options(&self) -> &LoadOptions {
        &self.shared.options
    }

    pub fn load_status(&self) -> LoadStatus {
        self.shared.volume.load_status()
    }

    pub fn is_loaded(&self) -> bool {
        self.shared.volume.is_loaded()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.volume.is_loading()
    }

    /// Start loading every frame that is not cached yet
    ///
    /// While a load is running the call only registers `on_progress`, which
    /// then receives the remaining reports of that load including the
    /// terminal one. On a loaded volume `on_progress` receives one completed
    /// report right away and no task is submitted.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::UnsupportedBufferType`] before anything is
    /// submitted when the volume's element type cannot hold its values.
    pub fn load(
        &self,
        on_progress: Option<ProgressCallback>,
        priority: i32,
    ) -> Result<(), VolumeError> {
        let shared = &self.shared;
        let volume = &shared.volume;
        let scaling = shared.validate()?;

        let num_frames = volume.num_frames();
        let (generation, cached_frames) = {
            let mut state = volume.state();
            if state.status.loading {
                if let Some(callback) = on_progress {
                    state.status.callbacks.subscribe(callback);
                }
                debug!("volume {} already loading", volume.id());
                return Ok(());
            }
            if state.status.loaded {
                let report = ProgressReport::completed(state.status.num_cached(), num_frames);
                drop(state);
                if let Some(callback) = on_progress {
                    callback(&report);
                }
                return Ok(());
            }

            state.generation += 1;
            state.status.loading = true;
            if let Some(callback) = on_progress {
                state.status.callbacks.subscribe(callback);
            }
            state.frames_loaded = state.status.num_cached();
            state.frames_processed = state.frames_loaded;
            state.throttle = if shared.options.auto_render {
                RenderThrottle::new(num_frames, shared.options.render_percentage)
            } else {
                RenderThrottle::disabled(num_frames)
            };
            state.started = Some(Instant::now());

            if state.frames_processed == num_frames {
                state.status.loaded = true;
                state.status.loading = false;
                let observers = state.status.callbacks.take();
                let report = ProgressReport::completed(state.frames_loaded, num_frames);
                drop(state);
                info!("volume {} has no frames left to load", volume.id());
                observers.notify(&report);
                return Ok(());
            }
            (state.generation, state.status.cached_frames.clone())
        };

        let order = match &shared.context.ordering {
            Some(ordering) => ordering.order(volume.frame_ids()),
            None => shared.options.frame_order.order(volume.frame_ids()),
        };
        let pending: Vec<usize> = order
            .into_iter()
            .filter(|&index| cached_frames.get(index) == Some(&false))
            .collect();
        info!(
            "loading {} of {} frames of volume {}",
            pending.len(),
            num_frames,
            volume.id()
        );

        for index in pending {
            if !shared.is_current(generation) {
                debug!("load of volume {} stopped during submission", volume.id());
                break;
            }
            let Some(range) = volume.buffer().frame_range(index) else {
                continue;
            };
            let task = FrameTask {
                frame_id: volume.frame_ids()[index].clone(),
                frame_index: index,
                range,
                priority,
                cancel_tag: volume.id(),
                scaling: scaling.frame(index),
                ratios: scaling.ratios(),
                generation,
            };
            if shared.options.reuse_cached_frames && shared.try_reuse_cached(&task) {
                continue;
            }
            shared.submit(task);
        }
        Ok(())
    }

    /// Load and wait for the terminal report
    ///
    /// Resolves to `None` when the load is cancelled before it finishes.
    pub async fn load_async(&self, priority: i32) -> Result<Option<ProgressReport>, VolumeError> {
        let (sender, receiver) = oneshot::channel();
        let sender = Mutex::new(Some(sender));
        let callback: ProgressCallback = Arc::new(move |report: &ProgressReport| {
            if report.is_terminal() {
                let sender = sender.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(sender) = sender {
                    let _ = sender.send(report.clone());
                }
            }
        });
        self.load(Some(callback), priority)?;
        Ok(receiver.await.ok())
    }

    /// Stop the current load generation
    ///
    /// Queued tasks are dropped; tasks already running may finish, but their
    /// completions no longer change the volume or reach any observer.
    pub fn cancel_loading(&self) {
        let shared = &self.shared;
        let _dispatch = shared.dispatch_guard();
        {
            let mut state = shared.volume.state();
            if !state.status.loading {
                return;
            }
            state.status.loading = false;
            state.status.callbacks.clear();
            info!(
                "cancelled load of volume {} after {} of {} frames",
                shared.volume.id(),
                state.frames_processed,
                state.num_frames()
            );
        }
        shared.context.scheduler.cancel_by_tag(shared.volume.id());
        shared.parked().clear();
    }

    /// Retire the volume's buffer, optionally salvaging loaded frames as
    /// individual cache entries
    pub fn decache(&self, completely_remove: bool) -> DecacheSummary {
        self.cancel_loading();
        let shared = &self.shared;
        decache::decache(
            &shared.volume,
            shared.context.cache.as_ref(),
            completely_remove,
            shared.options.frame_storage,
        )
    }
}

impl<T: Element> Shared<T> {
    fn validate(&self) -> Result<&ScalingRecord, VolumeError> {
        let scaling = self.volume.scaling_or_init(self.context.metadata.as_ref());
        if scaling.is_quantitative() && !T::ELEMENT_TYPE.is_float() {
            return Err(VolumeError::UnsupportedBufferType {
                element_type: T::ELEMENT_TYPE,
                reason: "quantitative scaling needs a floating point buffer",
            });
        }
        Ok(scaling)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.volume.state().accepts(generation)
    }

    fn dispatch_key(&self) -> usize {
        self as *const Self as usize
    }

    fn dispatch_guard(&self) -> Option<MutexGuard<'_, ()>> {
        if DispatchScope::is_dispatching(self.dispatch_key()) {
            None
        } else {
            Some(self.dispatch.lock().unwrap_or_else(PoisonError::into_inner))
        }
    }

    fn parked(&self) -> MutexGuard<'_, HashMap<usize, FrameTask>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(self: &Arc<Self>, task: FrameTask) {
        let slot = self.volume.buffer().claim(task.frame_index);
        let priority = task.priority;
        let cancel_tag = task.cancel_tag;
        let shared = Arc::clone(self);
        self.context.scheduler.submit(ScheduledJob {
            priority,
            cancel_tag,
            run: Box::new(move || shared.run(task, slot)),
        });
    }

    /// Fetch one frame into its slot and integrate the completion
    ///
    /// When the slot is still held by a task of a cancelled generation the
    /// task is parked and runs once that task releases the slot.
    fn run(self: &Arc<Self>, task: FrameTask, slot: Option<FrameSlot<T>>) {
        if !self.is_current(task.generation) {
            if let Some(slot) = slot {
                self.release(slot);
            }
            return;
        }
        let Some(mut slot) = slot.or_else(|| self.claim_or_park(&task)) else {
            return;
        };
        let result = self.fetch(&task, &mut slot);
        self.complete(&task, result);
        self.release(slot);
    }

    fn claim_or_park(&self, task: &FrameTask) -> Option<FrameSlot<T>> {
        let mut parked = self.parked();
        let slot = self.volume.buffer().claim(task.frame_index);
        if slot.is_none() {
            debug!("frame {} waits for its slot to be released", task.frame_id);
            parked.insert(task.frame_index, task.clone());
        }
        slot
    }

    /// Drop the claim on a slot and run the task parked on it, if any
    fn release(self: &Arc<Self>, slot: FrameSlot<T>) {
        let index = slot.index();
        let waiting = {
            let mut parked = self.parked();
            drop(slot);
            parked.remove(&index)
        };
        if let Some(task) = waiting {
            self.run(task, None);
        }
    }

    fn fetch(&self, task: &FrameTask, slot: &mut FrameSlot<T>) -> Result<(), FrameError> {
        let loader = &self.context.loader;
        panic::catch_unwind(AssertUnwindSafe(|| loader.load_frame(task, slot))).unwrap_or_else(
            |payload| {
                let message = panic_message(payload.as_ref());
                error!("loader panicked on frame {}: {message}", task.frame_id);
                Err(FrameError::Panicked(message))
            },
        )
    }

    /// Copy an individually cached frame instead of fetching it
    fn try_reuse_cached(self: &Arc<Self>, task: &FrameTask) -> bool {
        let Some(entry) = self.context.cache.get_frame(&task.frame_id) else {
            return false;
        };
        if entry.len() != self.volume.buffer().frame_len() {
            return false;
        }
        let Some(mut slot) = self.volume.buffer().claim(task.frame_index) else {
            return false;
        };
        debug!("frame {} reused from cache", task.frame_id);
        let result = copy_cached_frame(&entry, &mut slot, &task.scaling);
        self.complete(task, result);
        self.release(slot);
        true
    }

    fn complete(&self, task: &FrameTask, result: Result<(), FrameError>) {
        let _dispatch = self.dispatch_guard();
        let index = task.frame_index;
        let success = result.is_ok();

        let (observers, report, render) = {
            let mut state = self.volume.state();
            if !state.accepts(task.generation) {
                debug!("ignoring stale completion of frame {index}");
                return;
            }
            state.frames_processed += 1;
            let error = match result {
                Ok(()) => {
                    state.status.cached_frames[index] = true;
                    state.frames_loaded += 1;
                    None
                }
                Err(err) => {
                    warn!("frame {} ({index}) failed: {err}", task.frame_id);
                    Some(err)
                }
            };
            let processed = state.frames_processed;
            let render = state.throttle.on_frame_processed(processed);
            let report = state.report(success, index, &task.frame_id, error);

            let observers = if report.is_terminal() {
                state.status.loaded = true;
                state.status.loading = false;
                let elapsed = state.started.take().map(|started| started.elapsed());
                info!(
                    "volume {} loaded: {} of {} frames in {:?}",
                    self.volume.id(),
                    state.frames_loaded,
                    report.num_frames,
                    elapsed.unwrap_or_default()
                );
                state.status.callbacks.take()
            } else {
                state.status.callbacks.clone()
            };
            (observers, report, render)
        };

        if success {
            self.context.render.mark_frame_updated(index);
        }
        if render {
            debug!("render requested after {} frames", report.frames_processed);
            self.context.render.request_render();
        }
        self.deliver(&observers, &report, task.generation);
    }

    fn deliver(&self, observers: &ProgressObservers, report: &ProgressReport, generation: u64) {
        let _scope = DispatchScope::enter(self.dispatch_key());
        for callback in observers.iter() {
            // an observer may cancel the load; later observers then see nothing
            if !report.is_terminal() && !self.is_current(generation) {
                break;
            }
            callback(report);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn copy_cached_frame<T: Element>(
    entry: &FrameEntry<T>,
    slot: &mut FrameSlot<T>,
    target: &FrameScaling,
) -> Result<(), FrameError> {
    let values = entry.to_vec();
    let raw: Vec<f64> = match entry.scaling {
        Some(stored) if stored == *target => {
            return if slot.copy_from_slice(&values) {
                Ok(())
            } else {
                Err(FrameError::LengthMismatch {
                    index: slot.index(),
                    expected: slot.len(),
                    actual: values.len(),
                })
            };
        }
        Some(stored) => values.iter().map(|v| stored.invert(v.to_f64())).collect(),
        None => values.iter().map(|v| v.to_f64()).collect(),
    };
    write_scaled(slot, &raw, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SharedBuffer;
    use crate::cache::LruFrameCache;
    use crate::scheduler::ImmediateScheduler;
    use crate::volume::VolumeGeometry;

    struct ZeroLoader;

    impl FrameLoader<f32> for ZeroLoader {
        fn load_frame(
            &self,
            _task: &FrameTask,
            _slot: &mut FrameSlot<f32>,
        ) -> Result<(), FrameError> {
            Ok(())
        }
    }

    fn controller() -> VolumeLoadController<f32> {
        let context = LoadContext::<f32>::new(
            Arc::new(ImmediateScheduler),
            Arc::new(ZeroLoader),
            Arc::new(LruFrameCache::<f32>::with_mb_limit(1)),
        );
        let volume = Volume::new(vec!["a".to_string()], VolumeGeometry::new(1, 1, (1.0, 1.0, 1.0)));
        VolumeLoadController::new(Arc::new(volume), context, LoadOptions::default())
    }

    #[test]
    fn test_dispatch_reentry_is_per_controller() {
        let first = controller();
        let second = controller();
        {
            let _scope = DispatchScope::enter(first.shared.dispatch_key());
            assert!(first.shared.dispatch_guard().is_none());
            assert!(second.shared.dispatch_guard().is_some());
            {
                let _nested = DispatchScope::enter(second.shared.dispatch_key());
                assert!(second.shared.dispatch_guard().is_none());
            }
            assert!(second.shared.dispatch_guard().is_some());
            assert!(first.shared.dispatch_guard().is_none());
        }
        assert!(first.shared.dispatch_guard().is_some());
    }

    #[test]
    fn test_panic_message() {
        let formatted: Box<dyn Any + Send> = Box::new(format!("bad frame {}", 3));
        assert_eq!(panic_message(formatted.as_ref()), "bad frame 3");
        let literal: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(literal.as_ref()), "static");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[test]
    fn test_options_builder_clamps() {
        let options = LoadOptions::new()
            .with_render_percentage(5.0)
            .with_auto_render(false)
            .with_frame_order(FrameOrder::MiddleOut);
        assert_eq!(options.render_percentage, 1.0);
        assert!(!options.auto_render);
        assert_eq!(options.frame_order, FrameOrder::MiddleOut);

        assert_eq!(LoadOptions::new().with_render_percentage(-1.0).render_percentage, 0.02);
        assert_eq!(LoadOptions::new().with_render_percentage(f64::NAN).render_percentage, 0.02);
    }

    #[test]
    fn test_copy_cached_frame_applies_scaling_to_raw_entries() {
        let buffer = Arc::new(SharedBuffer::<f32>::new(1, 2));
        let mut slot = buffer.claim(0).unwrap();
        let entry = FrameEntry::owned("a".to_string(), 1, 2, vec![10.0f32, 20.0]);
        let target = FrameScaling {
            slope: 2.0,
            intercept: 1.0,
            suv_bw: None,
        };
        copy_cached_frame(&entry, &mut slot, &target).unwrap();
        drop(slot);
        assert_eq!(buffer.to_vec(), vec![21.0, 41.0]);
    }

    #[test]
    fn test_copy_cached_frame_rescales_differently_scaled_entries() {
        let buffer = Arc::new(SharedBuffer::<f32>::new(1, 2));
        let mut slot = buffer.claim(0).unwrap();
        let stored = FrameScaling {
            slope: 2.0,
            intercept: 0.0,
            suv_bw: None,
        };
        let entry = FrameEntry::owned("a".to_string(), 1, 2, vec![4.0f32, 8.0])
            .with_scaling(Some(stored));

        copy_cached_frame(&entry, &mut slot, &FrameScaling::IDENTITY).unwrap();
        drop(slot);
        assert_eq!(buffer.to_vec(), vec![2.0, 4.0]);
    }

    #[test]
    fn test_copy_cached_frame_copies_matching_entries() {
        let buffer = Arc::new(SharedBuffer::<i16>::new(1, 3));
        let mut slot = buffer.claim(0).unwrap();
        let entry = FrameEntry::owned("a".to_string(), 1, 3, vec![-5i16, 0, 5])
            .with_scaling(Some(FrameScaling::IDENTITY));
        copy_cached_frame(&entry, &mut slot, &FrameScaling::IDENTITY).unwrap();
        drop(slot);
        assert_eq!(buffer.to_vec(), vec![-5, 0, 5]);
    }
}
