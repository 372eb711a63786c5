//! Job scheduling boundary
//!
//! The controller only needs to submit prioritized, tagged units of work and
//! to drop queued work by tag. [`PriorityScheduler`] runs jobs on a rayon pool
//! in priority order; [`ImmediateScheduler`] runs them inline.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error};
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

use crate::volume::VolumeId;

/// A unit of work submitted to a [`Scheduler`]
pub struct ScheduledJob {
    /// Higher values run first
    pub priority: i32,
    pub cancel_tag: VolumeId,
    pub run: Box<dyn FnOnce() + Send>,
}

impl fmt::Debug for ScheduledJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("priority", &self.priority)
            .field("cancel_tag", &self.cancel_tag)
            .finish_non_exhaustive()
    }
}

pub trait Scheduler: Send + Sync {
    fn submit(&self, job: ScheduledJob);

    /// Drop every queued job tagged with `tag`; running jobs finish
    fn cancel_by_tag(&self, tag: VolumeId);
}

/// Runs every job synchronously inside `submit`
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn submit(&self, job: ScheduledJob) {
        (job.run)();
    }

    fn cancel_by_tag(&self, _tag: VolumeId) {}
}

struct QueuedJob {
    insertion_order: u64,
    job: ScheduledJob,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.insertion_order == other.insertion_order
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap: higher priority first, then FIFO
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.insertion_order.cmp(&self.insertion_order))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedJob>,
    insertion_counter: u64,
}

/// Priority queue drained by a rayon thread pool
///
/// Every submission spawns one pool task which pops whatever job has the
/// highest priority at that moment, so late high-priority submissions
/// overtake queued low-priority ones.
pub struct PriorityScheduler {
    pool: ThreadPool,
    queue: Arc<Mutex<QueueState>>,
}

impl PriorityScheduler {
    pub fn new(num_threads: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("frame-loader-{index}"))
            .panic_handler(|_| error!("frame job panicked"))
            .build()?;
        Ok(Self {
            pool,
            queue: Arc::new(Mutex::new(QueueState::default())),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Number of jobs waiting for a worker
    pub fn pending(&self) -> usize {
        self.lock().heap.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for PriorityScheduler {
    fn submit(&self, job: ScheduledJob) {
        {
            let mut state = self.lock();
            let insertion_order = state.insertion_counter;
            state.insertion_counter += 1;
            state.heap.push(QueuedJob {
                insertion_order,
                job,
            });
        }

        let queue = Arc::clone(&self.queue);
        self.pool.spawn(move || {
            let next = queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .heap
                .pop();
            if let Some(queued) = next {
                (queued.job.run)();
            }
        });
    }

    fn cancel_by_tag(&self, tag: VolumeId) {
        let mut state = self.lock();
        let before = state.heap.len();
        state.heap.retain(|queued| queued.job.cancel_tag != tag);
        debug!(
            "dropped {} queued jobs for volume {tag}",
            before - state.heap.len()
        );
    }
}
