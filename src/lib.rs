//! # DICOM streaming volume library
//!
//! This crate loads a series of DICOM frames progressively into one shared
//! volume buffer, so a viewer can render the volume while frames are still
//! arriving.

//!
//! Each frame is fetched and decoded by an independent task. Tasks run on a
//! prioritized scheduler and finish in any order; every frame writes only
//! its own region of the buffer. The load controller keeps track of which
//! frames are present, reports progress to registered callbacks, requests a
//! re-render every few percent of the frames and can be cancelled at any
//! time. When the cache needs the memory back, a volume can be decached:
//! its loaded frames survive as individual cache entries as far as the
//! memory budget allows.
//!
//! Frames are assumed to be:
//!   - Single frame images (always the first frame is used)
//!   - From the same series with identical rows and columns
//!
//! PET frames stored in Bq/ml are converted to SUV body weight while they
//! are written, which requires a floating point buffer.
//!
//! # Examples
//!
//! ## Streaming a directory of DICOM files into a volume
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use dicom_streaming_volume::{
//! #     DicomFileLoader, LoadContext, LoadOptions, LruFrameCache, PriorityScheduler, SortBy,
//! #     VolumeLoadController, VolumeLoader,
//! # };
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (volume, metadata) = VolumeLoader::from_directory::<f32>("dicom", SortBy::InstanceNumber)?;
//! let context = LoadContext::<f32>::new(
//!     Arc::new(PriorityScheduler::new(4)?),
//!     Arc::new(DicomFileLoader),
//!     Arc::new(LruFrameCache::with_mb_limit(512)),
//! )
//! .with_metadata(Arc::new(metadata));
//!
//! let controller = VolumeLoadController::new(Arc::new(volume), context, LoadOptions::default());
//! if let Some(report) = controller.load_async(0).await? {
//!     println!("{} of {} frames loaded", report.frames_loaded, report.num_frames);
//! }
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod cache;
pub mod controller;
pub mod decache;
pub mod element;
pub mod enums;
pub mod metadata;
pub mod ordering;
pub mod render;
pub mod scaling;
pub mod scheduler;
pub mod status;
pub mod task;
pub mod volume;
pub mod volume_loader;

pub use buffer::{FrameRange, FrameSlot, SharedBuffer};
pub use cache::{CacheError, CacheStats, FrameEntry, LruFrameCache, VolumeCache};
pub use controller::{LoadContext, LoadOptions, VolumeLoadController};
pub use decache::DecacheSummary;
pub use element::Element;
pub use enums::{ElementType, FrameOrder, FrameStorage, Modality, SortBy};
pub use metadata::{DicomMetadata, FrameMetadata, InMemoryMetadata, MetadataProvider};
pub use ordering::FrameOrdering;
pub use render::{NoopRenderSink, RenderSink, RenderThrottle};
pub use scaling::{FrameScaling, ScalingRecord, SuvRatios};
pub use scheduler::{ImmediateScheduler, PriorityScheduler, ScheduledJob, Scheduler};
pub use status::{LoadStatus, ProgressCallback, ProgressReport};
pub use task::{FrameError, FrameLoader, FrameTask};
pub use volume::{FrameId, Volume, VolumeError, VolumeGeometry, VolumeId};
pub use volume_loader::{DicomFileLoader, VolumeLoader, VolumeLoaderError};
