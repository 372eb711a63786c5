use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use ndarray::{Array2, Array3, ShapeError};
use thiserror::Error;
use uuid::Uuid;

use crate::buffer::SharedBuffer;
use crate::element::Element;
use crate::enums::ElementType;
use crate::metadata::MetadataProvider;
use crate::scaling::ScalingRecord;
use crate::status::{LoadState, LoadStatus};

/// Stable identifier of one frame (for DICOM files, the file path)
pub type FrameId = String;

#[derive(Debug, Error, PartialEq)]
pub enum VolumeError {
    #[error("Unsupported buffer type {element_type:?}: {reason}")]
    UnsupportedBufferType {
        element_type: ElementType,
        reason: &'static str,
    },

    #[error("Dimension mismatch: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },

    #[error("Frame {0} is being written by a load in progress")]
    FrameBusy(usize),
}

/// Unique id of a volume, also used as the cancellation tag of its frame tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(Uuid);

impl VolumeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VolumeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Spatial metadata of a volume, carried through to decached frames
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeGeometry {
    pub rows: usize,
    pub columns: usize,
    /// (row spacing, column spacing, slice spacing)
    pub spacing: (f32, f32, f32),
    pub origin: [f32; 3],
    pub direction: [f32; 9],
}

impl VolumeGeometry {
    pub fn new(rows: usize, columns: usize, spacing: (f32, f32, f32)) -> Self {
        Self {
            rows,
            columns,
            spacing,
            origin: [0.0; 3],
            direction: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        }
    }

    /// Number of elements in one frame
    pub fn frame_len(&self) -> usize {
        self.rows * self.columns
    }
}

/// A volume assembled from `N` ordered frames in one shared buffer
pub struct Volume<T: Element> {
    id: VolumeId,
    frame_ids: Vec<FrameId>,
    geometry: VolumeGeometry,
    buffer: Arc<SharedBuffer<T>>,
    scaling: OnceLock<ScalingRecord>,
    state: Mutex<LoadState>,
}

impl<T: Element> Volume<T> {
    pub fn new(frame_ids: Vec<FrameId>, geometry: VolumeGeometry) -> Self {
        let num_frames = frame_ids.len();
        Self {
            id: VolumeId::new(),
            buffer: Arc::new(SharedBuffer::new(num_frames, geometry.frame_len())),
            state: Mutex::new(LoadState::new(num_frames)),
            scaling: OnceLock::new(),
            frame_ids,
            geometry,
        }
    }

    pub fn id(&self) -> VolumeId {
        self.id
    }

    pub fn frame_ids(&self) -> &[FrameId] {
        &self.frame_ids
    }

    pub fn num_frames(&self) -> usize {
        self.frame_ids.len()
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    /// Get the dimensions of the volume (frames, rows, columns)
    pub fn dim(&self) -> (usize, usize, usize) {
        (self.num_frames(), self.geometry.rows, self.geometry.columns)
    }

    pub fn buffer(&self) -> &Arc<SharedBuffer<T>> {
        &self.buffer
    }

    pub fn byte_len(&self) -> usize {
        self.buffer.byte_len()
    }

    pub fn frame_byte_len(&self) -> usize {
        self.buffer.frame_byte_len()
    }

    pub fn scaling(&self) -> Option<&ScalingRecord> {
        self.scaling.get()
    }

    /// Compute the scaling record on first use; later calls return the same record
    pub(crate) fn scaling_or_init(&self, metadata: &dyn MetadataProvider) -> &ScalingRecord {
        self.scaling
            .get_or_init(|| ScalingRecord::compute(&self.frame_ids, metadata))
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, LoadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the load status (without its registered callbacks)
    pub fn load_status(&self) -> LoadStatus {
        self.state().status.snapshot()
    }

    pub fn is_loaded(&self) -> bool {
        self.state().status.loaded
    }

    pub fn is_loading(&self) -> bool {
        self.state().status.loading
    }

    /// Copy of one frame as a (rows, columns) array
    pub fn frame(&self, index: usize) -> Option<Array2<T>> {
        let data = self.buffer.copy_frame(index)?;
        Array2::from_shape_vec((self.geometry.rows, self.geometry.columns), data).ok()
    }

    /// Copy of the whole volume as a (frames, rows, columns) array
    pub fn to_array(&self) -> Result<Array3<T>, ShapeError> {
        Array3::from_shape_vec(self.dim(), self.buffer.to_vec())
    }

    /// Allocate an empty volume sharing this volume's geometry
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::DimensionMismatch`] if `frame_ids` does not
    /// have one id per frame of this volume.
    pub fn derive<U: Element>(&self, frame_ids: Vec<FrameId>) -> Result<Volume<U>, VolumeError> {
        if frame_ids.len() != self.num_frames() {
            return Err(VolumeError::DimensionMismatch {
                expected: self.dim(),
                actual: (frame_ids.len(), self.geometry.rows, self.geometry.columns),
            });
        }
        Ok(Volume::new(frame_ids, self.geometry.clone()))
    }

    /// Copy every frame of `other` into this volume, converting element types
    ///
    /// Dimensions are checked before any voxel is written.
    pub fn copy_frames_from<U: Element>(&self, other: &Volume<U>) -> Result<(), VolumeError> {
        if other.dim() != self.dim() {
            return Err(VolumeError::DimensionMismatch {
                expected: self.dim(),
                actual: other.dim(),
            });
        }
        if self.id == other.id {
            return Ok(());
        }
        for index in 0..self.num_frames() {
            let mut slot = self
                .buffer
                .claim(index)
                .ok_or(VolumeError::FrameBusy(index))?;
            other.buffer.read_frame(index, |source| {
                slot.with_frame(|target| {
                    for (dst, &src) in target.iter_mut().zip(source) {
                        *dst = T::from_f64(src.to_f64());
                    }
                })
            });
        }
        Ok(())
    }
}

impl<T: Element> fmt::Debug for Volume<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("id", &self.id)
            .field("dim", &self.dim())
            .field("element_type", &T::ELEMENT_TYPE)
            .finish()
    }
}
