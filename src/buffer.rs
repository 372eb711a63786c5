//! Shared volume buffer
//!
//! One contiguous allocation of `frames × frame_len` elements. Writers never
//! see the whole buffer: they claim a [`FrameSlot`] for one frame index and
//! can only touch that frame's range. A frame index can be claimed by at most
//! one slot at a time, and frame ranges never overlap, so concurrent writers
//! from different frames cannot alias each other.

use std::cell::UnsafeCell;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::element::Element;

/// Byte range of one frame inside the shared buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRange {
    pub offset: usize,
    pub length: usize,
}

impl FrameRange {
    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    pub fn overlaps(&self, other: &FrameRange) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

struct FrameGuard {
    claimed: AtomicBool,
    access: RwLock<()>,
}

pub struct SharedBuffer<T> {
    data: Box<[UnsafeCell<T>]>,
    frame_len: usize,
    guards: Box<[FrameGuard]>,
}

// Every access to a frame's elements happens under that frame's `access`
// lock, and element ranges of distinct frames are disjoint.
unsafe impl<T: Element> Sync for SharedBuffer<T> {}

impl<T: Element> SharedBuffer<T> {
    /// Allocate a zeroed buffer for `num_frames` frames of `frame_len` elements
    pub fn new(num_frames: usize, frame_len: usize) -> Self {
        let data = (0..num_frames * frame_len)
            .map(|_| UnsafeCell::new(T::zeroed()))
            .collect();
        let guards = (0..num_frames)
            .map(|_| FrameGuard {
                claimed: AtomicBool::new(false),
                access: RwLock::new(()),
            })
            .collect();
        Self {
            data,
            frame_len,
            guards,
        }
    }

    pub fn num_frames(&self) -> usize {
        self.guards.len()
    }

    /// Number of elements per frame
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn frame_byte_len(&self) -> usize {
        self.frame_len * size_of::<T>()
    }

    pub fn byte_len(&self) -> usize {
        self.data.len() * size_of::<T>()
    }

    /// Byte range of frame `index`, or `None` when out of range
    pub fn frame_range(&self, index: usize) -> Option<FrameRange> {
        (index < self.num_frames()).then(|| FrameRange {
            offset: index * self.frame_byte_len(),
            length: self.frame_byte_len(),
        })
    }

    fn elements(&self, index: usize) -> Range<usize> {
        index * self.frame_len..(index + 1) * self.frame_len
    }

    /// Claim exclusive write access to frame `index`
    ///
    /// Returns `None` if the index is out of range or another slot for the
    /// same frame is still alive.
    pub fn claim(self: &Arc<Self>, index: usize) -> Option<FrameSlot<T>> {
        let guard = self.guards.get(index)?;
        guard
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(FrameSlot {
            buffer: Arc::clone(self),
            index,
        })
    }

    pub fn is_claimed(&self, index: usize) -> bool {
        self.guards
            .get(index)
            .is_some_and(|guard| guard.claimed.load(Ordering::Acquire))
    }

    /// Run `f` over the elements of frame `index`
    pub fn read_frame<R>(&self, index: usize, f: impl FnOnce(&[T]) -> R) -> Option<R> {
        let guard = self.guards.get(index)?;
        let _read = guard.access.read().unwrap_or_else(PoisonError::into_inner);
        let cells = &self.data[self.elements(index)];
        // SAFETY: `UnsafeCell<T>` has the layout of `T`. The read lock keeps
        // `write_frame` out of this frame for the lifetime of `frame`, and
        // `write_frame` is the only way to mutate these cells.
        let frame = unsafe { std::slice::from_raw_parts(cells.as_ptr() as *const T, cells.len()) };
        Some(f(frame))
    }

    pub fn copy_frame(&self, index: usize) -> Option<Vec<T>> {
        self.read_frame(index, <[T]>::to_vec)
    }

    /// Copy the whole buffer, frame by frame
    pub fn to_vec(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.data.len());
        for index in 0..self.num_frames() {
            self.read_frame(index, |frame| out.extend_from_slice(frame));
        }
        out
    }

    fn write_frame<R>(&self, index: usize, f: impl FnOnce(&mut [T]) -> R) -> R {
        let guard = &self.guards[index];
        let _write = guard.access.write().unwrap_or_else(PoisonError::into_inner);
        let cells = &self.data[self.elements(index)];
        let first = UnsafeCell::raw_get(cells.as_ptr());
        // SAFETY: the write lock excludes every other reader and writer of
        // this frame while `frame` is alive, `elements(index)` covers only
        // this frame's cells, and `UnsafeCell` permits mutation through a
        // shared reference.
        let frame = unsafe { std::slice::from_raw_parts_mut(first, cells.len()) };
        f(frame)
    }
}

/// Exclusive write access to one frame of a [`SharedBuffer`]
///
/// Dropping the slot releases the claim.
pub struct FrameSlot<T: Element> {
    buffer: Arc<SharedBuffer<T>>,
    index: usize,
}

impl<T: Element> FrameSlot<T> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of elements in the frame
    pub fn len(&self) -> usize {
        self.buffer.frame_len
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.frame_len == 0
    }

    pub fn range(&self) -> FrameRange {
        FrameRange {
            offset: self.index * self.buffer.frame_byte_len(),
            length: self.buffer.frame_byte_len(),
        }
    }

    /// Mutable access to this frame's elements only
    pub fn with_frame<R>(&mut self, f: impl FnOnce(&mut [T]) -> R) -> R {
        self.buffer.write_frame(self.index, f)
    }

    /// Copy `values` into the frame; `false` when the lengths differ
    pub fn copy_from_slice(&mut self, values: &[T]) -> bool {
        if values.len() != self.len() {
            return false;
        }
        self.with_frame(|frame| frame.copy_from_slice(values));
        true
    }
}

impl<T: Element> Drop for FrameSlot<T> {
    fn drop(&mut self) {
        self.buffer.guards[self.index]
            .claimed
            .store(false, Ordering::Release);
    }
}

impl<T: Element> std::fmt::Debug for FrameSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSlot")
            .field("index", &self.index)
            .field("range", &self.range())
            .finish()
    }
}
