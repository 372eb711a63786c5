//! Volume and frame cache boundary
//!
//! [`VolumeCache`] is the process-wide cache the controller and the decache
//! manager talk to. [`LruFrameCache`] is a memory-bounded implementation that
//! evicts least recently used frames first.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;
use ndarray::Array2;
use rayon::prelude::*;
use thiserror::Error;

use crate::buffer::SharedBuffer;
use crate::element::Element;
use crate::scaling::FrameScaling;
use crate::volume::{FrameId, VolumeId};

#[derive(Debug, Error, PartialEq)]
pub enum CacheError {
    #[error("Not enough cache space: {required} bytes required, {available} available")]
    InsufficientSpace { required: usize, available: usize },
}

enum FramePixels<T: Element> {
    /// A frame of a still-live volume buffer
    Shared {
        buffer: Arc<SharedBuffer<T>>,
        index: usize,
    },
    Owned(Vec<T>),
}

/// An independent single-frame cache entry
pub struct FrameEntry<T: Element> {
    pub frame_id: FrameId,
    pub rows: usize,
    pub columns: usize,
    /// (row spacing, column spacing)
    pub spacing: (f32, f32),
    /// Scaling already applied to the stored values, `None` for raw values
    pub scaling: Option<FrameScaling>,
    pub min_value: f64,
    pub max_value: f64,
    pixels: FramePixels<T>,
}

impl<T: Element> FrameEntry<T> {
    fn new(frame_id: FrameId, rows: usize, columns: usize, pixels: FramePixels<T>) -> Self {
        let mut entry = Self {
            frame_id,
            rows,
            columns,
            spacing: (1.0, 1.0),
            scaling: None,
            min_value: 0.0,
            max_value: 0.0,
            pixels,
        };
        (entry.min_value, entry.max_value) = entry.with_pixels(value_range);
        entry
    }

    pub fn owned(frame_id: FrameId, rows: usize, columns: usize, pixels: Vec<T>) -> Self {
        Self::new(frame_id, rows, columns, FramePixels::Owned(pixels))
    }

    /// Entry aliasing frame `index` of `buffer`; `None` if the index is out of range
    pub fn shared(
        frame_id: FrameId,
        rows: usize,
        columns: usize,
        buffer: Arc<SharedBuffer<T>>,
        index: usize,
    ) -> Option<Self> {
        (index < buffer.num_frames())
            .then(|| Self::new(frame_id, rows, columns, FramePixels::Shared { buffer, index }))
    }

    pub fn with_spacing(mut self, spacing: (f32, f32)) -> Self {
        self.spacing = spacing;
        self
    }

    pub fn with_scaling(mut self, scaling: Option<FrameScaling>) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn is_shared_view(&self) -> bool {
        matches!(self.pixels, FramePixels::Shared { .. })
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.with_pixels(<[T]>::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len() * size_of::<T>()
    }

    pub fn with_pixels<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        match &self.pixels {
            FramePixels::Owned(pixels) => f(pixels),
            FramePixels::Shared { buffer, index } => match buffer.read_frame(*index, f) {
                Some(result) => result,
                None => unreachable!("shared entries are only built for valid frame indices"),
            },
        }
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.with_pixels(<[T]>::to_vec)
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        self.with_pixels(|pixels| bytemuck::cast_slice(pixels).to_vec())
    }

    pub fn to_array(&self) -> Option<Array2<T>> {
        Array2::from_shape_vec((self.rows, self.columns), self.to_vec()).ok()
    }
}

impl<T: Element> fmt::Debug for FrameEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameEntry")
            .field("frame_id", &self.frame_id)
            .field("rows", &self.rows)
            .field("columns", &self.columns)
            .field("scaling", &self.scaling)
            .field("min_value", &self.min_value)
            .field("max_value", &self.max_value)
            .field("shared", &self.is_shared_view())
            .finish()
    }
}

/// Minimum and maximum value, `(0, 0)` for an empty frame
pub fn value_range<T: Element>(values: &[T]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    values
        .par_iter()
        .map(|value| value.to_f64())
        .fold(
            || (f64::INFINITY, f64::NEG_INFINITY),
            |(min, max), value| (min.min(value), max.max(value)),
        )
        .reduce(
            || (f64::INFINITY, f64::NEG_INFINITY),
            |a, b| (a.0.min(b.0), a.1.max(b.1)),
        )
}

pub trait VolumeCache<T: Element>: Send + Sync {
    fn put_frame(&self, entry: FrameEntry<T>) -> Result<(), CacheError>;

    fn get_frame(&self, frame_id: &str) -> Option<Arc<FrameEntry<T>>>;

    fn remove_volume(&self, volume_id: VolumeId);

    /// Evict other entries until `bytes` fit or nothing evictable is left
    ///
    /// Frames listed in `exclude` are never evicted. Returns the number of
    /// bytes available afterwards.
    fn evict_until_bytes_available(&self, bytes: usize, exclude: &[FrameId]) -> usize;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub frame_count: usize,
    pub volume_count: usize,
    pub memory_used: usize,
    pub memory_limit: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheState<T: Element> {
    frames: HashMap<FrameId, Arc<FrameEntry<T>>>,
    /// Most recently used at the back
    lru_queue: VecDeque<FrameId>,
    volumes: HashMap<VolumeId, usize>,
    memory_used: usize,
    memory_limit: usize,
    stats: CacheStats,
}

impl<T: Element> CacheState<T> {
    fn available(&self) -> usize {
        self.memory_limit.saturating_sub(self.memory_used)
    }

    fn touch(&mut self, frame_id: &str) {
        self.lru_queue.retain(|id| id != frame_id);
        self.lru_queue.push_back(frame_id.to_string());
    }

    fn remove_frame(&mut self, frame_id: &str) -> Option<Arc<FrameEntry<T>>> {
        let entry = self.frames.remove(frame_id)?;
        self.lru_queue.retain(|id| id != frame_id);
        self.memory_used = self.memory_used.saturating_sub(entry.byte_len());
        Some(entry)
    }

    /// Evict least recently used frames outside `exclude` until `bytes` fit
    fn evict_to_fit(&mut self, bytes: usize, exclude: &HashSet<&str>) {
        let mut position = 0;
        while self.available() < bytes && position < self.lru_queue.len() {
            if exclude.contains(self.lru_queue[position].as_str()) {
                position += 1;
                continue;
            }
            if let Some(frame_id) = self.lru_queue.remove(position) {
                if let Some(entry) = self.frames.remove(&frame_id) {
                    self.memory_used = self.memory_used.saturating_sub(entry.byte_len());
                    self.stats.evictions += 1;
                }
            }
        }
    }
}

/// Memory-bounded LRU cache of frame entries and volume reservations
pub struct LruFrameCache<T: Element> {
    state: Mutex<CacheState<T>>,
}

impl<T: Element> LruFrameCache<T> {
    pub fn new(memory_limit: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                frames: HashMap::new(),
                lru_queue: VecDeque::new(),
                volumes: HashMap::new(),
                memory_used: 0,
                memory_limit,
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn with_mb_limit(megabytes: usize) -> Self {
        Self::new(megabytes * 1024 * 1024)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `bytes` for a volume's shared buffer, evicting frames if needed
    pub fn put_volume(&self, volume_id: VolumeId, bytes: usize) -> Result<(), CacheError> {
        let mut state = self.lock();
        if let Some(previous) = state.volumes.remove(&volume_id) {
            state.memory_used = state.memory_used.saturating_sub(previous);
        }
        state.evict_to_fit(bytes, &HashSet::new());
        if state.available() < bytes {
            return Err(CacheError::InsufficientSpace {
                required: bytes,
                available: state.available(),
            });
        }
        state.volumes.insert(volume_id, bytes);
        state.memory_used += bytes;
        Ok(())
    }

    pub fn contains_volume(&self, volume_id: VolumeId) -> bool {
        self.lock().volumes.contains_key(&volume_id)
    }

    pub fn contains_frame(&self, frame_id: &str) -> bool {
        self.lock().frames.contains_key(frame_id)
    }

    pub fn remove_frame(&self, frame_id: &str) -> Option<Arc<FrameEntry<T>>> {
        self.lock().remove_frame(frame_id)
    }

    pub fn memory_used(&self) -> usize {
        self.lock().memory_used
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            frame_count: state.frames.len(),
            volume_count: state.volumes.len(),
            memory_used: state.memory_used,
            memory_limit: state.memory_limit,
            ..state.stats
        }
    }
}

impl<T: Element> VolumeCache<T> for LruFrameCache<T> {
    fn put_frame(&self, entry: FrameEntry<T>) -> Result<(), CacheError> {
        let mut state = self.lock();
        let frame_id = entry.frame_id.clone();
        let required = entry.byte_len();
        state.remove_frame(&frame_id);
        state.evict_to_fit(required, &HashSet::new());
        if state.available() < required {
            return Err(CacheError::InsufficientSpace {
                required,
                available: state.available(),
            });
        }
        state.memory_used += required;
        state.touch(&frame_id);
        state.frames.insert(frame_id, Arc::new(entry));
        Ok(())
    }

    fn get_frame(&self, frame_id: &str) -> Option<Arc<FrameEntry<T>>> {
        let mut state = self.lock();
        match state.frames.get(frame_id).cloned() {
            Some(entry) => {
                state.stats.hits += 1;
                state.touch(frame_id);
                Some(entry)
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    fn remove_volume(&self, volume_id: VolumeId) {
        let mut state = self.lock();
        if let Some(bytes) = state.volumes.remove(&volume_id) {
            state.memory_used = state.memory_used.saturating_sub(bytes);
            debug!("released {bytes} bytes of volume {volume_id}");
        }
    }

    fn evict_until_bytes_available(&self, bytes: usize, exclude: &[FrameId]) -> usize {
        let mut state = self.lock();
        let exclude: HashSet<&str> = exclude.iter().map(String::as_str).collect();
        state.evict_to_fit(bytes, &exclude);
        state.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, len: usize) -> FrameEntry<u8> {
        FrameEntry::owned(id.to_string(), 1, len, vec![7; len])
    }

    #[test]
    fn test_basic_put_get() {
        let cache = LruFrameCache::new(1024);
        cache.put_frame(entry("a", 100)).unwrap();

        let cached = cache.get_frame("a").expect("frame should be cached");
        assert_eq!(cached.len(), 100);
        assert_eq!(cached.max_value, 7.0);
        assert!(cache.get_frame("b").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.memory_used, 100);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = LruFrameCache::new(250);
        cache.put_frame(entry("a", 100)).unwrap();
        cache.put_frame(entry("b", 100)).unwrap();
        assert!(cache.get_frame("a").is_some());

        cache.put_frame(entry("c", 100)).unwrap();
        assert!(cache.contains_frame("a"));
        assert!(!cache.contains_frame("b"));
        assert!(cache.contains_frame("c"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_replacing_frame_keeps_accounting() {
        let cache = LruFrameCache::new(1000);
        cache.put_frame(entry("a", 100)).unwrap();
        cache.put_frame(entry("a", 300)).unwrap();
        assert_eq!(cache.memory_used(), 300);
        assert_eq!(cache.stats().frame_count, 1);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let cache = LruFrameCache::new(50);
        let err = cache.put_frame(entry("a", 100)).unwrap_err();
        assert_eq!(
            err,
            CacheError::InsufficientSpace {
                required: 100,
                available: 50
            }
        );
    }

    #[test]
    fn test_volume_reservation() {
        let cache = LruFrameCache::<u8>::new(1000);
        let volume = VolumeId::new();
        cache.put_volume(volume, 600).unwrap();
        assert!(cache.contains_volume(volume));
        assert!(cache.put_volume(VolumeId::new(), 600).is_err());

        cache.remove_volume(volume);
        assert!(!cache.contains_volume(volume));
        assert_eq!(cache.memory_used(), 0);
    }

    #[test]
    fn test_evict_until_bytes_available_respects_exclusions() {
        let cache = LruFrameCache::new(300);
        cache.put_frame(entry("keep", 100)).unwrap();
        cache.put_frame(entry("old", 100)).unwrap();
        cache.put_frame(entry("older", 100)).unwrap();

        let available = cache.evict_until_bytes_available(300, &["keep".to_string()]);
        assert_eq!(available, 200);
        assert!(cache.contains_frame("keep"));
        assert!(!cache.contains_frame("old"));
        assert!(!cache.contains_frame("older"));
    }

    #[test]
    fn test_value_range() {
        assert_eq!(value_range::<i16>(&[]), (0.0, 0.0));
        assert_eq!(value_range(&[3i16, -7, 12, 0]), (-7.0, 12.0));
    }

    #[test]
    fn test_shared_view_entry() {
        let buffer = Arc::new(SharedBuffer::<u16>::new(2, 3));
        buffer.claim(1).unwrap().copy_from_slice(&[4, 9, 1]);
        let entry = FrameEntry::shared("f1".to_string(), 1, 3, Arc::clone(&buffer), 1).unwrap();
        assert!(entry.is_shared_view());
        assert!(FrameEntry::shared("f2".to_string(), 1, 3, Arc::clone(&buffer), 2).is_none());
        assert_eq!(entry.to_vec(), vec![4, 9, 1]);
        assert_eq!((entry.min_value, entry.max_value), (1.0, 9.0));
        assert_eq!(entry.byte_len(), 6);
        assert_eq!(entry.as_bytes().len(), 6);
        assert_eq!(entry.to_array().unwrap()[[0, 1]], 9);
    }
}
