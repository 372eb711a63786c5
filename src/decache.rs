//! Retiring a volume's shared buffer
//!
//! Either drops the volume outright or first salvages its loaded frames as
//! independent single-frame cache entries, as far as the cache budget allows.
//! Decaching never fails: at worst no frame is salvaged and the volume is
//! still removed.

use std::sync::Arc;

use log::{info, warn};

use crate::cache::{FrameEntry, VolumeCache};
use crate::element::Element;
use crate::enums::FrameStorage;
use crate::volume::Volume;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecacheSummary {
    /// Frames inserted into the cache as independent entries
    pub frames_converted: usize,
    /// Frames that were never loaded and so had nothing to salvage
    pub frames_not_loaded: usize,
    /// Loaded frames lost because the budget ran out
    pub frames_dropped: usize,
    /// Frames the cache refused to insert
    pub insert_failures: usize,
    pub volume_removed: bool,
}

pub fn decache<T: Element>(
    volume: &Volume<T>,
    cache: &dyn VolumeCache<T>,
    completely_remove: bool,
    storage: FrameStorage,
) -> DecacheSummary {
    let mut summary = DecacheSummary::default();
    if completely_remove {
        cache.remove_volume(volume.id());
        summary.volume_removed = true;
        info!("volume {} removed from cache", volume.id());
        return summary;
    }

    let frame_bytes = volume.frame_byte_len();
    let cached_frames = volume.load_status().cached_frames;
    let loaded_frames = cached_frames.iter().filter(|&&cached| cached).count();
    let mut bytes_remaining =
        cache.evict_until_bytes_available(frame_bytes * loaded_frames, volume.frame_ids());

    let mut visited_loaded = 0;
    for (index, &cached) in cached_frames.iter().enumerate() {
        if !cached {
            summary.frames_not_loaded += 1;
            continue;
        }
        if bytes_remaining < frame_bytes {
            summary.frames_dropped = loaded_frames - visited_loaded;
            summary.frames_not_loaded += cached_frames[index..].iter().filter(|&&c| !c).count();
            break;
        }
        visited_loaded += 1;
        bytes_remaining -= frame_bytes;

        let Some(entry) = frame_entry(volume, index, storage) else {
            summary.insert_failures += 1;
            continue;
        };
        match cache.put_frame(entry) {
            Ok(()) => summary.frames_converted += 1,
            Err(err) => {
                warn!("frame {index} of volume {} not cached: {err}", volume.id());
                summary.insert_failures += 1;
            }
        }
    }

    cache.remove_volume(volume.id());
    summary.volume_removed = true;
    info!(
        "volume {} decached: {} frames converted, {} dropped, {} not loaded",
        volume.id(),
        summary.frames_converted,
        summary.frames_dropped,
        summary.frames_not_loaded
    );
    summary
}

fn frame_entry<T: Element>(
    volume: &Volume<T>,
    index: usize,
    storage: FrameStorage,
) -> Option<FrameEntry<T>> {
    let geometry = volume.geometry();
    let frame_id = volume.frame_ids().get(index)?.clone();
    let entry = match storage {
        FrameStorage::SharedView => FrameEntry::shared(
            frame_id,
            geometry.rows,
            geometry.columns,
            Arc::clone(volume.buffer()),
            index,
        )?,
        FrameStorage::Copied => FrameEntry::owned(
            frame_id,
            geometry.rows,
            geometry.columns,
            volume.buffer().copy_frame(index)?,
        ),
    };
    Some(
        entry
            .with_spacing((geometry.spacing.0, geometry.spacing.1))
            .with_scaling(volume.scaling().map(|record| record.frame(index))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, LruFrameCache};
    use crate::volume::{FrameId, VolumeGeometry, VolumeId};

    /// Refuses one frame id, delegates everything else
    struct RefusingCache {
        inner: LruFrameCache<u16>,
        refused: FrameId,
        removed: std::sync::Mutex<Vec<VolumeId>>,
    }

    impl VolumeCache<u16> for RefusingCache {
        fn put_frame(&self, entry: FrameEntry<u16>) -> Result<(), CacheError> {
            if entry.frame_id == self.refused {
                return Err(CacheError::InsufficientSpace {
                    required: entry.byte_len(),
                    available: 0,
                });
            }
            self.inner.put_frame(entry)
        }

        fn get_frame(&self, frame_id: &str) -> Option<Arc<FrameEntry<u16>>> {
            self.inner.get_frame(frame_id)
        }

        fn remove_volume(&self, volume_id: VolumeId) {
            self.removed.lock().unwrap().push(volume_id);
            self.inner.remove_volume(volume_id);
        }

        fn evict_until_bytes_available(&self, bytes: usize, exclude: &[FrameId]) -> usize {
            self.inner.evict_until_bytes_available(bytes, exclude)
        }
    }

    fn loaded_volume(num_frames: usize, loaded: &[usize]) -> Volume<u16> {
        let ids = (0..num_frames).map(|i| format!("f{i}")).collect();
        let volume = Volume::new(ids, VolumeGeometry::new(2, 2, (0.5, 0.5, 2.0)));
        {
            let mut state = volume.state();
            for &index in loaded {
                state.status.cached_frames[index] = true;
                let value = index as u16 + 1;
                volume
                    .buffer()
                    .claim(index)
                    .unwrap()
                    .copy_from_slice(&[value, value * 2, value, value]);
            }
        }
        volume
    }

    #[test]
    fn test_complete_removal_converts_nothing() {
        let volume = loaded_volume(3, &[0, 1, 2]);
        let cache = LruFrameCache::new(1 << 20);
        cache.put_volume(volume.id(), volume.byte_len()).unwrap();

        let summary = decache(&volume, &cache, true, FrameStorage::Copied);
        assert!(summary.volume_removed);
        assert_eq!(summary.frames_converted, 0);
        assert!(!cache.contains_volume(volume.id()));
        assert_eq!(cache.stats().frame_count, 0);
    }

    #[test]
    fn test_converts_loaded_frames_with_range() {
        let volume = loaded_volume(3, &[0, 2]);
        let cache = LruFrameCache::new(1 << 20);

        let summary = decache(&volume, &cache, false, FrameStorage::Copied);
        assert_eq!(summary.frames_converted, 2);
        assert_eq!(summary.frames_not_loaded, 1);
        assert_eq!(summary.frames_dropped, 0);

        let frame = cache.get_frame("f2").unwrap();
        assert_eq!(frame.to_vec(), vec![3, 6, 3, 3]);
        assert_eq!((frame.min_value, frame.max_value), (3.0, 6.0));
        assert_eq!(frame.spacing, (0.5, 0.5));
        assert!(!frame.is_shared_view());
        assert!(cache.get_frame("f1").is_none());
    }

    #[test]
    fn test_shared_views_outlive_volume() {
        let cache = LruFrameCache::new(1 << 20);
        {
            let volume = loaded_volume(2, &[0, 1]);
            decache(&volume, &cache, false, FrameStorage::SharedView);
        }
        let frame = cache.get_frame("f1").unwrap();
        assert!(frame.is_shared_view());
        assert_eq!(frame.to_vec(), vec![2, 4, 2, 2]);
    }

    #[test]
    fn test_budget_stops_conversion() {
        let volume = loaded_volume(10, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let frame_bytes = volume.frame_byte_len();
        let cache = LruFrameCache::new(4 * frame_bytes);

        let summary = decache(&volume, &cache, false, FrameStorage::Copied);
        assert_eq!(summary.frames_converted, 4);
        assert_eq!(summary.frames_dropped, 6);
        assert!(summary.volume_removed);
        assert!(cache.get_frame("f3").is_some());
        assert!(cache.get_frame("f4").is_none());
    }

    #[test]
    fn test_refused_insert_does_not_stop_conversion() {
        let volume = loaded_volume(4, &[0, 1, 2, 3]);
        let cache = RefusingCache {
            inner: LruFrameCache::new(1 << 20),
            refused: "f1".to_string(),
            removed: Default::default(),
        };

        let summary = decache(&volume, &cache, false, FrameStorage::Copied);
        assert_eq!(summary.insert_failures, 1);
        assert_eq!(summary.frames_converted, 3);
        assert_eq!(summary.frames_dropped, 0);
        assert!(summary.volume_removed);
        assert_eq!(*cache.removed.lock().unwrap(), vec![volume.id()]);

        assert!(cache.get_frame("f1").is_none());
        assert_eq!(cache.get_frame("f2").unwrap().to_vec(), vec![3, 6, 3, 3]);
        assert_eq!(cache.get_frame("f3").unwrap().to_vec(), vec![4, 8, 4, 4]);
    }
}
