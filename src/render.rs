//! Render/texture consumer boundary and the auto-render policy

/// Consumer of frame updates, typically a texture uploader and viewport
///
/// Both calls are fire-and-forget.
pub trait RenderSink: Send + Sync {
    /// Frame `index` of the shared buffer holds new data
    fn mark_frame_updated(&self, index: usize);

    fn request_render(&self);
}

/// Sink for hosts without a renderer attached
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRenderSink;

impl RenderSink for NoopRenderSink {
    fn mark_frame_updated(&self, _index: usize) {}

    fn request_render(&self) {}
}

/// Bounds re-render requests to about `1 / percentage` per load
///
/// The threshold starts at `num_frames × percentage` processed frames and
/// advances by the same increment every time it is crossed. The last frame
/// always requests a render.
#[derive(Debug, Clone)]
pub struct RenderThrottle {
    num_frames: usize,
    increment: f64,
    next: f64,
    enabled: bool,
}

impl RenderThrottle {
    pub fn new(num_frames: usize, percentage: f64) -> Self {
        let increment = (num_frames as f64 * percentage).max(1.0);
        Self {
            num_frames,
            increment,
            next: increment,
            enabled: true,
        }
    }

    pub fn disabled(num_frames: usize) -> Self {
        Self {
            enabled: false,
            ..Self::new(num_frames, 1.0)
        }
    }

    /// Whether a render should be requested after `frames_processed` frames
    pub fn on_frame_processed(&mut self, frames_processed: usize) -> bool {
        if !self.enabled {
            return false;
        }
        let processed = frames_processed as f64;
        if processed < self.next {
            return frames_processed == self.num_frames;
        }
        while self.next <= processed {
            self.next += self.increment;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_renders(num_frames: usize, percentage: f64) -> usize {
        let mut throttle = RenderThrottle::new(num_frames, percentage);
        (1..=num_frames)
            .filter(|&processed| throttle.on_frame_processed(processed))
            .count()
    }

    #[test]
    fn test_render_count_is_bounded() {
        assert_eq!(count_renders(1000, 0.02), 50);
        assert_eq!(count_renders(5000, 0.02), 50);
        assert!(count_renders(333, 0.02) <= 51);
        assert_eq!(count_renders(1000, 0.1), 10);
    }

    #[test]
    fn test_small_volumes_render_every_frame() {
        assert_eq!(count_renders(3, 0.02), 3);
        assert_eq!(count_renders(0, 0.02), 0);
    }

    #[test]
    fn test_last_frame_always_renders() {
        let mut throttle = RenderThrottle::new(150, 0.02);
        assert!(!throttle.on_frame_processed(1));
        assert!(throttle.on_frame_processed(3));
        assert!(throttle.on_frame_processed(149));
        assert!(throttle.on_frame_processed(150));

        let mut throttle = RenderThrottle::new(10, 0.3);
        assert!(throttle.on_frame_processed(9));
        assert!(throttle.on_frame_processed(10));
    }

    #[test]
    fn test_disabled_never_renders() {
        let mut throttle = RenderThrottle::disabled(4);
        assert!((1..=4).all(|processed| !throttle.on_frame_processed(processed)));
    }
}
