//! Frame load tasks
//!
//! A [`FrameTask`] describes one frame fetch: which frame, where its bytes go
//! in the shared buffer, and how decoded values are rescaled. A
//! [`FrameLoader`] performs the fetch and decode and writes the result
//! through the task's [`FrameSlot`].

use thiserror::Error;

use crate::buffer::{FrameRange, FrameSlot};
use crate::element::Element;
use crate::scaling::{FrameScaling, SuvRatios};
use crate::volume::{FrameId, VolumeId};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FrameError {
    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Frame {index} expected {expected} elements, decoded {actual}")]
    LengthMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Loader panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameTask {
    pub frame_id: FrameId,
    /// Position in the volume's frame list
    pub frame_index: usize,
    /// Target byte range in the shared buffer
    pub range: FrameRange,
    pub priority: i32,
    pub cancel_tag: VolumeId,
    pub scaling: FrameScaling,
    pub ratios: Option<SuvRatios>,
    pub(crate) generation: u64,
}

/// Fetches and decodes one frame straight into its slot of the shared buffer
pub trait FrameLoader<T: Element>: Send + Sync {
    fn load_frame(&self, task: &FrameTask, slot: &mut FrameSlot<T>) -> Result<(), FrameError>;
}

/// Rescale `raw` decoded values into `slot`
///
/// # Errors
///
/// Returns [`FrameError::LengthMismatch`] without writing anything when the
/// decoded frame does not have exactly one value per element of the slot.
pub fn write_scaled<T, S>(
    slot: &mut FrameSlot<T>,
    raw: &[S],
    scaling: &FrameScaling,
) -> Result<(), FrameError>
where
    T: Element,
    S: Copy + Into<f64>,
{
    if raw.len() != slot.len() {
        return Err(FrameError::LengthMismatch {
            index: slot.index(),
            expected: slot.len(),
            actual: raw.len(),
        });
    }
    slot.with_frame(|frame| {
        if scaling.is_identity() {
            for (dst, &src) in frame.iter_mut().zip(raw) {
                *dst = T::from_f64(src.into());
            }
        } else {
            for (dst, &src) in frame.iter_mut().zip(raw) {
                *dst = T::from_f64(scaling.apply(src.into()));
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SharedBuffer;
    use std::sync::Arc;

    #[test]
    fn test_write_scaled() {
        let buffer = Arc::new(SharedBuffer::<f32>::new(2, 3));
        let mut slot = buffer.claim(1).unwrap();
        let scaling = FrameScaling {
            slope: 2.0,
            intercept: -1.0,
            suv_bw: None,
        };
        write_scaled(&mut slot, &[1u16, 2, 3], &scaling).unwrap();
        drop(slot);
        assert_eq!(buffer.to_vec(), vec![0.0, 0.0, 0.0, 1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_write_scaled_length_mismatch() {
        let buffer = Arc::new(SharedBuffer::<i16>::new(1, 4));
        let mut slot = buffer.claim(0).unwrap();
        let err = write_scaled(&mut slot, &[1i16, 2], &FrameScaling::IDENTITY).unwrap_err();
        assert_eq!(
            err,
            FrameError::LengthMismatch {
                index: 0,
                expected: 4,
                actual: 2
            }
        );
    }
}
