//! Frame submission order
//!
//! Strategies return frame indices in the order they should be submitted.
//! Every strategy yields a permutation of `0..frame_ids.len()`.

use crate::enums::FrameOrder;
use crate::volume::FrameId;

pub trait FrameOrdering: Send + Sync {
    fn order(&self, frame_ids: &[FrameId]) -> Vec<usize>;
}

impl FrameOrdering for FrameOrder {
    fn order(&self, frame_ids: &[FrameId]) -> Vec<usize> {
        let num_frames = frame_ids.len();
        match self {
            FrameOrder::Sequential => (0..num_frames).collect(),
            FrameOrder::MiddleOut => middle_out(num_frames),
            FrameOrder::Interleaved => interleaved(num_frames),
        }
    }
}

/// Middle frame first, then alternately one below and one above
fn middle_out(num_frames: usize) -> Vec<usize> {
    if num_frames == 0 {
        return Vec::new();
    }
    let middle = num_frames / 2;
    let mut order = Vec::with_capacity(num_frames);
    order.push(middle);
    for step in 1..=middle.max(num_frames - middle) {
        if let Some(lower) = middle.checked_sub(step) {
            order.push(lower);
        }
        if middle + step < num_frames {
            order.push(middle + step);
        }
    }
    order
}

// (stride, offset) stages: coarse coverage of the whole volume first
const INTERLEAVE_STAGES: [(usize, usize); 3] = [(4, 0), (4, 2), (2, 1)];

fn interleaved(num_frames: usize) -> Vec<usize> {
    let mut queued = vec![false; num_frames];
    let mut order = Vec::with_capacity(num_frames);
    let mut push = |index: usize, order: &mut Vec<usize>| {
        if !queued[index] {
            queued[index] = true;
            order.push(index);
        }
    };

    for (stride, offset) in INTERLEAVE_STAGES {
        for index in (offset..num_frames).step_by(stride) {
            push(index, &mut order);
        }
        // the last frame bounds the volume, fetch it with the first stage
        if offset == 0 && num_frames > 0 {
            push(num_frames - 1, &mut order);
        }
    }
    for index in 0..num_frames {
        push(index, &mut order);
    }
    order
}
