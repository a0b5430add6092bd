//! Smoothed control parameters.
//!
//! The control thread writes targets through a `ParamHandle` (lock-free, never
//! blocks). The render side owns a `ParameterRamp` that reads the latest target
//! once per block and moves toward it along an exponential approach, so a
//! burst of writes always ramps toward the most recent value.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Values this close to the target snap onto it.
const SNAP_EPSILON: f32 = 1e-5;

struct ParamCell {
    target: AtomicU32,
    time_constant: AtomicU32,
}

/// Control-side handle to one smoothed parameter. Cheap to clone.
#[derive(Clone)]
pub struct ParamHandle {
    cell: Arc<ParamCell>,
}

impl ParamHandle {
    pub fn new(initial: f32, time_constant: f32) -> Self {
        ParamHandle {
            cell: Arc::new(ParamCell {
                target: AtomicU32::new(initial.to_bits()),
                time_constant: AtomicU32::new(time_constant.to_bits()),
            }),
        }
    }

    /// Schedule an approach toward `value` with time constant `tau` seconds.
    /// A later call replaces the pending target.
    pub fn set_target(&self, value: f32, tau: f32) {
        self.cell.time_constant.store(tau.max(0.0).to_bits(), Ordering::Relaxed);
        self.cell.target.store(value.to_bits(), Ordering::Release);
    }

    pub fn target(&self) -> f32 {
        f32::from_bits(self.cell.target.load(Ordering::Acquire))
    }

    pub fn time_constant(&self) -> f32 {
        f32::from_bits(self.cell.time_constant.load(Ordering::Relaxed))
    }
}

impl std::fmt::Debug for ParamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamHandle")
            .field("target", &self.target())
            .field("time_constant", &self.time_constant())
            .finish()
    }
}

/// Render-side state of one smoothed parameter.
pub struct ParameterRamp {
    handle: ParamHandle,
    current: f32,
    sample_rate: f32,
}

impl ParameterRamp {
    /// Starts settled at the handle's current target.
    pub fn new(handle: ParamHandle, sample_rate: u32) -> Self {
        let current = handle.target();
        ParameterRamp {
            handle,
            current,
            sample_rate: sample_rate as f32,
        }
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn is_settled(&self) -> bool {
        self.current == self.handle.target()
    }

    /// Advance by `frames` and return the value at the start and end of the block.
    pub fn advance(&mut self, frames: usize) -> (f32, f32) {
        let start = self.current;
        let target = self.handle.target();
        let tau = self.handle.time_constant();

        if tau <= 0.0 || start == target {
            self.current = target;
            return (start, target);
        }

        let coef = 1.0 - (-(frames as f32) / (tau * self.sample_rate)).exp();
        let mut end = start + (target - start) * coef;
        if (end - target).abs() < SNAP_EPSILON {
            end = target;
        }
        self.current = end;
        (start, end)
    }

    /// Multiply an interleaved block by the ramped gain, interpolating across it.
    pub fn apply(&mut self, block: &mut [f32], channels: usize) {
        let frames = block.len() / channels.max(1);
        let (start, end) = self.advance(frames);
        apply_gain_ramp(block, channels, start, end);
    }
}

/// Scale an interleaved block by a gain moving linearly from `start` to `end`.
pub fn apply_gain_ramp(block: &mut [f32], channels: usize, start: f32, end: f32) {
    let channels = channels.max(1);
    let frames = block.len() / channels;
    if start == end {
        if start != 1.0 {
            block.iter_mut().for_each(|s| *s *= start);
        }
        return;
    }
    let step = (end - start) / frames.max(1) as f32;
    for (i, frame) in block.chunks_mut(channels).enumerate() {
        let gain = start + step * (i + 1) as f32;
        frame.iter_mut().for_each(|s| *s *= gain);
    }
}
