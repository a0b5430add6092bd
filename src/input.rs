//! Per-channel input buffer between a producer (stream decoder or capture
//! device) and the renderer.
//!
//! Every bind gets a new generation. Producers tag each push with the
//! generation they were started for, so audio from a superseded session can
//! never reach the graph, even if its thread is still winding down.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Channel is paused; audio was discarded.
    Paused,
    /// A newer bind owns the channel; the producer should stop.
    Superseded,
}

struct InputState {
    generation: u64,
    /// Highest generation handed out, current or reserved.
    issued: u64,
    samples: VecDeque<f32>,
    paused: bool,
    dropped_frames: u64,
}

/// Shared stereo buffer feeding one channel strip.
#[derive(Clone)]
pub struct ChannelInput {
    state: Arc<Mutex<InputState>>,
    sample_rate: u32,
    high_water_frames: usize,
    max_frames: usize,
}

impl ChannelInput {
    pub fn new(sample_rate: u32, high_water_frames: usize, max_frames: usize) -> Self {
        ChannelInput {
            state: Arc::new(Mutex::new(InputState {
                generation: 0,
                issued: 0,
                samples: VecDeque::new(),
                paused: false,
                dropped_frames: 0,
            })),
            sample_rate,
            high_water_frames,
            max_frames: max_frames.max(high_water_frames),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Invalidate the current producer and start a fresh, empty generation.
    pub fn rebind(&self) -> u64 {
        let mut state = self.state.lock();
        state.issued += 1;
        state.generation = state.issued;
        state.samples.clear();
        state.paused = false;
        state.generation
    }

    /// Hand out a generation for a producer that is not ready yet. The
    /// current producer keeps the channel until `adopt` succeeds.
    pub fn reserve(&self) -> u64 {
        let mut state = self.state.lock();
        state.issued += 1;
        state.issued
    }

    /// Make a reserved generation current. Fails if a later bind got there
    /// first; the reservation is then dead.
    pub fn adopt(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if generation <= state.generation {
            return false;
        }
        state.generation = generation;
        state.samples.clear();
        state.paused = false;
        true
    }

    /// Start a producer on a reserved generation and give it the channel
    /// once `start` succeeds. On failure the current producer keeps feeding.
    pub fn hand_over<P>(&self, start: impl FnOnce(u64) -> Result<P, String>) -> Result<P, String> {
        let generation = self.reserve();
        let producer = start(generation)?;
        if !self.adopt(generation) {
            return Err("input was rebound while the new source was opening".into());
        }
        Ok(producer)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    /// Append interleaved stereo samples at the engine rate.
    pub fn push(&self, generation: u64, samples: &[f32]) -> PushOutcome {
        let mut state = self.state.lock();
        if state.generation != generation {
            return PushOutcome::Superseded;
        }
        if state.paused {
            return PushOutcome::Paused;
        }
        state.samples.extend(samples.iter().copied());
        let cap = self.max_frames * 2;
        if state.samples.len() > cap {
            let excess = state.samples.len() - cap;
            // Keep frames aligned.
            let excess = excess + excess % 2;
            state.samples.drain(..excess);
            state.dropped_frames += (excess / 2) as u64;
        }
        PushOutcome::Accepted
    }

    /// Fill `out` (interleaved stereo) from the buffer, zero-padding on
    /// underrun. Returns the number of frames that carried real audio.
    pub fn pull(&self, out: &mut [f32]) -> usize {
        let mut state = self.state.lock();
        let available = state.samples.len().min(out.len()) & !1;
        for (dst, src) in out.iter_mut().zip(state.samples.drain(..available)) {
            *dst = src;
        }
        out[available..].iter_mut().for_each(|s| *s = 0.0);
        available / 2
    }

    pub fn buffered_frames(&self) -> usize {
        self.state.lock().samples.len() / 2
    }

    pub fn buffered_ms(&self) -> u32 {
        (self.buffered_frames() as u64 * 1000 / self.sample_rate.max(1) as u64) as u32
    }

    /// Producers back off while this is true.
    pub fn is_above_high_water(&self) -> bool {
        self.buffered_frames() >= self.high_water_frames
    }

    pub fn dropped_frames(&self) -> u64 {
        self.state.lock().dropped_frames
    }

    /// Pausing and resuming both empty the buffer: resume jumps to live.
    pub fn set_paused(&self, paused: bool) {
        let mut state = self.state.lock();
        state.paused = paused;
        state.samples.clear();
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }
}

/// Linear-interpolating converter from any rate/channel layout to stereo at
/// the engine rate. Keeps the last frame so block boundaries stay continuous.
pub struct LinearResampler {
    step: f64,
    channels: usize,
    pos: f64,
    last: [f32; 2],
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32, channels: usize) -> Self {
        LinearResampler {
            step: from_rate as f64 / to_rate.max(1) as f64,
            channels: channels.max(1),
            pos: 0.0,
            last: [0.0; 2],
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.step == 1.0
    }

    fn stereo_frame(input: &[f32], channels: usize, index: usize) -> [f32; 2] {
        let base = index * channels;
        if channels == 1 {
            [input[base], input[base]]
        } else {
            [input[base], input[base + 1]]
        }
    }

    /// Convert one block of interleaved input, appending stereo output to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        let frames = input.len() / self.channels;
        if frames == 0 {
            return;
        }
        if self.is_passthrough() {
            for i in 0..frames {
                out.extend_from_slice(&Self::stereo_frame(input, self.channels, i));
            }
            self.last = Self::stereo_frame(input, self.channels, frames - 1);
            return;
        }

        // Index -1 is the previous block's last frame.
        let frame_at = |i: isize, last: [f32; 2]| -> [f32; 2] {
            if i < 0 {
                last
            } else {
                Self::stereo_frame(input, self.channels, i as usize)
            }
        };
        while self.pos < (frames - 1) as f64 {
            let i = self.pos.floor() as isize;
            let frac = (self.pos - i as f64) as f32;
            let a = frame_at(i, self.last);
            let b = frame_at(i + 1, self.last);
            out.push(a[0] + (b[0] - a[0]) * frac);
            out.push(a[1] + (b[1] - a[1]) * frac);
            self.pos += self.step;
        }
        self.pos -= frames as f64;
        self.last = Self::stereo_frame(input, self.channels, frames - 1);
    }
}
