//! `tone:` URLs: synthetic stream sessions for device- and network-free runs.
//!
//! `tone:<hz>[?amp=<0..1>&secs=<n>&bitrate=<kbps>&cors=deny]`
//!
//! - `secs` ends the stream after that many seconds of audio.
//! - `bitrate` is reported as the session's bitrate.
//! - `cors=deny` refuses analysis-mode connects like a strict server would.

use super::connector::{AccessMode, ConnectRequest, StreamSession};
use crate::error::BindFailure;
use std::f32::consts::TAU;

const BLOCK_FRAMES: usize = 1024;

#[derive(Debug)]
pub struct ToneSession {
    frequency: f32,
    amplitude: f32,
    phase: f32,
    sample_rate: u32,
    remaining_frames: Option<u64>,
    bitrate_kbps: Option<u32>,
}

fn bad(spec: &str) -> BindFailure {
    BindFailure::Codec(format!("invalid tone spec '{}'", spec))
}

impl ToneSession {
    pub fn parse(spec: &str, request: &ConnectRequest) -> Result<Self, BindFailure> {
        let (freq, query) = spec.split_once('?').unwrap_or((spec, ""));
        let frequency: f32 = freq.trim().parse().map_err(|_| bad(spec))?;
        if !(0.0..=20_000.0).contains(&frequency) {
            return Err(bad(spec));
        }

        let mut session = ToneSession {
            frequency,
            amplitude: 0.5,
            phase: 0.0,
            sample_rate: request.sample_rate,
            remaining_frames: None,
            bitrate_kbps: None,
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| bad(spec))?;
            match key {
                "amp" => {
                    let amp: f32 = value.parse().map_err(|_| bad(spec))?;
                    session.amplitude = amp.clamp(0.0, 1.0);
                }
                "secs" => {
                    let secs: f64 = value.parse().map_err(|_| bad(spec))?;
                    session.remaining_frames = Some((secs * request.sample_rate as f64) as u64);
                }
                "bitrate" => {
                    session.bitrate_kbps = Some(value.parse().map_err(|_| bad(spec))?);
                }
                "cors" if value == "deny" => {
                    if request.mode == AccessMode::Analyzed {
                        return Err(BindFailure::CrossOrigin(format!(
                            "tone:{} refuses analysis access",
                            spec
                        )));
                    }
                }
                _ => return Err(bad(spec)),
            }
        }
        Ok(session)
    }
}

impl StreamSession for ToneSession {
    fn next_block(&mut self) -> Result<Option<Vec<f32>>, BindFailure> {
        let frames = match self.remaining_frames {
            Some(0) => return Ok(None),
            Some(left) => {
                let n = left.min(BLOCK_FRAMES as u64);
                self.remaining_frames = Some(left - n);
                n as usize
            }
            None => BLOCK_FRAMES,
        };

        let step = TAU * self.frequency / self.sample_rate as f32;
        let mut block = Vec::with_capacity(frames * 2);
        for _ in 0..frames {
            let s = self.amplitude * self.phase.sin();
            block.push(s);
            block.push(s);
            self.phase = (self.phase + step) % TAU;
        }
        Ok(Some(block))
    }

    fn bitrate_kbps(&self) -> Option<u32> {
        self.bitrate_kbps
    }
}
