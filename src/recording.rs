//! Per-bus recording sessions.
//!
//! Capture is fed by the graph through a channel of rendered stereo blocks.
//! The control thread drains it on every poll; each drained batch becomes one
//! chunk of native PCM16 data.

use crate::bus::BusId;
use crate::error::{MixError, Result};
use crate::schedule::RecordingWindow;
use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecorderState {
    Idle,
    Recording,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExportFormat {
    Mp3,
    Webm,
    Wav,
    Ogg,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 4] = [
        ExportFormat::Mp3,
        ExportFormat::Webm,
        ExportFormat::Wav,
        ExportFormat::Ogg,
    ];

    /// What the capture tap produces without any conversion.
    pub const NATIVE: ExportFormat = ExportFormat::Wav;

    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Mp3 => "mp3",
            ExportFormat::Webm => "webm",
            ExportFormat::Wav => "wav",
            ExportFormat::Ogg => "ogg",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.extension().to_ascii_uppercase())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mp3" => Ok(ExportFormat::Mp3),
            "webm" => Ok(ExportFormat::Webm),
            "wav" => Ok(ExportFormat::Wav),
            "ogg" => Ok(ExportFormat::Ogg),
            _ => Err(format!(
                "Unknown format '{}'. Expected mp3, webm, wav or ogg",
                s
            )),
        }
    }
}

/// Convert rendered float samples to little-endian PCM16 bytes.
pub fn encode_pcm16(samples: &[f32], out: &mut Vec<u8>) {
    out.reserve(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
}

/// One capture of a bus, from `start` until `clear`.
pub struct RecordingSession {
    bus: BusId,
    state: RecorderState,
    format: ExportFormat,
    sample_rate: u32,
    chunks: Vec<Vec<u8>>,
    captured_frames: u64,
    started_wall: DateTime<Local>,
    started_at: Duration,
    elapsed_seconds: u64,
    capture: Option<Receiver<Vec<f32>>>,
}

impl RecordingSession {
    /// Chunks are in the native format regardless of `format`; `format` is
    /// the container the session will be exported to by default.
    pub fn start(
        bus: BusId,
        format: ExportFormat,
        sample_rate: u32,
        capture: Receiver<Vec<f32>>,
        now: Duration,
    ) -> Self {
        info!("Recording {} started ({})", bus, format);
        RecordingSession {
            bus,
            state: RecorderState::Recording,
            format,
            sample_rate,
            chunks: Vec::new(),
            captured_frames: 0,
            started_wall: Local::now(),
            started_at: now,
            elapsed_seconds: 0,
            capture: Some(capture),
        }
    }

    pub fn bus(&self) -> BusId {
        self.bus
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn format(&self) -> ExportFormat {
        self.format
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    pub fn captured_frames(&self) -> u64 {
        self.captured_frames
    }

    pub fn captured_seconds(&self) -> f64 {
        self.captured_frames as f64 / self.sample_rate as f64
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_seconds
    }

    pub fn started_wall(&self) -> DateTime<Local> {
        self.started_wall
    }

    pub fn is_recording(&self) -> bool {
        self.state == RecorderState::Recording
    }

    /// Move everything the graph has rendered since the last drain into a
    /// new chunk. Returns the number of frames appended.
    pub fn drain(&mut self) -> usize {
        let Some(rx) = &self.capture else {
            return 0;
        };
        let mut chunk = Vec::new();
        let mut frames = 0;
        for block in rx.try_iter() {
            frames += block.len() / 2;
            encode_pcm16(&block, &mut chunk);
        }
        self.append(chunk, frames)
    }

    /// Drain until the renderer drops its end of the capture, so blocks
    /// rendered before it saw the detach are kept. Gives up after `timeout`.
    pub fn drain_until_detached(&mut self, timeout: Duration) -> usize {
        let Some(rx) = &self.capture else {
            return 0;
        };
        let deadline = Instant::now() + timeout;
        let mut chunk = Vec::new();
        let mut frames = 0;
        loop {
            match rx.recv_deadline(deadline) {
                Ok(block) => {
                    frames += block.len() / 2;
                    encode_pcm16(&block, &mut chunk);
                }
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Recording {}: capture still attached after {:?}", self.bus, timeout);
                    break;
                }
            }
        }
        self.append(chunk, frames)
    }

    fn append(&mut self, chunk: Vec<u8>, frames: usize) -> usize {
        if !chunk.is_empty() {
            self.chunks.push(chunk);
            self.captured_frames += frames as u64;
        }
        frames
    }

    /// Whole seconds since start. Returns true when the count moved.
    pub fn tick(&mut self, now: Duration) -> bool {
        if self.state != RecorderState::Recording {
            return false;
        }
        let secs = now.saturating_sub(self.started_at).as_secs();
        if secs != self.elapsed_seconds {
            self.elapsed_seconds = secs;
            return true;
        }
        false
    }

    /// Finalize the chunk sequence. No-op unless recording.
    pub fn stop(&mut self, now: Duration) -> bool {
        if self.state != RecorderState::Recording {
            return false;
        }
        self.drain();
        self.tick(now);
        self.capture = None;
        self.state = RecorderState::Stopped;
        info!(
            "Recording {} stopped: {}s, {} chunks",
            self.bus,
            self.elapsed_seconds,
            self.chunks.len()
        );
        true
    }
}

/// A bus's recorder: selected format, optional schedule, at most one session.
pub struct RecorderSlot {
    bus: BusId,
    format: ExportFormat,
    schedule: Option<RecordingWindow>,
    session: Option<RecordingSession>,
    /// The current session was started by the schedule.
    scheduled: bool,
}

impl RecorderSlot {
    pub fn new(bus: BusId) -> Self {
        RecorderSlot {
            bus,
            format: ExportFormat::Mp3,
            schedule: None,
            session: None,
            scheduled: false,
        }
    }

    pub fn bus(&self) -> BusId {
        self.bus
    }

    pub fn format(&self) -> ExportFormat {
        self.format
    }

    pub fn set_format(&mut self, format: ExportFormat) {
        self.format = format;
    }

    pub fn schedule(&self) -> Option<RecordingWindow> {
        self.schedule
    }

    pub fn set_schedule(&mut self, window: Option<RecordingWindow>) {
        self.schedule = window;
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut RecordingSession> {
        self.session.as_mut()
    }

    pub fn state(&self) -> RecorderState {
        self.session
            .as_ref()
            .map_or(RecorderState::Idle, |s| s.state())
    }

    pub fn is_recording(&self) -> bool {
        self.state() == RecorderState::Recording
    }

    pub fn started_by_schedule(&self) -> bool {
        self.scheduled && self.is_recording()
    }

    /// Fails with `AlreadyRecording` if a session is active; the active
    /// session is left untouched. A stopped session is replaced.
    pub fn begin(
        &mut self,
        sample_rate: u32,
        capture: Receiver<Vec<f32>>,
        now: Duration,
        scheduled: bool,
    ) -> Result<()> {
        if self.is_recording() {
            return Err(MixError::AlreadyRecording(self.bus));
        }
        self.session = Some(RecordingSession::start(
            self.bus,
            self.format,
            sample_rate,
            capture,
            now,
        ));
        self.scheduled = scheduled;
        Ok(())
    }

    pub fn stop(&mut self, now: Duration) -> bool {
        self.scheduled = false;
        self.session.as_mut().is_some_and(|s| s.stop(now))
    }

    /// Drop the session and its captured data.
    pub fn clear(&mut self) -> bool {
        self.scheduled = false;
        self.session.take().is_some()
    }
}
