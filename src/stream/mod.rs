//! Network stream sources.
//!
//! A `StreamSource` is the control-side state machine of one stream channel.
//! Each bind spawns one worker thread that connects, decodes and pushes audio
//! into the channel's `ChannelInput`; the worker reports back through
//! `WorkerEvent`s tagged with the generation it was started for. The engine
//! applies those events on its own thread and drops any whose generation is
//! no longer current, so a slow, superseded connect can never overwrite the
//! state of a newer bind.

use crate::config::network::MAX_BACKOFF_SECS;
use crate::config::StreamConfig;
use crate::error::BindFailure;
use crate::input::{ChannelInput, PushOutcome};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub mod connector;
pub mod decode;
pub mod hls;
pub mod http;
pub mod tone;

pub use connector::{AccessMode, ConnectRequest, DefaultConnector, StreamConnector, StreamSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Single continuous container (Icecast, Shoutcast, plain files).
    Progressive,
    /// Segmented, manifest-driven (HLS).
    Adaptive,
}

impl Transport {
    pub fn detect(url: &str) -> Transport {
        if url.to_ascii_lowercase().contains(".m3u8") {
            Transport::Adaptive
        } else {
            Transport::Progressive
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Loading,
    Playing,
    Paused,
    Error,
}

/// What a worker reports about its session.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected {
        bitrate_kbps: Option<u32>,
        /// Admitted in playback-only mode: audio flows, analysis does not.
        degraded: bool,
    },
    Bitrate(u32),
    /// The established session dropped; reconnect attempt `attempt` is pending.
    Reconnecting { attempt: u32, reason: BindFailure },
    Failed(BindFailure),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub channel: String,
    pub generation: u64,
    pub event: StreamEvent,
}

/// Everything a worker needs besides its URL.
#[derive(Clone)]
pub struct WorkerContext {
    pub connector: Arc<dyn StreamConnector>,
    pub events: Sender<WorkerEvent>,
    pub config: StreamConfig,
    pub sample_rate: u32,
}

/// Stop flag of a running worker. Dropping the handle does not stop it.
struct WorkerHandle {
    stop: Arc<AtomicBool>,
}

impl WorkerHandle {
    fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Lifecycle of one network source feeding a channel.
pub struct StreamSource {
    url: Option<String>,
    transport: Transport,
    state: StreamState,
    bitrate_kbps: Option<u32>,
    degraded: bool,
    generation: u64,
    last_error: Option<BindFailure>,
    worker: Option<WorkerHandle>,
    /// A reconnect started while paused comes back paused.
    paused_before_drop: bool,
}

impl StreamSource {
    pub fn new(url: Option<String>) -> Self {
        let transport = url
            .as_deref()
            .map(Transport::detect)
            .unwrap_or(Transport::Progressive);
        StreamSource {
            url,
            transport,
            state: StreamState::Idle,
            bitrate_kbps: None,
            degraded: false,
            generation: 0,
            last_error: None,
            worker: None,
            paused_before_drop: false,
        }
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn bitrate_kbps(&self) -> Option<u32> {
        self.bitrate_kbps
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_error(&self) -> Option<&BindFailure> {
        self.last_error.as_ref()
    }

    pub fn has_session(&self) -> bool {
        self.worker.is_some()
    }

    /// Stop the current worker and invalidate its generation on `input`.
    /// After this returns nothing from the old session can reach the graph.
    fn teardown(&mut self, input: &ChannelInput) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
        self.generation = input.rebind();
        self.bitrate_kbps = None;
        self.degraded = false;
        self.paused_before_drop = false;
    }

    /// Replace any existing session with a new one for `url`. Moves to `Loading`.
    pub fn bind(&mut self, channel: &str, url: &str, input: &ChannelInput, ctx: &WorkerContext) {
        self.teardown(input);
        self.url = Some(url.to_string());
        self.transport = Transport::detect(url);
        self.state = StreamState::Loading;
        self.last_error = None;

        let stop = Arc::new(AtomicBool::new(false));
        spawn_worker(
            channel.to_string(),
            url.to_string(),
            self.generation,
            input.clone(),
            ctx.clone(),
            stop.clone(),
        );
        self.worker = Some(WorkerHandle { stop });
        info!(
            "{}: binding {:?} stream {} (generation {})",
            channel, self.transport, url, self.generation
        );
    }

    /// Rebind to the current URL. Returns false if no URL was ever assigned.
    pub fn reload(&mut self, channel: &str, input: &ChannelInput, ctx: &WorkerContext) -> bool {
        match self.url.clone() {
            Some(url) => {
                self.bind(channel, &url, input, ctx);
                true
            }
            None => false,
        }
    }

    /// Tear the session down and go `Idle`, keeping the URL.
    pub fn stop(&mut self, input: &ChannelInput) {
        self.teardown(input);
        self.state = StreamState::Idle;
    }

    /// `Playing → Paused`. The session stays connected; its audio is discarded.
    pub fn pause(&mut self, input: &ChannelInput) -> bool {
        if self.state != StreamState::Playing {
            return false;
        }
        input.set_paused(true);
        self.state = StreamState::Paused;
        true
    }

    /// `Paused → Playing`, jumping to live.
    pub fn resume(&mut self, input: &ChannelInput) -> bool {
        if self.state != StreamState::Paused {
            return false;
        }
        input.set_paused(false);
        self.state = StreamState::Playing;
        true
    }

    /// Apply a worker event. Returns false (and changes nothing) when the
    /// event belongs to a superseded generation.
    pub fn apply(&mut self, generation: u64, event: &StreamEvent) -> bool {
        if generation != self.generation || self.worker.is_none() {
            debug!(
                "discarding stale stream event (generation {}, current {})",
                generation, self.generation
            );
            return false;
        }
        match event {
            StreamEvent::Connected {
                bitrate_kbps,
                degraded,
            } => {
                if self.state == StreamState::Loading {
                    self.state = if self.paused_before_drop {
                        StreamState::Paused
                    } else {
                        StreamState::Playing
                    };
                    self.paused_before_drop = false;
                }
                if bitrate_kbps.is_some() {
                    self.bitrate_kbps = *bitrate_kbps;
                }
                self.degraded = *degraded;
            }
            StreamEvent::Bitrate(kbps) => self.bitrate_kbps = Some(*kbps),
            StreamEvent::Reconnecting { reason, .. } => {
                self.paused_before_drop |= self.state == StreamState::Paused;
                self.state = StreamState::Loading;
                self.last_error = Some(reason.clone());
            }
            StreamEvent::Failed(reason) => {
                self.state = StreamState::Error;
                self.last_error = Some(reason.clone());
                self.worker = None;
            }
        }
        true
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }
}

/// Exponential backoff: base, 2×base, 4×base, … capped at `MAX_BACKOFF_SECS`,
/// plus up to 10% random jitter.
pub(crate) fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(5);
    let delay = base
        .saturating_mul(1u32 << exp)
        .min(Duration::from_secs(MAX_BACKOFF_SECS));
    let jitter_ms = (delay.as_millis() as u64 / 10).max(1);
    delay + Duration::from_millis(fastrand::u64(0..jitter_ms))
}

/// Sleep with backoff, checking `stop` every 50ms.
/// Returns true if the full duration elapsed, false if stopped early.
pub(crate) fn backoff_sleep(attempt: u32, base: Duration, stop: &AtomicBool) -> bool {
    let total = backoff_delay(attempt, base);
    let interval = Duration::from_millis(50);
    let start = Instant::now();
    while start.elapsed() < total {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let remaining = total.saturating_sub(start.elapsed());
        std::thread::sleep(remaining.min(interval));
    }
    !stop.load(Ordering::Relaxed)
}

fn spawn_worker(
    channel: String,
    url: String,
    generation: u64,
    input: ChannelInput,
    ctx: WorkerContext,
    stop: Arc<AtomicBool>,
) {
    let name = format!("stream-{}", channel.to_ascii_lowercase());
    let result = std::thread::Builder::new().name(name).spawn(move || {
        let worker = Worker {
            channel,
            url,
            generation,
            input,
            ctx,
            stop,
        };
        worker.run();
    });
    if let Err(e) = result {
        warn!("failed to spawn stream worker: {}", e);
    }
}

struct Worker {
    channel: String,
    url: String,
    generation: u64,
    input: ChannelInput,
    ctx: WorkerContext,
    stop: Arc<AtomicBool>,
}

/// How a pumped session ended.
enum PumpEnd {
    Stopped,
    Dropped(BindFailure),
}

impl Worker {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || !self.input.is_current(self.generation)
    }

    fn send(&self, event: StreamEvent) {
        let _ = self.ctx.events.send(WorkerEvent {
            channel: self.channel.clone(),
            generation: self.generation,
            event,
        });
    }

    /// Connect, retrying once without analysis access on a cross-origin refusal.
    fn connect(&self) -> Result<(Box<dyn StreamSession>, bool), BindFailure> {
        let request = ConnectRequest {
            url: &self.url,
            mode: AccessMode::Analyzed,
            sample_rate: self.ctx.sample_rate,
        };
        match self.ctx.connector.connect(&request) {
            Ok(session) => Ok((session, false)),
            Err(failure) if failure.is_cross_origin() => {
                warn!(
                    "{}: {}; retrying without analysis access",
                    self.channel, failure
                );
                let request = ConnectRequest {
                    mode: AccessMode::PlaybackOnly,
                    ..request
                };
                self.ctx
                    .connector
                    .connect(&request)
                    .map(|session| (session, true))
            }
            Err(failure) => Err(failure),
        }
    }

    fn run(self) {
        let base_delay = Duration::from_millis(self.ctx.config.retry_base_delay_ms);
        let mut reconnects = 0u32;
        let mut established = false;

        loop {
            if self.stopped() {
                return;
            }
            let failure = match self.connect() {
                Ok((session, degraded)) => {
                    if self.stopped() {
                        return;
                    }
                    established = true;
                    let bitrate = session.bitrate_kbps();
                    self.send(StreamEvent::Connected {
                        bitrate_kbps: bitrate,
                        degraded,
                    });
                    match self.pump(session, bitrate) {
                        PumpEnd::Stopped => return,
                        PumpEnd::Dropped(reason) => reason,
                    }
                }
                Err(failure) => failure,
            };

            if !established || reconnects >= self.ctx.config.max_reconnects {
                warn!("{}: stream failed: {}", self.channel, failure);
                self.send(StreamEvent::Failed(failure));
                return;
            }
            reconnects += 1;
            info!(
                "{}: stream dropped ({}), reconnect {}/{}",
                self.channel, failure, reconnects, self.ctx.config.max_reconnects
            );
            self.send(StreamEvent::Reconnecting {
                attempt: reconnects,
                reason: failure,
            });
            if !backoff_sleep(reconnects, base_delay, &self.stop) {
                return;
            }
        }
    }

    /// Move audio from the session into the channel until it stops or drops.
    fn pump(&self, mut session: Box<dyn StreamSession>, mut reported: Option<u32>) -> PumpEnd {
        let idle = Duration::from_millis(10);
        loop {
            if self.stopped() {
                return PumpEnd::Stopped;
            }
            if self.input.is_above_high_water() {
                std::thread::sleep(idle);
                continue;
            }
            let block = match session.next_block() {
                Ok(Some(block)) => block,
                Ok(None) => return PumpEnd::Dropped(BindFailure::EndOfStream),
                Err(failure) => return PumpEnd::Dropped(failure),
            };

            let bitrate = session.bitrate_kbps();
            if bitrate.is_some() && bitrate != reported {
                reported = bitrate;
                if let Some(kbps) = bitrate {
                    self.send(StreamEvent::Bitrate(kbps));
                }
            }

            if block.is_empty() {
                std::thread::sleep(idle);
                continue;
            }
            match self.input.push(self.generation, &block) {
                PushOutcome::Accepted => {}
                PushOutcome::Paused => {
                    // Pace discarded audio at roughly real time.
                    let frames = block.len() / 2;
                    std::thread::sleep(Duration::from_secs_f64(
                        frames as f64 / self.ctx.sample_rate as f64,
                    ));
                }
                PushOutcome::Superseded => return PumpEnd::Stopped,
            }
        }
    }
}
