//! MixEngine: the single entry point for every control operation.
//!
//! The engine owns the channel roster, the three buses and their recorders,
//! and the renderer. Parameter setters only write ramp targets and return.
//! Stream workers, the audio runtime and capture taps report back through
//! channels that `poll` drains on the control thread, so all control-side
//! state is mutated from one place.

use crate::bus::{normalize_device, Bus, BusId, DynamicsChain, OutputRoute};
use crate::catalog::ChannelKind;
use crate::channel::{AuxSend, Channel, ChannelSource, EqSettings};
use crate::config::MixConfig;
use crate::device::{DeviceDirectory, DeviceInfo, Direction, StaticDevices, SystemDevices};
use crate::dsp::EqBand;
use crate::error::{BindFailure, MixError, Result};
use crate::export::{artifact_name, convert, probe_duration, Artifact};
use crate::graph::{GraphCommand, MixGraph};
use crate::input::ChannelInput;
use crate::onair::OnAirDetector;
use crate::recording::{ExportFormat, RecorderSlot, RecorderState};
use crate::runtime::{spawn_runtime, RuntimeEvent, RuntimeHandle};
use crate::schedule::RecordingWindow;
use crate::stream::{
    DefaultConnector, StreamConnector, StreamEvent, StreamState, WorkerContext, WorkerEvent,
};
use crate::tap::AnalysisTap;
use chrono::{Local, NaiveTime};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

// ── Log buffer ──────────────────────────────────────────────────────────────

const LOG_BUFFER_MAX: usize = 500;

/// How long `stop_recording` waits for the audio thread to release a capture.
const DETACH_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
}

/// Operator-facing history of engine operations, oldest dropped first.
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
}

impl LogBuffer {
    pub fn new() -> Self {
        LogBuffer {
            entries: VecDeque::with_capacity(LOG_BUFFER_MAX),
        }
    }

    pub fn push(&mut self, level: LogLevel, message: String) {
        if self.entries.len() == LOG_BUFFER_MAX {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            timestamp: Local::now().format("%H:%M:%S").to_string(),
            level,
            message,
        });
    }

    /// Entries from `since_index` on, for callers that poll incrementally.
    pub fn get(&self, since_index: usize) -> Vec<LogEntry> {
        self.entries.iter().skip(since_index).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ── Events ──────────────────────────────────────────────────────────────────

/// What changed since the last `poll`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MixEvent {
    StreamState {
        channel: String,
        state: StreamState,
    },
    Bitrate {
        channel: String,
        kbps: u32,
    },
    /// Admitted without analysis access; the channel tap is frozen.
    AnalysisDegraded {
        channel: String,
    },
    StreamFailed {
        channel: String,
        reason: String,
    },
    RecordingStarted {
        bus: BusId,
        scheduled: bool,
    },
    RecordingTick {
        bus: BusId,
        elapsed_seconds: u64,
    },
    RecordingStopped {
        bus: BusId,
    },
    OnAir {
        on_air: bool,
    },
    RouteFailed {
        bus: BusId,
        reason: String,
    },
    InputFailed {
        channel: String,
        reason: String,
    },
}

// ── Response data types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ChannelData {
    pub id: String,
    pub label: String,
    pub kind: ChannelKind,
    pub trim: f32,
    pub fader: f32,
    pub muted: bool,
    pub eq: EqSettings,
    pub aux_sends: [AuxSend; 2],
    pub stations: Vec<String>,
    pub url: Option<String>,
    pub live_device: Option<String>,
    pub stream_state: Option<StreamState>,
    pub bitrate_kbps: Option<u32>,
    pub analysis_degraded: bool,
    pub last_error: Option<String>,
    pub buffered_ms: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecorderData {
    pub state: RecorderState,
    pub format: ExportFormat,
    pub elapsed_seconds: u64,
    pub captured_seconds: f64,
    pub chunk_count: usize,
    pub schedule: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusData {
    pub id: BusId,
    pub level: f32,
    pub dynamics: Option<DynamicsChain>,
    pub route: String,
    pub recorder: RecorderData,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub realtime: bool,
    pub on_air: bool,
    pub any_playing: bool,
    pub sample_rate: u32,
    pub channel_count: usize,
    pub recording: Vec<BusId>,
}

// ── Engine ──────────────────────────────────────────────────────────────────

enum Renderer {
    /// Rendered on the caller's thread by `advance`.
    Offline(Box<MixGraph>),
    /// Rendered by the audio runtime thread in real time.
    Realtime {
        handle: RuntimeHandle,
        started: Instant,
    },
    Stopped,
}

pub struct MixEngine {
    config: MixConfig,
    channels: Vec<Channel>,
    buses: [Bus; 3],
    recorders: [RecorderSlot; 3],
    /// Whether each bus's schedule window was open at the last poll.
    window_open: [bool; 3],
    graph_tx: Sender<GraphCommand>,
    renderer: Renderer,
    devices: Box<dyn DeviceDirectory>,
    workers: WorkerContext,
    worker_rx: Receiver<WorkerEvent>,
    runtime_rx: Receiver<RuntimeEvent>,
    on_air: OnAirDetector,
    logs: LogBuffer,
}

impl MixEngine {
    /// Realtime engine on the system's audio devices.
    pub fn new(config: MixConfig) -> Result<Self> {
        let connector = Arc::new(DefaultConnector::new(&config.stream)?);
        Self::build(config, connector, Box::new(SystemDevices), true)
    }

    /// Device-free engine rendered by `advance`.
    pub fn offline(config: MixConfig) -> Result<Self> {
        let connector = Arc::new(DefaultConnector::new(&config.stream)?);
        Self::build(config, connector, Box::new(StaticDevices::default()), false)
    }

    /// Offline engine with an injected stream transport and device list.
    pub fn offline_with(
        config: MixConfig,
        connector: Arc<dyn StreamConnector>,
        devices: Box<dyn DeviceDirectory>,
    ) -> Result<Self> {
        Self::build(config, connector, devices, false)
    }

    fn build(
        config: MixConfig,
        connector: Arc<dyn StreamConnector>,
        devices: Box<dyn DeviceDirectory>,
        realtime: bool,
    ) -> Result<Self> {
        config.validate()?;
        let sr = config.sample_rate;
        let tau = config.ramp_time_constant_secs;
        let high_water = config.frames_for_ms(config.stream.high_water_ms);
        let max_buffer = config.frames_for_ms(config.stream.max_buffer_ms);

        let channels: Vec<Channel> = config
            .channels
            .iter()
            .map(|c| {
                Channel::new(
                    c.clone(),
                    ChannelInput::new(sr, high_water, max_buffer),
                    tau,
                    config.aux_ramp_time_constant_secs,
                )
            })
            .collect();

        let routes = &config.output_routes;
        let buses = [
            Bus::new(
                BusId::Master,
                config.master_level,
                tau,
                OutputRoute::new(routes.master.clone()),
            )
            .with_dynamics(DynamicsChain::new(
                config.compressor_enabled,
                config.limiter_enabled,
            )),
            Bus::new(
                BusId::Aux1,
                config.aux_levels[0],
                tau,
                OutputRoute::new(routes.aux1.clone()),
            ),
            Bus::new(
                BusId::Aux2,
                config.aux_levels[1],
                tau,
                OutputRoute::new(routes.aux2.clone()),
            ),
        ];

        let (graph_tx, graph_rx) = unbounded();
        let layout = buses[0].dynamics().map(|d| d.layout()).unwrap_or_default();
        let graph = MixGraph::new(
            sr,
            config.block_frames,
            channels.iter().map(|c| c.handles().clone()).collect(),
            std::array::from_fn(|i| buses[i].handles().clone()),
            &layout,
            graph_rx,
        );

        let (runtime_tx, runtime_rx) = unbounded();
        let renderer = if realtime {
            let routes = std::array::from_fn(|i| buses[i].route().device.clone());
            let handle = spawn_runtime(graph, routes, move |event| {
                let _ = runtime_tx.send(event);
            });
            Renderer::Realtime {
                handle,
                started: Instant::now(),
            }
        } else {
            drop(runtime_tx);
            Renderer::Offline(Box::new(graph))
        };

        let (worker_tx, worker_rx) = unbounded();
        let workers = WorkerContext {
            connector,
            events: worker_tx,
            config: config.stream.clone(),
            sample_rate: sr,
        };

        let on_air = OnAirDetector::new(
            config.on_air_threshold,
            Duration::from_millis(config.on_air_interval_ms),
        );

        let mut engine = MixEngine {
            channels,
            buses,
            recorders: BusId::ALL.map(RecorderSlot::new),
            window_open: [false; 3],
            graph_tx,
            renderer,
            devices,
            workers,
            worker_rx,
            runtime_rx,
            on_air,
            logs: LogBuffer::new(),
            config,
        };
        let mode = if realtime { "realtime" } else { "offline" };
        engine.log(
            LogLevel::Info,
            format!(
                "Engine ready ({}, {} Hz, {} channels)",
                mode,
                sr,
                engine.channels.len()
            ),
        );
        Ok(engine)
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn log(&mut self, level: LogLevel, message: String) {
        match level {
            LogLevel::Error => error!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Info => info!("{}", message),
        }
        self.logs.push(level, message);
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.renderer {
            Renderer::Stopped => Err(MixError::EngineNotReady),
            _ => Ok(()),
        }
    }

    fn channel_index(&self, id: &str) -> Result<usize> {
        self.ensure_ready()?;
        self.channels
            .iter()
            .position(|c| c.id().eq_ignore_ascii_case(id))
            .ok_or_else(|| MixError::InvalidHandle(format!("channel '{}'", id)))
    }

    fn channel_mut(&mut self, id: &str) -> Result<&mut Channel> {
        let idx = self.channel_index(id)?;
        Ok(&mut self.channels[idx])
    }

    fn send_graph(&self, cmd: GraphCommand) {
        if self.graph_tx.send(cmd).is_err() {
            warn!("mix graph is gone; command dropped");
        }
    }

    /// Engine clock: rendered time offline, wall time in realtime.
    fn now(&self) -> Duration {
        match &self.renderer {
            Renderer::Offline(graph) => Duration::from_secs_f64(
                graph.frames_rendered() as f64 / self.config.sample_rate as f64,
            ),
            Renderer::Realtime { started, .. } => started.elapsed(),
            Renderer::Stopped => Duration::ZERO,
        }
    }

    pub fn config(&self) -> &MixConfig {
        &self.config
    }

    pub fn is_realtime(&self) -> bool {
        matches!(self.renderer, Renderer::Realtime { .. })
    }

    /// Resolve a bus name (`MASTER`, `AUX1`, `AUX2`).
    pub fn bus_id(name: &str) -> Result<BusId> {
        name.parse()
            .map_err(|_| MixError::InvalidHandle(format!("bus '{}'", name)))
    }

    // ── Channel strip ───────────────────────────────────────────────────

    pub fn set_channel_trim(&mut self, channel: &str, trim: f32) -> Result<f32> {
        Ok(self.channel_mut(channel)?.set_trim(trim))
    }

    pub fn set_channel_fader(&mut self, channel: &str, fader: f32) -> Result<f32> {
        Ok(self.channel_mut(channel)?.set_fader(fader))
    }

    pub fn set_channel_mute(&mut self, channel: &str, muted: bool) -> Result<()> {
        self.channel_mut(channel)?.set_mute(muted);
        Ok(())
    }

    pub fn toggle_channel_mute(&mut self, channel: &str) -> Result<bool> {
        let ch = self.channel_mut(channel)?;
        let muted = !ch.is_muted();
        ch.set_mute(muted);
        Ok(muted)
    }

    pub fn set_channel_eq(&mut self, channel: &str, band: EqBand, gain_db: f32) -> Result<f32> {
        Ok(self.channel_mut(channel)?.set_eq_band(band, gain_db))
    }

    pub fn toggle_channel_eq_bypass(&mut self, channel: &str) -> Result<bool> {
        Ok(self.channel_mut(channel)?.toggle_eq_bypass())
    }

    /// Set a channel's send level to `bus` (AUX1 or AUX2).
    pub fn set_aux_send(&mut self, channel: &str, bus: BusId, level: f32) -> Result<AuxSend> {
        let index = bus
            .aux_index()
            .ok_or_else(|| MixError::InvalidHandle(format!("{} has no aux send", bus)))?;
        Ok(self.channel_mut(channel)?.set_aux_send(index, level))
    }

    pub fn toggle_aux_send(&mut self, channel: &str, bus: BusId) -> Result<AuxSend> {
        let index = bus
            .aux_index()
            .ok_or_else(|| MixError::InvalidHandle(format!("{} has no aux send", bus)))?;
        Ok(self.channel_mut(channel)?.toggle_aux_send(index))
    }

    // ── Buses ───────────────────────────────────────────────────────────

    pub fn set_bus_level(&mut self, bus: BusId, level: f32) -> Result<f32> {
        self.ensure_ready()?;
        let tau = self.config.ramp_time_constant_secs;
        Ok(self.buses[bus.index()].set_level(level, tau))
    }

    fn toggle_dynamics(&mut self, flip: impl FnOnce(&mut DynamicsChain) -> bool) -> Result<bool> {
        self.ensure_ready()?;
        let Some(chain) = self.buses[BusId::Master.index()].dynamics_mut() else {
            return Err(MixError::InvalidHandle("MASTER dynamics".into()));
        };
        let enabled = flip(chain);
        let layout = chain.layout();
        debug!("master dynamics -> {:?}", layout);
        self.send_graph(GraphCommand::SetDynamics(layout));
        Ok(enabled)
    }

    pub fn toggle_compressor(&mut self) -> Result<bool> {
        self.toggle_dynamics(|c| {
            c.compressor_enabled = !c.compressor_enabled;
            c.compressor_enabled
        })
    }

    pub fn toggle_limiter(&mut self) -> Result<bool> {
        self.toggle_dynamics(|c| {
            c.limiter_enabled = !c.limiter_enabled;
            c.limiter_enabled
        })
    }

    /// Re-bind a bus's physical output. On failure the previous route stays.
    pub fn set_output_device(&mut self, bus: BusId, device: Option<&str>) -> Result<()> {
        self.ensure_ready()?;
        let device = normalize_device(device.map(str::to_string));
        let route_failure = |reason: String| MixError::DeviceRouteFailure {
            target: bus.to_string(),
            reason,
        };
        if !self.devices.contains(Direction::Output, device.as_deref()) {
            let reason = format!(
                "unknown output device '{}'",
                device.as_deref().unwrap_or("default")
            );
            self.log(LogLevel::Warn, format!("{}: {}", bus, reason));
            return Err(route_failure(reason));
        }
        if let Renderer::Realtime { handle, .. } = &self.renderer {
            if let Err(reason) = handle.set_route(bus, device.clone()) {
                self.log(LogLevel::Warn, format!("{}: route change failed: {}", bus, reason));
                return Err(route_failure(reason));
            }
        }
        let route = OutputRoute::new(device);
        self.log(LogLevel::Info, format!("{} routed to {}", bus, route.label()));
        self.buses[bus.index()].set_route(route);
        Ok(())
    }

    pub fn list_output_devices(&self) -> Vec<DeviceInfo> {
        self.devices.list(Direction::Output)
    }

    pub fn list_input_devices(&self) -> Vec<DeviceInfo> {
        self.devices.list(Direction::Input)
    }

    // ── Sources ─────────────────────────────────────────────────────────

    /// Point a stream channel at `url`, replacing any current session.
    pub fn bind_stream(&mut self, channel: &str, url: &str) -> Result<()> {
        let idx = self.channel_index(channel)?;
        let url = url.trim();
        let ch = &mut self.channels[idx];
        let id = ch.id().to_string();
        if url.is_empty() {
            return Err(MixError::StreamBindFailure {
                channel: id,
                reason: BindFailure::Manifest("empty URL".into()),
            });
        }
        let input = ch.input().clone();
        let tap = ch.tap().clone();
        let Some(stream) = ch.stream_mut() else {
            return Err(MixError::InvalidHandle(format!("{} is a live input", id)));
        };
        stream.bind(&id, url, &input, &self.workers);
        tap.set_frozen(false);
        self.log(LogLevel::Info, format!("{}: loading {}", id, url));
        Ok(())
    }

    /// Bind a channel to one of its catalog stations by name.
    pub fn bind_station(&mut self, channel: &str, station: &str) -> Result<()> {
        let idx = self.channel_index(channel)?;
        let url = self.channels[idx]
            .station(station)
            .map(|s| s.url.clone())
            .ok_or_else(|| MixError::InvalidHandle(format!("station '{}'", station)))?;
        self.bind_stream(channel, &url)
    }

    /// Tear down and rebind the channel's current URL.
    pub fn reload_stream(&mut self, channel: &str) -> Result<()> {
        let idx = self.channel_index(channel)?;
        let ch = &mut self.channels[idx];
        let id = ch.id().to_string();
        let input = ch.input().clone();
        let tap = ch.tap().clone();
        let Some(stream) = ch.stream_mut() else {
            return Err(MixError::InvalidHandle(format!("{} is a live input", id)));
        };
        if !stream.reload(&id, &input, &self.workers) {
            return Err(MixError::StreamBindFailure {
                channel: id,
                reason: BindFailure::Manifest("no URL assigned".into()),
            });
        }
        let url = stream.url().unwrap_or_default().to_string();
        tap.set_frozen(false);
        self.log(LogLevel::Info, format!("{}: reloading {}", id, url));
        Ok(())
    }

    /// Reload every stream channel that is not `Idle`. Returns how many.
    pub fn refresh_all(&mut self) -> Result<usize> {
        self.ensure_ready()?;
        let ids: Vec<String> = self
            .channels
            .iter()
            .filter(|c| c.stream().is_some_and(|s| s.state() != StreamState::Idle))
            .map(|c| c.id().to_string())
            .collect();
        for id in &ids {
            self.reload_stream(id)?;
        }
        self.log(LogLevel::Info, format!("Refreshed {} stream(s)", ids.len()));
        Ok(ids.len())
    }

    fn with_stream<T>(
        &mut self,
        channel: &str,
        f: impl FnOnce(&mut crate::stream::StreamSource, &ChannelInput) -> T,
    ) -> Result<T> {
        let ch = self.channel_mut(channel)?;
        let input = ch.input().clone();
        let id = ch.id().to_string();
        let stream = ch
            .stream_mut()
            .ok_or_else(|| MixError::InvalidHandle(format!("{} is a live input", id)))?;
        Ok(f(stream, &input))
    }

    pub fn pause_stream(&mut self, channel: &str) -> Result<bool> {
        self.with_stream(channel, |s, input| s.pause(input))
    }

    pub fn resume_stream(&mut self, channel: &str) -> Result<bool> {
        self.with_stream(channel, |s, input| s.resume(input))
    }

    /// `Playing ⇄ Paused`; other states are left alone. Returns the new state.
    pub fn toggle_play(&mut self, channel: &str) -> Result<StreamState> {
        self.with_stream(channel, |s, input| {
            match s.state() {
                StreamState::Playing => s.pause(input),
                StreamState::Paused => s.resume(input),
                _ => false,
            };
            s.state()
        })
    }

    pub fn stop_stream(&mut self, channel: &str) -> Result<()> {
        self.with_stream(channel, |s, input| s.stop(input))?;
        self.log(LogLevel::Info, format!("{}: stopped", channel.to_ascii_uppercase()));
        Ok(())
    }

    pub fn is_any_playing(&self) -> bool {
        self.channels
            .iter()
            .any(|c| c.stream().is_some_and(|s| s.state() == StreamState::Playing))
    }

    /// Re-select a live channel's capture device. The channel keeps its identity.
    pub fn select_live_input(&mut self, channel: &str, device: Option<&str>) -> Result<()> {
        let idx = self.channel_index(channel)?;
        let device = normalize_device(device.map(str::to_string));
        let id = self.channels[idx].id().to_string();
        if self.channels[idx].kind() != ChannelKind::Live {
            return Err(MixError::InvalidHandle(format!("{} is not a live input", id)));
        }
        if !self.devices.contains(Direction::Input, device.as_deref()) {
            return Err(MixError::DeviceRouteFailure {
                target: id,
                reason: format!(
                    "unknown input device '{}'",
                    device.as_deref().unwrap_or("default")
                ),
            });
        }
        let input = self.channels[idx].input().clone();
        match &self.renderer {
            Renderer::Realtime { handle, .. } => handle
                .open_input(&id, device.clone(), input)
                .map_err(|reason| MixError::DeviceRouteFailure {
                    target: id.clone(),
                    reason,
                })?,
            _ => {
                input.rebind();
            }
        }
        self.log(
            LogLevel::Info,
            format!("{}: input {}", id, device.as_deref().unwrap_or("default")),
        );
        *self.channels[idx].source_mut() = ChannelSource::Live { device };
        Ok(())
    }

    // ── Recording ───────────────────────────────────────────────────────

    pub fn set_recording_format(&mut self, bus: BusId, format: ExportFormat) -> Result<()> {
        self.ensure_ready()?;
        self.recorders[bus.index()].set_format(format);
        Ok(())
    }

    /// Start capturing `bus` in its selected format.
    pub fn start_recording(&mut self, bus: BusId) -> Result<()> {
        self.begin_recording(bus, false)
    }

    /// Select `format` and start capturing `bus`.
    pub fn start_recording_as(&mut self, bus: BusId, format: ExportFormat) -> Result<()> {
        self.ensure_ready()?;
        let slot = &mut self.recorders[bus.index()];
        if slot.is_recording() {
            return Err(MixError::AlreadyRecording(bus));
        }
        slot.set_format(format);
        self.begin_recording(bus, false)
    }

    fn begin_recording(&mut self, bus: BusId, scheduled: bool) -> Result<()> {
        self.ensure_ready()?;
        let now = self.now();
        let (tx, rx) = unbounded();
        self.recorders[bus.index()].begin(self.config.sample_rate, rx, now, scheduled)?;
        self.send_graph(GraphCommand::AttachCapture { bus, tx });
        let how = if scheduled { " (scheduled)" } else { "" };
        self.log(LogLevel::Info, format!("Recording {} started{}", bus, how));
        Ok(())
    }

    /// Finalize the bus's session. Returns false if it was not recording.
    pub fn stop_recording(&mut self, bus: BusId) -> Result<bool> {
        self.ensure_ready()?;
        if !self.recorders[bus.index()].is_recording() {
            return Ok(false);
        }
        self.send_graph(GraphCommand::DetachCapture { bus });
        // The offline graph only applies the detach on its next render, so
        // there is nothing in flight to wait for.
        if matches!(self.renderer, Renderer::Realtime { .. }) {
            if let Some(session) = self.recorders[bus.index()].session_mut() {
                session.drain_until_detached(DETACH_WAIT);
            }
        }
        let now = self.now();
        let stopped = self.recorders[bus.index()].stop(now);
        self.log(LogLevel::Info, format!("Recording {} stopped", bus));
        Ok(stopped)
    }

    /// Discard the bus's session and its captured data.
    pub fn clear_recording(&mut self, bus: BusId) -> Result<bool> {
        self.ensure_ready()?;
        if self.recorders[bus.index()].is_recording() {
            self.send_graph(GraphCommand::DetachCapture { bus });
        }
        Ok(self.recorders[bus.index()].clear())
    }

    /// Convert a stopped session to `format`, or to the format it was
    /// started with.
    /// The stored chunks are never modified, so this can be retried.
    pub fn export_recording(&self, bus: BusId, format: Option<ExportFormat>) -> Result<Artifact> {
        self.ensure_ready()?;
        let slot = &self.recorders[bus.index()];
        let session = slot.session().ok_or_else(|| {
            MixError::RecordingExportFailure(format!("nothing recorded on {}", bus))
        })?;
        if session.is_recording() {
            return Err(MixError::RecordingExportFailure(format!(
                "{} is still recording",
                bus
            )));
        }
        let target = format.unwrap_or(session.format());
        let bytes = convert(
            session.chunks(),
            ExportFormat::NATIVE,
            target,
            session.sample_rate(),
            &self.config.ffmpeg_path,
        )?;
        let duration = probe_duration(&bytes)
            .unwrap_or_else(|| Duration::from_secs_f64(session.captured_seconds()));
        Ok(Artifact {
            name: artifact_name(bus, session.started_wall(), target),
            format: target,
            bytes,
            duration,
        })
    }

    /// Export and write the artifact into `dir`, or the configured recording
    /// directory, or the current directory.
    pub fn export_recording_to(
        &mut self,
        bus: BusId,
        format: Option<ExportFormat>,
        dir: Option<&Path>,
    ) -> Result<PathBuf> {
        let artifact = self.export_recording(bus, format)?;
        let dir = dir
            .map(Path::to_path_buf)
            .or_else(|| self.config.recording_dir.clone())
            .unwrap_or_else(|| PathBuf::from("."));
        let path = artifact.write_to(&dir)?;
        self.log(LogLevel::Info, format!("Exported {}", path.display()));
        Ok(path)
    }

    /// Daily window (`HH:MM`) during which `poll` keeps the bus recording.
    pub fn set_recording_schedule(&mut self, bus: BusId, start: &str, end: &str) -> Result<()> {
        self.ensure_ready()?;
        let window = RecordingWindow::parse(start, end).map_err(MixError::Config)?;
        self.recorders[bus.index()].set_schedule(Some(window));
        self.window_open[bus.index()] = false;
        self.log(LogLevel::Info, format!("{} recording window {}", bus, window));
        Ok(())
    }

    pub fn clear_recording_schedule(&mut self, bus: BusId) -> Result<()> {
        self.ensure_ready()?;
        self.recorders[bus.index()].set_schedule(None);
        self.window_open[bus.index()] = false;
        Ok(())
    }

    // ── Rendering & polling ─────────────────────────────────────────────

    /// Render `duration` of audio synchronously (offline engines only).
    pub fn advance(&mut self, duration: Duration) -> Result<()> {
        let graph = match &mut self.renderer {
            Renderer::Offline(graph) => graph,
            Renderer::Stopped => return Err(MixError::EngineNotReady),
            Renderer::Realtime { .. } => {
                return Err(MixError::Config("advance needs an offline engine".into()));
            }
        };
        let frames = (duration.as_secs_f64() * graph.sample_rate() as f64).ceil() as usize;
        let blocks = frames.div_ceil(graph.block_frames());
        for _ in 0..blocks {
            graph.render();
        }
        Ok(())
    }

    pub fn poll(&mut self) -> Result<Vec<MixEvent>> {
        self.poll_at(Local::now().time())
    }

    /// `poll` with an explicit time of day for schedule evaluation.
    pub fn poll_at(&mut self, time_of_day: NaiveTime) -> Result<Vec<MixEvent>> {
        self.ensure_ready()?;
        let mut events = Vec::new();

        let worker_events: Vec<WorkerEvent> = self.worker_rx.try_iter().collect();
        for event in worker_events {
            self.apply_worker_event(event, &mut events);
        }

        let runtime_events: Vec<RuntimeEvent> = self.runtime_rx.try_iter().collect();
        for event in runtime_events {
            self.apply_runtime_event(event, &mut events);
        }

        let now = self.now();
        for slot in &mut self.recorders {
            let bus = slot.bus();
            if let Some(session) = slot.session_mut() {
                session.drain();
                if session.tick(now) {
                    events.push(MixEvent::RecordingTick {
                        bus,
                        elapsed_seconds: session.elapsed_seconds(),
                    });
                }
            }
        }

        self.evaluate_schedules(time_of_day, &mut events);

        let rms = self.buses[BusId::Master.index()].tap().rms();
        if let Some(on_air) = self.on_air.update(now, rms) {
            let word = if on_air { "ON AIR" } else { "off air" };
            self.log(LogLevel::Info, format!("Master {}", word));
            events.push(MixEvent::OnAir { on_air });
        }
        Ok(events)
    }

    fn apply_worker_event(&mut self, event: WorkerEvent, out: &mut Vec<MixEvent>) {
        let Some(idx) = self.channels.iter().position(|c| c.id() == event.channel) else {
            return;
        };
        let ch = &mut self.channels[idx];
        let tap = ch.tap().clone();
        let Some(stream) = ch.stream_mut() else {
            return;
        };
        let before = stream.state();
        if !stream.apply(event.generation, &event.event) {
            return;
        }
        let after = stream.state();
        let id = event.channel;
        if after != before {
            out.push(MixEvent::StreamState {
                channel: id.clone(),
                state: after,
            });
        }
        match event.event {
            StreamEvent::Connected {
                bitrate_kbps,
                degraded,
            } => {
                tap.set_frozen(degraded);
                if let Some(kbps) = bitrate_kbps {
                    out.push(MixEvent::Bitrate {
                        channel: id.clone(),
                        kbps,
                    });
                }
                if degraded {
                    out.push(MixEvent::AnalysisDegraded {
                        channel: id.clone(),
                    });
                    self.log(
                        LogLevel::Warn,
                        format!("{}: playing without analysis (cross-origin)", id),
                    );
                } else {
                    self.log(LogLevel::Info, format!("{}: playing", id));
                }
            }
            StreamEvent::Bitrate(kbps) => out.push(MixEvent::Bitrate { channel: id, kbps }),
            StreamEvent::Reconnecting { attempt, reason } => {
                self.log(
                    LogLevel::Warn,
                    format!("{}: reconnecting ({}), attempt {}", id, reason, attempt),
                );
            }
            StreamEvent::Failed(reason) => {
                self.log(LogLevel::Error, format!("{}: {}", id, reason));
                out.push(MixEvent::StreamFailed {
                    channel: id,
                    reason: reason.to_string(),
                });
            }
        }
    }

    fn apply_runtime_event(&mut self, event: RuntimeEvent, out: &mut Vec<MixEvent>) {
        match event {
            RuntimeEvent::RouteFailed {
                bus,
                device,
                reason,
            } => {
                self.log(
                    LogLevel::Warn,
                    format!(
                        "{}: cannot open {}: {}",
                        bus,
                        device.as_deref().unwrap_or("default"),
                        reason
                    ),
                );
                out.push(MixEvent::RouteFailed { bus, reason });
            }
            RuntimeEvent::InputError { channel, reason } => {
                self.log(LogLevel::Warn, format!("{}: input error: {}", channel, reason));
                out.push(MixEvent::InputFailed { channel, reason });
            }
            RuntimeEvent::Stopped => debug!("audio runtime stopped"),
        }
    }

    /// Start recordings whose window just opened; stop the ones the
    /// schedule started once their window closes.
    fn evaluate_schedules(&mut self, time_of_day: NaiveTime, out: &mut Vec<MixEvent>) {
        for bus in BusId::ALL {
            let i = bus.index();
            let Some(window) = self.recorders[i].schedule() else {
                continue;
            };
            let open = window.contains(time_of_day);
            let was_open = std::mem::replace(&mut self.window_open[i], open);
            if open && !was_open && !self.recorders[i].is_recording() {
                match self.begin_recording(bus, true) {
                    Ok(()) => out.push(MixEvent::RecordingStarted {
                        bus,
                        scheduled: true,
                    }),
                    Err(e) => self.log(LogLevel::Warn, format!("{}: scheduled start failed: {}", bus, e)),
                }
            } else if !open && was_open && self.recorders[i].started_by_schedule() {
                if let Ok(true) = self.stop_recording(bus) {
                    out.push(MixEvent::RecordingStopped { bus });
                }
            }
        }
    }

    /// Stop every stream, recording and the audio runtime. Afterwards every
    /// operation fails with `EngineNotReady`.
    pub fn shutdown(&mut self) -> Result<()> {
        self.ensure_ready()?;
        let now = self.now();
        for ch in &mut self.channels {
            let input = ch.input().clone();
            if let Some(stream) = ch.stream_mut() {
                stream.stop(&input);
            }
        }
        for slot in &mut self.recorders {
            slot.stop(now);
        }
        if let Renderer::Realtime { handle, .. } = &self.renderer {
            handle.shutdown();
        }
        self.renderer = Renderer::Stopped;
        self.log(LogLevel::Info, "Engine shut down".into());
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn channel_ids(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.id().to_string()).collect()
    }

    fn channel_data(ch: &Channel) -> ChannelData {
        let stream = ch.stream();
        let live_device = match ch.source() {
            ChannelSource::Live { device } => device.clone(),
            ChannelSource::Stream(_) => None,
        };
        ChannelData {
            id: ch.id().to_string(),
            label: ch.label().to_string(),
            kind: ch.kind(),
            trim: ch.trim(),
            fader: ch.fader(),
            muted: ch.is_muted(),
            eq: ch.eq(),
            aux_sends: [ch.aux_send(0), ch.aux_send(1)],
            stations: ch.stations().iter().map(|s| s.name.clone()).collect(),
            url: stream.and_then(|s| s.url().map(str::to_string)),
            live_device,
            stream_state: stream.map(|s| s.state()),
            bitrate_kbps: stream.and_then(|s| s.bitrate_kbps()),
            analysis_degraded: stream.is_some_and(|s| s.is_degraded()),
            last_error: stream.and_then(|s| s.last_error().map(|e| e.to_string())),
            buffered_ms: ch.input().buffered_ms(),
        }
    }

    pub fn channel(&self, id: &str) -> Result<ChannelData> {
        let idx = self.channel_index(id)?;
        Ok(Self::channel_data(&self.channels[idx]))
    }

    pub fn channels(&self) -> Result<Vec<ChannelData>> {
        self.ensure_ready()?;
        Ok(self.channels.iter().map(Self::channel_data).collect())
    }

    fn recorder_data(slot: &RecorderSlot) -> RecorderData {
        let session = slot.session();
        RecorderData {
            state: slot.state(),
            format: slot.format(),
            elapsed_seconds: session.map_or(0, |s| s.elapsed_seconds()),
            captured_seconds: session.map_or(0.0, |s| s.captured_seconds()),
            chunk_count: session.map_or(0, |s| s.chunks().len()),
            schedule: slot.schedule().map(|w| w.to_string()),
        }
    }

    pub fn bus(&self, bus: BusId) -> Result<BusData> {
        self.ensure_ready()?;
        let b = &self.buses[bus.index()];
        Ok(BusData {
            id: bus,
            level: b.level(),
            dynamics: b.dynamics(),
            route: b.route().label().to_string(),
            recorder: Self::recorder_data(&self.recorders[bus.index()]),
        })
    }

    pub fn buses(&self) -> Result<Vec<BusData>> {
        BusId::ALL.iter().map(|&b| self.bus(b)).collect()
    }

    pub fn recorder(&self, bus: BusId) -> Result<RecorderData> {
        self.ensure_ready()?;
        Ok(Self::recorder_data(&self.recorders[bus.index()]))
    }

    pub fn status(&self) -> Result<StatusData> {
        self.ensure_ready()?;
        Ok(StatusData {
            realtime: self.is_realtime(),
            on_air: self.on_air.is_on_air(),
            any_playing: self.is_any_playing(),
            sample_rate: self.config.sample_rate,
            channel_count: self.channels.len(),
            recording: self
                .recorders
                .iter()
                .filter(|r| r.is_recording())
                .map(|r| r.bus())
                .collect(),
        })
    }

    pub fn is_on_air(&self) -> bool {
        self.on_air.is_on_air()
    }

    /// Read-only analysis tap of a channel (post-EQ, pre-fader).
    pub fn channel_tap(&self, id: &str) -> Result<AnalysisTap> {
        let idx = self.channel_index(id)?;
        Ok(self.channels[idx].tap().clone())
    }

    /// Read-only analysis tap of a bus's output.
    pub fn bus_tap(&self, bus: BusId) -> Result<AnalysisTap> {
        self.ensure_ready()?;
        Ok(self.buses[bus.index()].tap().clone())
    }

    pub fn logs(&self, since_index: usize) -> Vec<LogEntry> {
        self.logs.get(since_index)
    }
}

impl Drop for MixEngine {
    fn drop(&mut self) {
        if let Renderer::Realtime { handle, .. } = &self.renderer {
            handle.shutdown();
        }
    }
}
