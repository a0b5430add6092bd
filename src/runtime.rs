//! Realtime audio runtime: a dedicated thread that owns the mix graph and
//! the device streams.
//!
//! The graph is rendered ahead of the wall clock by a small lead and each
//! bus's block is queued on that bus's rodio sink. Live inputs are cpal
//! capture streams feeding a channel's `ChannelInput`. cpal streams are not
//! `Send`, so everything device-related is created and dropped on this
//! thread; callers talk to it through `RuntimeHandle`.

use crate::bus::BusId;
use crate::device::{find_input_device, find_output_device};
use crate::graph::MixGraph;
use crate::input::{ChannelInput, LinearResampler};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use rodio::buffer::SamplesBuffer;
use rodio::cpal::traits::{DeviceTrait, StreamTrait};
use rodio::cpal::{FromSample, SampleFormat, SizedSample};
use rodio::{OutputStream, Sink};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How far rendering runs ahead of the wall clock.
const RENDER_LEAD_MS: u64 = 60;

/// Blocks a sink may hold before new ones are dropped.
const MAX_QUEUED_BLOCKS: usize = 16;

/// How long a caller waits for a device to open.
const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

// ── Commands & Events ────────────────────────────────────────────────────────

pub enum RuntimeCmd {
    SetRoute {
        bus: BusId,
        device: Option<String>,
        reply: Sender<Result<(), String>>,
    },
    OpenInput {
        channel: String,
        device: Option<String>,
        input: ChannelInput,
        reply: Sender<Result<(), String>>,
    },
    Shutdown,
}

/// Events emitted by the runtime thread.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    RouteFailed {
        bus: BusId,
        device: Option<String>,
        reason: String,
    },
    InputError {
        channel: String,
        reason: String,
    },
    Stopped,
}

// ── Handle ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RuntimeHandle {
    tx: Sender<RuntimeCmd>,
}

impl RuntimeHandle {
    fn request(
        &self,
        make: impl FnOnce(Sender<Result<(), String>>) -> RuntimeCmd,
    ) -> Result<(), String> {
        let (reply, answer) = bounded(1);
        self.tx
            .send(make(reply))
            .map_err(|_| "audio runtime is not running".to_string())?;
        answer
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| "audio runtime did not answer".to_string())?
    }

    /// Re-bind a bus's output. On failure the previous binding keeps playing.
    pub fn set_route(&self, bus: BusId, device: Option<String>) -> Result<(), String> {
        self.request(|reply| RuntimeCmd::SetRoute { bus, device, reply })
    }

    pub fn open_input(
        &self,
        channel: &str,
        device: Option<String>,
        input: ChannelInput,
    ) -> Result<(), String> {
        let channel = channel.to_string();
        self.request(|reply| RuntimeCmd::OpenInput {
            channel,
            device,
            input,
            reply,
        })
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(RuntimeCmd::Shutdown);
    }
}

// ── Device streams ───────────────────────────────────────────────────────────

struct BusOutput {
    device: Option<String>,
    sink: Sink,
    _stream: OutputStream,
}

impl BusOutput {
    fn open(device: Option<&str>) -> Result<Self, String> {
        let dev = find_output_device(device)?;
        let (stream, handle) = OutputStream::try_from_device(&dev)
            .map_err(|e| format!("Failed to open audio output: {}", e))?;
        let sink =
            Sink::try_new(&handle).map_err(|e| format!("Failed to create audio sink: {}", e))?;
        Ok(BusOutput {
            device: device.map(str::to_string),
            sink,
            _stream: stream,
        })
    }

    fn push(&self, block: &[f32], sample_rate: u32) {
        if self.sink.len() >= MAX_QUEUED_BLOCKS {
            return;
        }
        self.sink
            .append(SamplesBuffer::new(2, sample_rate, block.to_vec()));
    }
}

fn build_capture<T>(
    device: &rodio::Device,
    config: &rodio::cpal::StreamConfig,
    input: ChannelInput,
    generation: u64,
    on_error: impl FnMut(rodio::cpal::StreamError) + Send + 'static,
) -> Result<rodio::cpal::Stream, String>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let mut resampler = LinearResampler::new(config.sample_rate.0, input.sample_rate(), channels);
    let mut converted: Vec<f32> = Vec::new();
    let mut out: Vec<f32> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &rodio::cpal::InputCallbackInfo| {
                converted.clear();
                converted.extend(data.iter().map(|&s| <f32 as FromSample<T>>::from_sample_(s)));
                out.clear();
                resampler.process(&converted, &mut out);
                input.push(generation, &out);
            },
            on_error,
            None,
        )
        .map_err(|e| format!("Failed to build input stream: {}", e))
}

fn open_capture<F>(
    device_id: Option<&str>,
    input: ChannelInput,
    on_error: F,
) -> Result<rodio::cpal::Stream, String>
where
    F: FnMut(rodio::cpal::StreamError) + Send + 'static,
{
    let device = find_input_device(device_id)?;
    let supported = device
        .default_input_config()
        .map_err(|e| format!("No usable input config: {}", e))?;
    let config = supported.config();
    // The previous capture keeps the channel until the new one is running.
    input.clone().hand_over(|generation| {
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_capture::<f32>(&device, &config, input, generation, on_error),
            SampleFormat::I16 => build_capture::<i16>(&device, &config, input, generation, on_error),
            SampleFormat::U16 => build_capture::<u16>(&device, &config, input, generation, on_error),
            other => Err(format!("Unsupported input sample format {:?}", other)),
        }?;
        stream
            .play()
            .map_err(|e| format!("Failed to start input stream: {}", e))?;
        Ok(stream)
    })
}

// ── Runtime ──────────────────────────────────────────────────────────────────

/// Spawn the runtime with each bus routed per `routes` (indexed by `BusId`).
///
/// `on_event` is called from the runtime thread. Initial routes that cannot
/// be opened are reported as `RouteFailed`; that bus keeps rendering for its
/// taps and recordings without a device.
pub fn spawn_runtime<F>(graph: MixGraph, routes: [Option<String>; 3], on_event: F) -> RuntimeHandle
where
    F: Fn(RuntimeEvent) + Send + 'static,
{
    let (tx, rx) = unbounded::<RuntimeCmd>();

    std::thread::Builder::new()
        .name("audio-runtime".into())
        .spawn(move || runtime_loop(rx, graph, routes, on_event))
        .expect("failed to spawn audio-runtime thread");

    RuntimeHandle { tx }
}

fn runtime_loop<F>(
    rx: Receiver<RuntimeCmd>,
    mut graph: MixGraph,
    routes: [Option<String>; 3],
    on_event: F,
) where
    F: Fn(RuntimeEvent) + Send + 'static,
{
    let sample_rate = graph.sample_rate();
    let block = Duration::from_secs_f64(graph.block_frames() as f64 / sample_rate as f64);
    let lead_frames = sample_rate as u64 * RENDER_LEAD_MS / 1000;

    let mut outputs: [Option<BusOutput>; 3] = [None, None, None];
    for bus in BusId::ALL {
        let device = routes[bus.index()].clone();
        match BusOutput::open(device.as_deref()) {
            Ok(out) => {
                info!("{} -> {}", bus, device.as_deref().unwrap_or("default"));
                outputs[bus.index()] = Some(out);
            }
            Err(reason) => on_event(RuntimeEvent::RouteFailed {
                bus,
                device,
                reason,
            }),
        }
    }

    let (input_err_tx, input_err_rx) = unbounded::<(String, String)>();
    let mut captures: HashMap<String, rodio::cpal::Stream> = HashMap::new();

    let mut clock = Instant::now();
    let mut rendered_since_clock: u64 = 0;

    loop {
        // Render up to the wall clock plus lead.
        let due = (clock.elapsed().as_secs_f64() * sample_rate as f64) as u64 + lead_frames;
        if due > rendered_since_clock + sample_rate as u64 {
            // Stalled for over a second; skip ahead instead of bursting.
            warn!("audio runtime fell behind; resyncing");
            clock = Instant::now();
            rendered_since_clock = 0;
        }
        let due = (clock.elapsed().as_secs_f64() * sample_rate as f64) as u64 + lead_frames;
        while rendered_since_clock < due {
            let rendered = graph.render();
            for bus in BusId::ALL {
                if let Some(out) = &outputs[bus.index()] {
                    out.push(rendered.get(bus), sample_rate);
                }
            }
            rendered_since_clock += graph.block_frames() as u64;
        }

        for (channel, reason) in input_err_rx.try_iter() {
            on_event(RuntimeEvent::InputError { channel, reason });
        }

        match rx.recv_timeout(block) {
            Ok(RuntimeCmd::SetRoute { bus, device, reply }) => {
                let result = BusOutput::open(device.as_deref()).map(|out| {
                    let previous = outputs[bus.index()].replace(out);
                    debug!(
                        "{} route {:?} -> {:?}",
                        bus,
                        previous.and_then(|p| p.device),
                        device
                    );
                });
                if let Err(reason) = &result {
                    on_event(RuntimeEvent::RouteFailed {
                        bus,
                        device,
                        reason: reason.clone(),
                    });
                }
                let _ = reply.send(result);
            }
            Ok(RuntimeCmd::OpenInput {
                channel,
                device,
                input,
                reply,
            }) => {
                let errors = input_err_tx.clone();
                let name = channel.clone();
                let result = open_capture(device.as_deref(), input, move |e| {
                    let _ = errors.send((name.clone(), e.to_string()));
                })
                .map(|stream| {
                    // Replacing drops (and stops) the previous capture.
                    captures.insert(channel.clone(), stream);
                    info!("{} capturing from {}", channel, device.as_deref().unwrap_or("default"));
                });
                let _ = reply.send(result);
            }
            Ok(RuntimeCmd::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    captures.clear();
    for out in outputs.iter().flatten() {
        out.sink.stop();
    }
    on_event(RuntimeEvent::Stopped);
}

// ── Tests ────────────────────────────────────────────────────────────────────
