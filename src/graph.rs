//! The render graph: per-strip processing, bus summing and the master
//! dynamics path.
//!
//! ```text
//! input → trim → EQ → tap ─┬─ aux1 send ──→ AUX1 sum → level → tap → capture
//!                          ├─ aux2 send ──→ AUX2 sum → level → tap → capture
//!                          └─ fader ──────→ MASTER sum → [comp] → [lim] → level → tap → capture
//! ```
//!
//! Continuous parameters come in through `ParamHandle`s. Structural changes
//! (dynamics layout, capture taps) arrive as `GraphCommand`s that are applied
//! between blocks, so the renderer never sees a half-built path.

use crate::bus::{BusHandles, BusId};
use crate::channel::StripHandles;
use crate::config::dynamics::REBUILD_CROSSFADE_FRAMES;
use crate::dsp::{DynamicsProcessor, StageKind, ThreeBandEq};
use crate::ramp::ParameterRamp;
use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

const CHANNELS: usize = 2;

pub enum GraphCommand {
    /// Start copying a bus's post-processing output to `tx`.
    AttachCapture { bus: BusId, tx: Sender<Vec<f32>> },
    DetachCapture { bus: BusId },
    /// Rebuild the MASTER dynamics path with these stages, in order.
    SetDynamics(Vec<StageKind>),
}

struct StripRender {
    handles: StripHandles,
    trim: ParameterRamp,
    fader: ParameterRamp,
    eq_gains: [ParameterRamp; 3],
    aux: [ParameterRamp; 2],
    eq: ThreeBandEq,
    scratch: Vec<f32>,
}

impl StripRender {
    fn new(handles: StripHandles, sample_rate: u32, block_samples: usize) -> Self {
        let ramp = |h: &crate::ramp::ParamHandle| ParameterRamp::new(h.clone(), sample_rate);
        let mut eq = ThreeBandEq::new(sample_rate);
        eq.set_gains(std::array::from_fn(|i| handles.eq[i].target()));
        StripRender {
            trim: ramp(&handles.trim),
            fader: ramp(&handles.fader),
            eq_gains: std::array::from_fn(|i| ramp(&handles.eq[i])),
            aux: std::array::from_fn(|i| ramp(&handles.aux[i])),
            eq,
            scratch: vec![0.0; block_samples],
            handles,
        }
    }
}

struct BusRender {
    id: BusId,
    tap: crate::tap::AnalysisTap,
    level: ParameterRamp,
    sum: Vec<f32>,
    capture: Option<Sender<Vec<f32>>>,
}

impl BusRender {
    fn new(id: BusId, handles: &BusHandles, sample_rate: u32, block_samples: usize) -> Self {
        BusRender {
            id,
            tap: handles.tap.clone(),
            level: ParameterRamp::new(handles.level.clone(), sample_rate),
            sum: vec![0.0; block_samples],
            capture: None,
        }
    }

    /// Output gain, tap and capture: the tail every bus shares.
    fn finish(&mut self) {
        self.level.apply(&mut self.sum, CHANNELS);
        self.tap.write(&self.sum);
        let lost = match &self.capture {
            Some(tx) => tx.send(self.sum.clone()).is_err(),
            None => false,
        };
        if lost {
            debug!("{} capture receiver gone, detaching", self.id);
            self.capture = None;
        }
    }
}

/// Old chain kept alive while the new one fades in.
struct Crossfade {
    old: Vec<DynamicsProcessor>,
    remaining: usize,
}

/// Per-block rendered output of every bus (interleaved stereo).
pub struct BusOutputs<'a> {
    pub master: &'a [f32],
    pub aux1: &'a [f32],
    pub aux2: &'a [f32],
}

impl BusOutputs<'_> {
    pub fn get(&self, bus: BusId) -> &[f32] {
        match bus {
            BusId::Master => self.master,
            BusId::Aux1 => self.aux1,
            BusId::Aux2 => self.aux2,
        }
    }
}

pub struct MixGraph {
    sample_rate: u32,
    block_frames: usize,
    strips: Vec<StripRender>,
    buses: [BusRender; 3],
    chain: Vec<DynamicsProcessor>,
    crossfade: Option<Crossfade>,
    fade_scratch: Vec<f32>,
    commands: Receiver<GraphCommand>,
    frames_rendered: u64,
}

impl MixGraph {
    pub fn new(
        sample_rate: u32,
        block_frames: usize,
        strips: Vec<StripHandles>,
        buses: [BusHandles; 3],
        layout: &[StageKind],
        commands: Receiver<GraphCommand>,
    ) -> Self {
        let block_samples = block_frames * CHANNELS;
        let buses = std::array::from_fn(|i| {
            BusRender::new(BusId::ALL[i], &buses[i], sample_rate, block_samples)
        });
        MixGraph {
            sample_rate,
            block_frames,
            strips: strips
                .into_iter()
                .map(|h| StripRender::new(h, sample_rate, block_samples))
                .collect(),
            buses,
            chain: layout
                .iter()
                .map(|&k| DynamicsProcessor::new(k, sample_rate))
                .collect(),
            crossfade: None,
            fade_scratch: vec![0.0; block_samples],
            commands,
            frames_rendered: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn block_frames(&self) -> usize {
        self.block_frames
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    /// Stages currently in the MASTER path, in order.
    pub fn dynamics_layout(&self) -> Vec<StageKind> {
        self.chain.iter().map(|p| p.kind()).collect()
    }

    fn apply_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                GraphCommand::AttachCapture { bus, tx } => {
                    self.buses[bus.index()].capture = Some(tx);
                }
                GraphCommand::DetachCapture { bus } => {
                    self.buses[bus.index()].capture = None;
                }
                GraphCommand::SetDynamics(layout) => self.rebuild_master_chain(&layout),
            }
        }
    }

    /// Swap the MASTER dynamics path for `layout` in one step.
    ///
    /// Stages present in both layouts carry their envelope over; the old
    /// path keeps running for a short crossfade so the switch is click-free.
    fn rebuild_master_chain(&mut self, layout: &[StageKind]) {
        if self.dynamics_layout() == layout {
            return;
        }
        let new_chain: Vec<DynamicsProcessor> = layout
            .iter()
            .map(|&kind| {
                self.chain
                    .iter()
                    .find(|p| p.kind() == kind)
                    .cloned()
                    .unwrap_or_else(|| DynamicsProcessor::new(kind, self.sample_rate))
            })
            .collect();
        debug!("master dynamics rebuilt: {:?}", layout);
        let old = std::mem::replace(&mut self.chain, new_chain);
        self.crossfade = Some(Crossfade {
            old,
            remaining: REBUILD_CROSSFADE_FRAMES,
        });
    }

    fn process_master_dynamics(&mut self) {
        let [master, ..] = &mut self.buses;
        let sum = &mut master.sum;

        if let Some(fade) = &mut self.crossfade {
            self.fade_scratch.copy_from_slice(sum);
            for stage in &mut fade.old {
                stage.process(&mut self.fade_scratch);
            }
            for stage in &mut self.chain {
                stage.process(sum);
            }
            let total = REBUILD_CROSSFADE_FRAMES as f32;
            for (frame, old) in sum
                .chunks_exact_mut(CHANNELS)
                .zip(self.fade_scratch.chunks_exact(CHANNELS))
            {
                if fade.remaining == 0 {
                    break;
                }
                let t = 1.0 - fade.remaining as f32 / total;
                for (s, o) in frame.iter_mut().zip(old) {
                    *s = *o * (1.0 - t) + *s * t;
                }
                fade.remaining -= 1;
            }
            if fade.remaining == 0 {
                self.crossfade = None;
            }
        } else {
            for stage in &mut self.chain {
                stage.process(sum);
            }
        }
    }

    /// Render one block and return every bus's output.
    pub fn render(&mut self) -> BusOutputs<'_> {
        self.apply_commands();
        let frames = self.block_frames;

        for bus in &mut self.buses {
            bus.sum.iter_mut().for_each(|s| *s = 0.0);
        }

        let [master, aux1, aux2] = &mut self.buses;
        for strip in &mut self.strips {
            strip.handles.input.pull(&mut strip.scratch);
            strip.trim.apply(&mut strip.scratch, CHANNELS);

            let gains = std::array::from_fn(|i| strip.eq_gains[i].advance(frames).1);
            strip.eq.set_gains(gains);
            strip.eq.process(&mut strip.scratch);

            strip.handles.tap.write(&strip.scratch);

            // Sends are taken here: post-EQ, pre-fader, independent of mute.
            for (send, bus) in strip.aux.iter_mut().zip([&mut *aux1, &mut *aux2]) {
                let (start, end) = send.advance(frames);
                mix_into(&mut bus.sum, &strip.scratch, start, end);
            }
            let (start, end) = strip.fader.advance(frames);
            mix_into(&mut master.sum, &strip.scratch, start, end);
        }

        self.process_master_dynamics();
        for bus in &mut self.buses {
            bus.finish();
        }
        self.frames_rendered += frames as u64;

        let [master, aux1, aux2] = &self.buses;
        BusOutputs {
            master: &master.sum,
            aux1: &aux1.sum,
            aux2: &aux2.sum,
        }
    }
}

/// Accumulate `src` into `dst` with a gain ramp from `start` to `end`.
fn mix_into(dst: &mut [f32], src: &[f32], start: f32, end: f32) {
    if start == 0.0 && end == 0.0 {
        return;
    }
    let frames = src.len() / CHANNELS;
    let step = (end - start) / frames.max(1) as f32;
    for (i, (d, s)) in dst
        .chunks_exact_mut(CHANNELS)
        .zip(src.chunks_exact(CHANNELS))
        .enumerate()
    {
        let gain = start + step * (i + 1) as f32;
        d[0] += s[0] * gain;
        d[1] += s[1] * gain;
    }
}
