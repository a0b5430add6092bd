//! Control-side channel strip.
//!
//! A `Channel` keeps the user's stored settings and writes *effective* values
//! into the render handles: mute forces the fader handle to 0 without touching
//! the stored fader, and EQ bypass forces the live band gains to 0 without
//! touching the stored curve. Aux sends never consult mute or fader.

use crate::catalog::{ChannelConfig, ChannelKind, Station};
use crate::config::{eq, ranges, taps};
use crate::dsp::EqBand;
use crate::input::ChannelInput;
use crate::ramp::ParamHandle;
use crate::stream::StreamSource;
use crate::tap::AnalysisTap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EqSettings {
    pub low: f32,
    pub mid: f32,
    pub high: f32,
    pub bypass: bool,
}

impl Default for EqSettings {
    fn default() -> Self {
        EqSettings {
            low: 0.0,
            mid: 0.0,
            high: 0.0,
            bypass: false,
        }
    }
}

impl EqSettings {
    pub fn get(&self, band: EqBand) -> f32 {
        match band {
            EqBand::Low => self.low,
            EqBand::Mid => self.mid,
            EqBand::High => self.high,
        }
    }

    fn set(&mut self, band: EqBand, gain: f32) {
        match band {
            EqBand::Low => self.low = gain,
            EqBand::Mid => self.mid = gain,
            EqBand::High => self.high = gain,
        }
    }

    /// Gains the filters should actually apply.
    pub fn effective(&self) -> [f32; 3] {
        if self.bypass {
            [0.0; 3]
        } else {
            [self.low, self.mid, self.high]
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AuxSend {
    pub level: f32,
    pub enabled: bool,
}

impl AuxSend {
    pub fn effective(&self) -> f32 {
        if self.enabled { self.level } else { 0.0 }
    }
}

/// Render-side handles for one strip. The graph holds a clone.
#[derive(Clone)]
pub struct StripHandles {
    pub trim: ParamHandle,
    /// Effective fader (0 while muted).
    pub fader: ParamHandle,
    /// Effective EQ gains in dB (0 while bypassed).
    pub eq: [ParamHandle; 3],
    /// Effective aux1/aux2 send gains.
    pub aux: [ParamHandle; 2],
    pub input: ChannelInput,
    pub tap: AnalysisTap,
}

pub enum ChannelSource {
    Live { device: Option<String> },
    Stream(StreamSource),
}

pub struct Channel {
    config: ChannelConfig,
    trim: f32,
    fader: f32,
    muted: bool,
    eq: EqSettings,
    aux: [AuxSend; 2],
    handles: StripHandles,
    source: ChannelSource,
    time_constant: f32,
    aux_time_constant: f32,
}

impl Channel {
    pub fn new(
        config: ChannelConfig,
        input: ChannelInput,
        time_constant: f32,
        aux_time_constant: f32,
    ) -> Self {
        let trim = 1.0;
        let fader = ranges::FADER_DEFAULT;
        let handles = StripHandles {
            trim: ParamHandle::new(trim, time_constant),
            fader: ParamHandle::new(fader, time_constant),
            eq: std::array::from_fn(|_| ParamHandle::new(0.0, time_constant)),
            aux: std::array::from_fn(|_| ParamHandle::new(0.0, aux_time_constant)),
            input,
            tap: AnalysisTap::new(taps::CHANNEL_TAP_FRAMES),
        };
        let source = match config.kind {
            ChannelKind::Live => ChannelSource::Live { device: None },
            ChannelKind::Stream => {
                ChannelSource::Stream(StreamSource::new(config.initial_url().map(String::from)))
            }
        };
        Channel {
            config,
            trim,
            fader,
            muted: false,
            eq: EqSettings::default(),
            aux: [AuxSend {
                level: 0.0,
                enabled: false,
            }; 2],
            handles,
            source,
            time_constant,
            aux_time_constant,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    pub fn kind(&self) -> ChannelKind {
        self.config.kind
    }

    pub fn stations(&self) -> &[Station] {
        &self.config.stations
    }

    pub fn station(&self, name: &str) -> Option<&Station> {
        self.config.station(name)
    }

    pub fn handles(&self) -> &StripHandles {
        &self.handles
    }

    pub fn input(&self) -> &ChannelInput {
        &self.handles.input
    }

    pub fn tap(&self) -> &AnalysisTap {
        &self.handles.tap
    }

    pub fn source(&self) -> &ChannelSource {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut ChannelSource {
        &mut self.source
    }

    pub fn stream(&self) -> Option<&StreamSource> {
        match &self.source {
            ChannelSource::Stream(s) => Some(s),
            ChannelSource::Live { .. } => None,
        }
    }

    pub fn stream_mut(&mut self) -> Option<&mut StreamSource> {
        match &mut self.source {
            ChannelSource::Stream(s) => Some(s),
            ChannelSource::Live { .. } => None,
        }
    }

    // ── Stored values ───────────────────────────────────────────────────

    pub fn trim(&self) -> f32 {
        self.trim
    }

    pub fn fader(&self) -> f32 {
        self.fader
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn eq(&self) -> EqSettings {
        self.eq
    }

    pub fn aux_send(&self, index: usize) -> AuxSend {
        self.aux[index]
    }

    /// Fader contribution to MASTER after mute.
    pub fn effective_fader(&self) -> f32 {
        if self.muted { 0.0 } else { self.fader }
    }

    // ── Setters ─────────────────────────────────────────────────────────

    pub fn set_trim(&mut self, trim: f32) -> f32 {
        self.trim = trim.clamp(ranges::TRIM_MIN, ranges::TRIM_MAX);
        self.handles.trim.set_target(self.trim, self.time_constant);
        self.trim
    }

    pub fn set_fader(&mut self, fader: f32) -> f32 {
        self.fader = fader.clamp(0.0, ranges::FADER_MAX);
        self.push_fader();
        self.fader
    }

    pub fn set_mute(&mut self, muted: bool) {
        self.muted = muted;
        self.push_fader();
    }

    fn push_fader(&self) {
        self.handles
            .fader
            .set_target(self.effective_fader(), self.time_constant);
    }

    pub fn set_eq_band(&mut self, band: EqBand, gain: f32) -> f32 {
        let gain = gain.clamp(eq::MIN_GAIN_DB, eq::MAX_GAIN_DB);
        self.eq.set(band, gain);
        self.push_eq();
        gain
    }

    /// Flip bypass; stored band gains are untouched either way.
    pub fn toggle_eq_bypass(&mut self) -> bool {
        self.eq.bypass = !self.eq.bypass;
        self.push_eq();
        self.eq.bypass
    }

    fn push_eq(&self) {
        for (handle, gain) in self.handles.eq.iter().zip(self.eq.effective()) {
            handle.set_target(gain, self.time_constant);
        }
    }

    /// Store a send level; a nonzero level also enables the send.
    pub fn set_aux_send(&mut self, index: usize, level: f32) -> AuxSend {
        let send = &mut self.aux[index];
        send.level = level.clamp(0.0, ranges::AUX_SEND_MAX);
        if send.level > 0.0 {
            send.enabled = true;
        }
        self.push_aux(index);
        self.aux[index]
    }

    /// Flip a send on or off. Enabling a send with no level sets unity.
    pub fn toggle_aux_send(&mut self, index: usize) -> AuxSend {
        let send = &mut self.aux[index];
        send.enabled = !send.enabled;
        if send.enabled && send.level == 0.0 {
            send.level = 1.0;
        }
        self.push_aux(index);
        self.aux[index]
    }

    fn push_aux(&self, index: usize) {
        self.handles.aux[index].set_target(self.aux[index].effective(), self.aux_time_constant);
    }
}
