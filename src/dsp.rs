//! Sample-level processors used by the mix graph: RBJ biquads for the
//! channel EQ and a feed-forward gain computer for master dynamics.
//!
//! All processors work on interleaved stereo blocks in place.

use crate::config::{dynamics, eq};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Flush values too small to matter (avoids denormal slowdowns in feedback paths).
#[inline]
fn flush_denormal(x: f64) -> f64 {
    if x.abs() < 1e-20 { 0.0 } else { x }
}

pub fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

pub fn linear_to_db(linear: f32) -> f32 {
    20.0 * linear.max(1e-9).log10()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EqBand {
    Low,
    Mid,
    High,
}

impl EqBand {
    pub const ALL: [EqBand; 3] = [EqBand::Low, EqBand::Mid, EqBand::High];

    pub fn index(self) -> usize {
        match self {
            EqBand::Low => 0,
            EqBand::Mid => 1,
            EqBand::High => 2,
        }
    }
}

impl std::str::FromStr for EqBand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" | "l" => Ok(EqBand::Low),
            "mid" | "m" => Ok(EqBand::Mid),
            "high" | "h" => Ok(EqBand::High),
            other => Err(format!("unknown EQ band '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FilterShape {
    LowShelf,
    Peak,
    HighShelf,
}

/// Stereo biquad, Direct Form II Transposed, f64 state.
struct Biquad {
    shape: FilterShape,
    frequency: f64,
    q: f64,
    sample_rate: f64,
    gain_db: f32,
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: [f64; 2],
    z2: [f64; 2],
}

impl Biquad {
    fn new(shape: FilterShape, frequency: f32, q: f32, sample_rate: u32) -> Self {
        let mut filter = Biquad {
            shape,
            frequency: frequency as f64,
            q: q as f64,
            sample_rate: sample_rate as f64,
            gain_db: f32::NAN,
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            z1: [0.0; 2],
            z2: [0.0; 2],
        };
        filter.set_gain(0.0);
        filter
    }

    /// Recompute coefficients when the gain moved by more than 0.01 dB.
    fn set_gain(&mut self, gain_db: f32) {
        if (self.gain_db - gain_db).abs() < 0.01 {
            return;
        }
        self.gain_db = gain_db;

        let a = 10f64.powf(gain_db as f64 / 40.0);
        let w0 = 2.0 * PI * self.frequency / self.sample_rate;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * self.q);

        let (b0, b1, b2, a0, a1, a2) = match self.shape {
            FilterShape::Peak => (
                1.0 + alpha * a,
                -2.0 * cos_w0,
                1.0 - alpha * a,
                1.0 + alpha / a,
                -2.0 * cos_w0,
                1.0 - alpha / a,
            ),
            FilterShape::LowShelf => {
                let k = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) - (a - 1.0) * cos_w0 + k),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w0),
                    a * ((a + 1.0) - (a - 1.0) * cos_w0 - k),
                    (a + 1.0) + (a - 1.0) * cos_w0 + k,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cos_w0),
                    (a + 1.0) + (a - 1.0) * cos_w0 - k,
                )
            }
            FilterShape::HighShelf => {
                let k = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) + (a - 1.0) * cos_w0 + k),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w0),
                    a * ((a + 1.0) + (a - 1.0) * cos_w0 - k),
                    (a + 1.0) - (a - 1.0) * cos_w0 + k,
                    2.0 * ((a - 1.0) - (a + 1.0) * cos_w0),
                    (a + 1.0) - (a - 1.0) * cos_w0 - k,
                )
            }
        };

        self.b0 = b0 / a0;
        self.b1 = b1 / a0;
        self.b2 = b2 / a0;
        self.a1 = a1 / a0;
        self.a2 = a2 / a0;
    }

    fn process(&mut self, block: &mut [f32]) {
        for frame in block.chunks_exact_mut(2) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                let x = *sample as f64;
                let y = self.b0 * x + self.z1[ch];
                self.z1[ch] = flush_denormal(self.b1 * x - self.a1 * y + self.z2[ch]);
                self.z2[ch] = flush_denormal(self.b2 * x - self.a2 * y);
                *sample = y as f32;
            }
        }
    }
}

/// Low shelf, mid peak and high shelf in series.
pub struct ThreeBandEq {
    bands: [Biquad; 3],
}

impl ThreeBandEq {
    pub fn new(sample_rate: u32) -> Self {
        ThreeBandEq {
            bands: [
                Biquad::new(FilterShape::LowShelf, eq::LOW_SHELF_HZ, 0.707, sample_rate),
                Biquad::new(FilterShape::Peak, eq::MID_PEAK_HZ, eq::MID_PEAK_Q, sample_rate),
                Biquad::new(FilterShape::HighShelf, eq::HIGH_SHELF_HZ, 0.707, sample_rate),
            ],
        }
    }

    /// Set the live gains (dB) for low, mid and high.
    pub fn set_gains(&mut self, gains_db: [f32; 3]) {
        for (band, gain) in self.bands.iter_mut().zip(gains_db) {
            band.set_gain(gain.clamp(eq::MIN_GAIN_DB, eq::MAX_GAIN_DB));
        }
    }

    /// All three live gains are flat.
    pub fn is_flat(&self) -> bool {
        self.bands.iter().all(|b| b.gain_db.abs() < 0.01)
    }

    pub fn process(&mut self, block: &mut [f32]) {
        for band in &mut self.bands {
            band.process(block);
        }
    }
}

/// Which master dynamics stage a processor implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Compressor,
    Limiter,
}

/// Feed-forward peak compressor with linked stereo detection.
#[derive(Clone)]
pub struct DynamicsProcessor {
    kind: StageKind,
    threshold_db: f32,
    ratio: f32,
    makeup: f32,
    attack_coeff: f32,
    release_coeff: f32,
    envelope_db: f32,
}

impl DynamicsProcessor {
    pub fn new(kind: StageKind, sample_rate: u32) -> Self {
        let (threshold_db, ratio, attack_ms, release_ms, makeup_db) = match kind {
            StageKind::Compressor => (
                dynamics::COMPRESSOR_THRESHOLD_DB,
                dynamics::COMPRESSOR_RATIO,
                dynamics::COMPRESSOR_ATTACK_MS,
                dynamics::COMPRESSOR_RELEASE_MS,
                dynamics::COMPRESSOR_MAKEUP_DB,
            ),
            StageKind::Limiter => (
                dynamics::LIMITER_THRESHOLD_DB,
                dynamics::LIMITER_RATIO,
                dynamics::LIMITER_ATTACK_MS,
                dynamics::LIMITER_RELEASE_MS,
                0.0,
            ),
        };
        let coeff = |ms: f32| (-1.0 / (ms * 0.001 * sample_rate as f32)).exp();
        DynamicsProcessor {
            kind,
            threshold_db,
            ratio,
            makeup: db_to_linear(makeup_db),
            attack_coeff: coeff(attack_ms),
            release_coeff: coeff(release_ms),
            envelope_db: 0.0,
        }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    /// Current gain reduction in dB (positive = reducing).
    pub fn gain_reduction_db(&self) -> f32 {
        self.envelope_db
    }

    pub fn process(&mut self, block: &mut [f32]) {
        for frame in block.chunks_exact_mut(2) {
            let peak = frame[0].abs().max(frame[1].abs());
            let over = linear_to_db(peak) - self.threshold_db;
            let target = if over > 0.0 {
                over - over / self.ratio
            } else {
                0.0
            };
            let coeff = if target > self.envelope_db {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.envelope_db = target + coeff * (self.envelope_db - target);
            let gain = db_to_linear(-self.envelope_db) * self.makeup;
            frame[0] *= gain;
            frame[1] *= gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 48_000;

    fn sine(freq: f32, frames: usize, amp: f32) -> Vec<f32> {
        (0..frames)
            .flat_map(|i| {
                let s = amp * (2.0 * std::f32::consts::PI * freq * i as f32 / SR as f32).sin();
                [s, s]
            })
            .collect()
    }

    fn peak(block: &[f32]) -> f32 {
        block.iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }

    #[test]
    fn flat_eq_is_transparent() {
        let mut eq = ThreeBandEq::new(SR);
        assert!(eq.is_flat());
        let input = sine(440.0, 4800, 0.5);
        let mut block = input.clone();
        eq.process(&mut block);
        for (a, b) in input.iter().zip(&block) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn low_shelf_boosts_bass() {
        let mut eq = ThreeBandEq::new(SR);
        eq.set_gains([12.0, 0.0, 0.0]);
        let mut block = sine(40.0, 48_000, 0.1);
        eq.process(&mut block);
        // Skip the filter's settling time.
        assert!(peak(&block[48_000..]) > 0.3);
    }

    #[test]
    fn mid_cut_attenuates_1k() {
        let mut eq = ThreeBandEq::new(SR);
        eq.set_gains([0.0, -12.0, 0.0]);
        let mut block = sine(1000.0, 9600, 0.5);
        eq.process(&mut block);
        assert!(peak(&block[9600..]) < 0.2);
    }

    #[test]
    fn gains_are_clamped() {
        let mut eq = ThreeBandEq::new(SR);
        eq.set_gains([40.0, -40.0, 0.0]);
        assert_eq!(eq.bands[0].gain_db, 12.0);
        assert_eq!(eq.bands[1].gain_db, -12.0);
    }

    #[test]
    fn band_parses() {
        assert_eq!("LOW".parse::<EqBand>().unwrap(), EqBand::Low);
        assert_eq!("m".parse::<EqBand>().unwrap(), EqBand::Mid);
        assert!("treble".parse::<EqBand>().is_err());
    }

    #[test]
    fn limiter_holds_peaks_near_threshold() {
        let mut limiter = DynamicsProcessor::new(StageKind::Limiter, SR);
        let mut block = sine(200.0, 48_000, 1.0);
        limiter.process(&mut block);
        let ceiling = db_to_linear(dynamics::LIMITER_THRESHOLD_DB);
        assert!(peak(&block[48_000..]) < ceiling * 1.3);
        assert!(limiter.gain_reduction_db() > 0.0);
    }

    #[test]
    fn quiet_signal_passes_limiter() {
        let mut limiter = DynamicsProcessor::new(StageKind::Limiter, SR);
        let input = sine(200.0, 4800, 0.1);
        let mut block = input.clone();
        limiter.process(&mut block);
        assert_eq!(block, input);
    }

    #[test]
    fn db_conversions_invert() {
        assert!((db_to_linear(-6.0) - 0.501).abs() < 0.001);
        assert!((linear_to_db(db_to_linear(-18.0)) + 18.0).abs() < 1e-3);
    }
}
