use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

struct TapRing {
    samples: Vec<f32>,
    pos: usize,
}

/// Read-only time-domain window over a point in the mix graph.
///
/// The renderer writes every block (stereo downmixed to mono); consumers pull a
/// snapshot at their own rate. The last block's RMS is also kept as f32 bits
/// so level polling never takes the lock.
#[derive(Clone)]
pub struct AnalysisTap {
    ring: Arc<Mutex<TapRing>>,
    level: Arc<AtomicU32>,
    frozen: Arc<AtomicBool>,
}

impl AnalysisTap {
    pub fn new(size: usize) -> Self {
        AnalysisTap {
            ring: Arc::new(Mutex::new(TapRing {
                samples: vec![0.0; size.max(1)],
                pos: 0,
            })),
            level: Arc::new(AtomicU32::new(0)),
            frozen: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn size(&self) -> usize {
        self.ring.lock().samples.len()
    }

    /// RMS of the most recent block (0.0–1.0+).
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    /// Oldest-to-newest copy of the window.
    pub fn snapshot(&self) -> Vec<f32> {
        let ring = self.ring.lock();
        let mut out = Vec::with_capacity(ring.samples.len());
        out.extend_from_slice(&ring.samples[ring.pos..]);
        out.extend_from_slice(&ring.samples[..ring.pos]);
        out
    }

    /// RMS over the whole window.
    pub fn rms(&self) -> f32 {
        let ring = self.ring.lock();
        let sum_sq: f64 = ring.samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum_sq / ring.samples.len() as f64).sqrt() as f32
    }

    /// A frozen tap ignores writes and reads as silence. Used for streams
    /// admitted without analysis access.
    pub fn set_frozen(&self, frozen: bool) {
        self.frozen.store(frozen, Ordering::Relaxed);
        if frozen {
            self.clear();
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        ring.samples.iter_mut().for_each(|s| *s = 0.0);
        ring.pos = 0;
        self.level.store(0f32.to_bits(), Ordering::Relaxed);
    }

    /// Record an interleaved stereo block.
    pub fn write(&self, block: &[f32]) {
        if self.is_frozen() {
            return;
        }
        let mut sum_sq = 0.0f64;
        let mut ring = self.ring.lock();
        let len = ring.samples.len();
        for frame in block.chunks_exact(2) {
            let mono = (frame[0] + frame[1]) * 0.5;
            sum_sq += (mono as f64) * (mono as f64);
            let pos = ring.pos;
            ring.samples[pos] = mono;
            ring.pos = (pos + 1) % len;
        }
        let frames = block.len() / 2;
        if frames > 0 {
            let rms = (sum_sq / frames as f64).sqrt() as f32;
            self.level.store(rms.to_bits(), Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_silent() {
        let tap = AnalysisTap::new(256);
        assert_eq!(tap.size(), 256);
        assert_eq!(tap.level(), 0.0);
        assert_eq!(tap.rms(), 0.0);
        assert!(tap.snapshot().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn write_downmixes_and_measures() {
        let tap = AnalysisTap::new(4);
        tap.write(&[0.5, 0.5, -0.5, -0.5]);
        assert!((tap.level() - 0.5).abs() < 1e-6);
        let snap = tap.snapshot();
        assert_eq!(snap.len(), 4);
        assert_eq!(&snap[2..], &[0.5, -0.5]);
    }

    #[test]
    fn ring_wraps_oldest_first() {
        let tap = AnalysisTap::new(3);
        tap.write(&[0.1, 0.1, 0.2, 0.2, 0.3, 0.3, 0.4, 0.4]);
        let snap = tap.snapshot();
        assert!((snap[0] - 0.2).abs() < 1e-6);
        assert!((snap[2] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn frozen_tap_ignores_writes() {
        let tap = AnalysisTap::new(8);
        tap.write(&[0.5; 16]);
        tap.set_frozen(true);
        assert_eq!(tap.level(), 0.0);
        tap.write(&[0.5; 16]);
        assert_eq!(tap.rms(), 0.0);
        tap.set_frozen(false);
        tap.write(&[0.5; 16]);
        assert!(tap.rms() > 0.4);
    }

    #[test]
    fn clones_share_state() {
        let tap = AnalysisTap::new(8);
        let reader = tap.clone();
        tap.write(&[0.25; 16]);
        assert!((reader.level() - 0.25).abs() < 1e-6);
    }
}
