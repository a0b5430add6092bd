use std::time::Duration;

/// Derives the "on air" flag from the master tap.
///
/// Evaluated at most once per `interval`: the station is on air while the
/// master RMS is above `threshold`.
pub struct OnAirDetector {
    threshold: f32,
    interval: Duration,
    last_check: Option<Duration>,
    on_air: bool,
}

impl OnAirDetector {
    pub fn new(threshold: f32, interval: Duration) -> Self {
        OnAirDetector {
            threshold,
            interval,
            last_check: None,
            on_air: false,
        }
    }

    pub fn is_on_air(&self) -> bool {
        self.on_air
    }

    /// Feed the current master RMS at engine time `now`.
    /// Returns the new state when it flipped.
    pub fn update(&mut self, now: Duration, rms: f32) -> Option<bool> {
        if let Some(last) = self.last_check {
            if now.saturating_sub(last) < self.interval {
                return None;
            }
        }
        self.last_check = Some(now);

        let on_air = rms > self.threshold;
        if on_air != self.on_air {
            self.on_air = on_air;
            Some(on_air)
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.last_check = None;
        self.on_air = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> OnAirDetector {
        OnAirDetector::new(0.005, Duration::from_millis(200))
    }

    #[test]
    fn silence_is_off_air() {
        let mut d = detector();
        assert_eq!(d.update(Duration::ZERO, 0.0), None);
        assert!(!d.is_on_air());
    }

    #[test]
    fn signal_above_threshold_goes_on_air() {
        let mut d = detector();
        assert_eq!(d.update(Duration::ZERO, 0.1), Some(true));
        assert!(d.is_on_air());
    }

    #[test]
    fn checks_are_rate_limited() {
        let mut d = detector();
        d.update(Duration::ZERO, 0.1);
        // Drop to silence 100ms later: too soon to re-evaluate.
        assert_eq!(d.update(Duration::from_millis(100), 0.0), None);
        assert!(d.is_on_air());
        assert_eq!(d.update(Duration::from_millis(200), 0.0), Some(false));
    }

    #[test]
    fn threshold_is_exclusive() {
        let mut d = detector();
        assert_eq!(d.update(Duration::ZERO, 0.005), None);
        assert!(!d.is_on_air());
    }

    #[test]
    fn reset_clears_state() {
        let mut d = detector();
        d.update(Duration::ZERO, 0.5);
        d.reset();
        assert!(!d.is_on_air());
        assert_eq!(d.update(Duration::from_millis(1), 0.5), Some(true));
    }
}
