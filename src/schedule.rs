//! Daily capture windows for scheduled bus recordings.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Parse a time string in HH:MM or HH:MM:SS format.
pub fn parse_time(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| format!("Invalid time '{}'. Expected HH:MM or HH:MM:SS", s))
}

/// A daily window `[start, end)`. `end` before `start` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl RecordingWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, String> {
        if start == end {
            return Err(format!("Empty recording window at {}", start.format("%H:%M")));
        }
        Ok(RecordingWindow { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, String> {
        Self::new(parse_time(start)?, parse_time(end)?)
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start < self.end {
            t >= self.start && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

impl fmt::Display for RecordingWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format("%H:%M:%S"),
            self.end.format("%H:%M:%S")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn parse_time_hhmm() {
        assert_eq!(parse_time("14:00").unwrap(), t(14, 0));
    }

    #[test]
    fn parse_time_hhmmss() {
        let parsed = parse_time("14:30:15").unwrap();
        assert_eq!(parsed, NaiveTime::from_hms_opt(14, 30, 15).unwrap());
    }

    #[test]
    fn parse_time_invalid() {
        assert!(parse_time("25:00").is_err());
        assert!(parse_time("abc").is_err());
        assert!(parse_time("").is_err());
    }

    #[test]
    fn daytime_window() {
        let w = RecordingWindow::parse("09:00", "10:30").unwrap();
        assert!(!w.contains(t(8, 59)));
        assert!(w.contains(t(9, 0)));
        assert!(w.contains(t(10, 29)));
        assert!(!w.contains(t(10, 30)));
    }

    #[test]
    fn window_wraps_midnight() {
        let w = RecordingWindow::parse("23:00", "01:00").unwrap();
        assert!(w.contains(t(23, 30)));
        assert!(w.contains(t(0, 15)));
        assert!(!w.contains(t(1, 0)));
        assert!(!w.contains(t(12, 0)));
    }

    #[test]
    fn empty_window_rejected() {
        assert!(RecordingWindow::parse("10:00", "10:00").is_err());
    }
}
