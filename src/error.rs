//! Error types for the mixing core.
//!
//! Every failure the control surface can report is a `MixError`. Stream
//! failures carry a `BindFailure` that the stream state machine uses to
//! decide whether a retry is worth attempting.

use crate::bus::BusId;
use thiserror::Error;

/// Why a stream session could not be established or kept alive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindFailure {
    /// The server refused the analysis-capable request (401/403 with an
    /// `Origin` header). Retried once in playback-only mode.
    #[error("cross-origin access refused: {0}")]
    CrossOrigin(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {0}")]
    Http(u16),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("stream ended")]
    EndOfStream,
}

impl BindFailure {
    /// Failures that a playback-only reconnect may get past.
    pub fn is_cross_origin(&self) -> bool {
        matches!(self, BindFailure::CrossOrigin(_))
    }
}

/// Main error type for the mixing engine.
#[derive(Error, Debug)]
pub enum MixError {
    #[error("engine is not running")]
    EngineNotReady,

    #[error("unknown handle: {0}")]
    InvalidHandle(String),

    #[error("channel {channel}: stream bind failed: {reason}")]
    StreamBindFailure { channel: String, reason: BindFailure },

    #[error("{0} is already recording")]
    AlreadyRecording(BusId),

    #[error("recording export failed: {0}")]
    RecordingExportFailure(String),

    #[error("cannot route {target}: {reason}")]
    DeviceRouteFailure { target: String, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the mixing engine.
pub type Result<T> = std::result::Result<T, MixError>;

pub(crate) fn export_failure(context: &str, e: impl std::fmt::Display) -> MixError {
    MixError::RecordingExportFailure(format!("{}: {}", context, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_origin_is_detected() {
        assert!(BindFailure::CrossOrigin("403".into()).is_cross_origin());
        assert!(!BindFailure::Http(404).is_cross_origin());
        assert!(!BindFailure::EndOfStream.is_cross_origin());
    }

    #[test]
    fn messages_name_the_target() {
        let e = MixError::AlreadyRecording(BusId::Aux2);
        assert_eq!(e.to_string(), "AUX2 is already recording");

        let e = MixError::StreamBindFailure {
            channel: "A".into(),
            reason: BindFailure::Http(404),
        };
        assert!(e.to_string().contains("channel A"));
        assert!(e.to_string().contains("HTTP 404"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: MixError = io.into();
        assert!(matches!(e, MixError::Io(_)));
    }
}
