//! The seam between the stream state machine and actual transports.

use super::hls::HlsSession;
use super::http::{self, ProgressiveSession};
use super::tone::ToneSession;
use super::Transport;
use crate::config::StreamConfig;
use crate::error::{BindFailure, MixError, Result};

/// Whether the request asks for analysis access.
///
/// `Analyzed` requests identify themselves with an `Origin` header; servers
/// that refuse cross-origin readers answer 401/403, and the worker falls back
/// to `PlaybackOnly`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Analyzed,
    PlaybackOnly,
}

pub struct ConnectRequest<'a> {
    pub url: &'a str,
    pub mode: AccessMode,
    /// Rate sessions must deliver audio at.
    pub sample_rate: u32,
}

/// One live connection producing audio.
pub trait StreamSession: Send {
    /// Next block of interleaved stereo at the engine rate.
    ///
    /// `Ok(Some(empty))` means nothing is ready yet; `Ok(None)` means the
    /// stream ended.
    fn next_block(&mut self) -> std::result::Result<Option<Vec<f32>>, BindFailure>;

    /// Encoded bitrate currently being received, if known.
    fn bitrate_kbps(&self) -> Option<u32>;
}

pub trait StreamConnector: Send + Sync {
    fn connect(
        &self,
        request: &ConnectRequest,
    ) -> std::result::Result<Box<dyn StreamSession>, BindFailure>;
}

/// Dispatches on the URL: `tone:` generators, HLS manifests, or progressive HTTP.
pub struct DefaultConnector {
    client: reqwest::blocking::Client,
    nominal_bitrate_kbps: u32,
}

impl DefaultConnector {
    pub fn new(config: &StreamConfig) -> Result<Self> {
        let client = http::build_client(config)
            .map_err(|e| MixError::Config(format!("HTTP client: {}", e)))?;
        Ok(DefaultConnector {
            client,
            nominal_bitrate_kbps: config.nominal_bitrate_kbps,
        })
    }
}

impl StreamConnector for DefaultConnector {
    fn connect(
        &self,
        request: &ConnectRequest,
    ) -> std::result::Result<Box<dyn StreamSession>, BindFailure> {
        if let Some(spec) = request.url.strip_prefix("tone:") {
            return Ok(Box::new(ToneSession::parse(spec, request)?));
        }
        match Transport::detect(request.url) {
            Transport::Adaptive => Ok(Box::new(HlsSession::open(
                self.client.clone(),
                request,
            )?)),
            Transport::Progressive => Ok(Box::new(ProgressiveSession::open(
                &self.client,
                request,
                self.nominal_bitrate_kbps,
            )?)),
        }
    }
}
