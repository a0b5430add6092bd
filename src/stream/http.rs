//! HTTP plumbing shared by progressive and HLS sessions.

use super::connector::{AccessMode, ConnectRequest, StreamSession};
use super::decode::{EngineFormat, StreamDecoder};
use crate::config::network::{ANALYSIS_ORIGIN, READ_TIMEOUT_SECS, USER_AGENT};
use crate::config::StreamConfig;
use crate::error::BindFailure;
use parking_lot::Mutex;
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_TYPE, ORIGIN};
use std::io::{self, Read, Seek, SeekFrom};
use std::time::Duration;
use symphonia::core::io::MediaSource;
use tracing::debug;

pub fn build_client(config: &StreamConfig) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .timeout(None::<Duration>)
        .build()
}

/// Map a transport error to something a listener can act on.
pub fn network_failure(e: &reqwest::Error) -> BindFailure {
    let msg = if e.is_builder() {
        match e.url() {
            Some(url) => format!("invalid URL: {}", url),
            None => "invalid URL".to_string(),
        }
    } else if e.is_connect() {
        match e.url().and_then(|u| u.host_str()) {
            Some(host) => format!("could not connect to {}", host),
            None => "could not connect to server".to_string(),
        }
    } else if e.is_timeout() {
        "connection timed out".to_string()
    } else {
        e.to_string()
    };
    BindFailure::Network(msg)
}

/// 401/403 on an analysis request is a cross-origin refusal; anything else
/// non-2xx is a plain HTTP failure.
pub fn classify_status(status: u16, mode: AccessMode) -> BindFailure {
    match (status, mode) {
        (401 | 403, AccessMode::Analyzed) => {
            BindFailure::CrossOrigin(format!("HTTP {} to analysis request", status))
        }
        _ => BindFailure::Http(status),
    }
}

pub fn open(client: &Client, url: &str, mode: AccessMode) -> Result<Response, BindFailure> {
    let mut request = client.get(url);
    if mode == AccessMode::Analyzed {
        request = request.header(ORIGIN, ANALYSIS_ORIGIN);
    }
    let response = request.send().map_err(|e| network_failure(&e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(classify_status(status.as_u16(), mode));
    }
    Ok(response)
}

/// Fetch a whole body (manifests, segments) with the read timeout applied.
pub fn fetch_bytes(client: &Client, url: &str, mode: AccessMode) -> Result<Vec<u8>, BindFailure> {
    let mut request = client
        .get(url)
        .timeout(Duration::from_secs(READ_TIMEOUT_SECS));
    if mode == AccessMode::Analyzed {
        request = request.header(ORIGIN, ANALYSIS_ORIGIN);
    }
    let response = request.send().map_err(|e| network_failure(&e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(classify_status(status.as_u16(), mode));
    }
    response
        .bytes()
        .map(|b| b.to_vec())
        .map_err(|e| network_failure(&e))
}

/// Container hint from the content type or URL extension.
pub fn format_hint(content_type: Option<&str>, url: &str) -> Option<&'static str> {
    let ct = content_type.unwrap_or("").to_ascii_lowercase();
    if ct.contains("mpeg") || ct.contains("mp3") {
        return Some("mp3");
    }
    if ct.contains("aac") || ct.contains("aacp") {
        return Some("aac");
    }
    if ct.contains("ogg") {
        return Some("ogg");
    }
    let path = url.split('?').next().unwrap_or(url).to_ascii_lowercase();
    ["mp3", "aac", "ogg", "m4a", "wav"]
        .into_iter()
        .find(|ext| path.ends_with(&format!(".{}", ext)))
}

/// Non-seekable response body usable as a symphonia source.
struct BodySource {
    body: Mutex<Response>,
}

impl Read for BodySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.body.get_mut().read(buf)
    }
}

impl Seek for BodySource {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "live stream"))
    }
}

impl MediaSource for BodySource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// A single continuous HTTP stream (Icecast, Shoutcast, plain files).
/// No adaptive signal: reports the nominal bitrate.
pub struct ProgressiveSession {
    decoder: StreamDecoder,
    format: EngineFormat,
    bitrate_kbps: u32,
}

impl ProgressiveSession {
    pub fn open(
        client: &Client,
        request: &ConnectRequest,
        nominal_bitrate_kbps: u32,
    ) -> Result<Self, BindFailure> {
        let response = open(client, request.url, request.mode)?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let hint = format_hint(content_type.as_deref(), request.url);
        debug!("progressive stream {} ({:?})", request.url, content_type);

        let source = BodySource {
            body: Mutex::new(response),
        };
        let decoder = StreamDecoder::new(Box::new(source), hint)?;
        Ok(ProgressiveSession {
            decoder,
            format: EngineFormat::new(request.sample_rate),
            bitrate_kbps: nominal_bitrate_kbps,
        })
    }
}

impl StreamSession for ProgressiveSession {
    fn next_block(&mut self) -> Result<Option<Vec<f32>>, BindFailure> {
        match self.decoder.next_raw()? {
            Some(raw) => Ok(Some(self.format.convert(&raw))),
            None => Ok(None),
        }
    }

    fn bitrate_kbps(&self) -> Option<u32> {
        Some(self.bitrate_kbps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_analysis_request_is_cross_origin() {
        assert!(classify_status(403, AccessMode::Analyzed).is_cross_origin());
        assert!(classify_status(401, AccessMode::Analyzed).is_cross_origin());
        assert_eq!(classify_status(403, AccessMode::PlaybackOnly), BindFailure::Http(403));
        assert_eq!(classify_status(404, AccessMode::Analyzed), BindFailure::Http(404));
    }

    #[test]
    fn hint_prefers_content_type() {
        assert_eq!(format_hint(Some("audio/mpeg"), "http://x/stream"), Some("mp3"));
        assert_eq!(format_hint(Some("audio/aacp"), "http://x/a.mp3"), Some("aac"));
        assert_eq!(format_hint(None, "http://x/SER.aac?id=1"), Some("aac"));
        assert_eq!(format_hint(None, "http://x/stream"), None);
    }

    #[test]
    fn unreachable_host_is_a_network_failure() {
        let client = build_client(&StreamConfig {
            connect_timeout_secs: 1,
            ..StreamConfig::default()
        })
        .unwrap();
        let err = open(&client, "http://127.0.0.1:9/none.mp3", AccessMode::Analyzed).unwrap_err();
        assert!(matches!(err, BindFailure::Network(_)));
    }
}
