//! HLS sessions.
//!
//! Resolves a master playlist to its variants, walks the media playlist by
//! sequence number and decodes each segment as it arrives. Variant choice
//! follows measured segment throughput, and the reported bitrate follows
//! the variant actually being played.

use super::connector::{AccessMode, ConnectRequest, StreamSession};
use super::decode::{EngineFormat, StreamDecoder};
use super::http::fetch_bytes;
use crate::config::network::MAX_MANIFEST_DEPTH;
use crate::error::BindFailure;
use m3u8_rs::{MediaPlaylist, Playlist};
use mpeg2ts::ts::{ReadTsPacket, TsPacketReader, TsPayload};
use reqwest::blocking::Client;
use std::collections::{HashSet, VecDeque};
use std::io::Cursor;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Live playlists start this many segments back from the edge.
const LIVE_START_SEGMENTS: usize = 3;

/// Step down when throughput falls below the variant bandwidth times this.
const DOWNSHIFT_MARGIN: f64 = 1.2;

/// Step up when throughput exceeds the next variant's bandwidth times this.
const UPSHIFT_MARGIN: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFormat {
    MpegTs,
    Fmp4,
    Raw,
}

/// Detect the container of a segment from its first bytes and URL.
pub fn detect_segment_format(data: &[u8], url: &str) -> SegmentFormat {
    if data.len() >= 8 {
        let magic = &data[4..8];
        if magic == b"ftyp" || magic == b"moof" || magic == b"moov" || magic == b"styp" {
            return SegmentFormat::Fmp4;
        }
    }
    if data.first() == Some(&0x47) {
        return SegmentFormat::MpegTs;
    }
    let lower = url.to_ascii_lowercase();
    if lower.ends_with(".ts") || lower.contains(".ts?") {
        return SegmentFormat::MpegTs;
    }
    if lower.ends_with(".m4s") || lower.contains(".m4s?") {
        return SegmentFormat::Fmp4;
    }
    SegmentFormat::Raw
}

/// Extract the audio elementary stream from an MPEG-TS segment.
pub fn demux_ts_segment(ts_data: &[u8]) -> Vec<u8> {
    let mut audio_pids: HashSet<u16> = HashSet::new();

    let mut reader = TsPacketReader::new(Cursor::new(ts_data));
    while let Ok(Some(packet)) = reader.read_ts_packet() {
        if let Some(TsPayload::Pmt(pmt)) = packet.payload {
            for es in &pmt.es_info {
                // MPEG-1/2 audio, AAC ADTS, AAC LATM, AC-3, private
                let stream_type = es.stream_type as u8;
                if matches!(stream_type, 0x03 | 0x04 | 0x0F | 0x11 | 0x81 | 0x80) {
                    audio_pids.insert(es.elementary_pid.as_u16());
                }
            }
        }
    }
    if audio_pids.is_empty() {
        audio_pids.extend([257, 258]);
    }

    let mut audio = Vec::new();
    let mut reader = TsPacketReader::new(Cursor::new(ts_data));
    while let Ok(Some(packet)) = reader.read_ts_packet() {
        if !audio_pids.contains(&packet.header.pid.as_u16()) {
            continue;
        }
        match packet.payload {
            Some(TsPayload::Pes(pes)) => audio.extend_from_slice(pes.data.as_ref()),
            Some(TsPayload::Raw(data)) => audio.extend_from_slice(data.as_ref()),
            _ => {}
        }
    }
    audio
}

pub fn get_base_url(url: &str) -> String {
    let path = url.split('?').next().unwrap_or(url);
    path.rsplit_once('/')
        .map(|(base, _)| base)
        .unwrap_or("")
        .to_string()
}

pub fn make_absolute_url(uri: &str, base_url: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return uri.to_string();
    }
    if let Some(rooted) = uri.strip_prefix('/') {
        // Keep scheme and host only.
        let host_end = base_url
            .find("://")
            .and_then(|i| base_url[i + 3..].find('/').map(|j| i + 3 + j))
            .unwrap_or(base_url.len());
        return format!("{}/{}", &base_url[..host_end], rooted);
    }
    format!("{}/{}", base_url, uri)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub bandwidth: u64,
    pub url: String,
}

/// Pick the variant to fetch next given the throughput of the last segment.
/// `variants` is sorted by ascending bandwidth.
pub fn choose_variant(variants: &[Variant], current: usize, throughput_bps: f64) -> usize {
    let Some(active) = variants.get(current) else {
        return current;
    };
    if current > 0 && throughput_bps < active.bandwidth as f64 * DOWNSHIFT_MARGIN {
        // Drop to the best variant the link can carry.
        return variants[..current]
            .iter()
            .rposition(|v| throughput_bps >= v.bandwidth as f64 * DOWNSHIFT_MARGIN)
            .unwrap_or(0);
    }
    match variants.get(current + 1) {
        Some(next) if throughput_bps > next.bandwidth as f64 * UPSHIFT_MARGIN => current + 1,
        _ => current,
    }
}

/// Result of resolving the URL a channel was bound to.
enum Resolved {
    Master(Vec<Variant>),
    Media(String, MediaPlaylist),
}

fn parse_manifest(bytes: &[u8]) -> Result<Playlist, BindFailure> {
    m3u8_rs::parse_playlist_res(bytes)
        .map_err(|e| BindFailure::Manifest(format!("playlist parse error: {:?}", e)))
}

/// Variants of a master playlist, lowest bandwidth first. I-frame-only
/// variants carry no audio and are skipped.
fn master_variants(master: &m3u8_rs::MasterPlaylist, base_url: &str) -> Vec<Variant> {
    let mut variants: Vec<Variant> = master
        .variants
        .iter()
        .filter(|v| !v.is_i_frame)
        .map(|v| Variant {
            bandwidth: v.bandwidth,
            url: make_absolute_url(&v.uri, base_url),
        })
        .collect();
    variants.sort_by_key(|v| v.bandwidth);
    variants
}

struct PendingSegment {
    sequence: u64,
    url: String,
    duration: f32,
}

pub struct HlsSession {
    client: Client,
    mode: AccessMode,
    variants: Vec<Variant>,
    current: usize,
    media_url: String,
    next_sequence: Option<u64>,
    pending: VecDeque<PendingSegment>,
    decoded: VecDeque<Vec<f32>>,
    init_segment: Option<(String, Vec<u8>)>,
    format: EngineFormat,
    ended: bool,
    refresh_every: Duration,
    last_refresh: Instant,
    measured_kbps: Option<u32>,
}

impl HlsSession {
    pub fn open(client: Client, request: &ConnectRequest) -> Result<Self, BindFailure> {
        let resolved = resolve(&client, request.url, request.mode, MAX_MANIFEST_DEPTH)?;
        let (variants, current, media_url, playlist) = match resolved {
            Resolved::Master(variants) => {
                if variants.is_empty() {
                    return Err(BindFailure::Manifest("no variants in master playlist".into()));
                }
                let current = variants.len() - 1;
                let media_url = variants[current].url.clone();
                let playlist = fetch_media(&client, &media_url, request.mode)?;
                (variants, current, media_url, playlist)
            }
            Resolved::Media(url, playlist) => (Vec::new(), 0, url, playlist),
        };
        info!(
            "HLS {}: {} variant(s), playing {}",
            request.url,
            variants.len().max(1),
            media_url
        );

        let mut session = HlsSession {
            client,
            mode: request.mode,
            variants,
            current,
            media_url,
            next_sequence: None,
            pending: VecDeque::new(),
            decoded: VecDeque::new(),
            init_segment: None,
            format: EngineFormat::new(request.sample_rate),
            ended: false,
            refresh_every: Duration::from_secs(1),
            last_refresh: Instant::now(),
            measured_kbps: None,
        };
        session.absorb(&playlist);
        if session.pending.is_empty() && session.ended {
            return Err(BindFailure::Manifest("media playlist has no segments".into()));
        }
        Ok(session)
    }

    /// Queue the segments of `playlist` not yet seen.
    fn absorb(&mut self, playlist: &MediaPlaylist) {
        let base_url = get_base_url(&self.media_url);
        let first_seq = playlist.media_sequence;
        let live = !playlist.end_list;

        let start = match self.next_sequence {
            Some(next) if next >= first_seq => next,
            Some(next) => {
                warn!("HLS fell behind the live window ({} < {})", next, first_seq);
                first_seq
            }
            None if live => {
                let back = LIVE_START_SEGMENTS.min(playlist.segments.len());
                first_seq + (playlist.segments.len() - back) as u64
            }
            None => first_seq,
        };

        if let Some(map) = playlist.segments.first().and_then(|s| s.map.as_ref()) {
            let map_url = make_absolute_url(&map.uri, &base_url);
            let known = matches!(&self.init_segment, Some((url, _)) if *url == map_url);
            if !known {
                match fetch_bytes(&self.client, &map_url, self.mode) {
                    Ok(data) => self.init_segment = Some((map_url, data)),
                    Err(e) => warn!("HLS init segment {}: {}", map_url, e),
                }
            }
        }

        let mut next = start;
        for (i, segment) in playlist.segments.iter().enumerate() {
            let sequence = first_seq + i as u64;
            if sequence < start {
                continue;
            }
            self.pending.push_back(PendingSegment {
                sequence,
                url: make_absolute_url(&segment.uri, &base_url),
                duration: segment.duration,
            });
            next = sequence + 1;
        }
        self.next_sequence = Some(next);
        self.ended = playlist.end_list;
        let target = playlist.target_duration as f64;
        self.refresh_every = Duration::from_secs_f64((target / 2.0).max(1.0));
        self.last_refresh = Instant::now();
    }

    fn refresh(&mut self) -> Result<(), BindFailure> {
        let playlist = fetch_media(&self.client, &self.media_url, self.mode)?;
        self.absorb(&playlist);
        Ok(())
    }

    /// Move to another variant, continuing from the same sequence number.
    fn switch_variant(&mut self, index: usize) -> Result<(), BindFailure> {
        let from = self.variants[self.current].bandwidth;
        self.current = index;
        self.media_url = self.variants[index].url.clone();
        info!(
            "HLS variant {} -> {} bps",
            from, self.variants[index].bandwidth
        );
        let resume_at = self.pending.front().map(|s| s.sequence).or(self.next_sequence);
        self.pending.clear();
        self.next_sequence = resume_at;
        self.refresh()
    }

    fn play_segment(&mut self, segment: PendingSegment) -> Result<(), BindFailure> {
        let started = Instant::now();
        let data = match fetch_bytes(&self.client, &segment.url, self.mode) {
            Ok(data) => data,
            Err(e @ BindFailure::Http(_)) => {
                // Rotated out of the window; the next one is usually there.
                warn!("HLS segment {} skipped: {}", segment.url, e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let elapsed = started.elapsed().as_secs_f64().max(1e-3);
        let throughput_bps = data.len() as f64 * 8.0 / elapsed;

        if self.variants.is_empty() && segment.duration > 0.0 {
            let kbps = data.len() as f64 * 8.0 / segment.duration as f64 / 1000.0;
            self.measured_kbps = Some(kbps.round() as u32);
        }

        let payload = match detect_segment_format(&data, &segment.url) {
            SegmentFormat::MpegTs => (demux_ts_segment(&data), Some("aac")),
            SegmentFormat::Fmp4 => {
                let mut combined = self
                    .init_segment
                    .as_ref()
                    .map(|(_, init)| init.clone())
                    .unwrap_or_default();
                combined.extend_from_slice(&data);
                (combined, Some("mp4"))
            }
            SegmentFormat::Raw => {
                let hint = if segment.url.to_ascii_lowercase().contains(".mp3") {
                    "mp3"
                } else {
                    "aac"
                };
                (data, Some(hint))
            }
        };
        let (bytes, hint) = payload;
        if bytes.is_empty() {
            warn!("HLS segment {} had no audio", segment.url);
        } else {
            let mut decoder = StreamDecoder::from_bytes(bytes, hint)?;
            while let Some(raw) = decoder.next_raw()? {
                let block = self.format.convert(&raw);
                if !block.is_empty() {
                    self.decoded.push_back(block);
                }
            }
        }

        if !self.variants.is_empty() {
            let next = choose_variant(&self.variants, self.current, throughput_bps);
            if next != self.current {
                self.switch_variant(next)?;
            }
        }
        Ok(())
    }
}

impl StreamSession for HlsSession {
    fn next_block(&mut self) -> Result<Option<Vec<f32>>, BindFailure> {
        if let Some(block) = self.decoded.pop_front() {
            return Ok(Some(block));
        }
        if let Some(segment) = self.pending.pop_front() {
            self.play_segment(segment)?;
            return Ok(Some(self.decoded.pop_front().unwrap_or_default()));
        }
        if self.ended {
            return Ok(None);
        }
        if self.last_refresh.elapsed() >= self.refresh_every {
            debug!("HLS refresh {}", self.media_url);
            self.refresh()?;
        }
        Ok(Some(Vec::new()))
    }

    fn bitrate_kbps(&self) -> Option<u32> {
        match self.variants.get(self.current) {
            Some(v) => Some((v.bandwidth / 1000) as u32),
            None => self.measured_kbps,
        }
    }
}

fn fetch_media(client: &Client, url: &str, mode: AccessMode) -> Result<MediaPlaylist, BindFailure> {
    let bytes = fetch_bytes(client, url, mode)?;
    match parse_manifest(&bytes)? {
        Playlist::MediaPlaylist(pl) => Ok(pl),
        Playlist::MasterPlaylist(_) => {
            Err(BindFailure::Manifest(format!("{} is not a media playlist", url)))
        }
    }
}

fn resolve(
    client: &Client,
    url: &str,
    mode: AccessMode,
    depth: usize,
) -> Result<Resolved, BindFailure> {
    if depth == 0 {
        return Err(BindFailure::Manifest("playlist nesting too deep".into()));
    }
    let bytes = fetch_bytes(client, url, mode)?;
    match parse_manifest(&bytes)? {
        Playlist::MasterPlaylist(master) => {
            let variants = master_variants(&master, &get_base_url(url));
            // A master whose only entry is another master: follow it.
            if let [only] = variants.as_slice() {
                if let Ok(Resolved::Master(nested)) = resolve(client, &only.url, mode, depth - 1) {
                    return Ok(Resolved::Master(nested));
                }
            }
            Ok(Resolved::Master(variants))
        }
        Playlist::MediaPlaylist(pl) => Ok(Resolved::Media(url.to_string(), pl)),
    }
}
