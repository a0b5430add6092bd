//! Recording export: packaging and format conversion.
//!
//! `convert` is a pure function of the captured chunks. It never touches a
//! session, so a failed conversion leaves the recording exportable again.
//! Native chunks are packaged with hound; other containers go through an
//! `ffmpeg` process fed on stdin.

use crate::bus::BusId;
use crate::error::{export_failure, MixError, Result};
use crate::recording::ExportFormat;
use crate::stream::decode::StreamDecoder;
use chrono::{DateTime, Local};
use lofty::file::AudioFile;
use lofty::probe::Probe;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info};

/// A finished export.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub name: String,
    pub format: ExportFormat,
    pub bytes: Vec<u8>,
    /// Duration declared by the container.
    pub duration: Duration,
}

impl Artifact {
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(&self.name);
        std::fs::write(&path, &self.bytes)?;
        info!("Exported {} ({} bytes)", path.display(), self.bytes.len());
        Ok(path)
    }
}

/// `<bus>_<YYYYMMDD-HHMMSS>.<ext>`
pub fn artifact_name(bus: BusId, started: DateTime<Local>, format: ExportFormat) -> String {
    format!(
        "{}_{}.{}",
        bus,
        started.format("%Y%m%d-%H%M%S"),
        format.extension()
    )
}

/// Interleaved PCM16 ready for packaging.
struct Pcm {
    samples: Vec<i16>,
    channels: u16,
    sample_rate: u32,
}

fn decode_chunks(chunks: &[Vec<u8>], source: ExportFormat, sample_rate: u32) -> Result<Pcm> {
    if source == ExportFormat::NATIVE {
        let samples = chunks
            .iter()
            .flat_map(|c| c.chunks_exact(2))
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        return Ok(Pcm {
            samples,
            channels: 2,
            sample_rate,
        });
    }

    let data = chunks.concat();
    let mut decoder = StreamDecoder::from_bytes(data, Some(source.extension()))
        .map_err(|e| export_failure("decode", e))?;
    let block = decoder
        .decode_all()
        .map_err(|e| export_failure("decode", e))?
        .ok_or_else(|| MixError::RecordingExportFailure("no audio in recording".into()))?;
    let samples = block
        .samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16)
        .collect();
    Ok(Pcm {
        samples,
        channels: block.channels as u16,
        sample_rate: block.sample_rate,
    })
}

/// RIFF sizes are 32-bit; leave room for the header.
const MAX_WAV_DATA_BYTES: u64 = u32::MAX as u64 - 44;

/// Sample count for a 16-bit WAV writer, refusing captures too long for
/// the container.
fn wav_sample_count(samples: usize) -> Result<u32> {
    let bytes = samples as u64 * 2;
    if bytes > MAX_WAV_DATA_BYTES {
        return Err(MixError::RecordingExportFailure(format!(
            "recording too long for WAV ({} bytes of audio, limit {})",
            bytes, MAX_WAV_DATA_BYTES
        )));
    }
    // Fits: the byte limit is below u32::MAX.
    Ok(samples as u32)
}

fn package_wav(pcm: &Pcm) -> Result<Vec<u8>> {
    let count = wav_sample_count(pcm.samples.len())?;
    let spec = hound::WavSpec {
        channels: pcm.channels,
        sample_rate: pcm.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| export_failure("wav", e))?;
        let mut samples = writer.get_i16_writer(count);
        for &s in &pcm.samples {
            samples.write_sample(s);
        }
        samples.flush().map_err(|e| export_failure("wav", e))?;
        writer.finalize().map_err(|e| export_failure("wav", e))?;
    }
    Ok(cursor.into_inner())
}

/// Argument list for encoding WAV on stdin to `target` on stdout.
pub fn build_ffmpeg_args(target: ExportFormat) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "wav".into(),
        "-i".into(),
        "pipe:0".into(),
        "-vn".into(),
    ];

    match target {
        ExportFormat::Mp3 => {
            args.extend(["-c:a", "libmp3lame", "-q:a", "2", "-f", "mp3"].map(String::from));
        }
        ExportFormat::Ogg => {
            args.extend(["-c:a", "libvorbis", "-q:a", "5", "-f", "ogg"].map(String::from));
        }
        ExportFormat::Webm => {
            args.extend(["-c:a", "libopus", "-b:a", "128k", "-f", "webm"].map(String::from));
        }
        ExportFormat::Wav => {
            args.extend(["-c:a", "pcm_s16le", "-f", "wav"].map(String::from));
        }
    }

    args.push("pipe:1".into());
    args
}

fn run_ffmpeg(ffmpeg: &Path, args: &[String], input: Vec<u8>) -> Result<Vec<u8>> {
    let mut child = Command::new(ffmpeg)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| export_failure(&format!("failed to launch {}", ffmpeg.display()), e))?;

    let stdin = child.stdin.take();
    let writer = std::thread::spawn(move || -> std::io::Result<()> {
        if let Some(mut stdin) = stdin {
            stdin.write_all(&input)?;
        }
        Ok(())
    });

    let output = child
        .wait_with_output()
        .map_err(|e| export_failure("ffmpeg", e))?;
    // A broken pipe here means ffmpeg bailed early; its status says why.
    let _ = writer.join();

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let last = stderr.lines().last().unwrap_or("").trim().to_string();
        return Err(MixError::RecordingExportFailure(format!(
            "ffmpeg exited with status {}: {}",
            output.status.code().unwrap_or(-1),
            last
        )));
    }
    if output.stdout.is_empty() {
        return Err(MixError::RecordingExportFailure(
            "encoder produced no output".into(),
        ));
    }
    Ok(output.stdout)
}

/// Turn captured chunks in `source` format into a `target` artifact.
pub fn convert(
    chunks: &[Vec<u8>],
    source: ExportFormat,
    target: ExportFormat,
    sample_rate: u32,
    ffmpeg: &Path,
) -> Result<Vec<u8>> {
    if chunks.iter().all(|c| c.is_empty()) {
        return Err(MixError::RecordingExportFailure("nothing was captured".into()));
    }
    if source == target && source != ExportFormat::NATIVE {
        return Ok(chunks.concat());
    }

    let pcm = decode_chunks(chunks, source, sample_rate)?;
    let wav = package_wav(&pcm)?;
    if target == ExportFormat::Wav {
        return Ok(wav);
    }
    debug!("transcoding {} -> {}", source, target);
    run_ffmpeg(ffmpeg, &build_ffmpeg_args(target), wav)
}

/// Duration the container declares, if lofty can read it.
pub fn probe_duration(bytes: &[u8]) -> Option<Duration> {
    let probe = Probe::new(Cursor::new(bytes)).guess_file_type().ok()?;
    let file = probe.read().ok()?;
    let duration = file.properties().duration();
    (!duration.is_zero()).then_some(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::encode_pcm16;
    use chrono::TimeZone;

    fn native_chunks(seconds: f32, rate: u32) -> Vec<Vec<u8>> {
        let frames = (seconds * rate as f32) as usize;
        // Two chunks to check concatenation.
        let half = frames / 2;
        [half, frames - half]
            .iter()
            .map(|&n| {
                let mut chunk = Vec::new();
                encode_pcm16(&vec![0.25; n * 2], &mut chunk);
                chunk
            })
            .collect()
    }

    #[test]
    fn wav_export_packages_native_chunks() {
        let chunks = native_chunks(3.0, 48_000);
        let bytes = convert(&chunks, ExportFormat::Wav, ExportFormat::Wav, 48_000, Path::new("ffmpeg")).unwrap();
        let reader = hound::WavReader::new(Cursor::new(&bytes)).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 48_000);
        assert_eq!(reader.duration(), 144_000);

        let declared = probe_duration(&bytes).unwrap();
        assert!((declared.as_secs_f64() - 3.0).abs() < 0.05, "{:?}", declared);
    }

    #[test]
    fn wav_size_limit_is_enforced() {
        // About 6.2 hours of 48 kHz stereo fits; one more sample past 4 GiB does not.
        let six_hours = 48_000 * 2 * 6 * 3600;
        assert_eq!(wav_sample_count(six_hours).unwrap(), six_hours as u32);
        let over = (MAX_WAV_DATA_BYTES / 2 + 1) as usize;
        assert!(matches!(
            wav_sample_count(over),
            Err(MixError::RecordingExportFailure(_))
        ));
    }

    #[test]
    fn empty_capture_fails() {
        let err = convert(&[], ExportFormat::Wav, ExportFormat::Wav, 48_000, Path::new("ffmpeg")).unwrap_err();
        assert!(matches!(err, MixError::RecordingExportFailure(_)));
    }

    #[test]
    fn missing_encoder_is_an_export_failure() {
        let chunks = native_chunks(0.1, 48_000);
        let err = convert(
            &chunks,
            ExportFormat::Wav,
            ExportFormat::Mp3,
            48_000,
            Path::new("/nonexistent/ffmpeg"),
        )
        .unwrap_err();
        assert!(matches!(err, MixError::RecordingExportFailure(_)));
        // Retrying after a failure still works for a format that needs no encoder.
        assert!(convert(&chunks, ExportFormat::Wav, ExportFormat::Wav, 48_000, Path::new("ffmpeg")).is_ok());
    }

    #[test]
    fn undecodable_source_is_an_export_failure() {
        let chunks = vec![vec![1u8, 2, 3, 4, 5, 6, 7, 8]];
        let err = convert(&chunks, ExportFormat::Webm, ExportFormat::Wav, 48_000, Path::new("ffmpeg")).unwrap_err();
        assert!(matches!(err, MixError::RecordingExportFailure(_)));
    }

    #[test]
    fn same_container_is_passed_through() {
        let chunks = vec![vec![1u8, 2], vec![3u8]];
        let out = convert(&chunks, ExportFormat::Ogg, ExportFormat::Ogg, 48_000, Path::new("ffmpeg")).unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn ffmpeg_args_pick_the_codec() {
        let args = build_ffmpeg_args(ExportFormat::Mp3);
        assert!(args.contains(&"libmp3lame".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
        let args = build_ffmpeg_args(ExportFormat::Webm);
        let pos = args.iter().position(|a| a == "-c:a").unwrap();
        assert_eq!(args[pos + 1], "libopus");
        assert!(build_ffmpeg_args(ExportFormat::Ogg).contains(&"libvorbis".to_string()));
    }

    #[test]
    fn artifact_names_are_deterministic() {
        let start = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            artifact_name(BusId::Aux1, start, ExportFormat::Mp3),
            "AUX1_20240309-070501.mp3"
        );
    }

    #[test]
    fn artifact_is_written_under_its_name() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = Artifact {
            name: "MASTER_20240101-000000.wav".into(),
            format: ExportFormat::Wav,
            bytes: vec![1, 2, 3],
            duration: Duration::from_secs(1),
        };
        let path = artifact.write_to(dir.path()).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), vec![1, 2, 3]);
    }
}
