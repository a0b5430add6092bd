//! Symphonia-backed decoding of compressed audio into engine-rate stereo.

use crate::error::BindFailure;
use crate::input::LinearResampler;
use std::io::{self, Cursor};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Decoded audio in the source's own layout.
pub struct RawBlock {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

pub struct StreamDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_buf: Option<SampleBuffer<f32>>,
}

fn codec(e: impl std::fmt::Display) -> BindFailure {
    BindFailure::Codec(e.to_string())
}

fn is_eof(e: &SymphoniaError) -> bool {
    matches!(e, SymphoniaError::IoError(io) if io.kind() == io::ErrorKind::UnexpectedEof)
}

impl StreamDecoder {
    /// Probe `source` and open its first audio track.
    pub fn new(source: Box<dyn MediaSource>, extension: Option<&str>) -> Result<Self, BindFailure> {
        let mss = MediaSourceStream::new(source, Default::default());
        let mut hint = Hint::new();
        if let Some(ext) = extension {
            hint.with_extension(ext);
        }
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| codec(format!("probe: {}", e)))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| codec("no audio track"))?;
        let track_id = track.id;
        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| codec(format!("decoder: {}", e)))?;

        Ok(StreamDecoder {
            format,
            decoder,
            track_id,
            sample_buf: None,
        })
    }

    pub fn from_bytes(data: Vec<u8>, extension: Option<&str>) -> Result<Self, BindFailure> {
        Self::new(Box::new(Cursor::new(data)), extension)
    }

    /// Decode the next packet. `Ok(None)` at end of data.
    pub fn next_raw(&mut self) -> Result<Option<RawBlock>, BindFailure> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(e) if is_eof(&e) => return Ok(None),
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => return Err(codec(e)),
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let capacity = decoded.capacity() as u64;
                    if self
                        .sample_buf
                        .as_ref()
                        .is_none_or(|b| (b.capacity() as u64) < capacity)
                    {
                        self.sample_buf = Some(SampleBuffer::<f32>::new(capacity, spec));
                    }
                    let Some(buf) = self.sample_buf.as_mut() else {
                        continue;
                    };
                    buf.copy_interleaved_ref(decoded);
                    if buf.samples().is_empty() {
                        continue;
                    }
                    return Ok(Some(RawBlock {
                        samples: buf.samples().to_vec(),
                        sample_rate: spec.rate,
                        channels: spec.channels.count(),
                    }));
                }
                // Corrupt frames are skipped; live streams recover on the next one.
                Err(SymphoniaError::DecodeError(_)) => continue,
                Err(e) if is_eof(&e) => return Ok(None),
                Err(e) => return Err(codec(e)),
            }
        }
    }

    /// Decode everything that remains.
    pub fn decode_all(&mut self) -> Result<Option<RawBlock>, BindFailure> {
        let mut out: Option<RawBlock> = None;
        while let Some(block) = self.next_raw()? {
            match &mut out {
                Some(acc) => acc.samples.extend_from_slice(&block.samples),
                None => out = Some(block),
            }
        }
        Ok(out)
    }
}

/// Converts raw decoder output to engine-rate stereo, rebuilding the
/// resampler whenever the source layout changes.
pub struct EngineFormat {
    target_rate: u32,
    current: Option<(u32, usize, LinearResampler)>,
}

impl EngineFormat {
    pub fn new(target_rate: u32) -> Self {
        EngineFormat {
            target_rate,
            current: None,
        }
    }

    pub fn convert(&mut self, block: &RawBlock) -> Vec<f32> {
        let stale = !matches!(
            &self.current,
            Some((rate, ch, _)) if *rate == block.sample_rate && *ch == block.channels
        );
        if stale {
            self.current = Some((
                block.sample_rate,
                block.channels,
                LinearResampler::new(block.sample_rate, self.target_rate, block.channels),
            ));
        }
        let mut out = Vec::with_capacity(block.samples.len() * 2);
        if let Some((_, _, resampler)) = &mut self.current {
            resampler.process(&block.samples, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(rate: u32, channels: u16, frames: usize) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..frames * channels as usize {
                writer.write_sample(((i % 100) as i16) * 100).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn decodes_wav_to_the_end() {
        let mut dec = StreamDecoder::from_bytes(wav_bytes(44_100, 2, 4410), Some("wav")).unwrap();
        let all = dec.decode_all().unwrap().unwrap();
        assert_eq!(all.sample_rate, 44_100);
        assert_eq!(all.channels, 2);
        assert_eq!(all.samples.len(), 4410 * 2);
        assert!(dec.next_raw().unwrap().is_none());
    }

    #[test]
    fn garbage_is_a_codec_failure() {
        let err = StreamDecoder::from_bytes(vec![0u8; 64], None).err().unwrap();
        assert!(matches!(err, BindFailure::Codec(_)));
    }

    #[test]
    fn engine_format_upmixes_and_resamples() {
        let mut fmt = EngineFormat::new(48_000);
        let block = RawBlock {
            samples: vec![0.5; 2400],
            sample_rate: 24_000,
            channels: 1,
        };
        let out = fmt.convert(&block);
        // 2400 mono frames at 24k ≈ 4800 stereo frames at 48k.
        let frames = out.len() / 2;
        assert!((4790..=4800).contains(&frames), "got {}", frames);
    }
}
