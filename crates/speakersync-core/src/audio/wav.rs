//! PCM WAV encoding for the calibration asset
//!
//! Writes the canonical 44-byte RIFF/WAVE header followed by interleaved
//! 16-bit little-endian samples, the form every playback endpoint accepts.
//!
//! ## Layout
//!
//! ```text
//! 0   "RIFF"  u32 riff_size  "WAVE"
//! 12  "fmt "  u32 16  u16 format(1)  u16 channels  u32 sample_rate
//!             u32 byte_rate  u16 block_align  u16 bits_per_sample(16)
//! 36  "data"  u32 data_size  <samples>
//! ```

use super::click::StereoTrack;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Size of the canonical PCM header
pub const HEADER_LEN: usize = 44;

/// WAVE_FORMAT_PCM
const FORMAT_PCM: u16 = 1;

/// Errors from encoding or parsing WAV data
#[derive(Error, Debug)]
pub enum WavError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Header truncated: {0} bytes, need {HEADER_LEN}")]
    Truncated(usize),

    #[error("Invalid chunk id at offset {offset}: expected {expected}")]
    InvalidChunk { offset: usize, expected: &'static str },

    #[error("Unsupported format tag {0} (only PCM is supported)")]
    UnsupportedFormat(u16),

    #[error("Channel count must be at least 1")]
    NoChannels,
}

/// Parsed canonical WAV header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    /// Number of interleaved channels
    pub channels: u16,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Bits per sample
    pub bits_per_sample: u16,
    /// Size of the sample data in bytes
    pub data_len: u32,
}

impl WavHeader {
    /// Header for 16-bit PCM with the given shape
    pub fn pcm16(channels: u16, sample_rate: u32, frames: usize) -> Self {
        Self {
            channels,
            sample_rate,
            bits_per_sample: 16,
            data_len: (frames * channels as usize * 2) as u32,
        }
    }

    /// Bytes per interleaved frame
    pub fn block_align(&self) -> u16 {
        self.channels * (self.bits_per_sample / 8)
    }

    /// Bytes per second of audio
    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.block_align() as u32
    }

    /// Serialize to the 44-byte header
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(b"RIFF");
        out[4..8].copy_from_slice(&(36 + self.data_len).to_le_bytes());
        out[8..12].copy_from_slice(b"WAVE");
        out[12..16].copy_from_slice(b"fmt ");
        out[16..20].copy_from_slice(&16u32.to_le_bytes());
        out[20..22].copy_from_slice(&FORMAT_PCM.to_le_bytes());
        out[22..24].copy_from_slice(&self.channels.to_le_bytes());
        out[24..28].copy_from_slice(&self.sample_rate.to_le_bytes());
        out[28..32].copy_from_slice(&self.byte_rate().to_le_bytes());
        out[32..34].copy_from_slice(&self.block_align().to_le_bytes());
        out[34..36].copy_from_slice(&self.bits_per_sample.to_le_bytes());
        out[36..40].copy_from_slice(b"data");
        out[40..44].copy_from_slice(&self.data_len.to_le_bytes());
        out
    }

    /// Parse a canonical 44-byte header
    pub fn parse(bytes: &[u8]) -> Result<Self, WavError> {
        if bytes.len() < HEADER_LEN {
            return Err(WavError::Truncated(bytes.len()));
        }
        expect_id(bytes, 0, "RIFF")?;
        expect_id(bytes, 8, "WAVE")?;
        expect_id(bytes, 12, "fmt ")?;
        expect_id(bytes, 36, "data")?;

        let format = read_u16(bytes, 20);
        if format != FORMAT_PCM {
            return Err(WavError::UnsupportedFormat(format));
        }

        Ok(Self {
            channels: read_u16(bytes, 22),
            sample_rate: read_u32(bytes, 24),
            bits_per_sample: read_u16(bytes, 34),
            data_len: read_u32(bytes, 40),
        })
    }
}

fn expect_id(bytes: &[u8], offset: usize, expected: &'static str) -> Result<(), WavError> {
    if &bytes[offset..offset + 4] == expected.as_bytes() {
        Ok(())
    } else {
        Err(WavError::InvalidChunk { offset, expected })
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Encode interleaved 16-bit samples into a complete WAV image
pub fn encode_pcm16(samples: &[i16], channels: u16, sample_rate: u32) -> Result<Vec<u8>, WavError> {
    if channels == 0 {
        return Err(WavError::NoChannels);
    }
    let header = WavHeader::pcm16(channels, sample_rate, samples.len() / channels as usize);
    let mut out = Vec::with_capacity(HEADER_LEN + samples.len() * 2);
    out.extend_from_slice(&header.to_bytes());
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    Ok(out)
}

/// Encode a rendered stereo click track
pub fn encode_track(track: &StereoTrack) -> Result<Vec<u8>, WavError> {
    encode_pcm16(&track.to_pcm16(), 2, track.sample_rate)
}

/// Write a rendered stereo click track to disk
pub fn write_track(track: &StereoTrack, path: &Path) -> Result<(), WavError> {
    let samples = track.to_pcm16();
    let header = WavHeader::pcm16(2, track.sample_rate, track.frames());

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&header.to_bytes())?;
    for s in &samples {
        writer.write_all(&s.to_le_bytes())?;
    }
    writer.flush()?;

    tracing::info!(
        path = %path.display(),
        frames = track.frames(),
        bytes = HEADER_LEN + samples.len() * 2,
        "calibration_wav_written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::click::{render_track, ClickTrackConfig};

    #[test]
    fn test_header_layout() {
        let header = WavHeader::pcm16(2, 48000, 10);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(read_u32(&bytes, 4), 36 + 40);
        assert_eq!(read_u32(&bytes, 16), 16);
        assert_eq!(read_u16(&bytes, 20), 1);
        assert_eq!(read_u32(&bytes, 28), 192000);
        assert_eq!(read_u16(&bytes, 32), 4);
        assert_eq!(read_u32(&bytes, 40), 40);
    }

    #[test]
    fn test_header_round_trip() {
        for (channels, rate) in [(1u16, 44100u32), (2, 48000), (6, 96000)] {
            let header = WavHeader::pcm16(channels, rate, 1234);
            let parsed = WavHeader::parse(&header.to_bytes()).unwrap();
            assert_eq!(parsed, header);
        }
    }

    #[test]
    fn test_encode_track_round_trip() {
        let config = ClickTrackConfig {
            sample_rate: 44100,
            total_duration_sec: 1.0,
            ..Default::default()
        };
        let track = render_track(&config);
        let bytes = encode_track(&track).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 44100 * 2 * 2);

        let header = WavHeader::parse(&bytes).unwrap();
        assert_eq!(header.sample_rate, 44100);
        assert_eq!(header.channels, 2);
        assert_eq!(header.bits_per_sample, 16);
        assert_eq!(header.data_len as usize, bytes.len() - HEADER_LEN);
    }

    #[test]
    fn test_hound_reads_our_output() {
        let config = ClickTrackConfig {
            total_duration_sec: 0.5,
            click_interval_ms: 250.0,
            ..Default::default()
        };
        let track = render_track(&config);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clicks.wav");
        write_track(&track, &path).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 48000);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(spec.sample_format, hound::SampleFormat::Int);

        let samples: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, track.to_pcm16());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(WavHeader::parse(&[0u8; 10]), Err(WavError::Truncated(10))));

        let mut bytes = WavHeader::pcm16(2, 48000, 1).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            WavHeader::parse(&bytes),
            Err(WavError::InvalidChunk { offset: 0, .. })
        ));

        let mut bytes = WavHeader::pcm16(2, 48000, 1).to_bytes();
        bytes[20] = 3;
        assert!(matches!(
            WavHeader::parse(&bytes),
            Err(WavError::UnsupportedFormat(3))
        ));
    }

    #[test]
    fn test_zero_channels_rejected() {
        assert!(matches!(encode_pcm16(&[0, 0], 0, 48000), Err(WavError::NoChannels)));
    }
}
