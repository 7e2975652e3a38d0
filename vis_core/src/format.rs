//! PCM audio format description
//!
//! Frame/byte/time conversions used by the sound cache and the analyzer.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Encoding of a single PCM sample. Samples are stored in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// Signed 8 bit
    S8,
    /// Signed 16 bit
    S16,
    /// Signed 24 bit, packed into the low bits of a 32 bit integer
    S24P32,
    /// Signed 32 bit
    S32,
    /// IEEE 754 single precision
    Float,
}

impl SampleFormat {
    /// Size of one sample, in bytes
    pub fn sample_size(self) -> usize {
        match self {
            SampleFormat::S8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S24P32 | SampleFormat::S32 | SampleFormat::Float => 4,
        }
    }

    /// Decode one sample from the front of `bytes` and scale it to [-1, 1).
    ///
    /// `bytes` must hold at least `sample_size()` bytes.
    pub fn to_float(self, bytes: &[u8]) -> f32 {
        match self {
            SampleFormat::S8 => bytes[0] as i8 as f32 / (1u32 << 7) as f32,
            SampleFormat::S16 => {
                i16::from_ne_bytes([bytes[0], bytes[1]]) as f32 / (1u32 << 15) as f32
            }
            SampleFormat::S24P32 => {
                i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32
                    / (1u32 << 23) as f32
            }
            SampleFormat::S32 => {
                i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32
                    / (1u64 << 31) as f32
            }
            SampleFormat::Float => f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    /// Encode `x`, clamped to [-1, 1], into the front of `out`.
    pub fn write_float(self, x: f32, out: &mut [u8]) {
        let x = x.clamp(-1.0, 1.0);
        match self {
            SampleFormat::S8 => out[0] = (x * i8::MAX as f32) as i8 as u8,
            SampleFormat::S16 => {
                out[..2].copy_from_slice(&((x * i16::MAX as f32) as i16).to_ne_bytes())
            }
            SampleFormat::S24P32 => {
                out[..4].copy_from_slice(&((x * ((1 << 23) - 1) as f32) as i32).to_ne_bytes())
            }
            SampleFormat::S32 => {
                out[..4].copy_from_slice(&((x as f64 * i32::MAX as f64) as i32).to_ne_bytes())
            }
            SampleFormat::Float => out[..4].copy_from_slice(&x.to_ne_bytes()),
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SampleFormat::S8 => "8",
            SampleFormat::S16 => "16",
            SampleFormat::S24P32 => "24",
            SampleFormat::S32 => "32",
            SampleFormat::Float => "f",
        };
        f.write_str(s)
    }
}

impl FromStr for SampleFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "8" => Ok(SampleFormat::S8),
            "16" => Ok(SampleFormat::S16),
            "24" => Ok(SampleFormat::S24P32),
            "32" => Ok(SampleFormat::S32),
            "f" => Ok(SampleFormat::Float),
            other => Err(Error::Audio(format!("Unknown sample format '{}'", other))),
        }
    }
}

/// Sample rate, sample encoding and channel count of a PCM stream.
///
/// Written as `rate:bits:channels`, e.g. `44100:16:2` or `48000:f:2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub format: SampleFormat,
    pub channels: u8,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, format: SampleFormat, channels: u8) -> Self {
        Self {
            sample_rate,
            format,
            channels,
        }
    }

    /// A format is usable when it has a non-zero rate and at least one channel
    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0
    }

    /// Size of one frame (one sample for every channel), in bytes
    pub fn frame_size(&self) -> usize {
        self.format.sample_size() * self.channels as usize
    }

    /// Number of bytes needed to hold `duration` worth of whole frames
    pub fn time_to_size(&self, duration: Duration) -> usize {
        let frames = duration.as_nanos() * self.sample_rate as u128 / NANOS_PER_SEC;
        frames as usize * self.frame_size()
    }

    /// Play time of `size` bytes; trailing partial frames are ignored
    pub fn size_to_time(&self, size: usize) -> Duration {
        self.frames_to_time(size / self.frame_size())
    }

    /// Play time of `frames` whole frames
    pub fn frames_to_time(&self, frames: usize) -> Duration {
        let nanos = frames as u128 * NANOS_PER_SEC / self.sample_rate as u128;
        Duration::from_nanos(nanos as u64)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.sample_rate, self.format, self.channels)
    }
}

impl FromStr for AudioFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 3 {
            return Err(Error::Audio(format!(
                "Audio format '{}' is not of the form rate:bits:channels",
                s
            )));
        }

        let sample_rate = parts[0]
            .parse::<u32>()
            .map_err(|e| Error::Audio(format!("Invalid sample rate '{}': {}", parts[0], e)))?;
        let format = parts[1].parse::<SampleFormat>()?;
        let channels = parts[2]
            .parse::<u8>()
            .map_err(|e| Error::Audio(format!("Invalid channel count '{}': {}", parts[2], e)))?;

        let audio_format = AudioFormat::new(sample_rate, format, channels);
        if !audio_format.is_valid() {
            return Err(Error::Audio(format!("Audio format '{}' is not valid", s)));
        }
        Ok(audio_format)
    }
}

impl TryFrom<String> for AudioFormat {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AudioFormat> for String {
    fn from(value: AudioFormat) -> Self {
        value.to_string()
    }
}
