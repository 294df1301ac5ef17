//! Video format descriptions
//!
//! A format fixes the frame geometry, field mode, frame rate and the audio
//! cadence: the repeating per-frame sample counts whose mean equals
//! `sample_rate / fps` exactly. Formats are plain data and cheap to clone;
//! the channel snapshots one per tick.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when resolving or validating a format
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unknown video format: {0}")]
    UnknownFormat(String),

    #[error("invalid framerate {num}/{den}")]
    InvalidFramerate { num: u32, den: u32 },
}

/// Interlacing mode of a format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldMode {
    Progressive,
    Upper,
    Lower,
}

impl std::fmt::Display for FieldMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldMode::Progressive => write!(f, "progressive"),
            FieldMode::Upper => write!(f, "upper"),
            FieldMode::Lower => write!(f, "lower"),
        }
    }
}

/// Exact frame rate as a rational number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Framerate {
    pub num: u32,
    pub den: u32,
}

impl Framerate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl std::fmt::Display for Framerate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Description of a channel's video format
///
/// Immutable per tick: the channel loop copies the current description under
/// its format lock at the start of every iteration, so producers, mixer and
/// consumers all observe one consistent format for the whole frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFormat {
    /// Canonical name, e.g. `"1080i5000"`
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub field_mode: FieldMode,
    pub framerate: Framerate,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    /// Per-frame sample counts; rotated by one each tick by the channel
    pub audio_cadence: Vec<usize>,
}

impl VideoFormat {
    /// Build a format, deriving the audio cadence from the framerate
    pub fn new(
        name: impl Into<String>,
        width: u32,
        height: u32,
        field_mode: FieldMode,
        framerate: Framerate,
        audio_sample_rate: u32,
        audio_channels: u16,
    ) -> Result<Self, FormatError> {
        if framerate.num == 0 || framerate.den == 0 {
            return Err(FormatError::InvalidFramerate {
                num: framerate.num,
                den: framerate.den,
            });
        }
        let audio_cadence = find_cadence(audio_sample_rate, framerate);
        Ok(Self {
            name: name.into(),
            width,
            height,
            field_mode,
            framerate,
            audio_sample_rate,
            audio_channels,
            audio_cadence,
        })
    }

    /// Frames per second as a floating point value
    pub fn fps(&self) -> f64 {
        self.framerate.as_f64()
    }

    /// Duration of one frame
    pub fn frame_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.framerate.den as f64 / self.framerate.num as f64)
    }

    /// Resolve a format by its canonical name
    pub fn from_name(name: &str) -> Result<Self, FormatError> {
        match name {
            "pal" => Self::new("pal", 720, 576, FieldMode::Upper, Framerate::new(25, 1), 48000, 2),
            "ntsc" => Self::new(
                "ntsc",
                720,
                486,
                FieldMode::Lower,
                Framerate::new(30000, 1001),
                48000,
                2,
            ),
            "720p5000" => Self::new(
                "720p5000",
                1280,
                720,
                FieldMode::Progressive,
                Framerate::new(50, 1),
                48000,
                2,
            ),
            "720p5994" => Self::new(
                "720p5994",
                1280,
                720,
                FieldMode::Progressive,
                Framerate::new(60000, 1001),
                48000,
                2,
            ),
            "1080i5000" => Self::new(
                "1080i5000",
                1920,
                1080,
                FieldMode::Upper,
                Framerate::new(25, 1),
                48000,
                2,
            ),
            "1080i5994" => Self::new(
                "1080i5994",
                1920,
                1080,
                FieldMode::Upper,
                Framerate::new(30000, 1001),
                48000,
                2,
            ),
            "1080p2500" => Self::new(
                "1080p2500",
                1920,
                1080,
                FieldMode::Progressive,
                Framerate::new(25, 1),
                48000,
                2,
            ),
            "1080p5000" => Self::new(
                "1080p5000",
                1920,
                1080,
                FieldMode::Progressive,
                Framerate::new(50, 1),
                48000,
                2,
            ),
            "2160p2500" => Self::new(
                "2160p2500",
                3840,
                2160,
                FieldMode::Progressive,
                Framerate::new(25, 1),
                48000,
                2,
            ),
            other => Err(FormatError::UnknownFormat(other.to_string())),
        }
    }
}

impl std::fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Derive the per-frame sample counts for a sample rate and framerate
///
/// Integer framerates get a flat cadence of one element. Fractional rates
/// (e.g. 30000/1001) get a short repeating sequence whose sum over one
/// period is exact, distributing the remainder one sample at a time.
fn find_cadence(sample_rate: u32, framerate: Framerate) -> Vec<usize> {
    let num = framerate.num as u64;
    let den = framerate.den as u64;
    let rate = sample_rate as u64;

    // samples per frame = rate * den / num
    if (rate * den) % num == 0 {
        return vec![(rate * den / num) as usize];
    }

    // Period of the repeating pattern: after `num / gcd(rate * den, num)`
    // frames the accumulated remainder returns to zero. For broadcast rates
    // this is small (5 for 59.94/29.97).
    let g = gcd(rate * den, num);
    let period = (num / g) as usize;

    // Each frame gets the exact number of samples belonging to it, so the
    // running total never drifts by more than one sample.
    let mut cadence = Vec::with_capacity(period);
    let mut prev_total: u64 = 0;
    for i in 0..period as u64 {
        let total = (rate * den * (i + 1)) / num;
        cadence.push((total - prev_total) as usize);
        prev_total = total;
    }

    cadence
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 { a } else { gcd(b, a % b) }
}
