//! Per-layer frame transforms
//!
//! A transform carries the image and audio adjustments a layer applies to its
//! producer's frames. `TweenedTransform` interpolates between two transforms
//! over a number of frames so adjustments ramp instead of stepping.

use serde::{Deserialize, Serialize};

/// Image and audio adjustments applied to one layer's frames
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameTransform {
    /// Image opacity, 0.0..=1.0
    pub opacity: f64,
    /// Audio gain, 0.0..=1.0 (linear)
    pub volume: f64,
}

impl FrameTransform {
    pub fn with_opacity(opacity: f64) -> Self {
        Self {
            opacity,
            ..Default::default()
        }
    }

    pub fn with_volume(volume: f64) -> Self {
        Self {
            volume,
            ..Default::default()
        }
    }

    /// Compose two transforms; nesting multiplies
    pub fn combine(&self, other: &FrameTransform) -> FrameTransform {
        FrameTransform {
            opacity: self.opacity * other.opacity,
            volume: self.volume * other.volume,
        }
    }

    fn lerp(&self, dest: &FrameTransform, t: f64) -> FrameTransform {
        FrameTransform {
            opacity: self.opacity + (dest.opacity - self.opacity) * t,
            volume: self.volume + (dest.volume - self.volume) * t,
        }
    }
}

impl Default for FrameTransform {
    fn default() -> Self {
        Self {
            opacity: 1.0,
            volume: 1.0,
        }
    }
}

/// A transform ramping from a source to a destination over `duration` frames
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TweenedTransform {
    source: FrameTransform,
    dest: FrameTransform,
    duration: u32,
    time: u32,
}

impl TweenedTransform {
    pub fn new(source: FrameTransform, dest: FrameTransform, duration: u32) -> Self {
        Self {
            source,
            dest,
            duration,
            time: 0,
        }
    }

    /// Advance by `frames` ticks, saturating at the destination
    pub fn tick(&mut self, frames: u32) {
        self.time = (self.time + frames).min(self.duration);
    }

    /// The transform effective at the current time
    pub fn fetch(&self) -> FrameTransform {
        if self.duration == 0 || self.time >= self.duration {
            return self.dest;
        }
        let t = self.time as f64 / self.duration as f64;
        self.source.lerp(&self.dest, t)
    }

    /// The destination this tween is ramping toward
    pub fn dest(&self) -> FrameTransform {
        self.dest
    }

    pub fn is_done(&self) -> bool {
        self.time >= self.duration
    }
}

impl Default for TweenedTransform {
    fn default() -> Self {
        Self::new(FrameTransform::default(), FrameTransform::default(), 0)
    }
}
