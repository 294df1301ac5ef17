//! Frame-accurate channel timecode
//!
//! The channel stamps every output frame with a `FrameTimecode`. Stamping is
//! two-phase per tick:
//! - `predict()` answers "what stamp will this frame carry?" without
//!   committing, so producers running inside the stage can schedule against
//!   the frame they are producing
//! - `finalize()` commits the stamp the consumers will see
//!
//! Between two finalizes (without a format change) the stamp advances by
//! exactly one frame. Calling `predict` any number of times between
//! finalizes returns the same value, and that value is what the following
//! `finalize` commits.
//!
//! # Sources
//!
//! By default the timecode free-runs from a wall-clock anchor. A producer
//! that carries embedded timecode (e.g. an SDI ingest) can be attached as a
//! `TimecodeSource`; a valid source stamp is adopted at finalize and
//! re-anchors the free run. Weak attachment degrades back to free run when
//! the source goes away.

use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use thiserror::Error;

use crate::format::VideoFormat;

const MILLIS_PER_DAY: u64 = 1000 * 60 * 60 * 24;

/// Errors produced when parsing a timecode string
#[derive(Debug, Error)]
pub enum TimecodeParseError {
    #[error("timecode string must be HH:MM:SS:FF, got {0:?}")]
    MalformedString(String),

    #[error("timecode component out of range: {0}")]
    ComponentOutOfRange(&'static str),
}

/// A frame-precision stamp: frame count within a 24 hour day, at a fixed rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameTimecode {
    frames: u32,
    fps: u8,
}

impl FrameTimecode {
    pub fn new(frames: u32, fps: u8) -> Self {
        Self {
            frames: validate(frames, fps),
            fps,
        }
    }

    /// The invalid sentinel stamp
    pub fn empty() -> Self {
        Self { frames: 0, fps: 0 }
    }

    pub fn is_valid(&self) -> bool {
        self.fps != 0
    }

    pub fn total_frames(&self) -> u32 {
        self.frames
    }

    pub fn fps(&self) -> u8 {
        self.fps
    }

    /// Frames in one 24 hour day at this rate
    pub fn max_frames(&self) -> u32 {
        max_frames_for_fps(self.fps)
    }

    /// The stamp one frame later, wrapping at 24 hours
    pub fn next(&self) -> Self {
        Self::new(self.frames + 1, self.fps)
    }

    /// The stamp `delta` frames away, wrapping in either direction
    pub fn offset(&self, delta: i64) -> Self {
        let max = self.max_frames() as i64;
        if max == 0 {
            return *self;
        }
        let mut val = (self.frames as i64 + delta) % max;
        if val < 0 {
            val += max;
        }
        Self {
            frames: val as u32,
            fps: self.fps,
        }
    }

    /// The same moment expressed at another frame rate
    pub fn with_fps(&self, fps: u8) -> Self {
        if self.fps == 0 || fps == 0 {
            return Self { frames: 0, fps };
        }
        let frames =
            (self.frames as u64 * fps as u64 + self.fps as u64 / 2) / self.fps as u64;
        Self::new(frames as u32, fps)
    }

    /// Milliseconds since midnight
    pub fn pts(&self) -> i64 {
        if self.fps == 0 {
            return 0;
        }
        self.frames as i64 * 1000 / self.fps as i64
    }

    /// Split into hours, minutes, seconds and frames
    ///
    /// With `smpte` set, frame pairs are halved above 30fps so the frame
    /// field stays within two digits.
    pub fn components(&self, smpte: bool) -> (u8, u8, u8, u8) {
        if self.fps == 0 {
            return (0, 0, 0, 0);
        }

        let mut total = self.frames;
        let mut frames = (total % self.fps as u32) as u8;
        if smpte && self.fps > 30 {
            frames /= 2;
        }
        total /= self.fps as u32;

        let seconds = (total % 60) as u8;
        total /= 60;
        let minutes = (total % 60) as u8;
        total /= 60;
        let hours = (total % 24) as u8;

        (hours, minutes, seconds, frames)
    }

    /// Packed BCD representation (hh mm ss ff, one byte each)
    pub fn bcd(&self) -> u32 {
        let (hours, minutes, seconds, frames) = self.components(true);

        let mut res: u32 = 0;
        for part in [hours, minutes, seconds, frames] {
            res <<= 8;
            res += (((part / 10) as u32) << 4) + (part % 10) as u32;
        }
        res
    }

    /// Build from components; frames above `fps` are rejected
    pub fn from_components(
        hours: u8,
        minutes: u8,
        seconds: u8,
        frames: u8,
        fps: u8,
    ) -> Result<Self, TimecodeParseError> {
        if hours > 23 {
            return Err(TimecodeParseError::ComponentOutOfRange("hours"));
        }
        if minutes > 59 {
            return Err(TimecodeParseError::ComponentOutOfRange("minutes"));
        }
        if seconds > 59 {
            return Err(TimecodeParseError::ComponentOutOfRange("seconds"));
        }
        if frames > fps {
            return Err(TimecodeParseError::ComponentOutOfRange("frames"));
        }

        let mut total = hours as u32;
        total = total * 60 + minutes as u32;
        total = total * 60 + seconds as u32;
        total = total * fps as u32 + frames as u32;

        Ok(Self::new(total, fps))
    }

    /// Parse `"HH:MM:SS:FF"` (separators `:` `.` `;` `,` accepted)
    pub fn parse(s: &str, fps: u8) -> Result<Self, TimecodeParseError> {
        if s.len() != 11 {
            return Err(TimecodeParseError::MalformedString(s.to_string()));
        }

        let parts: Vec<&str> = s.split([':', '.', ';', ',']).collect();
        if parts.len() != 4 {
            return Err(TimecodeParseError::MalformedString(s.to_string()));
        }

        let mut nums = [0u8; 4];
        for (i, part) in parts.iter().enumerate() {
            nums[i] = part
                .parse::<u8>()
                .map_err(|_| TimecodeParseError::MalformedString(s.to_string()))?;
        }

        let mut frames = nums[3];
        // smpte strings don't carry high-rate frame counts
        if fps > 30 {
            frames *= 2;
        }

        Self::from_components(nums[0], nums[1], nums[2], frames, fps)
    }
}

impl std::fmt::Display for FrameTimecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (hours, minutes, seconds, frames) = self.components(true);
        write!(
            f,
            "{:02}:{:02}:{:02}:{:02}",
            hours, minutes, seconds, frames
        )
    }
}

fn max_frames_for_fps(fps: u8) -> u32 {
    const SECONDS_PER_DAY: u32 = 24 * 60 * 60;
    SECONDS_PER_DAY * fps as u32
}

fn validate(frames: u32, fps: u8) -> u32 {
    let max = max_frames_for_fps(fps);
    if max == 0 {
        return 0;
    }
    if frames >= max { frames - max } else { frames }
}

/// A producer-side clock a channel timecode can follow
pub trait TimecodeSource: Send + Sync {
    /// The source's current stamp; `FrameTimecode::empty()` when unknown
    fn timecode(&self) -> FrameTimecode;

    /// Whether a stamp is currently available
    fn has_timecode(&self) -> bool;

    /// Whether this source can ever provide stamps
    fn provides_timecode(&self) -> bool;

    /// Human-readable name for telemetry
    fn name(&self) -> String;
}

/// Proxy holding the source weakly; degrades to "no source" when dropped
struct WeakSourceProxy {
    index: i32,
    src: Weak<dyn TimecodeSource>,
    valid: Mutex<bool>,
}

impl WeakSourceProxy {
    fn new(index: i32, src: &Arc<dyn TimecodeSource>) -> Self {
        Self {
            index,
            src: Arc::downgrade(src),
            valid: Mutex::new(true),
        }
    }

    fn upgrade(&self) -> Option<Arc<dyn TimecodeSource>> {
        let mut valid = self.valid.lock().unwrap();
        if !*valid {
            return None;
        }
        match self.src.upgrade() {
            Some(src) => Some(src),
            None => {
                warn!("timecode[{}] - Lost timecode source", self.index);
                *valid = false;
                None
            }
        }
    }
}

impl TimecodeSource for WeakSourceProxy {
    fn timecode(&self) -> FrameTimecode {
        match self.upgrade() {
            Some(src) => src.timecode(),
            None => FrameTimecode::empty(),
        }
    }

    fn has_timecode(&self) -> bool {
        self.upgrade().map(|src| src.has_timecode()).unwrap_or(false)
    }

    fn provides_timecode(&self) -> bool {
        self.upgrade()
            .map(|src| src.provides_timecode())
            .unwrap_or(false)
    }

    fn name(&self) -> String {
        match self.upgrade() {
            Some(src) => src.name(),
            None => "free".to_string(),
        }
    }
}

struct TimecodeState {
    current: FrameTimecode,
    format: VideoFormat,
    source: Option<Arc<dyn TimecodeSource>>,
    is_system_clock: bool,
}

/// The channel's two-phase timecode
///
/// Shared between the channel loop (predict/finalize) and external callers
/// (source management, format changes); all state sits behind one mutex with
/// short critical sections.
pub struct ChannelTimecode {
    index: i32,
    state: Mutex<TimecodeState>,
}

impl ChannelTimecode {
    pub fn new(index: i32, format: &VideoFormat) -> Self {
        let fps = format.fps().round() as u8;
        Self {
            index,
            state: Mutex::new(TimecodeState {
                current: FrameTimecode::new(0, fps),
                format: format.clone(),
                source: None,
                is_system_clock: false,
            }),
        }
    }

    /// Anchor the free run to the current wall clock
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        state.current = wall_clock_stamp(&state.format);
    }

    /// The stamp the next frame will carry; does not commit
    ///
    /// Stable across repeated calls until the next `finalize`, and equal to
    /// what that `finalize` will return: an attached source is consulted
    /// here exactly as it is at finalize.
    pub fn predict(&self) -> FrameTimecode {
        let state = self.state.lock().unwrap();

        if let Some(source) = &state.source {
            if source.has_timecode() {
                let tc = source.timecode();
                if tc.is_valid() {
                    return tc.with_fps(state.current.fps());
                }
            }
        }

        state.current.next()
    }

    /// Commit and return the stamp for the frame being produced
    ///
    /// Advances the free run by one frame, or adopts the attached source's
    /// stamp when one is available and valid.
    pub fn finalize(&self) -> FrameTimecode {
        let mut state = self.state.lock().unwrap();

        if let Some(source) = state.source.clone() {
            if source.has_timecode() {
                let tc = source.timecode();
                if tc.is_valid() {
                    state.current = tc.with_fps(state.current.fps());
                    return state.current;
                }
                warn!("timecode[{}] - Timecode update invalid. Ignoring", self.index);
            }
        }

        state.current = state.current.next();
        state.current
    }

    /// The last committed stamp
    pub fn timecode(&self) -> FrameTimecode {
        self.state.lock().unwrap().current
    }

    /// Jump the free run to a given stamp; ignored while a source is attached
    pub fn set_timecode(&self, tc: FrameTimecode) {
        let mut state = self.state.lock().unwrap();
        if !has_live_source(&state) {
            state.current = tc;
        }
    }

    /// Re-anchor for a new format; subsequent stamps use its rate
    pub fn change_format(&self, format: &VideoFormat) {
        let mut state = self.state.lock().unwrap();
        state.format = format.clone();
        state.current = wall_clock_stamp(format);
    }

    /// Whether the timecode is free-running (no live source attached)
    pub fn is_free(&self) -> bool {
        let state = self.state.lock().unwrap();
        !has_live_source(&state)
    }

    /// Follow a source, keeping it alive
    pub fn set_source(&self, src: Arc<dyn TimecodeSource>) -> bool {
        if !src.provides_timecode() {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        info!("timecode[{}] - Loaded source {}", self.index, src.name());
        state.source = Some(src);
        state.is_system_clock = false;
        true
    }

    /// Follow a source without keeping it alive
    ///
    /// When the source is dropped the timecode falls back to free run.
    pub fn set_weak_source(&self, src: &Arc<dyn TimecodeSource>) -> bool {
        if !src.provides_timecode() {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        info!("timecode[{}] - Loaded source {}", self.index, src.name());
        state.source = Some(Arc::new(WeakSourceProxy::new(self.index, src)));
        state.is_system_clock = false;
        true
    }

    /// Detach any source and free-run
    pub fn clear_source(&self) {
        let mut state = self.state.lock().unwrap();
        state.source = None;
        state.is_system_clock = false;
        info!("timecode[{}] - Set to freerun", self.index);
    }

    /// Free-run anchored to the system clock
    pub fn set_system_time(&self) {
        let mut state = self.state.lock().unwrap();
        state.source = None;
        state.is_system_clock = true;
        state.current = wall_clock_stamp(&state.format);
        info!("timecode[{}] - Set to system clock", self.index);
    }

    /// Name of whatever feeds the stamp: a source, `"clock"`, or `"free"`
    pub fn source_name(&self) -> String {
        let state = self.state.lock().unwrap();
        if let Some(source) = &state.source {
            return source.name();
        }
        if state.is_system_clock {
            return "clock".to_string();
        }
        "free".to_string()
    }
}

fn has_live_source(state: &TimecodeState) -> bool {
    state
        .source
        .as_ref()
        .map(|s| s.has_timecode())
        .unwrap_or(false)
}

fn wall_clock_stamp(format: &VideoFormat) -> FrameTimecode {
    let fps = format.fps().round() as u8;
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64 % MILLIS_PER_DAY)
        .unwrap_or(0);
    let frames = (millis as f64 * format.fps() / 1000.0).round() as u32;
    FrameTimecode::new(frames, fps)
}
