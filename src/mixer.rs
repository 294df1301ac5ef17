//! Frame mixing façade
//!
//! The mixer turns the stage's per-layer frames into the single output
//! frame of the tick. Image compositing is delegated to the injected
//! `ImageMixer` (the channel does not know how to composite; the same
//! object doubles as the producers' frame factory). Audio is mixed here:
//! transform-weighted summation of every layer's samples into one
//! interleaved buffer with saturation at the i32 edges.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use bytes::Bytes;

use crate::format::VideoFormat;
use crate::frame::{DrawFrame, FrameFactory, MixedFrame};
use crate::telemetry::State;

/// Image compositing contract, implemented by the injected compositor
///
/// `FrameFactory` is a supertrait: the compositor allocates the frames the
/// producers draw into, so the compositing backend owns the pixel layout
/// end to end.
pub trait ImageMixer: FrameFactory {
    /// Composite the per-layer frames, in layer order, into one image plane
    fn composite(&self, layers: &BTreeMap<i32, DrawFrame>, format: &VideoFormat) -> Result<Bytes>;
}

/// Composites frames and mixes audio for one channel
pub struct Mixer {
    channel_index: i32,
    image_mixer: std::sync::Arc<dyn ImageMixer>,
    state: Mutex<State>,
}

impl Mixer {
    pub fn new(channel_index: i32, image_mixer: std::sync::Arc<dyn ImageMixer>) -> Self {
        Self {
            channel_index,
            image_mixer,
            state: Mutex::new(State::new()),
        }
    }

    /// Mix one tick's frames into the output frame
    ///
    /// `nb_samples` is the cadence baseline for this format: the audio
    /// buffer holds exactly `nb_samples * channels` interleaved samples,
    /// padded with silence where layers provided less.
    pub fn mix(
        &self,
        frames: &BTreeMap<i32, DrawFrame>,
        format: &VideoFormat,
        nb_samples: usize,
    ) -> Result<MixedFrame> {
        let image = self.image_mixer.composite(frames, format)?;
        let audio = mix_audio(frames, format, nb_samples);

        let mut state = State::new();
        state.insert("layers", frames.len() as i64);
        let peaks: Vec<crate::telemetry::StateValue> = channel_peaks(&audio, format)
            .into_iter()
            .map(crate::telemetry::StateValue::Real)
            .collect();
        state.insert("audio/peak", crate::telemetry::StateValue::List(peaks));
        *self.state.lock().unwrap() = state;

        Ok(MixedFrame {
            image,
            audio,
            width: format.width,
            height: format.height,
        })
    }

    /// Snapshot taken during the last mix
    pub fn state(&self) -> State {
        self.state.lock().unwrap().clone()
    }

    pub fn channel_index(&self) -> i32 {
        self.channel_index
    }
}

fn mix_audio(frames: &BTreeMap<i32, DrawFrame>, format: &VideoFormat, nb_samples: usize) -> Vec<i32> {
    let len = nb_samples * format.audio_channels as usize;
    let mut accumulator = vec![0i64; len];

    for frame in frames.values() {
        frame.visit(&mut |leaf, transform| {
            let volume = transform.volume.clamp(0.0, 1.0);
            for (slot, &sample) in accumulator.iter_mut().zip(leaf.audio.iter()) {
                *slot += (sample as f64 * volume) as i64;
            }
        });
    }

    accumulator
        .into_iter()
        .map(|s| s.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
        .collect()
}

/// Peak level per channel, normalized to 0.0..=1.0
fn channel_peaks(audio: &[i32], format: &VideoFormat) -> Vec<f64> {
    let channels = format.audio_channels as usize;
    let mut peaks = vec![0.0f64; channels.max(1)];
    for (i, &sample) in audio.iter().enumerate() {
        let level = (sample as f64 / i32::MAX as f64).abs();
        let ch = i % channels.max(1);
        if level > peaks[ch] {
            peaks[ch] = level;
        }
    }
    peaks
}
