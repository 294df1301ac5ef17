//! Realtime video channel engine
//!
//! This crate drives broadcast-style video channels: once per frame a
//! dedicated worker gathers one frame from every layered producer, mixes
//! them into a single output frame, and hands it to the consumers, while
//! publishing a predicted and then corrected timecode, fanning stage frames
//! out on weak routes, and exporting per-tick telemetry.
//!
//! # Architecture
//!
//! A `Channel` composes, leaves first:
//! - `ChannelTimecode`: two-phase frame stamp (predict, then finalize)
//! - `Stage`: ordered layers, each owning a pluggable `Producer`
//! - `Mixer`: composites layers via the injected `ImageMixer` and mixes audio
//! - `Output`: dispatches finished frames to pluggable `Consumer`s
//! - `Route`: weak fan-out taps on single layers or the whole channel
//! - `State`/`Graph`: telemetry snapshot and occupancy time series
//!
//! Data flow per tick: `Stage → (per-layer frames, audio) → Mixer → Output`,
//! with route fan-out alongside the consumer dispatch. Pacing comes from the
//! consumers; the loop itself never sleeps.

pub mod channel;
pub mod format;
pub mod frame;
pub mod mixer;
pub mod output;
pub mod route;
pub mod stage;
pub mod telemetry;
pub mod timecode;
pub mod transform;

pub use channel::{Channel, ListenerHandle, TimecodeListener};
pub use format::{FieldMode, FormatError, Framerate, VideoFormat};
pub use frame::{DrawFrame, Frame, FrameFactory, MixedFrame};
pub use mixer::{ImageMixer, Mixer};
pub use output::{Consumer, Output};
pub use route::Route;
pub use stage::{Producer, Stage};
pub use telemetry::{Color, Graph, State, StateValue};
pub use timecode::{ChannelTimecode, FrameTimecode, TimecodeSource};
pub use transform::{FrameTransform, TweenedTransform};
