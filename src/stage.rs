//! The stage: ordered layers of producers
//!
//! A stage owns an ordered map of layers. Once per tick the channel loop
//! asks it for one `DrawFrame` per layer; everything else (loading,
//! playing, pausing producers, adjusting transforms) arrives from outside
//! the loop and is serialized against the tick by the stage's own lock.
//!
//! A layer holds a foreground producer (on air) and a background producer
//! (loaded, waiting for `play`). Pausing a layer freezes it on its last
//! frame; the producer is not ticked while paused.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use log::info;

use crate::format::VideoFormat;
use crate::frame::DrawFrame;
use crate::telemetry::State;
use crate::transform::{FrameTransform, TweenedTransform};

/// A pluggable frame source owned by one layer
pub trait Producer: Send {
    /// Produce one frame plus `nb_samples` audio samples per channel
    fn receive(&mut self, format: &VideoFormat, nb_samples: usize) -> Result<DrawFrame>;

    /// Name for logging and telemetry
    fn name(&self) -> String;

    /// Producer-specific telemetry snapshot
    fn state(&self) -> State {
        State::new()
    }
}

#[derive(Default)]
struct Layer {
    foreground: Option<Box<dyn Producer>>,
    background: Option<Box<dyn Producer>>,
    paused: bool,
    last_frame: DrawFrame,
}

impl Layer {
    fn receive(&mut self, format: &VideoFormat, nb_samples: usize) -> Result<DrawFrame> {
        if self.paused {
            // A freshly previewed layer has nothing cached yet; pull the
            // frame to freeze on, then hold it.
            if !matches!(self.last_frame, DrawFrame::Empty) || self.foreground.is_none() {
                return Ok(self.last_frame.clone());
            }
        }

        let frame = match self.foreground.as_mut() {
            Some(producer) => producer.receive(format, nb_samples)?,
            None => DrawFrame::Empty,
        };

        self.last_frame = frame.clone();
        Ok(frame)
    }

    fn load(&mut self, producer: Box<dyn Producer>, preview: bool) {
        self.background = Some(producer);
        if preview {
            // Show the loaded producer's first frame without playing it
            self.play();
            self.paused = true;
        }
    }

    fn play(&mut self) {
        if let Some(background) = self.background.take() {
            self.foreground = Some(background);
            self.last_frame = DrawFrame::Empty;
        }
        self.paused = false;
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn resume(&mut self) {
        self.paused = false;
    }

    fn stop(&mut self) {
        self.foreground = None;
        self.last_frame = DrawFrame::Empty;
        self.paused = false;
    }

    fn state(&self) -> State {
        let mut state = State::new();
        state.insert(
            "foreground",
            self.foreground
                .as_ref()
                .map(|p| p.name())
                .unwrap_or_else(|| "empty".to_string()),
        );
        state.insert(
            "background",
            self.background
                .as_ref()
                .map(|p| p.name())
                .unwrap_or_else(|| "empty".to_string()),
        );
        state.insert("paused", self.paused);
        if let Some(producer) = &self.foreground {
            state.insert_tree("producer", producer.state());
        }
        state
    }
}

struct StageInner {
    layers: BTreeMap<i32, Layer>,
    tweens: BTreeMap<i32, TweenedTransform>,
}

/// Ordered map of layers, ticked by the channel loop
pub struct Stage {
    channel_index: i32,
    inner: Mutex<StageInner>,
    state: Mutex<State>,
}

impl Stage {
    pub fn new(channel_index: i32) -> Self {
        Self {
            channel_index,
            inner: Mutex::new(StageInner {
                layers: BTreeMap::new(),
                tweens: BTreeMap::new(),
            }),
            state: Mutex::new(State::new()),
        }
    }

    /// Produce one decorated frame per layer
    ///
    /// Advances transform tweens by one frame, asks every layer's producer
    /// for a frame, and rebuilds the per-layer telemetry snapshot. A failing
    /// producer fails the whole tick; the caller's recovery boundary decides
    /// what happens next.
    pub fn tick(
        &self,
        format: &VideoFormat,
        nb_samples: usize,
    ) -> Result<BTreeMap<i32, DrawFrame>> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        for tween in inner.tweens.values_mut() {
            tween.tick(1);
        }

        let mut frames = BTreeMap::new();
        for (&id, layer) in inner.layers.iter_mut() {
            let transform = inner
                .tweens
                .get(&id)
                .map(|t| t.fetch())
                .unwrap_or_default();
            frames.insert(id, DrawFrame::push(layer.receive(format, nb_samples)?, transform));
        }

        let mut state = State::new();
        for (&id, layer) in inner.layers.iter() {
            state.insert_tree(format!("layer/{}", id), layer.state());
        }
        *self.state.lock().unwrap() = state;

        Ok(frames)
    }

    /// Snapshot of the per-layer state taken during the last tick
    pub fn state(&self) -> State {
        self.state.lock().unwrap().clone()
    }

    /// Load a producer into a layer's background slot
    ///
    /// With `preview` set the producer becomes visible immediately but
    /// stays frozen on its first frame.
    pub fn load(&self, layer: i32, producer: Box<dyn Producer>, preview: bool) {
        let mut inner = self.inner.lock().unwrap();
        let name = producer.name();
        inner.layers.entry(layer).or_default().load(producer, preview);
        info!(
            "stage[{}] layer {} loaded {}",
            self.channel_index, layer, name
        );
    }

    /// Promote the layer's background producer to the foreground
    pub fn play(&self, layer: i32) {
        let mut inner = self.inner.lock().unwrap();
        inner.layers.entry(layer).or_default().play();
    }

    /// Freeze the layer on its last frame
    pub fn pause(&self, layer: i32) {
        if let Some(l) = self.inner.lock().unwrap().layers.get_mut(&layer) {
            l.pause();
        }
    }

    pub fn resume(&self, layer: i32) {
        if let Some(l) = self.inner.lock().unwrap().layers.get_mut(&layer) {
            l.resume();
        }
    }

    /// Remove the layer's foreground producer, keeping the background
    pub fn stop(&self, layer: i32) {
        if let Some(l) = self.inner.lock().unwrap().layers.get_mut(&layer) {
            l.stop();
        }
    }

    /// Remove one layer entirely
    pub fn clear_layer(&self, layer: i32) {
        self.inner.lock().unwrap().layers.remove(&layer);
    }

    /// Remove all layers (also called on format changes)
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.layers.clear();
        info!("stage[{}] cleared", self.channel_index);
    }

    /// Ramp a layer's transform toward `func(current destination)`
    pub fn apply_transform<F>(&self, layer: i32, func: F, duration: u32)
    where
        F: FnOnce(FrameTransform) -> FrameTransform,
    {
        let mut inner = self.inner.lock().unwrap();
        let tween = inner.tweens.entry(layer).or_default();
        let source = tween.fetch();
        let dest = func(tween.dest());
        *tween = TweenedTransform::new(source, dest, duration);
    }

    /// The transform currently in effect on a layer
    pub fn current_transform(&self, layer: i32) -> FrameTransform {
        self.inner
            .lock()
            .unwrap()
            .tweens
            .get(&layer)
            .map(|t| t.fetch())
            .unwrap_or_default()
    }

    pub fn clear_transform(&self, layer: i32) {
        self.inner.lock().unwrap().tweens.remove(&layer);
    }

    pub fn clear_transforms(&self) {
        self.inner.lock().unwrap().tweens.clear();
    }

    /// Ids of layers currently present
    pub fn layer_ids(&self) -> Vec<i32> {
        self.inner.lock().unwrap().layers.keys().copied().collect()
    }
}
