//! Output: consumer fan-out
//!
//! The output owns an indexed set of consumers and dispatches every mixed
//! frame to all of them with the finalized timecode. A consumer that fails
//! is logged and skipped for that tick; it never aborts the tick for the
//! other consumers. Buffering and scheduling are the consumer's own
//! affair; a consumer that blocks in `send` paces the whole channel,
//! which is the backpressure model.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use log::{error, info};

use crate::format::VideoFormat;
use crate::frame::MixedFrame;
use crate::telemetry::State;
use crate::timecode::FrameTimecode;

/// A pluggable frame sink
pub trait Consumer: Send {
    /// Deliver one finished frame with its timecode
    fn send(
        &mut self,
        timecode: FrameTimecode,
        frame: &MixedFrame,
        format: &VideoFormat,
    ) -> Result<()>;

    /// Name for logging and telemetry
    fn name(&self) -> String;

    /// Consumer-specific telemetry snapshot
    fn state(&self) -> State {
        State::new()
    }
}

/// Indexed consumer set for one channel
pub struct Output {
    channel_index: i32,
    consumers: Mutex<BTreeMap<i32, Box<dyn Consumer>>>,
    state: Mutex<State>,
}

impl Output {
    pub fn new(channel_index: i32) -> Self {
        Self {
            channel_index,
            consumers: Mutex::new(BTreeMap::new()),
            state: Mutex::new(State::new()),
        }
    }

    /// Install a consumer on a port, replacing any previous one
    pub fn add(&self, port: i32, consumer: Box<dyn Consumer>) {
        info!(
            "output[{}] port {} added {}",
            self.channel_index,
            port,
            consumer.name()
        );
        self.consumers.lock().unwrap().insert(port, consumer);
    }

    /// Remove the consumer on a port
    pub fn remove(&self, port: i32) {
        if self.consumers.lock().unwrap().remove(&port).is_some() {
            info!("output[{}] port {} removed", self.channel_index, port);
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().unwrap().len()
    }

    /// Dispatch one frame to every consumer
    ///
    /// Takes ownership of the frame; consumers receive a shared reference
    /// so none of them can hold the channel's buffer beyond the call.
    pub fn push(&self, timecode: FrameTimecode, frame: MixedFrame, format: &VideoFormat) {
        let mut consumers = self.consumers.lock().unwrap();

        for (&port, consumer) in consumers.iter_mut() {
            if let Err(e) = consumer.send(timecode, &frame, format) {
                error!(
                    "output[{}] port {} ({}) failed to send frame: {:#}",
                    self.channel_index,
                    port,
                    consumer.name(),
                    e
                );
            }
        }

        let mut state = State::new();
        for (&port, consumer) in consumers.iter() {
            let mut port_state = State::new();
            port_state.insert("consumer", consumer.name());
            port_state.insert_tree("state", consumer.state());
            state.insert_tree(format!("port/{}", port), port_state);
        }
        *self.state.lock().unwrap() = state;
    }

    /// Snapshot taken during the last push
    pub fn state(&self) -> State {
        self.state.lock().unwrap().clone()
    }
}
