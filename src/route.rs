//! Routes: weak fan-out taps
//!
//! A route is a tap on what the stage produced: either one layer or the
//! whole channel. The channel keeps only a weak entry in its routes table;
//! the subscribers own the route, and when the last one drops it the table
//! entry dies with it and is replaced on the next `route()` call.
//!
//! Delivery is best-effort and never blocks the channel loop: each
//! subscriber gets its own unbounded queue, and queues whose receiver is
//! gone are pruned on the next signal.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

use log::debug;

use crate::format::VideoFormat;
use crate::frame::DrawFrame;

/// A fan-out tap on one layer or the whole channel
pub struct Route {
    name: String,
    format: VideoFormat,
    subscribers: Mutex<Vec<Sender<DrawFrame>>>,
}

impl Route {
    pub(crate) fn new(name: String, format: VideoFormat) -> Self {
        Self {
            name,
            format,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Human-readable identity: `"<channel>"` or `"<channel>/<layer>"`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The channel format at the time the route was created
    pub fn format(&self) -> &VideoFormat {
        &self.format
    }

    /// Attach a subscriber; frames signaled after this call arrive on the
    /// returned receiver
    pub fn subscribe(&self) -> Receiver<DrawFrame> {
        let (tx, rx) = channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Deliver one frame to every live subscriber
    pub fn signal(&self, frame: DrawFrame) {
        let mut subscribers = self.subscribers.lock().unwrap();
        let before = subscribers.len();
        subscribers.retain(|tx| tx.send(frame.clone()).is_ok());
        let dropped = before - subscribers.len();
        if dropped > 0 {
            debug!("route {}: pruned {} dead subscribers", self.name, dropped);
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("format", &self.format.name)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
