//! Frame model
//!
//! Three frame shapes move through a channel:
//! - `Frame`: one image plane plus the audio samples a producer attached,
//!   allocated through a `FrameFactory`
//! - `DrawFrame`: what the stage hands to the mixer and the routes, a
//!   `Frame` decorated with the layer transform, or a composite of several
//! - `MixedFrame`: the single finished frame the output dispatches
//!
//! `DrawFrame::push` decorates, `DrawFrame::pop` strips the decoration again;
//! route taps deliver popped frames so downstream subscribers see what the
//! producer emitted, not the layer's transform of it.

use bytes::Bytes;

use crate::transform::FrameTransform;

/// A single produced frame: image plane plus interleaved audio samples
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub image: Bytes,
    pub audio: Vec<i32>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(image: Bytes, audio: Vec<i32>, width: u32, height: u32) -> Self {
        Self {
            image,
            audio,
            width,
            height,
        }
    }

    /// An empty frame with no image data and no audio
    pub fn empty() -> Self {
        Self {
            image: Bytes::new(),
            audio: Vec::new(),
            width: 0,
            height: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty() && self.audio.is_empty()
    }

    pub fn size(&self) -> usize {
        self.image.len()
    }
}

/// A stage-level frame: producer output decorated with its layer transform
#[derive(Debug, Clone, PartialEq)]
pub enum DrawFrame {
    /// Nothing to draw this tick
    Empty,
    /// One frame with the transform applied on top
    Single {
        frame: Frame,
        transform: FrameTransform,
    },
    /// Several frames drawn in order (whole-channel route signal)
    Composite(Vec<DrawFrame>),
}

impl Default for DrawFrame {
    fn default() -> Self {
        DrawFrame::Empty
    }
}

impl DrawFrame {
    /// Decorate a frame with a transform
    pub fn push(frame: DrawFrame, transform: FrameTransform) -> DrawFrame {
        match frame {
            DrawFrame::Empty => DrawFrame::Empty,
            DrawFrame::Single {
                frame,
                transform: inner,
            } => DrawFrame::Single {
                frame,
                transform: inner.combine(&transform),
            },
            composite @ DrawFrame::Composite(_) => DrawFrame::push_all(composite, transform),
        }
    }

    fn push_all(frame: DrawFrame, transform: FrameTransform) -> DrawFrame {
        match frame {
            DrawFrame::Empty => DrawFrame::Empty,
            DrawFrame::Single {
                frame,
                transform: inner,
            } => DrawFrame::Single {
                frame,
                transform: inner.combine(&transform),
            },
            DrawFrame::Composite(frames) => DrawFrame::Composite(
                frames
                    .into_iter()
                    .map(|f| DrawFrame::push_all(f, transform))
                    .collect(),
            ),
        }
    }

    /// Strip the outermost decoration, restoring the producer's own frame
    pub fn pop(frame: DrawFrame) -> DrawFrame {
        match frame {
            DrawFrame::Single { frame, .. } => DrawFrame::Single {
                frame,
                transform: FrameTransform::default(),
            },
            other => other,
        }
    }

    pub fn from_frame(frame: Frame) -> DrawFrame {
        DrawFrame::Single {
            frame,
            transform: FrameTransform::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            DrawFrame::Empty => true,
            DrawFrame::Single { frame, .. } => frame.is_empty(),
            DrawFrame::Composite(frames) => frames.iter().all(|f| f.is_empty()),
        }
    }

    /// Number of leaf frames contained
    pub fn frame_count(&self) -> usize {
        match self {
            DrawFrame::Empty => 0,
            DrawFrame::Single { .. } => 1,
            DrawFrame::Composite(frames) => frames.iter().map(|f| f.frame_count()).sum(),
        }
    }

    /// Visit every leaf frame together with its effective transform
    pub fn visit<F: FnMut(&Frame, &FrameTransform)>(&self, visitor: &mut F) {
        match self {
            DrawFrame::Empty => {}
            DrawFrame::Single { frame, transform } => visitor(frame, transform),
            DrawFrame::Composite(frames) => {
                for f in frames {
                    f.visit(visitor);
                }
            }
        }
    }
}

/// The finished output frame of one tick
#[derive(Debug, Clone, PartialEq)]
pub struct MixedFrame {
    pub image: Bytes,
    pub audio: Vec<i32>,
    pub width: u32,
    pub height: u32,
}

impl MixedFrame {
    pub fn size(&self) -> usize {
        self.image.len()
    }
}

/// Frame allocation for producers
///
/// The injected image compositor implements this; producers obtain writable
/// frames from it so allocation strategy (pooling, pinned memory) stays with
/// the compositor.
pub trait FrameFactory: Send + Sync {
    /// Allocate a frame sized for the given geometry, zero-filled
    fn alloc_frame(&self, width: u32, height: u32) -> Frame;
}
