//! The channel: a fixed-cadence produce → mix → consume driver
//!
//! One dedicated worker per channel runs the tick loop. Each iteration
//! snapshots the format and rotates the audio cadence, predicts the
//! timecode so producers can schedule against the frame being made, asks
//! the stage for one frame per layer, finalizes the timecode, notifies
//! timecode listeners, composites and audio-mixes the layers into one
//! output frame, hands it to the consumers, fans the stage frames out on
//! any live routes, and publishes the telemetry snapshot through the tick
//! callback.
//!
//! The loop never sleeps; pacing comes from the consumers. Any failure
//! inside a tick is caught at the iteration boundary and logged; the only
//! way out of the loop is the abort flag, set when the channel is dropped.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::Result;
use log::{error, info};

use crate::format::VideoFormat;
use crate::frame::{DrawFrame, FrameFactory};
use crate::mixer::{ImageMixer, Mixer};
use crate::output::Output;
use crate::route::Route;
use crate::stage::Stage;
use crate::telemetry::{Color, Graph, State};
use crate::timecode::{ChannelTimecode, FrameTimecode};

/// Called between finalize and mix with the committed stamp; commands it
/// schedules for that stamp apply no later than the next tick's produce
pub type TimecodeListener = Arc<dyn Fn(FrameTimecode, &Arc<Graph>) + Send + Sync>;

type TickCallback = Box<dyn Fn(&State) + Send + Sync>;

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    listeners: BTreeMap<u64, TimecodeListener>,
}

/// Removes its listener when dropped
///
/// Removal is atomic with respect to the loop's snapshot: a handle dropped
/// before a tick is never invoked for that tick or any later one.
pub struct ListenerHandle {
    id: u64,
    table: Weak<Mutex<ListenerTable>>,
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.lock().unwrap().listeners.remove(&self.id);
        }
    }
}

struct FormatState {
    format: VideoFormat,
    /// Rotated by one each tick; the head is the tick's sample count
    cadence: Vec<usize>,
}

struct ChannelCore {
    index: i32,
    format: Mutex<FormatState>,
    state: Mutex<State>,
    graph: Arc<Graph>,
    timecode: Arc<ChannelTimecode>,
    stage: Arc<Stage>,
    mixer: Arc<Mixer>,
    output: Arc<Output>,
    image_mixer: Arc<dyn ImageMixer>,
    routes: Mutex<BTreeMap<i32, Weak<Route>>>,
    listeners: Arc<Mutex<ListenerTable>>,
    tick_callback: TickCallback,
    abort: AtomicBool,
}

impl ChannelCore {
    fn new(
        index: i32,
        format: VideoFormat,
        image_mixer: Arc<dyn ImageMixer>,
        tick_callback: TickCallback,
    ) -> Arc<Self> {
        let graph = Arc::new(Graph::new());
        graph.set_color("produce-time", Color::rgb(0.0, 1.0, 0.0));
        graph.set_color("mix-time", Color::rgba(1.0, 0.0, 0.9, 0.8));
        graph.set_color("consume-time", Color::rgba(1.0, 0.4, 0.0, 0.8));
        graph.set_color("osc-time", Color::rgba(0.3, 0.4, 0.0, 0.8));
        graph.set_color("skipped-schedule", Color::rgb(0.3, 0.6, 0.6));

        let core = Arc::new(Self {
            index,
            format: Mutex::new(FormatState {
                cadence: format.audio_cadence.clone(),
                format: format.clone(),
            }),
            state: Mutex::new(State::new()),
            graph: graph.clone(),
            timecode: Arc::new(ChannelTimecode::new(index, &format)),
            stage: Arc::new(Stage::new(index)),
            mixer: Arc::new(Mixer::new(index, image_mixer.clone())),
            output: Arc::new(Output::new(index)),
            image_mixer,
            routes: Mutex::new(BTreeMap::new()),
            listeners: Arc::new(Mutex::new(ListenerTable::default())),
            tick_callback,
            abort: AtomicBool::new(false),
        });

        graph.set_text(core.print());
        core.timecode.start();

        core
    }

    fn print(&self) -> String {
        let format = self.format.lock().unwrap().format.name.clone();
        format!("channel[{}|{}]", self.index, format)
    }

    /// One iteration of the loop
    fn tick(&self) -> Result<()> {
        let (format, nb_samples) = {
            let mut fs = self.format.lock().unwrap();
            fs.cadence.rotate_right(1);
            (fs.format.clone(), fs.cadence.first().copied().unwrap_or(0))
        };

        self.state.lock().unwrap().clear();

        // Publish the tentative stamp for producers running inside the stage
        self.timecode.predict();

        let produce_timer = Instant::now();
        let stage_frames = self.stage.tick(&format, nb_samples)?;
        self.graph.set_value(
            "produce-time",
            produce_timer.elapsed().as_secs_f64() * format.fps() * 0.5,
        );

        self.state
            .lock()
            .unwrap()
            .insert_tree("stage", self.stage.state());

        // Accurate now the producers have run
        let timecode = self.timecode.finalize();

        self.invoke_timecode_listeners(timecode);

        let mix_timer = Instant::now();
        let mixed_frame = self.mixer.mix(
            &stage_frames,
            &format,
            format.audio_cadence.first().copied().unwrap_or(0),
        )?;
        self.graph.set_value(
            "mix-time",
            mix_timer.elapsed().as_secs_f64() * format.fps() * 0.5,
        );

        self.state
            .lock()
            .unwrap()
            .insert_tree("mixer", self.mixer.state());

        let consume_timer = Instant::now();
        self.output.push(timecode, mixed_frame, &format);
        self.graph.set_value(
            "consume-time",
            consume_timer.elapsed().as_secs_f64() * format.fps() * 0.5,
        );

        {
            let routes = self.routes.lock().unwrap();
            let mut frames = Vec::new();

            for (&layer, frame) in &stage_frames {
                frames.push(frame.clone());

                if let Some(route) = routes.get(&layer).and_then(|w| w.upgrade()) {
                    route.signal(DrawFrame::pop(frame.clone()));
                }
            }

            if let Some(route) = routes.get(&-1).and_then(|w| w.upgrade()) {
                route.signal(DrawFrame::Composite(frames));
            }
        }

        let snapshot = {
            let mut state = self.state.lock().unwrap();
            state.insert_tree("output", self.output.state());
            state.insert("timecode", timecode.to_string());
            state.insert("timecode/source", self.timecode.source_name());
            state.clone()
        };

        let osc_timer = Instant::now();
        (self.tick_callback)(&snapshot);
        self.graph.set_value(
            "osc-time",
            osc_timer.elapsed().as_secs_f64() * format.fps() * 0.5,
        );

        Ok(())
    }

    fn invoke_timecode_listeners(&self, timecode: FrameTimecode) {
        // Snapshot under the lock; registrations during the walk take
        // effect next tick
        let listeners: Vec<TimecodeListener> = {
            let table = self.listeners.lock().unwrap();
            table.listeners.values().cloned().collect()
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(timecode, &self.graph))).is_err() {
                error!("{} timecode listener panicked", self.print());
            }
        }
    }

    fn add_timecode_listener(&self, listener: TimecodeListener) -> ListenerHandle {
        let mut table = self.listeners.lock().unwrap();
        let id = table.next_id;
        table.next_id += 1;
        table.listeners.insert(id, listener);

        ListenerHandle {
            id,
            table: Arc::downgrade(&self.listeners),
        }
    }

    fn route(&self, layer: i32) -> Arc<Route> {
        let mut routes = self.routes.lock().unwrap();

        if let Some(existing) = routes.get(&layer).and_then(|w| w.upgrade()) {
            return existing;
        }

        let name = if layer == -1 {
            self.index.to_string()
        } else {
            format!("{}/{}", self.index, layer)
        };
        let format = self.format.lock().unwrap().format.clone();
        let route = Arc::new(Route::new(name, format));
        routes.insert(layer, Arc::downgrade(&route));
        route
    }

    fn video_format_desc(&self) -> VideoFormat {
        self.format.lock().unwrap().format.clone()
    }

    fn set_video_format_desc(&self, format: &VideoFormat) {
        let mut fs = self.format.lock().unwrap();
        fs.format = format.clone();
        fs.cadence = format.audio_cadence.clone();
        self.timecode.change_format(format);
        self.stage.clear();
    }

    fn run(&self) {
        while !self.abort.load(Ordering::Relaxed) {
            match catch_unwind(AssertUnwindSafe(|| self.tick())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("{} tick failed: {:#}", self.print(), e),
                Err(_) => error!("{} tick panicked", self.print()),
            }
        }
    }
}

/// A realtime video channel
///
/// Owns the stage, mixer, output, timecode and telemetry of one output
/// signal, plus the worker thread that drives them. External collaborators
/// reach the sub-components through the shared accessor handles; their
/// mutations are serialized against the running loop by each component's
/// own lock.
pub struct Channel {
    core: Arc<ChannelCore>,
    worker: Option<JoinHandle<()>>,
}

impl Channel {
    /// Create the channel and start its worker
    ///
    /// The image mixer is injected: it composites for the Mixer and
    /// allocates frames for the producers. The tick callback receives the
    /// full telemetry state once per tick, after all other work.
    pub fn new<F>(
        index: i32,
        format: VideoFormat,
        image_mixer: Arc<dyn ImageMixer>,
        tick_callback: F,
    ) -> Self
    where
        F: Fn(&State) + Send + Sync + 'static,
    {
        let core = ChannelCore::new(index, format, image_mixer, Box::new(tick_callback));

        info!("{} Successfully initialized.", core.print());

        let worker_core = core.clone();
        let worker = std::thread::Builder::new()
            .name(format!("channel-{}", index))
            .spawn(move || worker_core.run())
            .expect("failed to spawn channel worker");

        Self {
            core,
            worker: Some(worker),
        }
    }

    pub fn index(&self) -> i32 {
        self.core.index
    }

    pub fn stage(&self) -> Arc<Stage> {
        self.core.stage.clone()
    }

    pub fn mixer(&self) -> Arc<Mixer> {
        self.core.mixer.clone()
    }

    pub fn output(&self) -> Arc<Output> {
        self.core.output.clone()
    }

    pub fn timecode(&self) -> Arc<ChannelTimecode> {
        self.core.timecode.clone()
    }

    /// The injected image mixer in its frame-factory role
    pub fn frame_factory(&self) -> Arc<dyn FrameFactory> {
        self.core.image_mixer.clone()
    }

    pub fn graph(&self) -> Arc<Graph> {
        self.core.graph.clone()
    }

    /// Snapshot of the telemetry state published by the last tick
    pub fn state(&self) -> State {
        self.core.state.lock().unwrap().clone()
    }

    pub fn video_format_desc(&self) -> VideoFormat {
        self.core.video_format_desc()
    }

    /// Switch formats; re-anchors the timecode, resets the cadence
    /// rotation and clears the stage. Takes effect at the next tick.
    pub fn set_video_format_desc(&self, format: &VideoFormat) {
        self.core.set_video_format_desc(format);
    }

    /// Idempotent fan-out tap on one layer, or the whole channel with `-1`
    ///
    /// Returns the existing route while any holder keeps it alive;
    /// otherwise creates a fresh one.
    pub fn route(&self, layer: i32) -> Arc<Route> {
        self.core.route(layer)
    }

    /// Register a timecode listener; dropping the handle removes it
    pub fn add_timecode_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(FrameTimecode, &Arc<Graph>) + Send + Sync + 'static,
    {
        self.core.add_timecode_listener(Arc::new(listener))
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        info!("{} Uninitializing.", self.core.print());
        self.core.abort.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::output::Consumer;
    use crate::stage::Producer;
    use anyhow::anyhow;
    use bytes::Bytes;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    // ── test doubles ────────────────────────────────────────────

    struct StubCompositor;

    impl FrameFactory for StubCompositor {
        fn alloc_frame(&self, width: u32, height: u32) -> Frame {
            Frame::new(
                Bytes::from(vec![0u8; (width * height) as usize]),
                Vec::new(),
                width,
                height,
            )
        }
    }

    impl ImageMixer for StubCompositor {
        fn composite(
            &self,
            _layers: &BTreeMap<i32, DrawFrame>,
            _format: &VideoFormat,
        ) -> Result<Bytes> {
            Ok(Bytes::from_static(&[0u8; 4]))
        }
    }

    struct SampleRecorder {
        samples: Arc<Mutex<Vec<usize>>>,
    }

    impl Producer for SampleRecorder {
        fn receive(&mut self, _format: &VideoFormat, nb_samples: usize) -> Result<DrawFrame> {
            self.samples.lock().unwrap().push(nb_samples);
            Ok(DrawFrame::from_frame(Frame::new(
                Bytes::from_static(&[1u8]),
                vec![0; nb_samples],
                1,
                1,
            )))
        }

        fn name(&self) -> String {
            "sample-recorder".to_string()
        }
    }

    struct StampCollector {
        stamps: Arc<Mutex<Vec<FrameTimecode>>>,
    }

    impl Consumer for StampCollector {
        fn send(
            &mut self,
            timecode: FrameTimecode,
            _frame: &crate::frame::MixedFrame,
            _format: &VideoFormat,
        ) -> Result<()> {
            self.stamps.lock().unwrap().push(timecode);
            Ok(())
        }

        fn name(&self) -> String {
            "stamp-collector".to_string()
        }
    }

    struct EveryOtherTickFails {
        calls: u64,
    }

    impl Consumer for EveryOtherTickFails {
        fn send(
            &mut self,
            _timecode: FrameTimecode,
            _frame: &crate::frame::MixedFrame,
            _format: &VideoFormat,
        ) -> Result<()> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(anyhow!("link down"));
            }
            Ok(())
        }

        fn name(&self) -> String {
            "unstable".to_string()
        }
    }

    fn test_core(format: &str) -> Arc<ChannelCore> {
        ChannelCore::new(
            1,
            VideoFormat::from_name(format).unwrap(),
            Arc::new(StubCompositor),
            Box::new(|_| {}),
        )
    }

    fn load_recorder(core: &Arc<ChannelCore>, layer: i32) -> Arc<Mutex<Vec<usize>>> {
        let samples = Arc::new(Mutex::new(Vec::new()));
        core.stage.load(
            layer,
            Box::new(SampleRecorder {
                samples: samples.clone(),
            }),
            false,
        );
        core.stage.play(layer);
        samples
    }

    // ── end-to-end scenarios, driven tick by tick ───────────────

    #[test]
    fn test_steady_state_flat_cadence() {
        let core = test_core("1080i5000");
        core.timecode.set_timecode(FrameTimecode::new(1000, 25));
        let samples = load_recorder(&core, 0);
        let stamps = Arc::new(Mutex::new(Vec::new()));
        core.output.add(
            1,
            Box::new(StampCollector {
                stamps: stamps.clone(),
            }),
        );

        for _ in 0..1000 {
            core.tick().unwrap();
        }

        let total: usize = samples.lock().unwrap().iter().sum();
        assert_eq!(total, 1_920_000);

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 1000);
        let delta = stamps.last().unwrap().total_frames() - stamps.first().unwrap().total_frames();
        assert_eq!(delta, 999);
    }

    #[test]
    fn test_mixed_cadence_rotation() {
        let core = test_core("1080i5994");
        let samples = load_recorder(&core, 0);
        let cadence = core.video_format_desc().audio_cadence.clone();

        for _ in 0..500 {
            core.tick().unwrap();
        }

        let samples = samples.lock().unwrap();
        let total: usize = samples.iter().sum();
        // 100 full cadence periods
        assert_eq!(total, 100 * cadence.iter().sum::<usize>());

        // The rotation visits each cadence element exactly 100 times
        for &element in &cadence {
            let expected = cadence.iter().filter(|&&c| c == element).count() * 100;
            let observed = samples.iter().filter(|&&s| s == element).count();
            assert_eq!(observed, expected, "element {} visited {} times", element, observed);
        }
    }

    #[test]
    fn test_cadence_conservation_over_any_window() {
        let core = test_core("1080i5994");
        let samples = load_recorder(&core, 0);
        let cadence = core.video_format_desc().audio_cadence.clone();
        let period_sum: usize = cadence.iter().sum();

        for _ in 0..cadence.len() * 7 {
            core.tick().unwrap();
        }

        let samples = samples.lock().unwrap();
        for window in samples.chunks(cadence.len()) {
            assert_eq!(window.iter().sum::<usize>(), period_sum);
        }
    }

    #[test]
    fn test_listener_called_while_registered() {
        let core = test_core("1080i5000");
        let count = Arc::new(AtomicU64::new(0));
        let last_stamp = Arc::new(Mutex::new(FrameTimecode::empty()));

        let handle = {
            let count = count.clone();
            let last_stamp = last_stamp.clone();
            core.add_timecode_listener(Arc::new(move |tc: FrameTimecode, _graph: &Arc<Graph>| {
                count.fetch_add(1, Ordering::Relaxed);
                *last_stamp.lock().unwrap() = tc;
            }))
        };

        for _ in 0..10 {
            core.tick().unwrap();
        }
        let tenth_stamp = core.timecode.timecode();
        drop(handle);
        for _ in 0..10 {
            core.tick().unwrap();
        }

        assert_eq!(count.load(Ordering::Relaxed), 10);
        assert_eq!(*last_stamp.lock().unwrap(), tenth_stamp);
    }

    #[test]
    fn test_listener_sees_finalized_stamp() {
        let core = test_core("1080i5000");
        let observed = Arc::new(Mutex::new(Vec::new()));

        let _handle = {
            let observed = observed.clone();
            core.add_timecode_listener(Arc::new(move |tc: FrameTimecode, _: &Arc<Graph>| {
                observed.lock().unwrap().push(tc);
            }))
        };

        core.tick().unwrap();
        assert_eq!(observed.lock().unwrap()[0], core.timecode.timecode());
    }

    #[test]
    fn test_panicking_listener_isolated() {
        let core = test_core("1080i5000");
        let count = Arc::new(AtomicU64::new(0));

        let _bad = core.add_timecode_listener(Arc::new(
            |_: FrameTimecode, _: &Arc<Graph>| panic!("listener bug"),
        ));
        let _good = {
            let count = count.clone();
            core.add_timecode_listener(Arc::new(move |_: FrameTimecode, _: &Arc<Graph>| {
                count.fetch_add(1, Ordering::Relaxed);
            }))
        };

        for _ in 0..3 {
            core.tick().unwrap();
        }
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_format_change_switches_cadence_and_clears_stage() {
        let core = test_core("1080i5000");
        let samples = load_recorder(&core, 0);

        for _ in 0..50 {
            core.tick().unwrap();
        }
        core.set_video_format_desc(&VideoFormat::from_name("1080i5994").unwrap());
        core.tick().unwrap();

        // Stage was cleared: the old producer saw exactly the 50 old ticks
        let samples = samples.lock().unwrap();
        assert_eq!(samples.len(), 50);
        assert!(samples.iter().all(|&s| s == 1920));

        // New producers see the new cadence
        drop(samples);
        let new_samples = load_recorder(&core, 0);
        core.tick().unwrap();
        let head = new_samples.lock().unwrap()[0];
        assert!(head == 1601 || head == 1602);

        assert_eq!(core.timecode.timecode().fps(), 30);
    }

    #[test]
    fn test_flaky_consumer_keeps_channel_running() {
        let core = test_core("1080i5000");
        core.timecode.set_timecode(FrameTimecode::new(1000, 25));
        load_recorder(&core, 0);
        let stamps = Arc::new(Mutex::new(Vec::new()));
        core.output.add(1, Box::new(EveryOtherTickFails { calls: 0 }));
        core.output.add(
            2,
            Box::new(StampCollector {
                stamps: stamps.clone(),
            }),
        );

        for _ in 0..20 {
            core.tick().unwrap();
        }

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 20);
        for pair in stamps.windows(2) {
            assert_eq!(pair[1].total_frames(), pair[0].total_frames() + 1);
        }
    }

    #[test]
    fn test_whole_channel_route_gets_composite() {
        let core = test_core("1080i5000");
        for layer in [10, 20, 30] {
            load_recorder(&core, layer);
        }

        let route = core.route(-1);
        let rx = route.subscribe();

        for _ in 0..5 {
            core.tick().unwrap();
        }

        let signals: Vec<DrawFrame> = rx.try_iter().collect();
        assert_eq!(signals.len(), 5);
        for signal in &signals {
            assert_eq!(signal.frame_count(), 3);
        }
    }

    #[test]
    fn test_per_layer_route_delivery() {
        let core = test_core("1080i5000");
        load_recorder(&core, 10);
        load_recorder(&core, 20);

        let route = core.route(10);
        let rx = route.subscribe();

        core.tick().unwrap();
        core.tick().unwrap();

        // Exactly one signal per tick, for the routed layer only
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn test_route_liveness() {
        let core = test_core("1080i5000");

        // No holder: each call creates a fresh route
        let first = Arc::downgrade(&core.route(5));
        let second = core.route(5);
        assert!(first.upgrade().map(|f| !Arc::ptr_eq(&f, &second)).unwrap_or(true));

        // Held: the same route comes back
        let third = core.route(5);
        assert!(Arc::ptr_eq(&second, &third));
    }

    #[test]
    fn test_route_names() {
        let core = test_core("1080i5000");
        assert_eq!(core.route(-1).name(), "1");
        assert_eq!(core.route(7).name(), "1/7");
    }

    #[test]
    fn test_dead_route_skipped_during_fanout() {
        let core = test_core("1080i5000");
        load_recorder(&core, 0);

        drop(core.route(0));
        // Entry is dead; fan-out skips it without error
        core.tick().unwrap();
    }

    #[test]
    fn test_telemetry_keys_present() {
        let core = test_core("1080i5000");
        load_recorder(&core, 0);
        core.output.add(
            1,
            Box::new(StampCollector {
                stamps: Arc::new(Mutex::new(Vec::new())),
            }),
        );

        core.tick().unwrap();

        let state = core.state.lock().unwrap();
        for key in ["stage", "mixer", "output", "timecode", "timecode/source"] {
            assert!(state.contains_key(key), "missing telemetry key {}", key);
        }
    }

    #[test]
    fn test_timing_telemetry_non_negative() {
        let core = test_core("1080i5000");
        load_recorder(&core, 0);
        core.tick().unwrap();

        for series in ["produce-time", "mix-time", "consume-time", "osc-time"] {
            let value = core.graph.value(series).unwrap();
            assert!(value >= 0.0, "{} is negative: {}", series, value);
        }
    }

    #[test]
    fn test_phase_ordering() {
        struct OrderProbe {
            events: Arc<Mutex<Vec<&'static str>>>,
        }

        impl Producer for OrderProbe {
            fn receive(&mut self, _f: &VideoFormat, nb: usize) -> Result<DrawFrame> {
                self.events.lock().unwrap().push("produce");
                Ok(DrawFrame::from_frame(Frame::new(
                    Bytes::from_static(&[1u8]),
                    vec![0; nb],
                    1,
                    1,
                )))
            }
            fn name(&self) -> String {
                "probe".to_string()
            }
        }

        struct OrderCompositor {
            events: Arc<Mutex<Vec<&'static str>>>,
        }

        impl FrameFactory for OrderCompositor {
            fn alloc_frame(&self, w: u32, h: u32) -> Frame {
                Frame::new(Bytes::new(), Vec::new(), w, h)
            }
        }

        impl ImageMixer for OrderCompositor {
            fn composite(
                &self,
                _layers: &BTreeMap<i32, DrawFrame>,
                _format: &VideoFormat,
            ) -> Result<Bytes> {
                self.events.lock().unwrap().push("mix");
                Ok(Bytes::new())
            }
        }

        struct OrderConsumer {
            events: Arc<Mutex<Vec<&'static str>>>,
        }

        impl Consumer for OrderConsumer {
            fn send(
                &mut self,
                _tc: FrameTimecode,
                _frame: &crate::frame::MixedFrame,
                _f: &VideoFormat,
            ) -> Result<()> {
                self.events.lock().unwrap().push("consume");
                Ok(())
            }
            fn name(&self) -> String {
                "order".to_string()
            }
        }

        let events = Arc::new(Mutex::new(Vec::new()));
        let core = ChannelCore::new(
            1,
            VideoFormat::from_name("1080i5000").unwrap(),
            Arc::new(OrderCompositor {
                events: events.clone(),
            }),
            Box::new(|_| {}),
        );
        core.stage.load(
            0,
            Box::new(OrderProbe {
                events: events.clone(),
            }),
            false,
        );
        core.stage.play(0);
        core.output.add(
            1,
            Box::new(OrderConsumer {
                events: events.clone(),
            }),
        );

        core.tick().unwrap();
        core.tick().unwrap();

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec!["produce", "mix", "consume", "produce", "mix", "consume"]
        );
    }

    #[test]
    fn test_failing_tick_does_not_consume_a_stamp() {
        struct FailsOnce {
            failed: bool,
        }

        impl Producer for FailsOnce {
            fn receive(&mut self, _f: &VideoFormat, nb: usize) -> Result<DrawFrame> {
                if !self.failed {
                    self.failed = true;
                    return Err(anyhow!("first frame unavailable"));
                }
                Ok(DrawFrame::from_frame(Frame::new(
                    Bytes::from_static(&[1u8]),
                    vec![0; nb],
                    1,
                    1,
                )))
            }
            fn name(&self) -> String {
                "fails-once".to_string()
            }
        }

        let core = test_core("1080i5000");
        core.timecode.set_timecode(FrameTimecode::new(1000, 25));
        core.tick().unwrap();
        let before = core.timecode.timecode();

        core.stage.load(0, Box::new(FailsOnce { failed: false }), false);
        core.stage.play(0);

        assert!(core.tick().is_err());
        core.tick().unwrap();

        // The failed tick aborted before finalize; the stamp advanced once
        let after = core.timecode.timecode();
        assert_eq!(after.total_frames(), before.total_frames() + 1);
    }

    #[test]
    fn test_mixer_receives_cadence_baseline() {
        // The stage sees the rotated head; the mixer always gets the
        // baseline element, so the mixed audio length is constant
        let core = test_core("1080i5994");
        load_recorder(&core, 0);
        let audio_lens = Arc::new(Mutex::new(Vec::new()));

        struct AudioLenProbe {
            lens: Arc<Mutex<Vec<usize>>>,
        }

        impl Consumer for AudioLenProbe {
            fn send(
                &mut self,
                _tc: FrameTimecode,
                frame: &crate::frame::MixedFrame,
                _f: &VideoFormat,
            ) -> Result<()> {
                self.lens.lock().unwrap().push(frame.audio.len());
                Ok(())
            }
            fn name(&self) -> String {
                "audio-len".to_string()
            }
        }

        core.output.add(
            1,
            Box::new(AudioLenProbe {
                lens: audio_lens.clone(),
            }),
        );

        for _ in 0..10 {
            core.tick().unwrap();
        }

        let baseline = core.video_format_desc().audio_cadence[0];
        let channels = core.video_format_desc().audio_channels as usize;
        let lens = audio_lens.lock().unwrap();
        assert!(lens.iter().all(|&l| l == baseline * channels));
    }

    #[test]
    fn test_tick_callback_gets_full_state() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let core = {
            let seen = seen.clone();
            ChannelCore::new(
                1,
                VideoFormat::from_name("1080i5000").unwrap(),
                Arc::new(StubCompositor),
                Box::new(move |state: &State| {
                    seen.lock().unwrap().push(state.clone());
                }),
            )
        };
        load_recorder(&core, 0);

        core.tick().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains_key("timecode"));
        assert!(seen[0].contains_key("stage"));
    }

    // ── threaded channel lifecycle ──────────────────────────────

    struct PacingConsumer;

    impl Consumer for PacingConsumer {
        fn send(
            &mut self,
            _tc: FrameTimecode,
            _frame: &crate::frame::MixedFrame,
            _f: &VideoFormat,
        ) -> Result<()> {
            std::thread::sleep(Duration::from_millis(1));
            Ok(())
        }
        fn name(&self) -> String {
            "pacing".to_string()
        }
    }

    #[test]
    fn test_channel_runs_and_shuts_down_cleanly() {
        let _ = env_logger::builder().is_test(true).try_init();

        let ticks = Arc::new(AtomicU64::new(0));
        let channel = {
            let ticks = ticks.clone();
            Channel::new(
                7,
                VideoFormat::from_name("1080i5000").unwrap(),
                Arc::new(StubCompositor),
                move |_state| {
                    ticks.fetch_add(1, Ordering::Relaxed);
                },
            )
        };
        channel.output().add(1, Box::new(PacingConsumer));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(channel.index(), 7);
        drop(channel);

        let after_shutdown = ticks.load(Ordering::Relaxed);
        assert!(after_shutdown > 0);
        std::thread::sleep(Duration::from_millis(20));
        // Worker is joined: no more ticks after drop
        assert_eq!(ticks.load(Ordering::Relaxed), after_shutdown);
    }

    #[test]
    fn test_accessors() {
        let channel = Channel::new(
            3,
            VideoFormat::from_name("1080p2500").unwrap(),
            Arc::new(StubCompositor),
            |_| {},
        );

        assert_eq!(channel.video_format_desc().name, "1080p2500");
        assert_eq!(channel.timecode().source_name(), "free");
        let frame = channel.frame_factory().alloc_frame(16, 9);
        assert_eq!((frame.width, frame.height), (16, 9));
    }
}
