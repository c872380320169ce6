//! In-process backend driven by explicit ticks.
//!
//! Nothing here touches real hardware: a test (or the soak simulator) calls
//! [`MockStreamHandle::tick`] to play the role of the device clock.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{OutputBackend, OutputStream, SharingMode, StreamRequest};
use crate::{
    engine::CallbackEngine,
    error::{PlayoutError, Result},
};

/// Largest hardware buffer a mock stream grants, in bursts.
const MAX_BUFFER_BURSTS: usize = 16;

/// Smallest callback period a burst-sized mock stream accepts.
const MIN_BURST_FRAMES: usize = 16;

pub struct MockBackend {
    burst_frames: usize,
    sharing: SharingMode,
    fail_open: bool,
    buffer_is_burst: bool,
    streams: Mutex<Vec<MockStreamHandle>>,
}

impl MockBackend {
    /// Backend whose streams report `burst_frames` per callback.
    pub fn new(burst_frames: usize) -> Self {
        Self {
            burst_frames: burst_frames.max(1),
            sharing: SharingMode::Exclusive,
            fail_open: false,
            buffer_is_burst: false,
            streams: Mutex::new(Vec::new()),
        }
    }

    /// Grant only shared access, as a busy device would.
    pub fn shared_only(mut self) -> Self {
        self.sharing = SharingMode::Shared;
        self
    }

    /// Behave like cpal: the buffer size is the callback period, so a
    /// resize changes the burst too.
    pub fn burst_sized_buffer(mut self) -> Self {
        self.buffer_is_burst = true;
        self
    }

    /// Make every `open` fail with `StreamOpen`.
    pub fn failing(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Handle to the most recently opened stream.
    pub fn last_stream(&self) -> Option<MockStreamHandle> {
        self.streams.lock().last().cloned()
    }

    pub fn streams(&self) -> Vec<MockStreamHandle> {
        self.streams.lock().clone()
    }
}

impl OutputBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn open(
        &self,
        request: &StreamRequest,
        engine: Arc<CallbackEngine>,
    ) -> Result<Box<dyn OutputStream>> {
        if self.fail_open {
            return Err(PlayoutError::StreamOpen("mock backend refused to open".into()));
        }
        let sharing = match request.sharing {
            SharingMode::Exclusive => self.sharing,
            SharingMode::Shared => SharingMode::Shared,
        };
        let buffer_size_frames = if self.buffer_is_burst {
            self.burst_frames
        } else {
            self.burst_frames * 2
        };
        let shared = Arc::new(MockShared {
            max_buffer_frames: self.burst_frames * MAX_BUFFER_BURSTS,
            buffer_is_burst: self.buffer_is_burst,
            sample_rate: request.sample_rate,
            channels: request.channels,
            sharing,
            state: Mutex::new(MockState {
                engine: Some(engine),
                running: false,
                closed: false,
                burst_frames: self.burst_frames,
                buffer_size_frames,
                render_buf: vec![0.0; self.burst_frames * request.channels],
            }),
        });
        self.streams.lock().push(MockStreamHandle {
            shared: Arc::clone(&shared),
        });
        Ok(Box::new(MockStream { shared }))
    }
}

struct MockShared {
    max_buffer_frames: usize,
    buffer_is_burst: bool,
    sample_rate: u32,
    channels: usize,
    sharing: SharingMode,
    state: Mutex<MockState>,
}

struct MockState {
    /// Released on close.
    engine: Option<Arc<CallbackEngine>>,
    running: bool,
    closed: bool,
    burst_frames: usize,
    buffer_size_frames: usize,
    render_buf: Vec<f32>,
}

/// Test-side view of a mock stream.
#[derive(Clone)]
pub struct MockStreamHandle {
    shared: Arc<MockShared>,
}

impl MockStreamHandle {
    /// Run one device callback. Returns the rendered burst, or `None` while
    /// the stream is stopped or closed.
    pub fn tick(&self) -> Option<Vec<f32>> {
        let mut state = self.shared.state.lock();
        if !state.running {
            return None;
        }
        let engine = state.engine.clone()?;
        engine.on_audio_ready(&mut state.render_buf);
        Some(state.render_buf.clone())
    }

    /// Run `n` callbacks and return how many actually rendered.
    pub fn tick_n(&self, n: usize) -> usize {
        (0..n).filter(|_| self.tick().is_some()).count()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn burst_frames(&self) -> usize {
        self.shared.state.lock().burst_frames
    }
}

struct MockStream {
    shared: Arc<MockShared>,
}

impl MockStream {
    fn ensure_open(state: &MockState) -> Result<()> {
        if state.closed {
            return Err(PlayoutError::Backend("mock stream is closed".into()));
        }
        Ok(())
    }
}

impl OutputStream for MockStream {
    fn start(&mut self) -> Result<()> {
        let mut state = self.shared.state.lock();
        Self::ensure_open(&state)?;
        state.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.shared.state.lock();
        Self::ensure_open(&state)?;
        state.running = false;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.running = false;
        state.closed = true;
        state.engine = None;
        Ok(())
    }

    fn frames_per_burst(&self) -> usize {
        self.shared.state.lock().burst_frames
    }

    fn buffer_size_frames(&self) -> usize {
        self.shared.state.lock().buffer_size_frames
    }

    fn set_buffer_size_frames(&mut self, frames: usize) -> Result<usize> {
        let mut state = self.shared.state.lock();
        Self::ensure_open(&state)?;
        let max = self.shared.max_buffer_frames;
        if self.shared.buffer_is_burst {
            let granted = frames.clamp(MIN_BURST_FRAMES.min(max), max);
            state.burst_frames = granted;
            state.buffer_size_frames = granted;
            state.render_buf = vec![0.0; granted * self.shared.channels];
        } else {
            let burst = state.burst_frames;
            state.buffer_size_frames = frames.clamp(burst, max);
        }
        Ok(state.buffer_size_frames)
    }

    fn buffer_is_burst(&self) -> bool {
        self.shared.buffer_is_burst
    }

    fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    fn channels(&self) -> usize {
        self.shared.channels
    }

    fn sharing(&self) -> SharingMode {
        self.shared.sharing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::priority,
        clock::ManualClock,
        engine::EngineConfig,
    };

    fn engine() -> Arc<CallbackEngine> {
        Arc::new(
            CallbackEngine::new(
                EngineConfig {
                    channels: 1,
                    elevator: priority::no_elevation,
                    ..EngineConfig::default()
                },
                Arc::new(ManualClock::new(0)),
            )
            .unwrap(),
        )
    }

    #[test]
    fn ticks_render_only_while_running() {
        let backend = MockBackend::new(4);
        let engine = engine();
        let mut stream = backend
            .open(&StreamRequest::low_latency_output(48_000, 1), Arc::clone(&engine))
            .unwrap();
        let handle = backend.last_stream().unwrap();

        engine.submit(&[0.5; 4]);
        assert!(handle.tick().is_none());

        stream.start().unwrap();
        assert_eq!(handle.tick().unwrap(), vec![0.5; 4]);
        assert_eq!(handle.tick().unwrap(), vec![0.0; 4]);

        stream.stop().unwrap();
        assert_eq!(handle.tick_n(3), 0);
    }

    #[test]
    fn close_releases_engine_and_rejects_restart() {
        let backend = MockBackend::new(8);
        let engine = engine();
        let mut stream = backend
            .open(&StreamRequest::low_latency_output(48_000, 1), Arc::clone(&engine))
            .unwrap();
        stream.start().unwrap();
        stream.close().unwrap();

        assert_eq!(Arc::strong_count(&engine), 1);
        assert!(backend.last_stream().unwrap().is_closed());
        assert!(stream.start().is_err());
    }

    #[test]
    fn buffer_size_is_clamped_to_device_range() {
        let backend = MockBackend::new(96);
        let mut stream = backend
            .open(&StreamRequest::low_latency_output(48_000, 1), engine())
            .unwrap();
        assert_eq!(stream.buffer_size_frames(), 192);
        assert_eq!(stream.set_buffer_size_frames(10).unwrap(), 96);
        assert_eq!(stream.set_buffer_size_frames(300).unwrap(), 300);
        assert_eq!(stream.set_buffer_size_frames(1 << 20).unwrap(), 96 * 16);
    }

    #[test]
    fn burst_sized_buffer_moves_the_callback_period() {
        let backend = MockBackend::new(256).burst_sized_buffer();
        let engine = engine();
        let mut stream = backend
            .open(&StreamRequest::low_latency_output(48_000, 1), Arc::clone(&engine))
            .unwrap();
        let handle = backend.last_stream().unwrap();
        assert!(stream.buffer_is_burst());
        assert_eq!(stream.buffer_size_frames(), 256);

        assert_eq!(stream.set_buffer_size_frames(128).unwrap(), 128);
        assert_eq!(stream.frames_per_burst(), 128);
        assert_eq!(handle.burst_frames(), 128);
        assert_eq!(stream.set_buffer_size_frames(1).unwrap(), 16);

        stream.start().unwrap();
        assert_eq!(handle.tick().unwrap().len(), 16);
    }

    #[test]
    fn exclusive_request_falls_back_to_shared() {
        let backend = MockBackend::new(64).shared_only();
        let stream = backend
            .open(&StreamRequest::low_latency_output(48_000, 2), engine())
            .unwrap();
        assert_eq!(stream.sharing(), SharingMode::Shared);
    }

    #[test]
    fn failing_backend_reports_stream_open() {
        let backend = MockBackend::new(64).failing();
        let result = backend.open(&StreamRequest::low_latency_output(48_000, 1), engine());
        assert!(matches!(result, Err(PlayoutError::StreamOpen(_))));
    }
}
