//! Sessions bind one `CallbackEngine` to one hardware output stream.
//!
//! ## Lifecycle
//!
//! ```text
//! StreamSession::open()   → engine built, stream opened, ring sized   (Opened)
//!     └─► start()         → hardware callbacks begin                  (Started)
//!         └─► stop()      → callbacks pause, buffered audio kept      (Stopped)
//!             └─► close() → stream stopped + closed, decoder released (Closed)
//! ```
//!
//! `close()` is idempotent. Every other operation on a closed session
//! returns `PlayoutError::SessionClosed`.
//!
//! Callers on the far side of an API boundary never hold a session
//! directly: [`SessionRegistry`] hands out opaque [`SessionId`]s.

pub mod registry;

pub use registry::SessionRegistry;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    audio::{
        priority::{self, PriorityOutcome},
        OutputBackend, OutputStream, PerformanceMode, StreamRequest,
    },
    buffering::{LatencyAdapter, DEFAULT_BURST_MULTIPLIER, DEFAULT_CAPACITY_FRAMES},
    clock::Clock,
    codec::{DecoderFactory, DecoderSlot},
    engine::{flow::FlowConfig, CallbackEngine, EngineConfig},
    error::{PlayoutError, Result},
    ipc::events::{SessionStatus, SessionStatusEvent, StreamStats},
};

/// Highest channel count a session accepts.
pub const MAX_CHANNELS: usize = 32;

/// Opaque session handle. Never reused within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Everything needed to open one output session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SessionConfig {
    /// Requested device rate. Default: 48000.
    pub sample_rate: u32,
    /// Interleaved channels, 1..=32. Default: 2.
    pub channels: usize,
    /// Free-form label for the logical output (e.g. `"left-ear"`).
    pub label: Option<String>,
    /// Ring depth in device bursts. Default: 2.
    pub burst_multiplier: usize,
    /// Ring depth before the device reports its burst. Default: 2048.
    pub initial_capacity_frames: usize,
    /// Also request a hardware buffer of the ring's depth. Default: true.
    pub sync_hardware_buffer: bool,
    /// Attempt real-time scheduling for the render thread. Default: true.
    pub realtime_priority: bool,
    pub performance: PerformanceMode,
    /// Preferred output device name; `None` uses the system default.
    pub device: Option<String>,
    pub flow: FlowConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            label: None,
            burst_multiplier: DEFAULT_BURST_MULTIPLIER,
            initial_capacity_frames: DEFAULT_CAPACITY_FRAMES,
            sync_hardware_buffer: true,
            realtime_priority: true,
            performance: PerformanceMode::LowLatency,
            device: None,
            flow: FlowConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(PlayoutError::invalid(format!(
                "channels must be within 1..={MAX_CHANNELS} (got {})",
                self.channels
            )));
        }
        if self.sample_rate == 0 {
            return Err(PlayoutError::invalid("sample rate must be > 0"));
        }
        if self.burst_multiplier == 0 {
            return Err(PlayoutError::invalid("burst multiplier must be at least 1"));
        }
        if self.initial_capacity_frames == 0 {
            return Err(PlayoutError::invalid("initial capacity must be at least 1 frame"));
        }
        self.flow.validate()
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            capacity_frames: self.initial_capacity_frames,
            channels: self.channels,
            sample_rate: self.sample_rate,
            flow: self.flow.clone(),
            elevator: if self.realtime_priority {
                priority::elevate_current_thread
            } else {
                priority::no_elevation
            },
        }
    }

    fn stream_request(&self) -> StreamRequest {
        StreamRequest {
            performance: self.performance,
            device: self.device.clone(),
            ..StreamRequest::low_latency_output(self.sample_rate, self.channels)
        }
    }
}

/// One engine + one hardware stream + one decoder slot.
pub struct StreamSession {
    id: SessionId,
    config: SessionConfig,
    engine: Arc<CallbackEngine>,
    adapter: Mutex<LatencyAdapter>,
    /// `None` once closed.
    stream: Mutex<Option<Box<dyn OutputStream>>>,
    decoder: Mutex<DecoderSlot>,
    status: Mutex<SessionStatus>,
    closed: AtomicBool,
    status_tx: broadcast::Sender<SessionStatusEvent>,
}

impl StreamSession {
    /// Build the engine, open the hardware stream and size the ring from
    /// the device's burst.
    ///
    /// # Errors
    /// `InvalidConfig` for a bad config; whatever the backend reports if
    /// the stream cannot be opened or sized.
    pub fn open(
        id: SessionId,
        backend: &dyn OutputBackend,
        config: SessionConfig,
        decoders: Arc<dyn DecoderFactory>,
        clock: Arc<dyn Clock>,
        status_tx: broadcast::Sender<SessionStatusEvent>,
    ) -> Result<Self> {
        config.validate()?;

        let engine = Arc::new(CallbackEngine::new(config.engine_config(), clock)?);
        let mut stream = backend.open(&config.stream_request(), Arc::clone(&engine))?;
        let adapter = LatencyAdapter::new(config.burst_multiplier);

        if let Err(e) = Self::size_for_device(&engine, &adapter, stream.as_mut(), &config) {
            if let Err(close_err) = stream.close() {
                warn!(session = %id, "closing half-opened stream failed: {close_err}");
            }
            return Err(e);
        }

        info!(
            session = %id,
            backend = backend.name(),
            label = config.label.as_deref().unwrap_or(""),
            sample_rate = engine.sample_rate(),
            channels = config.channels,
            burst_frames = stream.frames_per_burst(),
            capacity_frames = engine.flow().capacity_frames(),
            sharing = ?stream.sharing(),
            "session opened"
        );

        let session = Self {
            id,
            config,
            engine,
            adapter: Mutex::new(adapter),
            stream: Mutex::new(Some(stream)),
            decoder: Mutex::new(DecoderSlot::new(decoders)),
            status: Mutex::new(SessionStatus::Opened),
            closed: AtomicBool::new(false),
            status_tx,
        };
        session.set_status(SessionStatus::Opened, None);
        Ok(session)
    }

    fn size_for_device(
        engine: &CallbackEngine,
        adapter: &LatencyAdapter,
        stream: &mut dyn OutputStream,
        config: &SessionConfig,
    ) -> Result<()> {
        if stream.channels() != config.channels {
            return Err(PlayoutError::UnsupportedFormat(format!(
                "device granted {} channels, {} requested",
                stream.channels(),
                config.channels
            )));
        }
        engine.set_sample_rate(stream.sample_rate());
        engine.adapt_to_burst(adapter, stream.frames_per_burst())?;

        if config.sync_hardware_buffer && stream.buffer_is_burst() {
            // Matching the ring would hand the whole ring to every callback.
            debug!("hardware buffer is the callback period, leaving it at one burst");
        } else if config.sync_hardware_buffer {
            let wanted = engine.flow().capacity_frames();
            match stream.set_buffer_size_frames(wanted) {
                Ok(granted) if granted != wanted => {
                    info!(wanted, granted, "device adjusted hardware buffer size");
                }
                Ok(_) => {}
                Err(e) => warn!("hardware buffer size request failed (non-fatal): {e}"),
            }
        }
        Ok(())
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<CallbackEngine> {
        &self.engine
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn start(&self) -> Result<()> {
        self.with_stream(|stream| stream.start())?;
        self.set_status(SessionStatus::Started, None);
        info!(session = %self.id, "session started");
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.with_stream(|stream| stream.stop())?;
        self.set_status(SessionStatus::Stopped, None);
        info!(session = %self.id, "session stopped");
        Ok(())
    }

    /// Queue up to `frame_count` frames from `samples`.
    ///
    /// `frame_count` is capped at the number of whole frames in `samples`.
    /// Returns the frames accepted; overrun never fails the call.
    pub fn submit(&self, samples: &[f32], frame_count: usize) -> Result<usize> {
        self.ensure_open()?;
        let channels = self.config.channels;
        let frames = frame_count.min(samples.len() / channels);
        Ok(self.engine.submit(&samples[..frames * channels]))
    }

    /// Decode one packet with the session's decoder and queue the result.
    ///
    /// # Errors
    /// `PlayoutError::Codec` if the packet is malformed; nothing is queued.
    pub fn submit_packet(&self, packet: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        let samples = self.decoder.lock().decode(
            self.engine.sample_rate(),
            self.config.channels,
            packet,
        )?;
        Ok(self.engine.submit(&samples))
    }

    pub fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        self.engine.clear();
        self.decoder.lock().reset();
        Ok(())
    }

    pub fn available_frames(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.engine.available_frames())
    }

    pub fn stats(&self) -> Result<StreamStats> {
        self.ensure_open()?;
        Ok(self.engine.stats())
    }

    /// Request a hardware buffer size; returns what the device granted.
    ///
    /// On backends where the buffer is the callback period the burst moves
    /// with it, and the ring is re-sized to `burst × multiplier`.
    pub fn set_buffer_size(&self, frames: usize) -> Result<usize> {
        if frames == 0 {
            return Err(PlayoutError::invalid("buffer size must be at least 1 frame"));
        }
        let (granted, new_burst) = self.with_stream(|stream| {
            let granted = stream.set_buffer_size_frames(frames)?;
            Ok((granted, stream.buffer_is_burst().then(|| stream.frames_per_burst())))
        })?;
        info!(session = %self.id, requested = frames, granted, "hardware buffer size set");

        if let Some(burst) = new_burst {
            let adapter = self.adapter.lock();
            self.engine.adapt_to_burst(&adapter, burst)?;
        }
        Ok(granted)
    }

    /// Re-size the ring for a new burst size and multiplier.
    ///
    /// Buffered audio is discarded if the capacity changes.
    pub fn reconfigure(&self, burst_frames: usize, multiplier: usize) -> Result<Option<usize>> {
        self.ensure_open()?;
        let mut adapter = self.adapter.lock();
        *adapter = LatencyAdapter::new(multiplier);
        self.engine.adapt_to_burst(&adapter, burst_frames)
    }

    pub fn priority_outcome(&self) -> Option<PriorityOutcome> {
        self.engine.priority_outcome()
    }

    /// Stop and close the hardware stream, then release the decoder.
    ///
    /// Safe to call more than once; only the first call does any work.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let stream = self.stream.lock().take();
        let result = match stream {
            Some(mut stream) => {
                if let Err(e) = stream.stop() {
                    warn!(session = %self.id, "stopping stream before close failed: {e}");
                }
                stream.close()
            }
            None => Ok(()),
        };
        self.decoder.lock().release();

        match &result {
            Ok(()) => self.set_status(SessionStatus::Closed, None),
            Err(e) => self.set_status(SessionStatus::Error, Some(e.to_string())),
        }
        info!(session = %self.id, "session closed");
        result
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PlayoutError::SessionClosed(self.id));
        }
        Ok(())
    }

    fn with_stream<T>(&self, f: impl FnOnce(&mut dyn OutputStream) -> Result<T>) -> Result<T> {
        let mut guard = self.stream.lock();
        let stream = guard
            .as_mut()
            .ok_or(PlayoutError::SessionClosed(self.id))?;
        let result = f(stream.as_mut());
        drop(guard);

        if let Err(e) = &result {
            warn!(session = %self.id, "stream operation failed: {e}");
            self.set_status(SessionStatus::Error, Some(e.to_string()));
        }
        result
    }

    fn set_status(&self, status: SessionStatus, detail: Option<String>) {
        *self.status.lock() = status;
        let _ = self.status_tx.send(SessionStatusEvent {
            session: self.id,
            status,
            detail,
        });
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(session = %self.id, "closing session on drop failed: {e}");
        }
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("channels", &self.config.channels)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{audio::MockBackend, clock::ManualClock, codec::Pcm16Factory};

    fn config() -> SessionConfig {
        SessionConfig {
            realtime_priority: false,
            ..SessionConfig::default()
        }
    }

    fn open(backend: &MockBackend, config: SessionConfig) -> Result<StreamSession> {
        let (status_tx, _) = broadcast::channel(16);
        StreamSession::open(
            SessionId(1),
            backend,
            config,
            Arc::new(Pcm16Factory::default()),
            Arc::new(ManualClock::new(0)),
            status_tx,
        )
    }

    #[test]
    fn session_id_displays_with_prefix() {
        assert_eq!(SessionId(7).to_string(), "session-7");
    }

    #[test]
    fn open_sizes_ring_and_hardware_buffer_from_burst() {
        let backend = MockBackend::new(96);
        let session = open(&backend, config()).unwrap();
        assert_eq!(session.engine().flow().capacity_frames(), 192);
        assert_eq!(session.status(), SessionStatus::Opened);
        assert_eq!(session.stats().unwrap().capacity_frames, 192);
    }

    #[test]
    fn open_rejects_bad_channel_counts() {
        let backend = MockBackend::new(96);
        for channels in [0, 33] {
            let result = open(
                &backend,
                SessionConfig {
                    channels,
                    ..config()
                },
            );
            assert!(matches!(result, Err(PlayoutError::InvalidConfig(_))));
        }
        assert!(backend.last_stream().is_none());
    }

    #[test]
    fn submit_caps_frame_count_to_sample_slice() {
        let backend = MockBackend::new(64);
        let session = open(&backend, config()).unwrap();
        assert_eq!(session.submit(&[0.1; 20], 4).unwrap(), 4);
        assert_eq!(session.submit(&[0.1; 20], 100).unwrap(), 10);
        assert_eq!(session.available_frames().unwrap(), 14);
    }

    #[test]
    fn submit_packet_decodes_pcm16() {
        let backend = MockBackend::new(64);
        let session = open(
            &backend,
            SessionConfig {
                channels: 1,
                ..config()
            },
        )
        .unwrap();
        assert_eq!(session.submit_packet(&[0x00, 0x40, 0x00, 0xc0]).unwrap(), 2);

        session.start().unwrap();
        let out = backend.last_stream().unwrap().tick().unwrap();
        approx::assert_relative_eq!(out[0], 0.5);
        approx::assert_relative_eq!(out[1], -0.5);
    }

    #[test]
    fn malformed_packet_queues_nothing() {
        let backend = MockBackend::new(64);
        let session = open(&backend, config()).unwrap();
        assert!(matches!(
            session.submit_packet(&[1, 2, 3]),
            Err(PlayoutError::Codec(_))
        ));
        assert_eq!(session.available_frames().unwrap(), 0);
    }

    #[test]
    fn close_is_idempotent_and_blocks_further_use() {
        let backend = MockBackend::new(64);
        let session = open(&backend, config()).unwrap();
        session.start().unwrap();
        session.close().unwrap();
        session.close().unwrap();

        assert!(backend.last_stream().unwrap().is_closed());
        assert_eq!(session.status(), SessionStatus::Closed);
        assert!(matches!(
            session.submit(&[0.0; 2], 1),
            Err(PlayoutError::SessionClosed(SessionId(1)))
        ));
        assert!(matches!(session.start(), Err(PlayoutError::SessionClosed(_))));
    }

    #[test]
    fn reconfigure_follows_new_burst() {
        let backend = MockBackend::new(64);
        let session = open(&backend, config()).unwrap();
        assert_eq!(session.reconfigure(64, 4).unwrap(), Some(256));
        assert_eq!(session.reconfigure(64, 4).unwrap(), None);
    }

    #[test]
    fn set_buffer_size_reports_granted_frames() {
        let backend = MockBackend::new(64);
        let session = open(&backend, config()).unwrap();
        assert_eq!(session.set_buffer_size(100).unwrap(), 100);
        assert_eq!(session.set_buffer_size(1).unwrap(), 64);
        assert!(session.set_buffer_size(0).is_err());
    }

    #[test]
    fn burst_sized_backend_keeps_one_burst_per_callback() {
        let backend = MockBackend::new(256).burst_sized_buffer();
        let session = open(&backend, config()).unwrap();
        let handle = backend.last_stream().unwrap();

        assert_eq!(handle.burst_frames(), 256);
        assert_eq!(session.engine().flow().capacity_frames(), 512);

        assert_eq!(session.set_buffer_size(128).unwrap(), 128);
        assert_eq!(handle.burst_frames(), 128);
        assert_eq!(session.engine().flow().capacity_frames(), 256);

        session.start().unwrap();
        session.submit(&[0.25; 2 * 200], 200).unwrap();
        assert_eq!(handle.tick().unwrap().len(), 2 * 128);
        assert_eq!(session.available_frames().unwrap(), 72);
    }

    #[test]
    fn status_changes_are_broadcast() {
        let backend = MockBackend::new(64);
        let (status_tx, mut status_rx) = broadcast::channel(16);
        let session = StreamSession::open(
            SessionId(9),
            &backend,
            config(),
            Arc::new(Pcm16Factory::default()),
            Arc::new(ManualClock::new(0)),
            status_tx,
        )
        .unwrap();
        session.start().unwrap();
        session.stop().unwrap();
        session.close().unwrap();

        let seen: Vec<SessionStatus> = std::iter::from_fn(|| status_rx.try_recv().ok())
            .map(|e| e.status)
            .collect();
        assert_eq!(
            seen,
            [
                SessionStatus::Opened,
                SessionStatus::Started,
                SessionStatus::Stopped,
                SessionStatus::Closed
            ]
        );
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"channels":1,"flow":{"silenceTimeoutMs":250}}"#).unwrap();
        assert_eq!(config.channels, 1);
        assert_eq!(config.sample_rate, 48_000);
        assert_eq!(config.flow.silence_timeout_ms, 250);
        assert_eq!(config.flow.reset_cooldown_ms, 10_000);
    }
}
