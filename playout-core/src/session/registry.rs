//! Opaque-id call surface over many independent sessions.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::warn;

use super::{SessionConfig, SessionId, StreamSession};
use crate::{
    audio::OutputBackend,
    clock::{Clock, MonotonicClock},
    codec::{DecoderFactory, PayloadFormat},
    error::{PlayoutError, Result},
    ipc::events::{SessionStatusEvent, StreamStats},
};

/// Broadcast channel capacity for status events.
const STATUS_BROADCAST_CAP: usize = 64;

/// Maps [`SessionId`]s to sessions sharing one backend and decoder factory.
///
/// `SessionRegistry` is `Send + Sync`; wrap it in an `Arc` to share it.
/// Lookups take a read lock only long enough to clone the session's `Arc`,
/// so a slow operation on one session never blocks another.
pub struct SessionRegistry {
    backend: Arc<dyn OutputBackend>,
    decoders: Arc<dyn DecoderFactory>,
    clock: Arc<dyn Clock>,
    sessions: RwLock<HashMap<SessionId, Arc<StreamSession>>>,
    next_id: AtomicU64,
    status_tx: broadcast::Sender<SessionStatusEvent>,
}

impl SessionRegistry {
    pub fn new(
        backend: Arc<dyn OutputBackend>,
        decoders: Arc<dyn DecoderFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_BROADCAST_CAP);
        Self {
            backend,
            decoders,
            clock,
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            status_tx,
        }
    }

    /// Default payload format (big-endian float32) and a monotonic clock.
    pub fn with_backend(backend: Arc<dyn OutputBackend>) -> Self {
        Self::new(
            backend,
            PayloadFormat::default().factory(),
            Arc::new(MonotonicClock::new()),
        )
    }

    pub fn open(&self, config: SessionConfig) -> Result<SessionId> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = StreamSession::open(
            id,
            self.backend.as_ref(),
            config,
            Arc::clone(&self.decoders),
            Arc::clone(&self.clock),
            self.status_tx.clone(),
        )?;
        self.sessions.write().insert(id, Arc::new(session));
        Ok(id)
    }

    pub fn get(&self, id: SessionId) -> Result<Arc<StreamSession>> {
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(PlayoutError::UnknownSession(id))
    }

    pub fn start(&self, id: SessionId) -> Result<()> {
        self.get(id)?.start()
    }

    pub fn stop(&self, id: SessionId) -> Result<()> {
        self.get(id)?.stop()
    }

    pub fn submit(&self, id: SessionId, samples: &[f32], frame_count: usize) -> Result<usize> {
        self.get(id)?.submit(samples, frame_count)
    }

    pub fn submit_packet(&self, id: SessionId, packet: &[u8]) -> Result<usize> {
        self.get(id)?.submit_packet(packet)
    }

    pub fn available_frames(&self, id: SessionId) -> Result<usize> {
        self.get(id)?.available_frames()
    }

    pub fn stats(&self, id: SessionId) -> Result<StreamStats> {
        self.get(id)?.stats()
    }

    pub fn clear(&self, id: SessionId) -> Result<()> {
        self.get(id)?.clear()
    }

    pub fn set_buffer_size(&self, id: SessionId, frames: usize) -> Result<usize> {
        self.get(id)?.set_buffer_size(frames)
    }

    /// Close and forget one session. The id is never valid again.
    pub fn close(&self, id: SessionId) -> Result<()> {
        let session = self
            .sessions
            .write()
            .remove(&id)
            .ok_or(PlayoutError::UnknownSession(id))?;
        session.close()
    }

    /// Close every session. Keeps going past failures and returns the first.
    pub fn close_all(&self) -> Result<()> {
        let drained: Vec<_> = self.sessions.write().drain().collect();
        let mut first_err = None;
        for (id, session) in drained {
            if let Err(e) = session.close() {
                warn!(session = %id, "close failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Open session ids in ascending order.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to status changes of every session in this registry.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if let Err(e) = self.close_all() {
            warn!("closing sessions on registry drop failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::MockBackend,
        clock::ManualClock,
        codec::{ByteOrder, Pcm16Factory},
        ipc::events::SessionStatus,
    };

    fn registry(backend: Arc<MockBackend>) -> SessionRegistry {
        SessionRegistry::new(
            backend,
            Arc::new(Pcm16Factory::default()),
            Arc::new(ManualClock::new(0)),
        )
    }

    fn config() -> SessionConfig {
        SessionConfig {
            realtime_priority: false,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn ids_are_unique_and_sorted() {
        let registry = registry(Arc::new(MockBackend::new(64)));
        let a = registry.open(config()).unwrap();
        let b = registry.open(config()).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.ids(), vec![a, b]);
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let registry = registry(Arc::new(MockBackend::new(64)));
        let ghost = SessionId(99);
        assert!(matches!(
            registry.submit(ghost, &[0.0; 2], 1),
            Err(PlayoutError::UnknownSession(SessionId(99)))
        ));
        assert!(matches!(registry.stats(ghost), Err(PlayoutError::UnknownSession(_))));
        assert!(matches!(registry.close(ghost), Err(PlayoutError::UnknownSession(_))));
    }

    #[test]
    fn sessions_do_not_share_buffers() {
        let registry = registry(Arc::new(MockBackend::new(64)));
        let a = registry.open(config()).unwrap();
        let b = registry.open(config()).unwrap();

        registry.submit(a, &[0.5; 16], 8).unwrap();
        assert_eq!(registry.available_frames(a).unwrap(), 8);
        assert_eq!(registry.available_frames(b).unwrap(), 0);

        registry.clear(a).unwrap();
        assert_eq!(registry.stats(a).unwrap().resets, 1);
        assert_eq!(registry.stats(b).unwrap().resets, 0);
    }

    #[test]
    fn close_forgets_the_id() {
        let backend = Arc::new(MockBackend::new(64));
        let registry = registry(Arc::clone(&backend));
        let id = registry.open(config()).unwrap();
        registry.start(id).unwrap();
        registry.close(id).unwrap();

        assert!(registry.is_empty());
        assert!(backend.last_stream().unwrap().is_closed());
        assert!(matches!(registry.start(id), Err(PlayoutError::UnknownSession(_))));
    }

    #[test]
    fn close_all_closes_every_stream() {
        let backend = Arc::new(MockBackend::new(64));
        let registry = registry(Arc::clone(&backend));
        for _ in 0..3 {
            registry.open(config()).unwrap();
        }
        registry.close_all().unwrap();
        assert!(registry.is_empty());
        assert!(backend.streams().iter().all(|s| s.is_closed()));
    }

    #[test]
    fn failed_open_registers_nothing() {
        let registry = registry(Arc::new(MockBackend::new(64).failing()));
        assert!(matches!(
            registry.open(config()),
            Err(PlayoutError::StreamOpen(_))
        ));
        assert!(registry.ids().is_empty());
    }

    #[test]
    fn default_registry_accepts_big_endian_float_packets() {
        let registry = SessionRegistry::with_backend(Arc::new(MockBackend::new(64)));
        let id = registry.open(config()).unwrap();
        let packet: Vec<u8> = [0.5f32, -0.5].iter().flat_map(|s| s.to_be_bytes()).collect();
        assert_eq!(registry.submit_packet(id, &packet).unwrap(), 1);
        assert_eq!(registry.available_frames(id).unwrap(), 1);
    }

    #[test]
    fn big_endian_pcm16_factory_is_honoured() {
        let registry = SessionRegistry::new(
            Arc::new(MockBackend::new(64)),
            Arc::new(Pcm16Factory::new(ByteOrder::Big)),
            Arc::new(ManualClock::new(0)),
        );
        let id = registry.open(config()).unwrap();
        assert_eq!(registry.submit_packet(id, &[0x40, 0x00, 0x40, 0x00]).unwrap(), 1);
    }

    #[test]
    fn drop_closes_every_stream() {
        let backend = Arc::new(MockBackend::new(64));
        {
            let registry = registry(Arc::clone(&backend));
            registry.open(config()).unwrap();
            let id = registry.open(config()).unwrap();
            registry.start(id).unwrap();
        }
        let streams = backend.streams();
        assert_eq!(streams.len(), 2);
        assert!(streams.iter().all(|s| s.is_closed()));
    }

    #[test]
    fn status_subscription_sees_every_session() {
        let registry = registry(Arc::new(MockBackend::new(64)));
        let mut rx = registry.subscribe_status();
        let a = registry.open(config()).unwrap();
        let b = registry.open(config()).unwrap();
        registry.start(b).unwrap();

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].session, a);
        assert_eq!(events[2].session, b);
        assert_eq!(events[2].status, SessionStatus::Started);
    }
}
