//! Mutation-id keyed response cache for idempotent retries.
//!
//! Expiry is driven by mutation timestamps, not the local clock, so every
//! replica evicts the same entries at the same log position.

use crate::composite::{AutomatonPart, PartRegistrar};
use crate::config::ResponseKeeperConfig;
use crate::error::{AutomatonError, Result};
use crate::serialize::{LoadContext, SaveContext, SyncSerializationPriority};
use bytes::Bytes;
use hydra_core::MutationId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

/// Snapshot section holding the kept responses.
pub const RESPONSE_KEEPER_SECTION: &str = "hydra.response_keeper";

#[derive(Default)]
struct KeeperState {
    responses: HashMap<MutationId, Bytes>,
    /// Registration order, oldest first.
    expiration_queue: VecDeque<(u64, MutationId)>,
}

/// Cache of responses to already-applied mutations.
pub struct ResponseKeeper {
    expiration_time_ms: u64,
    state: Mutex<KeeperState>,
}

impl ResponseKeeper {
    /// Create a keeper.
    pub fn new(config: &ResponseKeeperConfig) -> Self {
        Self {
            expiration_time_ms: config.expiration_time_ms,
            state: Mutex::new(KeeperState::default()),
        }
    }

    /// Remember the response to mutation `id`, applied at `timestamp_ms`.
    pub fn register_response(&self, id: MutationId, response: Bytes, timestamp_ms: u64) {
        let mut state = self.state.lock();
        Self::evict(&mut state, self.expiration_time_ms, timestamp_ms);
        if state.responses.insert(id, response).is_none() {
            state.expiration_queue.push_back((timestamp_ms, id));
        }
    }

    /// The kept response to mutation `id`, if any.
    pub fn find_response(&self, id: &MutationId) -> Option<Bytes> {
        self.state.lock().responses.get(id).cloned()
    }

    /// Drop every response registered more than the expiration time before
    /// `now_ms`.
    pub fn remove_expired_responses(&self, now_ms: u64) {
        let mut state = self.state.lock();
        Self::evict(&mut state, self.expiration_time_ms, now_ms);
    }

    fn evict(state: &mut KeeperState, expiration_time_ms: u64, now_ms: u64) {
        let mut evicted = 0usize;
        while let Some(&(registered_ms, id)) = state.expiration_queue.front() {
            if registered_ms.saturating_add(expiration_time_ms) >= now_ms {
                break;
            }
            state.expiration_queue.pop_front();
            state.responses.remove(&id);
            evicted += 1;
        }
        if evicted > 0 {
            trace!(evicted, now_ms, "Evicted expired responses");
        }
    }

    /// Number of kept responses.
    pub fn len(&self) -> usize {
        self.state.lock().responses.len()
    }

    /// Whether no responses are kept.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all responses.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.responses.clear();
        state.expiration_queue.clear();
    }

    fn save(&self, context: &mut SaveContext) -> Result<()> {
        let state = self.state.lock();
        context.write_u64(state.expiration_queue.len() as u64)?;
        for (timestamp_ms, id) in &state.expiration_queue {
            let response = state.responses.get(id).cloned().unwrap_or_default();
            context.write_bytes(id.as_bytes())?;
            context.write_u64(*timestamp_ms)?;
            context.write_bytes(&response)?;
        }
        Ok(())
    }

    fn load(&self, context: &mut LoadContext) -> Result<()> {
        let count = context.read_u64()?;
        let mut state = self.state.lock();
        state.responses.clear();
        state.expiration_queue.clear();
        for _ in 0..count {
            let raw = context.read_bytes()?;
            let bytes: [u8; 16] = raw.as_slice().try_into().map_err(|_| {
                AutomatonError::SnapshotFormat {
                    cause: format!("mutation id of {} bytes", raw.len()),
                }
            })?;
            let id = MutationId::from_bytes(bytes);
            let timestamp_ms = context.read_u64()?;
            let response = Bytes::from(context.read_bytes()?);
            if state.responses.insert(id, response).is_none() {
                state.expiration_queue.push_back((timestamp_ms, id));
            }
        }
        Ok(())
    }
}

/// Composite part persisting a [`ResponseKeeper`] in snapshots, so that a
/// replica recovering from a snapshot deduplicates exactly like the replica
/// that wrote it.
pub(crate) struct ResponseKeeperPart {
    keeper: Arc<ResponseKeeper>,
}

impl ResponseKeeperPart {
    pub(crate) fn new(keeper: Arc<ResponseKeeper>) -> Self {
        Self { keeper }
    }
}

impl AutomatonPart for ResponseKeeperPart {
    fn name(&self) -> &str {
        "hydra.response_keeper"
    }

    fn register(self: Arc<Self>, registrar: &mut PartRegistrar<'_>) -> Result<()> {
        let keeper = Arc::clone(&self.keeper);
        registrar.register_saver(
            RESPONSE_KEEPER_SECTION,
            SyncSerializationPriority::Values,
            move |context| keeper.save(context),
        )?;
        let keeper = Arc::clone(&self.keeper);
        registrar.register_loader(RESPONSE_KEEPER_SECTION, move |context| keeper.load(context))
    }

    fn clear(&self) {
        self.keeper.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keeper(expiration_time_ms: u64) -> ResponseKeeper {
        ResponseKeeper::new(&ResponseKeeperConfig { expiration_time_ms })
    }

    #[test]
    fn register_and_find() {
        let keeper = keeper(1_000);
        let id = MutationId::new();
        assert!(keeper.find_response(&id).is_none());

        keeper.register_response(id, Bytes::from_static(b"r"), 10);
        assert_eq!(keeper.find_response(&id), Some(Bytes::from_static(b"r")));
        assert_eq!(keeper.len(), 1);
    }

    #[test]
    fn expiry_follows_mutation_time() {
        let keeper = keeper(1_000);
        let old = MutationId::new();
        let young = MutationId::new();
        keeper.register_response(old, Bytes::from_static(b"old"), 0);
        keeper.register_response(young, Bytes::from_static(b"young"), 500);

        keeper.remove_expired_responses(1_000);
        assert_eq!(keeper.len(), 2);

        keeper.remove_expired_responses(1_001);
        assert!(keeper.find_response(&old).is_none());
        assert!(keeper.find_response(&young).is_some());

        keeper.register_response(MutationId::new(), Bytes::new(), 1_600);
        assert!(keeper.find_response(&young).is_none());
    }

    #[test]
    fn survives_composite_snapshot() {
        use crate::composite::CompositeAutomaton;
        use crate::store::{SnapshotWriter, StoreFuture};
        use std::io::{Cursor, Write};

        struct VecWriter(Arc<Mutex<Vec<u8>>>);

        impl Write for VecWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        impl SnapshotWriter for VecWriter {
            fn stream(&mut self) -> &mut (dyn Write + Send) {
                self
            }

            fn close(self: Box<Self>) -> StoreFuture<'static, ()> {
                Box::pin(async { Ok(()) })
            }
        }

        let keeper = Arc::new(keeper(1_000));
        let mut composite = CompositeAutomaton::new();
        composite
            .register_part(Arc::new(ResponseKeeperPart::new(Arc::clone(&keeper))))
            .unwrap();

        let id = MutationId::new();
        keeper.register_response(id, Bytes::from_static(b"kept"), 40);

        let data = Arc::new(Mutex::new(Vec::new()));
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime
            .block_on(composite.save_snapshot(Box::new(VecWriter(Arc::clone(&data)))))
            .unwrap();

        composite.clear();
        assert!(keeper.is_empty());

        let bytes = data.lock().clone();
        composite.load_snapshot(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(keeper.find_response(&id), Some(Bytes::from_static(b"kept")));

        keeper.remove_expired_responses(1_041);
        assert!(keeper.is_empty());
    }

    #[test]
    fn clear_drops_everything() {
        let keeper = keeper(1_000);
        keeper.register_response(MutationId::new(), Bytes::new(), 0);
        keeper.clear();
        assert!(keeper.is_empty());
    }
}
