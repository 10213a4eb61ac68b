//! Common test utilities for integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use hydra_automaton::serialize::{
    AsyncSerializationPriority, EntitySerializationKey, LoadContext, SaveContext,
    SyncSerializationPriority,
};
use hydra_automaton::{
    AsyncSaveContinuation, AutomatonConfig, AutomatonError, AutomatonPart, CompositeAutomaton,
    DecoratedAutomaton, Invoker, LoggedMutation, MutationRequest, PartRegistrar, Recovery, Result,
};
use hydra_core::providers::{MockClock, MockRng};
use hydra_core::{MutationId, Version};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;

/// Starting point of the mock clock, in milliseconds.
pub const START_MILLIS: u64 = 1_700_000_000_000;

/// Payload of a `Put` mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
}

/// A stored entry. Snapshots write entries once in a `Keys` section and refer
/// to them by entity key from the `Values` section.
#[derive(Debug)]
pub struct Entry {
    pub key: String,
    pub value: Mutex<String>,
}

/// Key/value part with observable side effects.
#[derive(Default)]
pub struct KvPart {
    entries: Mutex<BTreeMap<String, Arc<Entry>>>,
    /// Applied mutation log, persisted through an async saver.
    history: Mutex<Vec<String>>,
    /// Entity keys assigned by the last `Keys` pass.
    save_keys: Mutex<HashMap<String, EntitySerializationKey>>,
    /// Handler invocations, not persisted.
    applied: AtomicU64,
    events: Mutex<Vec<&'static str>>,
}

impl KvPart {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .get(key)
            .map(|entry| entry.value.lock().clone())
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries
            .lock()
            .iter()
            .map(|(k, entry)| (k.clone(), entry.value.lock().clone()))
            .collect()
    }

    pub fn history(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }

    fn put(&self, key: &str, value: String) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) => Some(std::mem::replace(&mut *entry.value.lock(), value)),
            None => {
                entries.insert(
                    key.to_string(),
                    Arc::new(Entry {
                        key: key.to_string(),
                        value: Mutex::new(value),
                    }),
                );
                None
            }
        }
    }

    fn save_keys(&self, context: &mut SaveContext) -> Result<()> {
        let entries = self.entries.lock();
        let mut keys = self.save_keys.lock();
        keys.clear();
        context.write_u64(entries.len() as u64)?;
        for name in entries.keys() {
            let key = context.generate_key();
            context.write_key(key)?;
            context.write_str(name)?;
            keys.insert(name.clone(), key);
        }
        Ok(())
    }

    fn save_values(&self, context: &mut SaveContext) -> Result<()> {
        let entries = self.entries.lock();
        let keys = self.save_keys.lock();
        context.write_u64(entries.len() as u64)?;
        for (name, entry) in entries.iter() {
            let key = keys
                .get(name)
                .copied()
                .ok_or_else(|| AutomatonError::part(format!("no key for entry '{}'", name)))?;
            context.write_key(key)?;
            context.write_str(&entry.value.lock())?;
        }
        Ok(())
    }

    fn load_keys(&self, context: &mut LoadContext) -> Result<()> {
        let count = context.read_u64()?;
        let mut entries = self.entries.lock();
        for _ in 0..count {
            let key = context.read_key()?;
            let name = context.read_string()?;
            let entry = Arc::new(Entry {
                key: name.clone(),
                value: Mutex::new(String::new()),
            });
            context.register_entity(key, Arc::clone(&entry))?;
            entries.insert(name, entry);
        }
        Ok(())
    }

    fn load_values(&self, context: &mut LoadContext) -> Result<()> {
        let count = context.read_u64()?;
        for _ in 0..count {
            let key = context.read_key()?;
            let value = context.read_string()?;
            let entry = context.get_entity::<Entry>(key)?;
            *entry.value.lock() = value;
        }
        Ok(())
    }

    fn capture_history(&self) -> Result<AsyncSaveContinuation> {
        let history = self.history.lock().clone();
        Ok(Box::new(move |context: &mut SaveContext| {
            context.write_json(&history)
        }))
    }

    fn load_history(&self, context: &mut LoadContext) -> Result<()> {
        *self.history.lock() = context.read_json()?;
        Ok(())
    }
}

impl AutomatonPart for KvPart {
    fn name(&self) -> &str {
        "kv"
    }

    fn register(self: Arc<Self>, registrar: &mut PartRegistrar<'_>) -> Result<()> {
        let part = Arc::clone(&self);
        registrar.register_saver("kv.keys", SyncSerializationPriority::Keys, move |ctx| {
            part.save_keys(ctx)
        })?;
        let part = Arc::clone(&self);
        registrar.register_saver("kv.values", SyncSerializationPriority::Values, move |ctx| {
            part.save_values(ctx)
        })?;
        let part = Arc::clone(&self);
        registrar.register_async_saver(
            "kv.history",
            AsyncSerializationPriority::Default,
            move || part.capture_history(),
        )?;

        let part = Arc::clone(&self);
        registrar.register_loader("kv.keys", move |ctx| part.load_keys(ctx))?;
        let part = Arc::clone(&self);
        registrar.register_loader("kv.values", move |ctx| part.load_values(ctx))?;
        let part = Arc::clone(&self);
        registrar.register_loader("kv.history", move |ctx| part.load_history(ctx))?;

        let part = Arc::clone(&self);
        registrar.register_method("Put", move |ctx| {
            part.applied.fetch_add(1, Ordering::SeqCst);
            let request: PutRequest = ctx.request_json()?;
            let previous = part.put(&request.key, request.value.clone());
            part.history
                .lock()
                .push(format!("{}@{}", request.key, ctx.version()));
            ctx.set_response_json(&previous)
        })?;

        let part = Arc::clone(&self);
        registrar.register_method("Delete", move |ctx| {
            part.applied.fetch_add(1, Ordering::SeqCst);
            let key: String = ctx.request_json()?;
            let removed = part.entries.lock().remove(&key).is_some();
            if !removed {
                ctx.suppress_mutation();
            }
            ctx.set_response_json(&removed)
        })?;

        let part = Arc::clone(&self);
        registrar.register_method("Random", move |ctx| {
            part.applied.fetch_add(1, Ordering::SeqCst);
            let key: String = ctx.request_json()?;
            let value = format!("{}:{}", ctx.timestamp_ms(), ctx.rng().r#gen::<u64>());
            part.put(&key, value.clone());
            ctx.set_response_json(&value)
        })?;

        let part = Arc::clone(&self);
        registrar.register_method("Fail", move |_ctx| {
            part.applied.fetch_add(1, Ordering::SeqCst);
            Err(AutomatonError::part("rejected by test handler"))
        })
    }

    fn clear(&self) {
        self.entries.lock().clear();
        self.history.lock().clear();
    }

    fn on_start_leading(&self) {
        self.events.lock().push("start_leading");
    }

    fn on_leader_active(&self) {
        self.events.lock().push("leader_active");
    }

    fn on_stop_leading(&self) {
        self.events.lock().push("stop_leading");
    }

    fn on_start_following(&self) {
        self.events.lock().push("start_following");
    }

    fn on_recovery_started(&self) {
        self.events.lock().push("recovery_started");
    }

    fn on_recovery_complete(&self) {
        self.events.lock().push("recovery_complete");
    }

    fn on_after_snapshot_loaded(&self) {
        self.events.lock().push("snapshot_loaded");
    }
}

/// An automaton over a temporary directory with a pinned clock and seed.
pub struct Harness {
    pub dir: Arc<TempDir>,
    pub kv: Arc<KvPart>,
    pub clock: Arc<MockClock>,
    pub automaton: Arc<DecoratedAutomaton>,
}

impl Harness {
    /// New automaton over a fresh directory.
    pub fn new() -> Self {
        let dir = Arc::new(TempDir::new().unwrap());
        Self::open(dir)
    }

    /// New automaton over an existing directory, as after a restart.
    pub fn open(dir: Arc<TempDir>) -> Self {
        Self::build(dir, None)
    }

    /// New automaton running its tasks through `invoker`.
    pub fn with_invoker(invoker: Arc<dyn Invoker>) -> Self {
        Self::build(Arc::new(TempDir::new().unwrap()), Some(invoker))
    }

    fn build(dir: Arc<TempDir>, invoker: Option<Arc<dyn Invoker>>) -> Self {
        hydra_core::logging::init_test_tracing();
        let kv = KvPart::new();
        let clock = Arc::new(MockClock::at_millis(START_MILLIS));

        let mut composite = CompositeAutomaton::new();
        composite.register_part(kv.clone()).unwrap();

        let mut builder = DecoratedAutomaton::builder(test_config(&dir), composite)
            .clock(clock.clone())
            .rng(Arc::new(MockRng::seeded(7)));
        if let Some(invoker) = invoker {
            builder = builder.invoker(invoker);
        }
        let automaton = builder.build().unwrap();

        Self {
            dir,
            kv,
            clock,
            automaton,
        }
    }

    /// Recover and become the leader.
    pub async fn lead(&self) -> Version {
        self.automaton.start_leading().unwrap();
        let version = Recovery::new(Arc::clone(&self.automaton)).run().await.unwrap();
        self.automaton.leader_recovery_complete().unwrap();
        version
    }

    /// Recover and become a follower.
    pub async fn follow(&self) -> Version {
        self.automaton.start_following().unwrap();
        let version = Recovery::new(Arc::clone(&self.automaton)).run().await.unwrap();
        self.automaton.follower_recovery_complete().unwrap();
        version
    }

    /// Log a `Put` at the leader and wait until it is durable.
    pub async fn put(&self, key: &str, value: &str) -> LoggedMutation {
        self.put_with_id(key, value, None).await
    }

    pub async fn put_with_id(
        &self,
        key: &str,
        value: &str,
        id: Option<MutationId>,
    ) -> LoggedMutation {
        let mut request = put_request(key, value);
        if let Some(id) = id {
            request = request.with_id(id);
        }
        self.log(request).await
    }

    /// Log a request at the leader and wait until it is durable.
    pub async fn log(&self, request: MutationRequest) -> LoggedMutation {
        let mut logged = self.automaton.log_mutation_at_leader(request).unwrap();
        let log_future = std::mem::replace(&mut logged.log_future, Box::pin(async { Ok(()) }));
        log_future.await.unwrap();
        logged
    }

    /// Commit everything logged so far.
    pub fn commit_all(&self) {
        self.automaton
            .commit_mutations(self.automaton.logged_version())
            .unwrap();
    }
}

pub fn test_config(dir: &TempDir) -> AutomatonConfig {
    AutomatonConfig::builder()
        .data_dir(dir.path())
        .sync_on_flush(false)
        .snapshot_timeout_ms(10_000)
        .response_expiration_ms(60_000)
        .build()
}

pub fn put_request(key: &str, value: &str) -> MutationRequest {
    MutationRequest::json(
        "Put",
        &PutRequest {
            key: key.to_string(),
            value: value.to_string(),
        },
    )
    .unwrap()
}

pub fn record_bytes(logged: &LoggedMutation) -> Bytes {
    logged.record.clone()
}
