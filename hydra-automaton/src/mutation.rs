//! Mutation requests, responses and the per-apply mutation context.

use crate::error::{AutomatonError, Result};
use bytes::Bytes;
use hydra_core::{MutationHeader, MutationId, MutationRecord, Version};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

/// A request to mutate automaton state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRequest {
    /// Handler key of the mutation.
    pub mutation_type: String,
    /// Opaque payload interpreted by the handler.
    pub data: Bytes,
    /// Client-supplied id enabling response deduplication.
    pub id: Option<MutationId>,
}

impl MutationRequest {
    /// Create a request without an id.
    pub fn new(mutation_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            mutation_type: mutation_type.into(),
            data: data.into(),
            id: None,
        }
    }

    /// Create a request whose payload is the JSON encoding of `value`.
    pub fn json<T: Serialize>(mutation_type: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::new(mutation_type, serde_json::to_vec(value)?))
    }

    /// Attach a mutation id.
    pub fn with_id(mut self, id: MutationId) -> Self {
        self.id = Some(id);
        self
    }

    pub(crate) fn from_record(record: MutationRecord) -> (Self, u64, u64) {
        let MutationRecord { header, data } = record;
        (
            Self {
                mutation_type: header.mutation_type,
                data,
                id: header.mutation_id,
            },
            header.timestamp_ms,
            header.random_seed,
        )
    }

    pub(crate) fn to_record(&self, timestamp_ms: u64, random_seed: u64) -> MutationRecord {
        MutationRecord::new(
            MutationHeader::new(
                self.mutation_type.clone(),
                self.id,
                timestamp_ms,
                random_seed,
            ),
            self.data.clone(),
        )
    }
}

/// The result of applying a mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationResponse {
    /// Response payload produced by the handler.
    pub data: Bytes,
    /// True when the response came from the response keeper instead of a
    /// fresh execution.
    pub kept: bool,
}

impl MutationResponse {
    /// Create a fresh response.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            kept: false,
        }
    }

    /// Create a response replayed from the response keeper.
    pub fn kept(data: Bytes) -> Self {
        Self { data, kept: true }
    }

    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Receiver side of a commit promise.
pub type CommitReceiver = oneshot::Receiver<Result<MutationResponse>>;

/// Wait for a commit promise.
///
/// A promise dropped without being resolved, e.g. because the peer stopped,
/// yields [`AutomatonError::Cancelled`].
pub async fn await_commit(commit: CommitReceiver) -> Result<MutationResponse> {
    commit
        .await
        .map_err(|_| AutomatonError::cancelled("mutation was abandoned before commit"))?
}

type CommitSlot = Mutex<Option<oneshot::Sender<Result<MutationResponse>>>>;

/// Sender side of a commit promise. The first resolution wins; dropping the
/// last strong handle unresolved cancels the receiver.
#[derive(Debug)]
pub(crate) struct CommitPromise(Arc<CommitSlot>);

impl CommitPromise {
    pub fn new() -> (Self, CommitReceiver) {
        let (sender, receiver) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(sender)))), receiver)
    }

    pub fn resolve(&self, result: Result<MutationResponse>) {
        if let Some(sender) = self.0.lock().take() {
            let _ = sender.send(result);
        }
    }

    /// A handle that can still fail the promise while it is alive elsewhere,
    /// without keeping it alive.
    pub fn observer(&self) -> CommitObserver {
        CommitObserver(Arc::downgrade(&self.0))
    }
}

/// Weak handle to a [`CommitPromise`].
#[derive(Debug, Clone)]
pub(crate) struct CommitObserver(Weak<CommitSlot>);

impl CommitObserver {
    pub fn fail(&self, err: AutomatonError) {
        let Some(slot) = self.0.upgrade() else {
            return;
        };
        if let Some(sender) = slot.lock().take() {
            let _ = sender.send(Err(err));
        }
    }
}

/// A logged mutation waiting for its commit.
#[derive(Debug)]
pub(crate) struct PendingMutation {
    pub version: Version,
    pub request: MutationRequest,
    pub timestamp_ms: u64,
    pub random_seed: u64,
    pub commit_promise: Option<CommitPromise>,
}

/// State visible to a mutation handler while one mutation is applied.
///
/// Timestamp and random seed were captured when the mutation was logged, so
/// handlers must use them instead of reading the clock or an ambient RNG.
#[derive(Debug)]
pub struct MutationContext {
    version: Version,
    request: MutationRequest,
    timestamp_ms: u64,
    random_seed: u64,
    response: MutationResponse,
    suppressed: bool,
}

impl MutationContext {
    /// Create a context for applying `request` at `version`.
    pub fn new(
        version: Version,
        request: MutationRequest,
        timestamp_ms: u64,
        random_seed: u64,
    ) -> Self {
        Self {
            version,
            request,
            timestamp_ms,
            random_seed,
            response: MutationResponse::default(),
            suppressed: false,
        }
    }

    /// Version at which the mutation is applied.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The request being applied.
    pub fn request(&self) -> &MutationRequest {
        &self.request
    }

    /// Handler key of the mutation.
    pub fn mutation_type(&self) -> &str {
        &self.request.mutation_type
    }

    /// Client-supplied id, if any.
    pub fn mutation_id(&self) -> Option<MutationId> {
        self.request.id
    }

    /// Decode the request payload as JSON.
    pub fn request_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.request.data).map_err(|e| {
            AutomatonError::Serialization(format!(
                "invalid payload for '{}': {}",
                self.request.mutation_type, e
            ))
        })
    }

    /// Log-time timestamp (Unix epoch milliseconds).
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// Log-time random seed.
    pub fn random_seed(&self) -> u64 {
        self.random_seed
    }

    /// A generator seeded from the log-time seed, identical on every replica.
    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.random_seed)
    }

    /// Set the response payload.
    pub fn set_response(&mut self, data: impl Into<Bytes>) {
        self.response = MutationResponse::new(data);
    }

    /// Set the response payload to the JSON encoding of `value`.
    pub fn set_response_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        self.set_response(serde_json::to_vec(value)?);
        Ok(())
    }

    /// The response produced so far.
    pub fn response(&self) -> &MutationResponse {
        &self.response
    }

    pub(crate) fn set_kept_response(&mut self, data: Bytes) {
        self.response = MutationResponse::kept(data);
    }

    pub(crate) fn into_response(self) -> MutationResponse {
        self.response
    }

    /// Prevent the response of this mutation from being kept.
    pub fn suppress_mutation(&mut self) {
        self.suppressed = true;
    }

    /// Whether [`MutationContext::suppress_mutation`] was called.
    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Put {
        key: String,
    }

    #[tokio::test]
    async fn first_commit_resolution_wins() {
        let (promise, receiver) = CommitPromise::new();
        let observer = promise.observer();

        observer.fail(AutomatonError::cancelled("log failed"));
        promise.resolve(Ok(MutationResponse::default()));
        assert_eq!(await_commit(receiver).await.unwrap_err().code(), "H504");
    }

    #[tokio::test]
    async fn observer_does_not_keep_promise_alive() {
        let (promise, receiver) = CommitPromise::new();
        let observer = promise.observer();
        drop(promise);

        observer.fail(AutomatonError::part("too late"));
        let err = await_commit(receiver).await.unwrap_err();
        assert_eq!(err.code(), "H504");
    }

    #[test]
    fn request_record_conversion() {
        let id = MutationId::new();
        let request = MutationRequest::new("Put", Bytes::from_static(b"abc")).with_id(id);
        let record = request.to_record(1_000, 99);
        assert_eq!(record.header.mutation_id, Some(id));

        let (restored, ts, seed) = MutationRequest::from_record(record);
        assert_eq!(restored, request);
        assert_eq!(ts, 1_000);
        assert_eq!(seed, 99);
    }

    #[test]
    fn context_json_payloads() {
        let request = MutationRequest::json(
            "Put",
            &Put {
                key: "a".to_string(),
            },
        )
        .unwrap();
        let mut context = MutationContext::new(Version::new(1, 0), request, 5, 6);

        let put: Put = context.request_json().unwrap();
        assert_eq!(put.key, "a");

        context.set_response_json(&42u32).unwrap();
        assert_eq!(context.response().json::<u32>().unwrap(), 42);
        assert!(!context.response().kept);
    }

    #[test]
    fn context_rng_is_deterministic() {
        let request = MutationRequest::new("Roll", Bytes::new());
        let a = MutationContext::new(Version::new(1, 0), request.clone(), 0, 77);
        let b = MutationContext::new(Version::new(1, 0), request, 0, 77);
        assert_eq!(a.rng().r#gen::<u64>(), b.rng().r#gen::<u64>());
    }

    #[test]
    fn suppression() {
        let mut context =
            MutationContext::new(Version::default(), MutationRequest::new("X", Bytes::new()), 0, 0);
        assert!(!context.is_suppressed());
        context.suppress_mutation();
        assert!(context.is_suppressed());
    }
}
