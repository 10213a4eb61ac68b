//! Decorated automaton: drives the composite automaton through the log.
//!
//! The decorated automaton is the only component that advances the logged
//! and automaton versions and the only caller of
//! [`CompositeAutomaton::apply_mutation`]. Its pipeline operations are meant
//! to be called from one logical thread at a time (typically through a
//! [`SerialInvoker`]); version reads are safe from anywhere.
//!
//! # Versions
//!
//! - *logged version*: position right after the last record appended to the
//!   current changelog by this peer.
//! - *automaton version*: position right after the last record applied to
//!   the in-memory state. Never ahead of the logged version.

mod snapshot_builder;
mod state;

pub use snapshot_builder::RemoteSnapshotParams;
pub use state::PeerState;
pub(crate) use state::PeerStateCell;

use crate::AutomatonFuture;
use crate::composite::{CompositeAutomaton, PartEvent};
use crate::config::AutomatonConfig;
use crate::error::{AutomatonError, Result};
use crate::invoker::{GuardedUserInvoker, Invoker, SerialInvoker, SystemInvoker};
use crate::lock::UserSystemGate;
use crate::metrics::AutomatonMetrics;
use crate::mutation::{
    CommitPromise, CommitReceiver, MutationContext, MutationRequest, MutationResponse,
    PendingMutation,
};
use crate::response_keeper::{ResponseKeeper, ResponseKeeperPart};
use crate::store::{
    Changelog, ChangelogCreateParams, ChangelogStore, FileChangelogStore, FileSnapshotStore,
    SnapshotStore, StoreFuture,
};
use bytes::Bytes;
use futures::future;
use futures::{FutureExt, TryFutureExt};
use hydra_core::providers::{ClockProvider, RealClock, RealRng, RngProvider};
use hydra_core::{HydraError, MutationId, MutationRecord, Version};
use parking_lot::Mutex;
use snapshot_builder::SnapshotPromise;
use std::collections::VecDeque;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default)]
struct Versions {
    logged: Version,
    automaton: Version,
}

struct ScheduledSnapshot {
    version: Version,
    promise: SnapshotPromise,
}

#[derive(Default)]
struct PipelineState {
    pending: VecDeque<PendingMutation>,
    changelog: Option<Arc<dyn Changelog>>,
    scheduled_snapshot: Option<ScheduledSnapshot>,
}

/// A mutation logged at the leader.
pub struct LoggedMutation {
    /// Version the mutation was logged at.
    pub version: Version,
    /// Serialized record, to be replicated to followers.
    pub record: Bytes,
    /// Resolves once the record is durable in the local changelog.
    pub log_future: StoreFuture<'static, ()>,
    /// Resolves with the response once the mutation is committed.
    pub commit: CommitReceiver,
}

impl std::fmt::Debug for LoggedMutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggedMutation")
            .field("version", &self.version)
            .field("record_len", &self.record.len())
            .finish_non_exhaustive()
    }
}

/// Resets the mutation-context flag on drop.
struct ActiveContext<'a>(&'a AtomicBool);

impl Drop for ActiveContext<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Engine driving a [`CompositeAutomaton`] through the mutation log.
pub struct DecoratedAutomaton {
    config: AutomatonConfig,
    composite: Arc<CompositeAutomaton>,
    changelog_store: Arc<dyn ChangelogStore>,
    snapshot_store: Arc<dyn SnapshotStore>,
    clock: Arc<dyn ClockProvider>,
    rng: Arc<dyn RngProvider>,
    metrics: Arc<AutomatonMetrics>,
    response_keeper: Arc<ResponseKeeper>,
    invoker: Arc<dyn Invoker>,
    handle: Handle,
    gate: UserSystemGate,
    peer_state: PeerStateCell,
    versions: Mutex<Versions>,
    state: Mutex<PipelineState>,
    rotation_lock: tokio::sync::Mutex<()>,
    faulted: Mutex<Option<String>>,
    mutation_context_active: AtomicBool,
}

impl DecoratedAutomaton {
    /// Start building a decorated automaton around `composite`.
    pub fn builder(config: AutomatonConfig, composite: CompositeAutomaton) -> DecoratedAutomatonBuilder {
        DecoratedAutomatonBuilder {
            config,
            composite,
            changelog_store: None,
            snapshot_store: None,
            invoker: None,
            clock: None,
            rng: None,
            metrics: None,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The driven composite automaton.
    pub fn composite(&self) -> &Arc<CompositeAutomaton> {
        &self.composite
    }

    /// The configuration.
    pub fn config(&self) -> &AutomatonConfig {
        &self.config
    }

    /// The changelog store.
    pub fn changelog_store(&self) -> &Arc<dyn ChangelogStore> {
        &self.changelog_store
    }

    /// The snapshot store.
    pub fn snapshot_store(&self) -> &Arc<dyn SnapshotStore> {
        &self.snapshot_store
    }

    /// The metrics.
    pub fn metrics(&self) -> &Arc<AutomatonMetrics> {
        &self.metrics
    }

    /// The automaton invoker.
    pub fn invoker(&self) -> &Arc<dyn Invoker> {
        &self.invoker
    }

    /// The user/system gate.
    pub fn gate(&self) -> &UserSystemGate {
        &self.gate
    }

    /// Current peer state.
    pub fn state(&self) -> PeerState {
        self.peer_state.get()
    }

    /// Position right after the last logged record.
    pub fn logged_version(&self) -> Version {
        self.versions.lock().logged
    }

    /// Position right after the last applied record.
    pub fn automaton_version(&self) -> Version {
        self.versions.lock().automaton
    }

    /// Overwrite the logged version.
    pub fn set_logged_version(&self, version: Version) {
        let automaton = {
            let mut versions = self.versions.lock();
            versions.logged = version;
            versions.automaton
        };
        self.metrics.set_versions(version, automaton);
    }

    /// Number of mutations logged but not yet committed.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Size in bytes of the current changelog.
    pub fn logged_data_size(&self) -> Result<u64> {
        let mut state = self.state.lock();
        Ok(self.current_changelog(&mut state)?.data_size())
    }

    /// Whether a fatal error stopped the automaton.
    pub fn is_faulted(&self) -> bool {
        self.faulted.lock().is_some()
    }

    /// Invoker running user work while holding a user slot.
    pub fn create_guarded_user_invoker(&self) -> GuardedUserInvoker {
        GuardedUserInvoker::new(
            Arc::clone(&self.invoker),
            self.gate.clone(),
            self.peer_state.clone(),
        )
    }

    /// Invoker running system work while holding a system slot.
    pub fn system_invoker(&self) -> SystemInvoker {
        SystemInvoker::new(Arc::clone(&self.invoker), self.gate.clone(), self.handle.clone())
    }

    /// Look up a kept response for `id`.
    pub fn find_kept_response(&self, id: &MutationId) -> Option<MutationResponse> {
        self.response_keeper
            .find_response(id)
            .map(MutationResponse::kept)
    }

    // =========================================================================
    // Peer state transitions
    // =========================================================================

    /// `Stopped -> LeaderRecovery`.
    pub fn start_leading(&self) -> Result<()> {
        self.ensure_not_faulted()?;
        self.transition(PeerState::LeaderRecovery)?;
        self.composite.notify(PartEvent::StartLeading);
        Ok(())
    }

    /// `LeaderRecovery -> Leading`.
    pub fn leader_recovery_complete(&self) -> Result<()> {
        self.ensure_not_faulted()?;
        self.transition(PeerState::Leading)?;
        self.composite.notify(PartEvent::LeaderRecoveryComplete);
        self.composite.notify(PartEvent::LeaderActive);
        Ok(())
    }

    /// `Leading | LeaderRecovery -> Stopped`.
    pub fn stop_leading(&self) -> Result<()> {
        let current = self.state();
        if !matches!(current, PeerState::Leading | PeerState::LeaderRecovery) {
            return Err(self.fault(AutomatonError::InvalidTransition {
                from: current,
                to: PeerState::Stopped,
            }));
        }
        self.transition(PeerState::Stopped)?;
        self.composite.notify(PartEvent::StopLeading);
        Ok(())
    }

    /// `Stopped -> FollowerRecovery`.
    pub fn start_following(&self) -> Result<()> {
        self.ensure_not_faulted()?;
        self.transition(PeerState::FollowerRecovery)?;
        self.composite.notify(PartEvent::StartFollowing);
        Ok(())
    }

    /// `FollowerRecovery -> Following`.
    pub fn follower_recovery_complete(&self) -> Result<()> {
        self.ensure_not_faulted()?;
        self.transition(PeerState::Following)?;
        self.composite.notify(PartEvent::FollowerRecoveryComplete);
        Ok(())
    }

    /// `Following | FollowerRecovery -> Stopped`.
    pub fn stop_following(&self) -> Result<()> {
        let current = self.state();
        if !matches!(current, PeerState::Following | PeerState::FollowerRecovery) {
            return Err(self.fault(AutomatonError::InvalidTransition {
                from: current,
                to: PeerState::Stopped,
            }));
        }
        self.transition(PeerState::Stopped)?;
        self.composite.notify(PartEvent::StopFollowing);
        Ok(())
    }

    fn transition(&self, to: PeerState) -> Result<()> {
        let from = self.state();
        if !from.can_transition_to(to) {
            return Err(self.fault(AutomatonError::InvalidTransition { from, to }));
        }

        if to == PeerState::Stopped {
            self.reset();
        }
        self.peer_state.set(to);

        info!(from = %from, to = %to, version = %self.logged_version(), "Peer state changed");
        Ok(())
    }

    /// Drop transient pipeline state. Pending commit promises and a scheduled
    /// snapshot promise are dropped unresolved.
    fn reset(&self) {
        let dropped = {
            let mut state = self.state.lock();
            let dropped = state.pending.len();
            state.pending.clear();
            state.changelog = None;
            state.scheduled_snapshot = None;
            dropped
        };
        self.metrics.set_pending(0);
        if dropped > 0 {
            info!(dropped, "Dropped pending mutations");
        }
    }

    fn require_state(
        &self,
        operation: &'static str,
        allowed: impl Fn(PeerState) -> bool,
    ) -> Result<()> {
        let state = self.state();
        if allowed(state) {
            Ok(())
        } else {
            Err(AutomatonError::InvalidState { operation, state })
        }
    }

    // =========================================================================
    // Fault handling
    // =========================================================================

    fn ensure_not_faulted(&self) -> Result<()> {
        match self.faulted.lock().as_ref() {
            Some(cause) => Err(AutomatonError::Faulted {
                cause: cause.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Record `err` if it is fatal and hand it back. Pending commit promises
    /// fail with [`AutomatonError::Faulted`].
    fn fault(&self, err: AutomatonError) -> AutomatonError {
        if !err.is_fatal() {
            return err;
        }

        error!(code = err.code(), error = %err, "Automaton faulted");
        let cause = err.to_string();
        {
            let mut faulted = self.faulted.lock();
            if faulted.is_none() {
                *faulted = Some(cause.clone());
            }
        }

        let pending = std::mem::take(&mut self.state.lock().pending);
        for mutation in pending {
            if let Some(promise) = mutation.commit_promise {
                promise.resolve(Err(AutomatonError::Faulted {
                    cause: cause.clone(),
                }));
            }
        }
        self.metrics.set_pending(0);
        err
    }

    // =========================================================================
    // Mutation pipeline
    // =========================================================================

    fn current_changelog(&self, state: &mut PipelineState) -> Result<Arc<dyn Changelog>> {
        if let Some(changelog) = &state.changelog {
            return Ok(Arc::clone(changelog));
        }
        let changelog = self
            .changelog_store
            .open_changelog(self.logged_version().segment_id)?;
        state.changelog = Some(Arc::clone(&changelog));
        Ok(changelog)
    }

    fn publish_versions(&self) {
        let versions = *self.versions.lock();
        self.metrics.set_versions(versions.logged, versions.automaton);
    }

    /// Log a new mutation at the leader.
    ///
    /// The timestamp and random seed are captured here. If the changelog
    /// rejects the record, the mutation is not queued, the logged version
    /// does not move and both the log future and the commit promise fail.
    /// If the record is accepted but the log future later fails, the commit
    /// promise fails with the same cause; the mutation stays queued and its
    /// fate is left to whoever commits the log.
    pub fn log_mutation_at_leader(&self, request: MutationRequest) -> Result<LoggedMutation> {
        self.ensure_not_faulted()?;
        self.require_state("log_mutation_at_leader", |s| s == PeerState::Leading)?;

        let timestamp_ms = self.clock.system_time_millis();
        let random_seed = self.rng.next_u64();
        let record = Bytes::from(request.to_record(timestamp_ms, random_seed).to_bytes()?);
        let (commit_promise, commit) = CommitPromise::new();

        let mut state = self.state.lock();
        let changelog = self.current_changelog(&mut state)?;
        let version = self.logged_version();

        let log_future = match changelog.append(record.clone()) {
            Ok(log_future) => log_future,
            Err(e) => {
                warn!(version = %version, error = %e, "Failed to log mutation");
                let log_error = HydraError::ChangelogAppend {
                    changelog_id: changelog.id(),
                    cause: e.to_string(),
                };
                commit_promise.resolve(Err(e.into()));
                return Ok(LoggedMutation {
                    version,
                    record,
                    log_future: future::err(log_error).boxed(),
                    commit,
                });
            }
        };

        let observer = commit_promise.observer();
        let changelog_id = changelog.id();
        let log_future = log_future
            .inspect_err(move |e| {
                warn!(version = %version, error = %e, "Mutation failed to become durable");
                observer.fail(
                    HydraError::ChangelogAppend {
                        changelog_id,
                        cause: e.to_string(),
                    }
                    .into(),
                );
            })
            .boxed();

        debug!(version = %version, mutation_type = %request.mutation_type, "Logging mutation at leader");
        state.pending.push_back(PendingMutation {
            version,
            request,
            timestamp_ms,
            random_seed,
            commit_promise: Some(commit_promise),
        });
        let pending = state.pending.len();
        self.versions.lock().logged = version.advance();
        drop(state);

        self.metrics.set_pending(pending);
        self.publish_versions();

        Ok(LoggedMutation {
            version,
            record,
            log_future,
            commit,
        })
    }

    /// Log a record received from the leader.
    pub fn log_mutation_at_follower(&self, record: Bytes) -> Result<StoreFuture<'static, ()>> {
        self.ensure_not_faulted()?;
        self.require_state("log_mutation_at_follower", |s| {
            matches!(s, PeerState::Following | PeerState::FollowerRecovery)
        })?;

        let decoded = MutationRecord::from_bytes(&record)?;
        let (request, timestamp_ms, random_seed) = MutationRequest::from_record(decoded);

        let mut state = self.state.lock();
        let changelog = self.current_changelog(&mut state)?;
        let version = self.logged_version();
        let log_future = changelog.append(record)?;

        debug!(version = %version, mutation_type = %request.mutation_type, "Logging mutation at follower");
        state.pending.push_back(PendingMutation {
            version,
            request,
            timestamp_ms,
            random_seed,
            commit_promise: None,
        });
        let pending = state.pending.len();
        self.versions.lock().logged = version.advance();
        drop(state);

        self.metrics.set_pending(pending);
        self.publish_versions();
        Ok(log_future)
    }

    /// Apply a record read from the log during recovery, bypassing the
    /// pending queue.
    pub fn apply_mutation_during_recovery(&self, record: &[u8]) -> Result<()> {
        self.ensure_not_faulted()?;
        self.require_state("apply_mutation_during_recovery", PeerState::is_recovery)?;

        let decoded = MutationRecord::from_bytes(record)?;
        let (request, timestamp_ms, random_seed) = MutationRequest::from_record(decoded);
        let version = self.automaton_version();

        let mut context = MutationContext::new(version, request, timestamp_ms, random_seed);
        self.do_apply(&mut context).map_err(|e| self.fault(e))?;
        self.versions.lock().automaton = version.advance();
        self.publish_versions();
        Ok(())
    }

    /// Move the automaton version to the start of the next segment.
    pub fn rotate_changelog_during_recovery(&self) {
        let version = {
            let mut versions = self.versions.lock();
            versions.automaton = versions.automaton.rotate();
            versions.automaton
        };
        debug!(version = %version, "Rotated changelog during recovery");
        self.publish_versions();
    }

    /// Apply every pending mutation logged before `up_to`, in log order.
    ///
    /// Runs to completion without yielding. A fatal error faults the
    /// automaton: the failing mutation's promise and every later pending
    /// promise fail with [`AutomatonError::Faulted`].
    pub fn commit_mutations(&self, up_to: Version) -> Result<()> {
        self.ensure_not_faulted()?;
        debug!(version = %up_to, "Applying mutations up to version");

        let started = Instant::now();
        let result = self.drain_pending(up_to);
        self.metrics
            .batch_commit
            .observe(started.elapsed().as_secs_f64());
        self.metrics.set_pending(self.pending_count());
        self.publish_versions();

        result.map_err(|e| self.fault(e))
    }

    fn pop_pending_before(&self, up_to: Version) -> Option<PendingMutation> {
        let mut state = self.state.lock();
        let due = state
            .pending
            .front()
            .is_some_and(|front| front.version < up_to);
        if due {
            state.pending.pop_front()
        } else {
            None
        }
    }

    fn drain_pending(&self, up_to: Version) -> Result<()> {
        while let Some(mut pending) = self.pop_pending_before(up_to) {
            let promise = pending.commit_promise.take();
            let automaton = self.automaton_version();

            let in_order = if pending.version.segment_id == automaton.segment_id {
                pending.version.record_id == automaton.record_id
            } else {
                pending.version.segment_id > automaton.segment_id && pending.version.record_id == 0
            };
            if !in_order {
                let err = AutomatonError::OutOfOrderMutation {
                    expected: automaton,
                    actual: pending.version,
                };
                fail_promise(promise, &err);
                return Err(err);
            }
            if pending.version != automaton {
                self.versions.lock().automaton = pending.version;
                self.maybe_start_snapshot_builder();
            }

            debug!(version = %pending.version, "Applying mutation");
            let mut context = MutationContext::new(
                pending.version,
                pending.request,
                pending.timestamp_ms,
                pending.random_seed,
            );
            if let Err(err) = self.do_apply(&mut context) {
                fail_promise(promise, &err);
                return Err(err);
            }

            self.versions.lock().automaton = pending.version.advance();
            if let Some(promise) = promise {
                promise.resolve(Ok(context.into_response()));
            }

            self.maybe_start_snapshot_builder();
        }

        let automaton = self.automaton_version();
        if up_to.segment_id > automaton.segment_id {
            if up_to.record_id != 0 {
                return Err(AutomatonError::OutOfOrderMutation {
                    expected: automaton,
                    actual: up_to,
                });
            }
            self.versions.lock().automaton = up_to;
            self.maybe_start_snapshot_builder();
        }

        let automaton = self.automaton_version();
        if automaton < up_to {
            return Err(AutomatonError::VersionRegression {
                automaton,
                target: up_to,
            });
        }
        Ok(())
    }

    fn do_apply(&self, context: &mut MutationContext) -> Result<()> {
        if self.mutation_context_active.swap(true, Ordering::AcqRel) {
            return Err(AutomatonError::ReentrantMutationContext {
                version: context.version(),
            });
        }
        let _active = ActiveContext(&self.mutation_context_active);

        let kept = context
            .mutation_id()
            .and_then(|id| self.response_keeper.find_response(&id));
        match kept {
            Some(data) => {
                debug!(
                    version = %context.version(),
                    mutation_type = %context.mutation_type(),
                    "Mutation has a kept response, skipping handler"
                );
                context.set_kept_response(data);
            }
            None => {
                self.composite.apply_mutation(context)?;
                self.metrics.record_applied(context.mutation_type());
            }
        }

        match context.mutation_id() {
            Some(id) if !context.is_suppressed() && !context.response().kept => {
                self.response_keeper.register_response(
                    id,
                    context.response().data.clone(),
                    context.timestamp_ms(),
                );
            }
            _ => self
                .response_keeper
                .remove_expired_responses(context.timestamp_ms()),
        }
        Ok(())
    }

    // =========================================================================
    // Changelog rotation
    // =========================================================================

    /// Seal the current changelog and switch logging to its successor.
    ///
    /// Redundant calls for a changelog that was already rotated, or dropped by
    /// a stop, do nothing.
    pub async fn rotate_changelog(&self) -> Result<()> {
        self.rotate_current_changelog().await.map(|_| ())
    }

    /// Rotate and return the changelog that was current on entry.
    async fn rotate_current_changelog(&self) -> Result<Arc<dyn Changelog>> {
        self.ensure_not_faulted()?;
        let changelog = {
            let mut state = self.state.lock();
            self.current_changelog(&mut state)?
        };
        info!(
            version = %self.logged_version(),
            changelog_id = changelog.id(),
            "Rotating changelog"
        );

        let _rotation = self.rotation_lock.lock().await;
        if !self.is_current_changelog(&changelog) {
            warn!(changelog_id = changelog.id(), "Changelog already rotated");
            return Ok(changelog);
        }

        changelog.flush().await?;
        if changelog.is_sealed() {
            warn!(changelog_id = changelog.id(), "Changelog is already sealed");
        } else {
            changelog.seal(changelog.record_count()).await?;
        }

        if !self.is_current_changelog(&changelog) {
            warn!(changelog_id = changelog.id(), "Changelog already rotated");
            return Ok(changelog);
        }

        let next_id = changelog.id() + 1;
        let params = ChangelogCreateParams {
            prev_record_count: changelog.record_count(),
        };
        let store = Arc::clone(&self.changelog_store);
        let next = tokio::task::spawn_blocking(move || store.create_changelog(next_id, params))
            .await??;

        {
            let mut state = self.state.lock();
            let still_current = state
                .changelog
                .as_ref()
                .is_some_and(|current| same_changelog(current, &changelog));
            if !still_current {
                warn!(changelog_id = changelog.id(), "Changelog already rotated");
                return Ok(changelog);
            }

            let mut versions = self.versions.lock();
            if versions.logged.segment_id != changelog.id() {
                let err = AutomatonError::ChangelogMismatch {
                    logged: versions.logged,
                    changelog_id: changelog.id(),
                };
                drop(versions);
                drop(state);
                return Err(self.fault(err));
            }
            state.changelog = Some(next);
            versions.logged = Version::new(next_id, 0);
        }

        self.publish_versions();
        info!(
            changelog_id = next_id,
            prev_record_count = params.prev_record_count,
            "Changelog rotated"
        );
        Ok(changelog)
    }

    fn is_current_changelog(&self, changelog: &Arc<dyn Changelog>) -> bool {
        self.state
            .lock()
            .changelog
            .as_ref()
            .is_some_and(|current| same_changelog(current, changelog))
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Seal the current changelog and schedule a snapshot of the state at
    /// its end.
    ///
    /// Resolves once the snapshot is scheduled, with a future of the
    /// confirmed snapshot. The build starts as soon as the automaton version
    /// reaches the end of the sealed changelog (immediately if it already
    /// has), so snapshot `N` covers exactly the records changelog `N` follows.
    /// A later call replaces a schedule that has not started yet; the
    /// replaced future resolves as cancelled.
    pub async fn build_snapshot(
        &self,
    ) -> Result<AutomatonFuture<'static, RemoteSnapshotParams>> {
        self.ensure_not_faulted()?;

        let changelog = self.rotate_current_changelog().await?;
        if !changelog.is_sealed() {
            return Err(AutomatonError::cancelled(
                "changelog was dropped before it was sealed",
            ));
        }
        let version = Version::new(changelog.id(), changelog.record_count());

        let (promise, receiver) = oneshot::channel();
        {
            let mut state = self.state.lock();
            let automaton = self.automaton_version();
            if automaton > version {
                return Err(AutomatonError::SnapshotVersionPassed { version, automaton });
            }
            if let Some(replaced) = state
                .scheduled_snapshot
                .replace(ScheduledSnapshot { version, promise })
            {
                debug!(version = %replaced.version, "Replaced scheduled snapshot");
            }
        }
        info!(version = %version, "Scheduled snapshot");

        self.maybe_start_snapshot_builder();

        Ok(Box::pin(async move {
            receiver
                .await
                .map_err(|_| AutomatonError::cancelled("snapshot was abandoned"))?
        }))
    }

    fn maybe_start_snapshot_builder(&self) {
        let automaton = self.automaton_version();
        let scheduled = {
            let mut state = self.state.lock();
            let due = state
                .scheduled_snapshot
                .as_ref()
                .is_some_and(|s| s.version == automaton);
            if due {
                state.scheduled_snapshot.take()
            } else {
                None
            }
        };
        if let Some(scheduled) = scheduled {
            snapshot_builder::start(self, scheduled.promise);
        }
    }

    /// Replace the whole state with snapshot `snapshot_id`.
    ///
    /// The automaton version becomes `(snapshot_id, 0)`.
    pub fn load_snapshot(&self, snapshot_id: u64, reader: &mut dyn Read) -> Result<()> {
        self.ensure_not_faulted()?;
        info!(snapshot_id, "Started loading snapshot");

        self.state.lock().changelog = None;

        let started = Instant::now();
        self.composite.clear();
        self.composite.notify(PartEvent::BeforeSnapshotLoaded);
        self.composite.load_snapshot(reader)?;
        self.composite.notify(PartEvent::AfterSnapshotLoaded);
        self.metrics
            .snapshot_load
            .observe(started.elapsed().as_secs_f64());

        self.versions.lock().automaton = Version::new(snapshot_id, 0);
        self.publish_versions();

        info!(
            snapshot_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Finished loading snapshot"
        );
        Ok(())
    }

    /// Reset all state: parts, kept responses, versions, pending work and
    /// the faulted flag.
    pub fn clear(&self) {
        self.composite.clear();
        self.reset();
        *self.versions.lock() = Versions::default();
        *self.faulted.lock() = None;
        self.publish_versions();
    }
}

fn same_changelog(a: &Arc<dyn Changelog>, b: &Arc<dyn Changelog>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn fail_promise(promise: Option<CommitPromise>, err: &AutomatonError) {
    if let Some(promise) = promise {
        promise.resolve(Err(AutomatonError::Faulted {
            cause: err.to_string(),
        }));
    }
}

/// Builder for [`DecoratedAutomaton`].
pub struct DecoratedAutomatonBuilder {
    config: AutomatonConfig,
    composite: CompositeAutomaton,
    changelog_store: Option<Arc<dyn ChangelogStore>>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    invoker: Option<Arc<dyn Invoker>>,
    clock: Option<Arc<dyn ClockProvider>>,
    rng: Option<Arc<dyn RngProvider>>,
    metrics: Option<Arc<AutomatonMetrics>>,
}

impl DecoratedAutomatonBuilder {
    /// Use a custom changelog store instead of the file store under
    /// `data_dir`.
    pub fn changelog_store(mut self, store: Arc<dyn ChangelogStore>) -> Self {
        self.changelog_store = Some(store);
        self
    }

    /// Use a custom snapshot store instead of the file store under
    /// `data_dir`.
    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    /// Use a custom automaton invoker instead of a new [`SerialInvoker`].
    pub fn invoker(mut self, invoker: Arc<dyn Invoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Use a custom clock for mutation timestamps.
    pub fn clock(mut self, clock: Arc<dyn ClockProvider>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a custom RNG for mutation seeds.
    pub fn rng(mut self, rng: Arc<dyn RngProvider>) -> Self {
        self.rng = Some(rng);
        self
    }

    /// Share a metrics instance.
    pub fn metrics(mut self, metrics: Arc<AutomatonMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the automaton. Must be called within a tokio runtime.
    pub fn build(self) -> Result<Arc<DecoratedAutomaton>> {
        self.config
            .validate()
            .map_err(|cause| AutomatonError::Config { cause })?;
        let handle = Handle::try_current().map_err(|e| AutomatonError::Runtime {
            cause: e.to_string(),
        })?;

        let changelog_store = match self.changelog_store {
            Some(store) => store,
            None => Arc::new(FileChangelogStore::from_config(&self.config)?),
        };
        let snapshot_store = match self.snapshot_store {
            Some(store) => store,
            None => Arc::new(FileSnapshotStore::from_config(&self.config)?),
        };
        let invoker = self
            .invoker
            .unwrap_or_else(|| Arc::new(SerialInvoker::new(&handle)));
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(AutomatonMetrics::new()?),
        };

        let response_keeper = Arc::new(ResponseKeeper::new(&self.config.response_keeper));
        let mut composite = self.composite;
        composite.register_part(Arc::new(ResponseKeeperPart::new(Arc::clone(
            &response_keeper,
        ))))?;

        Ok(Arc::new(DecoratedAutomaton {
            config: self.config,
            composite: Arc::new(composite),
            changelog_store,
            snapshot_store,
            clock: self.clock.unwrap_or_else(|| Arc::new(RealClock::new())),
            rng: self.rng.unwrap_or_else(|| Arc::new(RealRng::new())),
            metrics,
            response_keeper,
            invoker,
            handle,
            gate: UserSystemGate::new(),
            peer_state: PeerStateCell::default(),
            versions: Mutex::new(Versions::default()),
            state: Mutex::new(PipelineState::default()),
            rotation_lock: tokio::sync::Mutex::new(()),
            faulted: Mutex::new(None),
            mutation_context_active: AtomicBool::new(false),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn automaton(dir: &TempDir) -> Arc<DecoratedAutomaton> {
        let config = AutomatonConfig::builder()
            .data_dir(dir.path())
            .sync_on_flush(false)
            .build();
        DecoratedAutomaton::builder(config, CompositeAutomaton::new())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn builder_registers_response_keeper() {
        let dir = TempDir::new().unwrap();
        let automaton = automaton(&dir);
        assert_eq!(automaton.composite().parts().len(), 1);
        assert_eq!(automaton.state(), PeerState::Stopped);
        assert_eq!(automaton.logged_version(), Version::default());
    }

    #[test]
    fn builder_requires_runtime() {
        let dir = TempDir::new().unwrap();
        let config = AutomatonConfig::builder().data_dir(dir.path()).build();
        let err = DecoratedAutomaton::builder(config, CompositeAutomaton::new())
            .build()
            .err()
            .unwrap();
        assert_eq!(err.code(), "H702");
    }

    #[tokio::test]
    async fn builder_validates_config() {
        let dir = TempDir::new().unwrap();
        let config = AutomatonConfig::builder()
            .data_dir(dir.path())
            .snapshot_timeout_ms(0)
            .build();
        let err = DecoratedAutomaton::builder(config, CompositeAutomaton::new())
            .build()
            .err()
            .unwrap();
        assert_eq!(err.code(), "H701");
    }

    #[tokio::test]
    async fn nested_mutation_context_is_fatal() {
        let dir = TempDir::new().unwrap();
        let automaton = automaton(&dir);
        automaton
            .mutation_context_active
            .store(true, Ordering::SeqCst);

        let mut context = MutationContext::new(
            Version::new(1, 0),
            MutationRequest::new("Any", Bytes::new()),
            0,
            0,
        );
        let err = automaton.do_apply(&mut context).unwrap_err();
        assert_eq!(err.code(), "H403");
        assert!(err.is_fatal());
        // The outer context still owns the flag.
        assert!(automaton.mutation_context_active.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn mutation_context_flag_resets_after_apply() {
        let dir = TempDir::new().unwrap();
        let automaton = automaton(&dir);

        let mut context = MutationContext::new(
            Version::new(1, 0),
            MutationRequest::new("Missing", Bytes::new()),
            0,
            0,
        );
        assert_eq!(automaton.do_apply(&mut context).unwrap_err().code(), "H401");
        assert!(!automaton.mutation_context_active.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn recovery_rotation_moves_automaton_version() {
        let dir = TempDir::new().unwrap();
        let automaton = automaton(&dir);
        automaton.rotate_changelog_during_recovery();
        automaton.rotate_changelog_during_recovery();
        assert_eq!(automaton.automaton_version(), Version::new(2, 0));

        automaton.set_logged_version(Version::new(2, 4));
        assert_eq!(automaton.logged_version(), Version::new(2, 4));
        assert_eq!(automaton.metrics().logged_record_id.get(), 4);

        automaton.clear();
        assert_eq!(automaton.automaton_version(), Version::default());
        assert_eq!(automaton.logged_version(), Version::default());
    }
}
