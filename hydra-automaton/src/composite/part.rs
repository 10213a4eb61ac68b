//! The automaton part trait.

use super::descriptors::PartRegistrar;
use crate::error::Result;
use crate::serialize::SNAPSHOT_FORMAT_VERSION;
use std::sync::Arc;

/// A unit of business logic plugged into the composite automaton.
///
/// Parts own their state behind interior mutability; the handlers they
/// register capture an `Arc` of the part. The core calls handlers and hooks
/// one at a time from the automaton context, never concurrently with each
/// other, so a plain `Mutex` around part state is never contended by the
/// core itself.
///
/// # Example
///
/// ```
/// use hydra_automaton::{AutomatonPart, PartRegistrar, Result};
/// use parking_lot::Mutex;
/// use std::sync::Arc;
///
/// #[derive(Default)]
/// struct Counter {
///     value: Mutex<u64>,
/// }
///
/// impl AutomatonPart for Counter {
///     fn name(&self) -> &str {
///         "counter"
///     }
///
///     fn register(self: Arc<Self>, registrar: &mut PartRegistrar<'_>) -> Result<()> {
///         let part = Arc::clone(&self);
///         registrar.register_method("Increment", move |ctx| {
///             let mut value = part.value.lock();
///             *value += 1;
///             ctx.set_response_json(&*value)
///         })
///     }
///
///     fn clear(&self) {
///         *self.value.lock() = 0;
///     }
/// }
/// ```
pub trait AutomatonPart: Send + Sync + 'static {
    /// Unique part name.
    fn name(&self) -> &str;

    /// Register savers, loaders and mutation handlers.
    fn register(self: Arc<Self>, registrar: &mut PartRegistrar<'_>) -> Result<()>;

    /// Reset all part state to empty. Must be idempotent.
    fn clear(&self);

    /// Whether this part can load snapshots of the given format version.
    fn validate_snapshot_version(&self, version: u32) -> bool {
        version == SNAPSHOT_FORMAT_VERSION
    }

    /// Leader recovery is about to begin.
    fn on_start_leading(&self) {}

    /// Leader recovery finished; the peer is now leading.
    fn on_leader_recovery_complete(&self) {}

    /// The leader accepts mutations.
    fn on_leader_active(&self) {}

    /// The peer stopped leading.
    fn on_stop_leading(&self) {}

    /// Follower recovery is about to begin.
    fn on_start_following(&self) {}

    /// Follower recovery finished; the peer is now following.
    fn on_follower_recovery_complete(&self) {}

    /// The peer stopped following.
    fn on_stop_following(&self) {}

    /// Log replay is about to begin.
    fn on_recovery_started(&self) {}

    /// Log replay finished.
    fn on_recovery_complete(&self) {}

    /// A snapshot load is about to begin; state was just cleared.
    fn on_before_snapshot_loaded(&self) {}

    /// A snapshot load finished.
    fn on_after_snapshot_loaded(&self) {}
}

/// Lifecycle notifications forwarded to every part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartEvent {
    /// See [`AutomatonPart::on_start_leading`].
    StartLeading,
    /// See [`AutomatonPart::on_leader_recovery_complete`].
    LeaderRecoveryComplete,
    /// See [`AutomatonPart::on_leader_active`].
    LeaderActive,
    /// See [`AutomatonPart::on_stop_leading`].
    StopLeading,
    /// See [`AutomatonPart::on_start_following`].
    StartFollowing,
    /// See [`AutomatonPart::on_follower_recovery_complete`].
    FollowerRecoveryComplete,
    /// See [`AutomatonPart::on_stop_following`].
    StopFollowing,
    /// See [`AutomatonPart::on_recovery_started`].
    RecoveryStarted,
    /// See [`AutomatonPart::on_recovery_complete`].
    RecoveryComplete,
    /// See [`AutomatonPart::on_before_snapshot_loaded`].
    BeforeSnapshotLoaded,
    /// See [`AutomatonPart::on_after_snapshot_loaded`].
    AfterSnapshotLoaded,
}

impl PartEvent {
    pub(crate) fn deliver(self, part: &dyn AutomatonPart) {
        match self {
            Self::StartLeading => part.on_start_leading(),
            Self::LeaderRecoveryComplete => part.on_leader_recovery_complete(),
            Self::LeaderActive => part.on_leader_active(),
            Self::StopLeading => part.on_stop_leading(),
            Self::StartFollowing => part.on_start_following(),
            Self::FollowerRecoveryComplete => part.on_follower_recovery_complete(),
            Self::StopFollowing => part.on_stop_following(),
            Self::RecoveryStarted => part.on_recovery_started(),
            Self::RecoveryComplete => part.on_recovery_complete(),
            Self::BeforeSnapshotLoaded => part.on_before_snapshot_loaded(),
            Self::AfterSnapshotLoaded => part.on_after_snapshot_loaded(),
        }
    }
}
