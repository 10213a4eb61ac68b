//! Peer state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Role of this replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PeerState {
    /// Not participating. Initial and terminal.
    Stopped = 0,
    /// Catching up before leading.
    LeaderRecovery = 1,
    /// Accepting and logging mutations.
    Leading = 2,
    /// Catching up before following.
    FollowerRecovery = 3,
    /// Replicating the leader's log.
    Following = 4,
}

impl PeerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::LeaderRecovery,
            2 => Self::Leading,
            3 => Self::FollowerRecovery,
            4 => Self::Following,
            _ => Self::Stopped,
        }
    }

    /// Whether `self -> to` is an allowed transition.
    ///
    /// Entering `Stopped` is allowed from every other state so that a
    /// recovery can be abandoned.
    pub fn can_transition_to(self, to: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, to),
            (Stopped, LeaderRecovery)
                | (LeaderRecovery, Leading)
                | (Stopped, FollowerRecovery)
                | (FollowerRecovery, Following)
                | (LeaderRecovery | Leading | FollowerRecovery | Following, Stopped)
        )
    }

    /// Whether the peer is in a recovery state.
    pub fn is_recovery(self) -> bool {
        matches!(self, Self::LeaderRecovery | Self::FollowerRecovery)
    }

    /// Whether the peer is serving (`Leading` or `Following`).
    pub fn is_active(self) -> bool {
        matches!(self, Self::Leading | Self::Following)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "Stopped",
            Self::LeaderRecovery => "LeaderRecovery",
            Self::Leading => "Leading",
            Self::FollowerRecovery => "FollowerRecovery",
            Self::Following => "Following",
        };
        f.write_str(name)
    }
}

/// Shared, lock-free view of the peer state.
#[derive(Debug, Clone, Default)]
pub(crate) struct PeerStateCell(Arc<AtomicU8>);

impl PeerStateCell {
    pub fn get(&self) -> PeerState {
        PeerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: PeerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}
