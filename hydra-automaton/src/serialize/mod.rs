//! Snapshot serialization sessions.
//!
//! A save pass writes every saver's output into a named section of a
//! checkpointable stream; a load pass reads the sections back and hands each
//! one to the loader registered under the same name. Entities that reference
//! each other are written as [`EntitySerializationKey`]s and resolved through
//! the [`LoadContext`] once their targets have been loaded.

pub mod checkpoint;
mod context;

pub use checkpoint::{SNAPSHOT_FORMAT_VERSION, SNAPSHOT_MAGIC};
pub use context::{LoadContext, SaveContext};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordering class of synchronous savers. All `Keys` sections precede all
/// `Values` sections, so loaders can materialize entities before anything
/// references them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyncSerializationPriority {
    /// Entity identities.
    Keys,
    /// Entity contents.
    Values,
}

/// Ordering class of asynchronous savers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum AsyncSerializationPriority {
    /// The only class.
    #[default]
    Default,
}

/// Kind byte stored in each section header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SectionKind {
    /// Written by a `Keys` saver.
    Keys = 0,
    /// Written by a `Values` saver.
    Values = 1,
    /// Written by an async saver.
    Async = 2,
}

impl From<SyncSerializationPriority> for SectionKind {
    fn from(priority: SyncSerializationPriority) -> Self {
        match priority {
            SyncSerializationPriority::Keys => Self::Keys,
            SyncSerializationPriority::Values => Self::Values,
        }
    }
}

impl TryFrom<u8> for SectionKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Keys),
            1 => Ok(Self::Values),
            2 => Ok(Self::Async),
            other => Err(other),
        }
    }
}

/// Opaque integer standing in for an entity reference inside a snapshot.
///
/// Keys are dense, generated in save order starting at zero. The default key
/// (`-1`) means "unassigned".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntitySerializationKey(pub i32);

impl EntitySerializationKey {
    /// The unassigned key.
    pub const NONE: Self = Self(-1);

    /// Raw index.
    pub fn index(self) -> i32 {
        self.0
    }

    /// Whether this key was generated by a save pass.
    pub fn is_assigned(self) -> bool {
        self.0 >= 0
    }
}

impl Default for EntitySerializationKey {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for EntitySerializationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
