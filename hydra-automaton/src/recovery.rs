//! Recovery: rebuild automaton state from the newest snapshot and the log.

use crate::composite::PartEvent;
use crate::decorated::DecoratedAutomaton;
use crate::error::{AutomatonError, Result};
use crate::store::ChangelogCreateParams;
use hydra_core::{HydraError, Version};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Records read from a changelog per batch.
pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// Drives a decorated automaton in a recovery state up to the end of the log.
///
/// The caller moves the automaton into `LeaderRecovery` or
/// `FollowerRecovery` first and signals recovery completion afterwards.
pub struct Recovery {
    automaton: Arc<DecoratedAutomaton>,
    batch_size: usize,
}

impl Recovery {
    /// Create a recovery driver.
    pub fn new(automaton: Arc<DecoratedAutomaton>) -> Self {
        Self {
            automaton,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set the number of records read per batch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run recovery and return the version the log was recovered to.
    ///
    /// If the latest changelog is sealed (or none exists), a fresh changelog
    /// is created and becomes the logging target.
    pub async fn run(&self) -> Result<Version> {
        let automaton = &self.automaton;
        let state = automaton.state();
        if !state.is_recovery() {
            return Err(AutomatonError::InvalidState {
                operation: "recovery",
                state,
            });
        }

        let started = Instant::now();
        automaton.composite().notify(PartEvent::RecoveryStarted);

        let target = self.recovery_target().await?;
        info!(target = %target, state = %state, "Recovery started");

        self.load_latest_snapshot(target).await?;
        self.replay_changelogs(target).await?;

        automaton.set_logged_version(target);
        automaton.composite().notify(PartEvent::RecoveryComplete);

        info!(
            version = %automaton.automaton_version(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Recovery complete"
        );
        Ok(target)
    }

    async fn recovery_target(&self) -> Result<Version> {
        let store = Arc::clone(self.automaton.changelog_store());
        let target = tokio::task::spawn_blocking(move || -> Result<Version> {
            let Some(latest) = store.latest_changelog_id()? else {
                store.create_changelog(1, ChangelogCreateParams::default())?;
                return Ok(Version::new(1, 0));
            };

            let changelog = store.open_changelog(latest)?;
            if changelog.is_sealed() {
                let params = ChangelogCreateParams {
                    prev_record_count: changelog.record_count(),
                };
                store.create_changelog(latest + 1, params)?;
                Ok(Version::new(latest + 1, 0))
            } else {
                Ok(Version::new(latest, changelog.record_count()))
            }
        })
        .await??;
        Ok(target)
    }

    /// Load the newest snapshot that lines up with the changelog chain.
    ///
    /// Snapshot `N` must cover exactly the records changelog `N` follows.
    /// Snapshots that do not are skipped in favor of older ones, down to a
    /// replay from the first changelog.
    async fn load_latest_snapshot(&self, target: Version) -> Result<()> {
        let current = self.automaton.automaton_version();
        let mut max_snapshot_id = target.segment_id;

        loop {
            let Some(snapshot_id) = self
                .automaton
                .snapshot_store()
                .latest_snapshot_id(max_snapshot_id)?
            else {
                debug!(target = %target, "No snapshot to load");
                return Ok(());
            };
            if snapshot_id <= current.segment_id {
                debug!(snapshot_id, version = %current, "Snapshot is not newer than current state");
                return Ok(());
            }

            let automaton = Arc::clone(&self.automaton);
            let mismatch =
                tokio::task::spawn_blocking(move || snapshot_mismatch(&automaton, snapshot_id))
                    .await??;
            if let Some(mismatch) = mismatch {
                warn!(snapshot_id, mismatch = %mismatch, "Skipping snapshot");
                max_snapshot_id = snapshot_id - 1;
                continue;
            }

            let automaton = Arc::clone(&self.automaton);
            return tokio::task::spawn_blocking(move || {
                let mut reader = automaton.snapshot_store().open_reader(snapshot_id)?;
                automaton.load_snapshot(snapshot_id, &mut reader)
            })
            .await?;
        }
    }

    async fn replay_changelogs(&self, target: Version) -> Result<()> {
        let automaton = &self.automaton;
        let first = automaton.automaton_version().segment_id.max(1);
        let mut prev_record_count = None;

        for changelog_id in first..=target.segment_id {
            while automaton.automaton_version().segment_id < changelog_id {
                automaton.rotate_changelog_during_recovery();
            }

            let store = Arc::clone(automaton.changelog_store());
            let changelog =
                tokio::task::spawn_blocking(move || store.open_changelog(changelog_id)).await??;
            if let Some(actual) = prev_record_count {
                let expected = changelog.prev_record_count();
                if expected != actual {
                    return Err(AutomatonError::ChangelogChainBroken {
                        changelog_id,
                        expected,
                        actual,
                    });
                }
            }
            prev_record_count = Some(changelog.record_count());

            let end = if changelog_id == target.segment_id {
                target.record_id
            } else {
                changelog.record_count()
            };

            let mut next = automaton.automaton_version().record_id;
            if next < end {
                debug!(changelog_id, from = next, to = end, "Replaying changelog");
            }
            while next < end {
                let max_records = self.batch_size.min((end - next) as usize);
                let reader = Arc::clone(&changelog);
                let records =
                    tokio::task::spawn_blocking(move || reader.read(next, max_records)).await??;
                if records.is_empty() {
                    return Err(AutomatonError::Runtime {
                        cause: format!(
                            "changelog {} ended at record {} before {}",
                            changelog_id, next, end
                        ),
                    });
                }

                for record in &records {
                    automaton.apply_mutation_during_recovery(record)?;
                }
                next += records.len() as u64;
            }
        }
        Ok(())
    }
}

/// Why snapshot `snapshot_id` does not continue into changelog `snapshot_id`,
/// if it does not.
fn snapshot_mismatch(automaton: &DecoratedAutomaton, snapshot_id: u64) -> Result<Option<String>> {
    let covered = automaton
        .snapshot_store()
        .snapshot_params(snapshot_id)?
        .prev_record_count;
    let changelogs = automaton.changelog_store();

    let next = changelogs.open_changelog(snapshot_id)?;
    if next.prev_record_count() != covered {
        return Ok(Some(format!(
            "covers {} records but changelog {} follows {}",
            covered,
            snapshot_id,
            next.prev_record_count()
        )));
    }

    match changelogs.open_changelog(snapshot_id - 1) {
        Ok(prev) if prev.record_count() != covered => Ok(Some(format!(
            "covers {} records but changelog {} holds {}",
            covered,
            snapshot_id - 1,
            prev.record_count()
        ))),
        Ok(_) | Err(HydraError::ChangelogNotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
