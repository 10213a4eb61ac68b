//! One-shot snapshot construction.

use super::DecoratedAutomaton;
use crate::error::{AutomatonError, Result};
use crate::store::{SnapshotCreateParams, SnapshotParams};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// A confirmed snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSnapshotParams {
    /// Snapshot id: the state it holds precedes changelog `snapshot_id`.
    pub snapshot_id: u64,
    /// Parameters reported by the snapshot store.
    pub params: SnapshotParams,
}

pub(crate) type SnapshotPromise = oneshot::Sender<Result<RemoteSnapshotParams>>;

/// Build a snapshot of the current automaton state.
///
/// The synchronous save phase runs before this returns, so the snapshot
/// captures exactly the current automaton version. Serialization of async
/// sections, closing and confirmation continue in the background; the
/// outcome is delivered through `promise`. A failed build leaves nothing
/// confirmed.
pub(super) fn start(automaton: &DecoratedAutomaton, promise: SnapshotPromise) {
    let version = automaton.automaton_version();
    let snapshot_id = version.segment_id + 1;
    let create_params = SnapshotCreateParams {
        prev_record_count: version.record_id,
    };
    let started = Instant::now();

    info!(snapshot_id, version = %version, "Building snapshot");

    let writer = match automaton.snapshot_store.create_writer(snapshot_id, create_params) {
        Ok(writer) => writer,
        Err(e) => {
            error!(snapshot_id, error = %e, "Failed to create snapshot writer");
            let _ = promise.send(Err(e.into()));
            return;
        }
    };

    let save = automaton.composite.save_snapshot(writer);
    let store = Arc::clone(&automaton.snapshot_store);
    let metrics = Arc::clone(&automaton.metrics);
    let timeout = automaton.config.snapshot_timeout();

    automaton.handle.spawn(async move {
        let build = async {
            let writer = save.await?;
            writer.close().await?;
            Ok::<_, AutomatonError>(store.confirm_snapshot(snapshot_id).await?)
        };

        let result = tokio::time::timeout(timeout, build)
            .await
            .unwrap_or_else(|_| {
                Err(AutomatonError::SnapshotTimeout {
                    snapshot_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            });

        let result = match result {
            Ok(params) => {
                let elapsed = started.elapsed();
                metrics.snapshot_build.observe(elapsed.as_secs_f64());
                info!(
                    snapshot_id,
                    size = params.data_size,
                    checksum = params.checksum,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Snapshot built"
                );
                Ok(RemoteSnapshotParams {
                    snapshot_id,
                    params,
                })
            }
            Err(e) => {
                error!(snapshot_id, error = %e, "Snapshot build failed");
                if let Err(discard) = store.discard_snapshot(snapshot_id) {
                    warn!(snapshot_id, error = %discard, "Failed to discard snapshot");
                }
                Err(e)
            }
        };

        let _ = promise.send(result);
    });
}
