//! Task invokers.
//!
//! The automaton is driven from a single logical thread. A [`SerialInvoker`]
//! provides one on top of a tokio task; the guarded invokers wrap it with the
//! [`UserSystemGate`] so that user work and system work never interleave.

use crate::AutomatonFuture;
use crate::decorated::PeerStateCell;
use crate::error::{AutomatonError, Result};
use crate::lock::UserSystemGate;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// A unit of work handed to an invoker.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks on some execution context.
///
/// Invokers may drop a task instead of running it; callers that need a result
/// use [`run_via`], which reports a dropped task as cancellation.
pub trait Invoker: Send + Sync {
    /// Schedule `task`.
    fn invoke(&self, task: Task);
}

/// Run `f` through `invoker` and return its result.
pub fn run_via<T, F>(invoker: &dyn Invoker, f: F) -> AutomatonFuture<'static, T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    invoker.invoke(Box::new(move || {
        let _ = tx.send(f());
    }));

    Box::pin(async move {
        rx.await
            .map_err(|_| AutomatonError::cancelled("task was dropped by its invoker"))?
    })
}

/// Runs tasks one at a time, in submission order, on a dedicated tokio task.
#[derive(Clone)]
pub struct SerialInvoker {
    sender: mpsc::UnboundedSender<Task>,
}

impl SerialInvoker {
    /// Start the invoker on the given runtime.
    pub fn new(handle: &Handle) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        handle.spawn(async move {
            while let Some(task) = receiver.recv().await {
                task();
            }
            trace!("Serial invoker stopped");
        });
        Self { sender }
    }

    /// Start the invoker on the current runtime.
    pub fn spawn() -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| AutomatonError::Runtime {
            cause: e.to_string(),
        })?;
        Ok(Self::new(&handle))
    }
}

impl Invoker for SerialInvoker {
    fn invoke(&self, task: Task) {
        if self.sender.send(task).is_err() {
            debug!("Serial invoker is gone, dropping task");
        }
    }
}

/// Runs user work on the automaton invoker while holding a user slot.
///
/// Work is dropped when a user slot cannot be taken, or when the peer is
/// neither leading nor following by the time the task runs.
#[derive(Clone)]
pub struct GuardedUserInvoker {
    inner: Arc<dyn Invoker>,
    gate: UserSystemGate,
    state: PeerStateCell,
}

impl GuardedUserInvoker {
    pub(crate) fn new(inner: Arc<dyn Invoker>, gate: UserSystemGate, state: PeerStateCell) -> Self {
        Self { inner, gate, state }
    }
}

impl Invoker for GuardedUserInvoker {
    fn invoke(&self, task: Task) {
        let Some(guard) = self.gate.try_acquire_user() else {
            debug!("System work pending, dropping user task");
            return;
        };

        let state = self.state.clone();
        self.inner.invoke(Box::new(move || {
            let _guard = guard;
            let current = state.get();
            if current.is_active() {
                task();
            } else {
                debug!(state = %current, "Peer is not active, dropping user task");
            }
        }));
    }
}

/// Runs system work on the automaton invoker while holding a system slot.
///
/// The slot is taken when the task is submitted, which shuts out new user
/// work immediately; the task is queued once running user work has drained.
#[derive(Clone)]
pub struct SystemInvoker {
    inner: Arc<dyn Invoker>,
    gate: UserSystemGate,
    handle: Handle,
}

impl SystemInvoker {
    pub(crate) fn new(inner: Arc<dyn Invoker>, gate: UserSystemGate, handle: Handle) -> Self {
        Self {
            inner,
            gate,
            handle,
        }
    }
}

impl Invoker for SystemInvoker {
    fn invoke(&self, task: Task) {
        let guard = self.gate.announce_system();
        let gate = self.gate.clone();
        let inner = Arc::clone(&self.inner);

        self.handle.spawn(async move {
            gate.users_drained().await;
            inner.invoke(Box::new(move || {
                let _guard = guard;
                task();
            }));
        });
    }
}
