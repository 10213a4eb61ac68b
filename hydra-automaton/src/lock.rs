//! User/system concurrency gate.
//!
//! User slots are taken by ordinary mutation-driven work and never wait: if a
//! system acquisition is pending or held, the user acquisition fails and the
//! caller drops its work. A system acquisition announces itself first, which
//! shuts out new user slots, then waits for the running ones to drain.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

#[derive(Default)]
struct GateState {
    user: AtomicUsize,
    system: AtomicUsize,
    user_drained: Notify,
}

/// Writer-preferring gate between user work and exclusive system work.
///
/// Cloning yields another handle to the same gate.
#[derive(Clone, Default)]
pub struct UserSystemGate {
    state: Arc<GateState>,
}

impl UserSystemGate {
    /// Create an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a user slot unless system work is pending or running.
    pub fn try_acquire_user(&self) -> Option<UserGuard> {
        let state = &self.state;
        if state.system.load(Ordering::SeqCst) != 0 {
            return None;
        }

        state.user.fetch_add(1, Ordering::SeqCst);
        if state.system.load(Ordering::SeqCst) != 0 {
            release_user(state);
            return None;
        }

        Some(UserGuard {
            state: Arc::clone(state),
        })
    }

    /// Take a system slot, spinning until no user slot is held.
    ///
    /// Intended for short waits on threads that may block. Async callers use
    /// [`UserSystemGate::acquire_system_async`].
    pub fn acquire_system(&self) -> SystemGuard {
        let guard = self.announce_system();
        while self.state.user.load(Ordering::SeqCst) != 0 {
            std::hint::spin_loop();
        }
        guard
    }

    /// Take a system slot, yielding to the runtime until no user slot is
    /// held.
    pub async fn acquire_system_async(&self) -> SystemGuard {
        let guard = self.announce_system();
        self.users_drained().await;
        guard
    }

    /// Take a system slot without waiting. New user acquisitions fail from
    /// this point on; running ones may still be in flight.
    pub(crate) fn announce_system(&self) -> SystemGuard {
        self.state.system.fetch_add(1, Ordering::SeqCst);
        SystemGuard {
            state: Arc::clone(&self.state),
        }
    }

    /// Resolve once no user slot is held.
    pub(crate) async fn users_drained(&self) {
        loop {
            let drained = self.state.user_drained.notified();
            tokio::pin!(drained);
            // Register before checking so a release in between is not lost.
            drained.as_mut().enable();
            if self.state.user.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Number of user slots held.
    pub fn user_count(&self) -> usize {
        self.state.user.load(Ordering::SeqCst)
    }

    /// Number of system slots held or pending.
    pub fn system_count(&self) -> usize {
        self.state.system.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for UserSystemGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSystemGate")
            .field("user", &self.user_count())
            .field("system", &self.system_count())
            .finish()
    }
}

fn release_user(state: &GateState) {
    if state.user.fetch_sub(1, Ordering::SeqCst) == 1 {
        state.user_drained.notify_waiters();
    }
}

/// A held user slot, released on drop.
#[must_use = "the slot is released when the guard is dropped"]
pub struct UserGuard {
    state: Arc<GateState>,
}

impl Drop for UserGuard {
    fn drop(&mut self) {
        release_user(&self.state);
    }
}

/// A held system slot, released on drop.
#[must_use = "the slot is released when the guard is dropped"]
pub struct SystemGuard {
    state: Arc<GateState>,
}

impl Drop for SystemGuard {
    fn drop(&mut self) {
        self.state.system.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn user_slots_are_shared() {
        let gate = UserSystemGate::new();
        let a = gate.try_acquire_user().unwrap();
        let b = gate.try_acquire_user().unwrap();
        assert_eq!(gate.user_count(), 2);
        drop(a);
        drop(b);
        assert_eq!(gate.user_count(), 0);
    }

    #[test]
    fn system_slot_blocks_users() {
        let gate = UserSystemGate::new();
        let system = gate.acquire_system();
        assert!(gate.try_acquire_user().is_none());
        assert_eq!(gate.user_count(), 0);
        drop(system);
        assert!(gate.try_acquire_user().is_some());
    }

    #[test]
    fn system_waits_for_running_users() {
        let gate = UserSystemGate::new();
        let user = gate.try_acquire_user().unwrap();

        let waiter = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                let _system = gate.acquire_system();
                gate.user_count()
            })
        };

        while gate.system_count() == 0 {
            std::thread::yield_now();
        }
        assert!(gate.try_acquire_user().is_none());

        std::thread::sleep(Duration::from_millis(10));
        drop(user);
        assert_eq!(waiter.join().unwrap(), 0);
    }

    #[tokio::test]
    async fn async_system_waits_for_release() {
        let gate = UserSystemGate::new();
        let user = gate.try_acquire_user().unwrap();

        let task = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _system = gate.acquire_system_async().await;
                gate.user_count()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());
        drop(user);
        assert_eq!(task.await.unwrap(), 0);
    }
}
