//! Cancellation tokens
//!
//! A [`CancellationToken`] is handed to each call that should die with its
//! host. The host decides when to fire it (a Ctrl-C handler, a service stop
//! hook, a parent task being dropped). Firing runs the call's
//! [`ShutdownHandler`] against every process still registered with the token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, warn};

use crate::process::{KillReason, ProcessHandle};

/// What to do with a registered process when its token fires.
pub trait ShutdownHandler: Send + Sync {
    fn shutdown(&self, process: &ProcessHandle);
}

/// Default handler: forcibly terminate the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct DestroyProcess;

impl ShutdownHandler for DestroyProcess {
    fn shutdown(&self, process: &ProcessHandle) {
        match process.kill(KillReason::Cancelled) {
            Ok(true) => warn!(pid = process.id(), program = %process.program(), "Cancelled running process"),
            Ok(false) => {}
            Err(err) => warn!(pid = process.id(), error = %err, "Failed to cancel process"),
        }
    }
}

struct Registration {
    process: Weak<ProcessHandle>,
    handler: Arc<dyn ShutdownHandler>,
}

#[derive(Default)]
struct TokenState {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    hooks: Mutex<HashMap<u64, Registration>>,
}

impl TokenState {
    fn hooks(&self) -> MutexGuard<'_, HashMap<u64, Registration>> {
        self.hooks.lock().unwrap_or_else(|poisoned| {
            warn!("Cancellation registry poisoned; continuing with recovered state");
            PoisonError::into_inner(poisoned)
        })
    }
}

/// Cloneable cancellation signal shared by a host and the calls it starts.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token.
    ///
    /// Every process currently registered is handed to its shutdown handler.
    /// Calls registered afterwards are refused before spawning. Firing twice
    /// is harmless.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);

        // Snapshot under the lock, run handlers outside it
        let targets: Vec<(Arc<ProcessHandle>, Arc<dyn ShutdownHandler>)> = self
            .state
            .hooks()
            .values()
            .filter_map(|reg| reg.process.upgrade().map(|p| (p, Arc::clone(&reg.handler))))
            .collect();

        debug!(processes = targets.len(), "Cancellation token fired");
        for (process, handler) in targets {
            handler.shutdown(&process);
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Number of processes currently registered.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.state.hooks().len()
    }

    /// Register `process`; the returned guard deregisters it when dropped.
    ///
    /// If the token fires between the caller's pre-spawn check and this
    /// registration, the handler runs immediately.
    pub fn register(
        &self,
        process: &Arc<ProcessHandle>,
        handler: Arc<dyn ShutdownHandler>,
    ) -> HookGuard {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        self.state.hooks().insert(
            id,
            Registration {
                process: Arc::downgrade(process),
                handler: Arc::clone(&handler),
            },
        );

        if self.is_cancelled() {
            handler.shutdown(process);
        }

        HookGuard {
            state: Arc::clone(&self.state),
            id,
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Keeps a process registered with a token until dropped.
#[must_use = "dropping the guard deregisters the process immediately"]
pub struct HookGuard {
    state: Arc<TokenState>,
    id: u64,
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        if self.state.hooks().remove(&self.id).is_none() {
            debug!(id = self.id, "Cancellation hook already removed");
        }
    }
}
