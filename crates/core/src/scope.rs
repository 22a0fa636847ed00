//! Cancellation scopes for blocking calls
//!
//! A [`Scope`] is passed into every blocking bridge call (`wait`, `iter`).
//! It is cancelled either explicitly through the [`CancelGuard`] returned when
//! it was created, or when its deadline passes. Cancelling a scope cancels all
//! scopes derived from it.
//!
//! Code that holds resources for the lifetime of a scope (listener
//! registrations, pending waits) registers an `on_cancel` hook and removes it
//! again when it finishes first.
//!
//! # Example
//!
//! ```
//! use idbind_core::Scope;
//! use std::time::Duration;
//!
//! let (scope, guard) = Scope::background().with_timeout(Duration::from_secs(5));
//! assert!(!scope.is_cancelled());
//! guard.cancel();
//! assert!(scope.is_cancelled());
//! ```

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// Why a scope ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Cancelled explicitly
    Cancelled,
    /// The deadline passed
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => write!(f, "scope cancelled"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Identifies a registered cancellation hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HookId(u64);

type Hook = Box<dyn FnOnce(CancelReason) + Send>;

struct ScopeState {
    reason: Option<CancelReason>,
    hooks: BTreeMap<HookId, Hook>,
    next_hook: u64,
}

struct ScopeInner {
    state: Mutex<ScopeState>,
    cond: Condvar,
    deadline: Option<Instant>,
}

/// Cancellation and deadline context for blocking calls
///
/// Cheap to clone; clones observe the same cancellation.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("deadline", &self.inner.deadline)
            .field("cancelled", &self.cancelled())
            .finish()
    }
}

impl Scope {
    fn with_parts(deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                state: Mutex::new(ScopeState {
                    reason: None,
                    hooks: BTreeMap::new(),
                    next_hook: 0,
                }),
                cond: Condvar::new(),
                deadline,
            }),
        }
    }

    /// A scope that is never cancelled on its own
    pub fn background() -> Self {
        Self::with_parts(None)
    }

    /// Derive a child scope that can be cancelled independently
    pub fn with_cancel(&self) -> (Scope, CancelGuard) {
        self.derive(self.inner.deadline)
    }

    /// Derive a child scope that is cancelled after `timeout`
    pub fn with_timeout(&self, timeout: Duration) -> (Scope, CancelGuard) {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child scope that is cancelled at `deadline`.
    ///
    /// The child's deadline is the earlier of `deadline` and the parent's.
    pub fn with_deadline(&self, deadline: Instant) -> (Scope, CancelGuard) {
        let effective = match self.inner.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        let (child, guard) = self.derive(Some(effective));
        if self.inner.deadline != Some(effective) {
            child.spawn_deadline_watcher(effective);
        }
        (child, guard)
    }

    fn derive(&self, deadline: Option<Instant>) -> (Scope, CancelGuard) {
        let child = Scope::with_parts(deadline);
        let weak = Arc::downgrade(&child.inner);
        let hook = self.on_cancel(move |reason| {
            if let Some(inner) = weak.upgrade() {
                Scope { inner }.cancel_with(reason);
            }
        });
        if let Some(hook) = hook {
            let parent = self.clone();
            // Unlink from the parent once the child ends on its own
            child.on_cancel(move |_| parent.remove_hook(hook));
        }
        let guard = CancelGuard {
            handle: CancelHandle {
                scope: child.clone(),
            },
            armed: true,
        };
        (child, guard)
    }

    fn spawn_deadline_watcher(&self, deadline: Instant) {
        let weak = Arc::downgrade(&self.inner);
        let spawned = thread::Builder::new()
            .name("idbind-deadline".to_string())
            .spawn(move || loop {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let mut state = inner.state.lock();
                if state.reason.is_some() {
                    return;
                }
                if Instant::now() >= deadline {
                    drop(state);
                    Scope { inner }.cancel_with(CancelReason::DeadlineExceeded);
                    return;
                }
                // Wake periodically so a dropped scope does not pin this thread
                let wake = deadline.min(Instant::now() + Duration::from_millis(250));
                inner.cond.wait_until(&mut state, wake);
            });
        if let Err(e) = spawned {
            warn!(target: "idbind::scope", error = %e, "Failed to spawn deadline watcher; deadline is enforced lazily");
        }
    }

    /// The reason this scope ended, or `None` while it is live.
    ///
    /// A passed deadline is reported (and applied) even if the watcher has
    /// not fired yet.
    pub fn cancelled(&self) -> Option<CancelReason> {
        if let Some(reason) = self.inner.state.lock().reason {
            return Some(reason);
        }
        if self.expire_if_due() {
            return Some(CancelReason::DeadlineExceeded);
        }
        None
    }

    /// Whether this scope has ended
    pub fn is_cancelled(&self) -> bool {
        self.cancelled().is_some()
    }

    /// The deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Cancel the scope if its deadline has passed. Returns true if it did.
    pub fn expire_if_due(&self) -> bool {
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.cancel_with(CancelReason::DeadlineExceeded);
                true
            }
            _ => false,
        }
    }

    /// Block until the scope ends
    pub fn wait(&self) -> CancelReason {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(reason) = state.reason {
                return reason;
            }
            match self.inner.deadline {
                Some(deadline) => {
                    if self.inner.cond.wait_until(&mut state, deadline).timed_out()
                        && state.reason.is_none()
                    {
                        drop(state);
                        self.cancel_with(CancelReason::DeadlineExceeded);
                        return self.cancelled().unwrap_or(CancelReason::DeadlineExceeded);
                    }
                }
                None => self.inner.cond.wait(&mut state),
            }
        }
    }

    /// Register `hook` to run once when the scope ends.
    ///
    /// If the scope has already ended the hook runs immediately on the calling
    /// thread and `None` is returned.
    pub fn on_cancel<F>(&self, hook: F) -> Option<HookId>
    where
        F: FnOnce(CancelReason) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if let Some(reason) = state.reason {
            drop(state);
            hook(reason);
            return None;
        }
        let id = HookId(state.next_hook);
        state.next_hook += 1;
        state.hooks.insert(id, Box::new(hook));
        Some(id)
    }

    /// Remove a hook that has not run yet. Unknown ids are ignored.
    pub fn remove_hook(&self, id: HookId) {
        let removed = self.inner.state.lock().hooks.remove(&id);
        drop(removed);
    }

    pub(crate) fn cancel_with(&self, reason: CancelReason) {
        let hooks = {
            let mut state = self.inner.state.lock();
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(reason);
            self.inner.cond.notify_all();
            std::mem::take(&mut state.hooks)
        };
        // Hooks run without the lock held; they may touch this scope again
        for (_, hook) in hooks {
            hook(reason);
        }
    }
}

/// Cloneable handle that cancels a scope
#[derive(Clone)]
pub struct CancelHandle {
    scope: Scope,
}

impl CancelHandle {
    /// Cancel the scope and every scope derived from it
    pub fn cancel(&self) {
        self.scope.cancel_with(CancelReason::Cancelled);
    }

    /// The scope this handle cancels
    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

/// Owns a derived scope; cancels it when dropped
pub struct CancelGuard {
    handle: CancelHandle,
    armed: bool,
}

impl CancelGuard {
    /// Cancel now instead of on drop
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// A cloneable handle for cancelling from elsewhere
    pub fn handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    /// Disarm the guard; the scope lives until cancelled through the handle
    /// or its parent.
    pub fn into_handle(mut self) -> CancelHandle {
        self.armed = false;
        self.handle.clone()
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.handle.cancel();
        }
    }
}
