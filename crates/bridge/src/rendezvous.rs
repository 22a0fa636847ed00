//! Cross-thread handoff from event callbacks to blocked callers
//!
//! Engine events arrive on the engine's dispatch thread while the caller is
//! parked in `wait` or `iter`. Every such handoff goes through one of the two
//! primitives here:
//!
//! - [`Rendezvous`]: a single value; the first `resolve` wins.
//! - [`Mailbox`]: an ordered queue that can be closed by the receiver.
//!
//! Both wake a blocked receiver when its scope is cancelled, and prefer a
//! delivered value over a cancellation that races with it.

use idbind_core::{CancelReason, Error, Result, Scope};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;

struct Shared<S> {
    state: Mutex<S>,
    cond: Condvar,
}

trait Cancellable {
    fn cancelled(&mut self) -> &mut Option<CancelReason>;
}

/// Park on `shared` until `poll` yields a value or `scope` ends.
fn block_on<S, T>(
    shared: &Arc<Shared<S>>,
    scope: &Scope,
    mut poll: impl FnMut(&mut S) -> Option<T>,
) -> Result<T>
where
    S: Cancellable + Send + 'static,
{
    let target = Arc::clone(shared);
    let hook = scope.on_cancel(move |reason| {
        let mut state = target.state.lock();
        state.cancelled().get_or_insert(reason);
        target.cond.notify_all();
    });

    let outcome = (|| {
        let mut state: MutexGuard<'_, S> = shared.state.lock();
        loop {
            if let Some(value) = poll(&mut state) {
                return Ok(value);
            }
            if let Some(reason) = state.cancelled().take() {
                return Err(Error::Cancelled(reason));
            }
            match scope.deadline() {
                Some(deadline) => {
                    if shared.cond.wait_until(&mut state, deadline).timed_out() {
                        // Runs the hook above, which needs the lock
                        MutexGuard::unlocked(&mut state, || {
                            scope.expire_if_due();
                        });
                    }
                }
                None => shared.cond.wait(&mut state),
            }
        }
    })();

    if let Some(hook) = hook {
        scope.remove_hook(hook);
    }
    outcome
}

// ============================================================================
// Rendezvous
// ============================================================================

struct SlotState<T> {
    value: Option<T>,
    resolved: bool,
    cancelled: Option<CancelReason>,
}

impl<T> Cancellable for SlotState<T> {
    fn cancelled(&mut self) -> &mut Option<CancelReason> {
        &mut self.cancelled
    }
}

/// Single-value handoff; the first `resolve` wins
pub(crate) struct Rendezvous<T> {
    shared: Arc<Shared<SlotState<T>>>,
}

impl<T> Clone for Rendezvous<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Rendezvous<T> {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SlotState {
                    value: None,
                    resolved: false,
                    cancelled: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Deliver the value. Returns false if a value was already delivered.
    pub(crate) fn resolve(&self, value: T) -> bool {
        let mut state = self.shared.state.lock();
        if state.resolved {
            return false;
        }
        state.resolved = true;
        state.value = Some(value);
        self.shared.cond.notify_all();
        true
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.shared.state.lock().resolved
    }

    /// Block until resolved or `scope` ends
    pub(crate) fn wait(self, scope: &Scope) -> Result<T> {
        block_on(&self.shared, scope, |state| state.value.take())
    }
}

// ============================================================================
// Mailbox
// ============================================================================

struct MailboxState<T> {
    queue: VecDeque<T>,
    closed: bool,
    cancelled: Option<CancelReason>,
}

impl<T> Cancellable for MailboxState<T> {
    fn cancelled(&mut self) -> &mut Option<CancelReason> {
        &mut self.cancelled
    }
}

/// Ordered multi-value handoff with a single receiver
pub(crate) struct Mailbox<T> {
    shared: Arc<Shared<MailboxState<T>>>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Mailbox<T> {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MailboxState {
                    queue: VecDeque::new(),
                    closed: false,
                    cancelled: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Enqueue an item; hands it back if the receiver has closed the mailbox
    pub(crate) fn push(&self, item: T) -> std::result::Result<(), T> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(item);
        }
        state.queue.push_back(item);
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Block until an item arrives or `scope` ends
    pub(crate) fn recv(&self, scope: &Scope) -> Result<T> {
        block_on(&self.shared, scope, |state| state.queue.pop_front())
    }

    /// Refuse further items and drop the queued ones
    pub(crate) fn close(&self) {
        let drained: Vec<T> = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.queue.drain(..).collect()
        };
        // Dropped outside the lock; items may run code on drop
        drop(drained);
    }
}
