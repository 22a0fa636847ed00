//! Event listener adapter
//!
//! [`listen`] attaches one callback for one event kind on an engine handle and
//! ties its lifetime to a [`Scope`]: when the scope ends the callback is
//! detached. Detaching is guarded by a single compare-and-swap, so when the
//! event firing and the scope ending race, exactly one path performs the
//! detach and the callback never runs after it.

use idbind_core::{
    EngineResult, Error, Event, EventKind, EventTarget, HookId, Listener, Result, Scope,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

type Detach = Box<dyn Fn() -> EngineResult<()> + Send + Sync>;

/// One attached listener
pub struct Registration {
    kind: EventKind,
    released: Arc<AtomicBool>,
    detach: Detach,
    scope: Scope,
    hook: Mutex<Option<HookId>>,
}

impl Registration {
    /// Detach the listener. Returns true for the call that performed the
    /// detach, false for every later call.
    pub fn release(&self) -> bool {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        match (self.detach)() {
            Ok(()) => trace!(target: "idbind::listener", event = %self.kind, "Listener detached"),
            Err(e) => {
                warn!(target: "idbind::listener", event = %self.kind, error = %e, "Failed to detach listener")
            }
        }
        if let Some(hook) = self.hook.lock().take() {
            self.scope.remove_hook(hook);
        }
        true
    }

    /// Whether the listener has been detached
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// The event kind this registration listens for
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("kind", &self.kind)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Attach `on_event` to `kind` events on `target` for the lifetime of `scope`.
///
/// # Errors
///
/// Returns `Error::Cancelled` if `scope` already ended, or the engine's error
/// if it refuses the listener. Nothing stays attached in either case.
pub fn listen<T, F>(
    scope: &Scope,
    target: &Arc<T>,
    kind: EventKind,
    on_event: F,
) -> Result<Arc<Registration>>
where
    T: EventTarget + ?Sized + 'static,
    F: Fn(&Event) + Send + Sync + 'static,
{
    if let Some(reason) = scope.cancelled() {
        return Err(Error::Cancelled(reason));
    }

    let released = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&released);
    let trampoline: Listener = Arc::new(move |event: &Event| {
        if !gate.load(Ordering::Acquire) {
            on_event(event);
        }
    });
    let id = target.add_event_listener(kind, trampoline)?;

    let handle = Arc::clone(target);
    let registration = Arc::new(Registration {
        kind,
        released,
        detach: Box::new(move || handle.remove_event_listener(kind, id)),
        scope: scope.clone(),
        hook: Mutex::new(None),
    });

    let on_cancel = Arc::clone(&registration);
    let hook = scope.on_cancel(move |_| {
        on_cancel.release();
    });
    *registration.hook.lock() = hook;
    // The scope may have ended between registering the hook and storing it
    if registration.is_released() {
        if let Some(hook) = registration.hook.lock().take() {
            scope.remove_hook(hook);
        }
    }
    Ok(registration)
}
