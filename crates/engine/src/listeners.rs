//! Per-handle listener registry

use idbind_core::{DomException, EngineResult, Event, EventKind, Listener, ListenerId};
use parking_lot::Mutex;

#[derive(Default)]
struct Registry {
    next_id: ListenerId,
    entries: Vec<(ListenerId, EventKind, Listener)>,
    sealed: bool,
}

/// Listeners attached to one engine object
#[derive(Default)]
pub(crate) struct ListenerSet {
    registry: Mutex<Registry>,
}

impl ListenerSet {
    pub(crate) fn add(&self, kind: EventKind, listener: Listener) -> EngineResult<ListenerId> {
        let mut registry = self.registry.lock();
        if registry.sealed {
            return Err(DomException::invalid_state(
                "the connection is closed and accepts no listeners",
            ));
        }
        registry.next_id += 1;
        let id = registry.next_id;
        registry.entries.push((id, kind, listener));
        Ok(id)
    }

    pub(crate) fn remove(&self, kind: EventKind, id: ListenerId) {
        self.registry
            .lock()
            .entries
            .retain(|(entry_id, entry_kind, _)| !(*entry_id == id && *entry_kind == kind));
    }

    /// Refuse further listeners; attached ones stay
    pub(crate) fn seal(&self) {
        self.registry.lock().sealed = true;
    }

    /// Invoke every listener for `event.kind`, in attach order, with no lock
    /// held
    pub(crate) fn fire(&self, event: &Event) {
        let matching: Vec<Listener> = self
            .registry
            .lock()
            .entries
            .iter()
            .filter(|(_, kind, _)| *kind == event.kind)
            .map(|(_, _, listener)| Listener::clone(listener))
            .collect();
        for listener in matching {
            listener(event);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }
}
