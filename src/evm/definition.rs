use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::callbacks::{
    Formatter, ListenerCallback, ListenerDestroyCallback, UserData,
};
use super::Eid;

/// One listener registered against an event type.
///
/// `removed` is the logical-delete tag described in the design notes: a
/// listener is never unlinked at `remove_listener` time, only marked, so
/// any in-flight dispatch walking the list at that moment still sees a
/// consistent (if stale) view. The maintenance sweep performs the actual
/// unlink-and-destroy pass.
pub struct Listener {
    eid: Eid,
    callback: ListenerCallback,
    destroy_cb: Option<ListenerDestroyCallback>,
    user: UserData,
    removed: AtomicBool,
}

impl Listener {
    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub(crate) fn callback(&self) -> &ListenerCallback {
        &self.callback
    }

    pub(crate) fn user(&self) -> &UserData {
        &self.user
    }

    pub(crate) fn destroy(&self) {
        if let Some(cb) = &self.destroy_cb {
            cb(self.eid, &self.user);
        }
    }
}

/// Opaque handle returned by [`super::Context::add_listener`]. Dropping it
/// does not remove the listener; call [`ListenerHandle::remove`] (or
/// [`super::Context::remove_listener`]) explicitly, matching the
/// original's separate `evm_remove_listener` call.
#[derive(Clone)]
pub struct ListenerHandle(pub(crate) Arc<Listener>);

impl ListenerHandle {
    /// Logically remove this listener. It stops being invoked by new
    /// dispatches immediately; it is physically unlinked and its destroy
    /// callback invoked on the next maintenance sweep.
    pub fn remove(&self) {
        self.0.removed.store(true, Ordering::SeqCst);
    }

    pub fn event_id(&self) -> Eid {
        self.0.eid
    }
}

/// Registry entry for one event type: its id, optional string formatter,
/// and the list of listeners registered against it.
pub struct Definition {
    pub(crate) eid: Eid,
    pub(crate) formatter: Option<Formatter>,
    pub(crate) listeners: Mutex<Vec<Arc<Listener>>>,
}

impl Definition {
    pub(crate) fn new(eid: Eid, formatter: Option<Formatter>) -> Self {
        Self {
            eid,
            formatter,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Add a listener. Callers must already hold the context's listener
    /// read lock; this just does the (cheap, uncontended in practice)
    /// push into this definition's own list.
    pub(crate) fn add_listener(
        &self,
        cb: ListenerCallback,
        destroy_cb: Option<ListenerDestroyCallback>,
        user: UserData,
    ) -> Arc<Listener> {
        let listener = Arc::new(Listener {
            eid: self.eid,
            callback: cb,
            destroy_cb,
            user,
            removed: AtomicBool::new(false),
        });
        self.listeners.lock().unwrap().push(listener.clone());
        listener
    }

    /// Physically drop every listener marked `removed`, returning them so
    /// the caller can invoke their destroy callbacks outside of the
    /// context's write lock.
    pub(crate) fn sweep_removed(&self) -> Vec<Arc<Listener>> {
        let mut listeners = self.listeners.lock().unwrap();
        let mut dead = Vec::new();
        listeners.retain(|l| {
            if l.is_removed() {
                dead.push(l.clone());
                false
            } else {
                true
            }
        });
        dead
    }
}
