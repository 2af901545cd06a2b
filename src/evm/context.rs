use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace, warn};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use super::callbacks::{
    EventDestroyCallback, Formatter, ListenerCallback, ListenerDestroyCallback, SessionCallback,
    UserData,
};
use super::definition::{Definition, Listener, ListenerHandle};
use super::event::EventPayload;
use super::session::{
    next_session_id, GroupData, Session, SessionData, SessionHandle, SessionReason,
};
use super::Eid;

/// Minimum worker pool size; `initialize` silently clamps a requested
/// count of zero up to this, since a context with no workers could never
/// make progress.
const MIN_WORKERS: usize = 1;

struct ContextInner {
    defs: RwLock<Vec<Arc<Definition>>>,
    /// Guards listener-list mutation: readers (dispatch, add_listener)
    /// take the read side; the maintenance sweep takes the write side
    /// before physically unlinking removed listeners. Holding the write
    /// lock during reclamation is what makes it sound to free a listener
    /// object the moment it's unlinked -- no reader can be mid-traversal
    /// while the writer holds it.
    listener_lock: RwLock<()>,
    queue: Mutex<VecDeque<Box<SessionData>>>,
    consumer: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    mfreq: Duration,
    shutdown: AtomicBool,
}

/// Event manager context: owns a worker pool, a maintenance thread, the
/// event-type registry, and the session FIFO feeding the workers.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

static SINGLETON: OnceCell<Context> = OnceCell::new();

impl Context {
    /// Create a new, independent context with `nworkers` worker threads
    /// (clamped to at least one) and a maintenance sweep every `mfreq`.
    pub fn initialize(nworkers: usize, mfreq: Duration) -> Context {
        let nworkers = nworkers.max(MIN_WORKERS);
        let inner = Arc::new(ContextInner {
            defs: RwLock::new(Vec::new()),
            listener_lock: RwLock::new(()),
            queue: Mutex::new(VecDeque::new()),
            consumer: Condvar::new(),
            workers: Mutex::new(Vec::new()),
            maintenance: Mutex::new(None),
            mfreq,
            shutdown: AtomicBool::new(false),
        });
        let ctx = Context { inner };

        let mut workers = ctx.inner.workers.lock().unwrap();
        for idx in 0..nworkers {
            let worker_ctx = ctx.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("evm-worker-{idx}"))
                    .spawn(move || worker_ctx.worker_loop())
                    .expect("failed to spawn evm worker thread"),
            );
        }
        drop(workers);

        let maint_ctx = ctx.clone();
        *ctx.inner.maintenance.lock().unwrap() = Some(
            thread::Builder::new()
                .name("evm-maintenance".to_string())
                .spawn(move || maint_ctx.maintenance_loop())
                .expect("failed to spawn evm maintenance thread"),
        );

        ctx
    }

    /// The process-wide context, created on first access with a small
    /// default worker pool. Call [`Context::initialize`] directly instead
    /// if a caller needs non-default sizing; the singleton exists for
    /// callers that just want "the" event manager without threading a
    /// context through everywhere.
    pub fn singleton() -> Context {
        SINGLETON
            .get_or_init(|| Context::initialize(4, Duration::from_secs(30)))
            .clone()
    }

    /// Derive a stable event-type id from its name via DJB2.
    pub fn generate_eid(name: &str) -> Eid {
        crate::primitives::strid(name.as_bytes())
    }

    pub fn register_type(&self, eid: Eid, formatter: Option<Formatter>) -> bool {
        if self.find_def(eid).is_some() {
            return false;
        }
        let mut defs = self.inner.defs.write();
        // Re-check under the write lock: two callers could have both
        // passed the read-only fast path above.
        if defs.iter().any(|d| d.eid == eid) {
            return false;
        }
        defs.push(Arc::new(Definition::new(eid, formatter)));
        true
    }

    pub(crate) fn find_def(&self, eid: Eid) -> Option<Arc<Definition>> {
        self.inner
            .defs
            .read()
            .iter()
            .find(|d| d.eid == eid)
            .cloned()
    }

    pub fn add_listener(
        &self,
        eid: Eid,
        cb: ListenerCallback,
        destroy_cb: Option<ListenerDestroyCallback>,
        user: UserData,
    ) -> Option<ListenerHandle> {
        let def = self.find_def(eid)?;
        let _read = self.inner.listener_lock.read();
        let listener = def.add_listener(cb, destroy_cb, user);
        Some(ListenerHandle(listener))
    }

    pub fn remove_listener(&self, handle: &ListenerHandle) {
        let _read = self.inner.listener_lock.read();
        handle.remove();
    }

    /// Start a new session seeded with `initial` events at depth 0. An
    /// empty `initial` is legal: the session is dispatched (trivially,
    /// there is nothing to do) and immediately destroyed, which is enough
    /// for a caller that only wants the `SessionDestroy` callback as a
    /// completion signal.
    ///
    /// Unlike the one-callback-plus-raw-pointer original, every initial
    /// event is supplied up front rather than appended after the fact by
    /// a caller racing a worker thread for the session pointer: once
    /// `start_session` returns, the only way to add more events is from
    /// inside a listener or session callback via [`Session::append`].
    pub fn start_session(
        &self,
        initial: Vec<(Eid, EventPayload, Option<EventDestroyCallback>)>,
        session_cb: Option<SessionCallback>,
        user: UserData,
    ) -> SessionHandle {
        let id = next_session_id();
        let mut groups = VecDeque::new();
        if !initial.is_empty() {
            let mut events = VecDeque::new();
            for (eid, data, destroy_cb) in initial {
                let def = self.find_def(eid);
                let formatter = def.as_ref().and_then(|d| d.formatter.clone());
                let event = super::event::Event::new(eid, formatter, data, 0);
                events.push_back((event, destroy_cb.map(|cb| (cb, user.clone()))));
            }
            groups.push_back(GroupData { depth: 0, events });
        }
        let session = Box::new(SessionData {
            id,
            groups,
            session_cb,
            user,
        });
        self.inner.queue.lock().unwrap().push_back(session);
        self.inner.consumer.notify_one();
        SessionHandle(id)
    }

    /// Cancel a session that hasn't been picked up by a worker yet.
    /// Returns `false` if it was already popped (and is therefore already
    /// being processed, or finished).
    pub fn cancel_session(&self, handle: SessionHandle) -> bool {
        let mut queue = self.inner.queue.lock().unwrap();
        if let Some(pos) = queue.iter().position(|s| s.id == handle.0) {
            let session = queue.remove(pos).unwrap();
            drop(queue);
            self.destroy_session_data(*session);
            true
        } else {
            false
        }
    }

    fn worker_loop(&self) {
        loop {
            let mut queue = self.inner.queue.lock().unwrap();
            while queue.is_empty() && !self.inner.shutdown.load(Ordering::SeqCst) {
                queue = self.inner.consumer.wait(queue).unwrap();
            }
            if self.inner.shutdown.load(Ordering::SeqCst) && queue.is_empty() {
                return;
            }
            let Some(session_data) = queue.pop_front() else {
                continue;
            };
            drop(queue);
            self.process_session(*session_data);
        }
    }

    /// Drain every event group in a session, depth first, dispatching
    /// each event to its type's live listeners. A new, empty group one
    /// depth deeper is pushed before a group's own events are processed,
    /// so that [`Session::append`] calls made from within this group's
    /// listeners land in the correct successor group rather than the one
    /// currently being drained.
    fn process_session(&self, data: SessionData) {
        let session = Session {
            data: Rc::new(RefCell::new(data)),
            ctx: self.clone(),
        };
        let halt = Cell::new(false);

        loop {
            if halt.get() {
                break;
            }
            let all_drained = session.data.borrow().groups.iter().all(|g| g.events.is_empty());
            if all_drained {
                break;
            }
            let depth = session.data.borrow().groups.front().unwrap().depth;
            session.data.borrow_mut().groups.push_back(GroupData {
                depth: depth + 1,
                events: VecDeque::new(),
            });

            loop {
                let next = session.data.borrow_mut().groups.front_mut().unwrap().events.pop_front();
                let Some((event, destroy)) = next else { break };
                event.mark_dispatched();
                self.dispatch_event(&session, &event, depth, &halt);
                if let Some((cb, user)) = destroy {
                    cb(&event, true, &user);
                }
                if halt.get() {
                    break;
                }
            }
            session.data.borrow_mut().groups.pop_front();

            // The successor group just pushed sits alone at the back now.
            // Drop it if Session::append never landed anything there, or
            // the outer loop would spin forever manufacturing one empty
            // group per depth.
            let mut data = session.data.borrow_mut();
            if data.groups.back().map(|g| g.events.is_empty()).unwrap_or(false) {
                data.groups.pop_back();
            }
        }

        // Destroy every remaining group/event (reached only if halted
        // early) and run the session-destroy callback.
        let mut remaining = session.data.borrow_mut();
        while let Some(mut group) = remaining.groups.pop_front() {
            while let Some((event, destroy)) = group.events.pop_front() {
                if let Some((cb, user)) = destroy {
                    cb(&event, event.is_dispatched(), &user);
                }
            }
        }
        if let Some(cb) = remaining.session_cb.clone() {
            let user = remaining.user.clone();
            drop(remaining);
            cb(&session, SessionReason::SessionDestroy, &user);
        }
    }

    fn dispatch_event(
        &self,
        session: &Session,
        event: &super::event::Event,
        depth: u32,
        halt: &Cell<bool>,
    ) {
        let Some(def) = self.find_def(event.id()) else {
            return;
        };
        let session_cb = session.data.borrow().session_cb.clone();
        let user = session.data.borrow().user.clone();

        {
            let _read = self.inner.listener_lock.read();
            let listeners = def.listeners.lock().unwrap().clone();
            for listener in listeners {
                if listener.is_removed() {
                    continue;
                }
                let result = (listener.callback())(session, event, listener.user());
                if let Some(cb) = &session_cb {
                    cb(
                        session,
                        SessionReason::ListenerResult { event, value: result },
                        &user,
                    );
                }
            }
        }

        if let Some(cb) = &session_cb {
            cb(
                session,
                SessionReason::EventComplete { event, depth, halt },
                &user,
            );
        }
    }

    fn destroy_session_data(&self, mut data: SessionData) {
        while let Some(mut group) = data.groups.pop_front() {
            while let Some((event, destroy)) = group.events.pop_front() {
                if let Some((cb, user)) = destroy {
                    cb(&event, event.is_dispatched(), &user);
                }
            }
        }
        if let Some(cb) = data.session_cb.clone() {
            let user = data.user.clone();
            let session = Session {
                data: Rc::new(RefCell::new(data)),
                ctx: self.clone(),
            };
            cb(&session, SessionReason::SessionDestroy, &user);
        }
    }

    fn maintenance_loop(&self) {
        loop {
            thread::park_timeout(self.inner.mfreq);
            if self.inner.shutdown.load(Ordering::SeqCst) {
                return;
            }
            self.sweep_listeners();
        }
    }

    fn sweep_listeners(&self) {
        let defs = self.inner.defs.read().clone();
        let mut dead: Vec<Arc<Listener>> = Vec::new();
        {
            let _write = self.inner.listener_lock.write();
            for def in &defs {
                dead.extend(def.sweep_removed());
            }
        }
        trace!("evm maintenance: reclaimed {} listeners", dead.len());
        for listener in dead {
            listener.destroy();
        }
    }

    /// Stop all workers and the maintenance thread, destroying any
    /// sessions still waiting in the queue.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.consumer.notify_all();
        if let Some(handle) = self.inner.maintenance.lock().unwrap().take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
        let mut workers = self.inner.workers.lock().unwrap();
        for w in workers.drain(..) {
            let _ = w.join();
        }
        let mut queue = self.inner.queue.lock().unwrap();
        for session in queue.drain(..) {
            debug!("evm shutdown: destroying queued session {}", session.id);
            self.destroy_session_data(*session);
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::SeqCst) {
            warn!("evm context dropped without an explicit shutdown() call");
        }
    }
}
