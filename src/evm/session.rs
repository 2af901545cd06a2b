use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::callbacks::{EventDestroyCallback, SessionCallback, UserData};
use super::context::Context;
use super::event::{Event, EventPayload};
use super::Eid;

/// Why a session callback is being invoked.
pub enum SessionReason<'a> {
    /// A listener for `event` just ran and returned `value`.
    ListenerResult { event: &'a Event, value: bool },
    /// Every listener for `event` has run. Setting `halt` suppresses
    /// dispatch of any event group deeper than `depth`.
    EventComplete {
        event: &'a Event,
        depth: u32,
        halt: &'a Cell<bool>,
    },
    /// The session is about to be destroyed; no more events remain.
    SessionDestroy,
}

pub(crate) struct GroupData {
    pub(crate) depth: u32,
    pub(crate) events: VecDeque<(Event, Option<(EventDestroyCallback, UserData)>)>,
}

pub(crate) struct SessionData {
    pub(crate) id: u64,
    pub(crate) groups: VecDeque<GroupData>,
    pub(crate) session_cb: Option<SessionCallback>,
    pub(crate) user: UserData,
}

impl SessionData {
    pub(crate) fn back_group_depth(&self) -> u32 {
        self.groups.back().map(|g| g.depth).unwrap_or(0)
    }
}

/// Opaque identifier for a session, returned by
/// [`Context::start_session`] and accepted by
/// [`Context::cancel_session`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SessionHandle(pub(crate) u64);

pub(crate) static SESSION_IDS: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_session_id() -> u64 {
    SESSION_IDS.fetch_add(1, Ordering::Relaxed)
}

/// A session as seen from inside a listener or session callback: a
/// handle onto the in-flight session data plus enough context to look up
/// event-type definitions for [`Session::append`].
///
/// `Session` wraps an `Rc`, not an `Arc`: it only ever exists on the
/// worker thread currently processing the session, so there is no need
/// to pay for atomic refcounting or to make it `Send`.
#[derive(Clone)]
pub struct Session {
    pub(crate) data: Rc<RefCell<SessionData>>,
    pub(crate) ctx: Context,
}

impl Session {
    pub fn id(&self) -> SessionHandle {
        SessionHandle(self.data.borrow().id)
    }

    /// Append a new event to the tail event group (i.e. the group one
    /// depth deeper than whatever is currently being dispatched). Returns
    /// `false` if `eid` was never registered via
    /// [`Context::register_type`].
    pub fn append(
        &self,
        eid: Eid,
        data: EventPayload,
        destroy_cb: Option<EventDestroyCallback>,
        user: UserData,
    ) -> bool {
        let Some(def) = self.ctx.find_def(eid) else {
            return false;
        };
        let mut session = self.data.borrow_mut();
        let depth = session.back_group_depth();
        let event = Event::new(eid, def.formatter.clone(), data, depth);
        if session.groups.is_empty() {
            session.groups.push_back(GroupData {
                depth,
                events: VecDeque::new(),
            });
        }
        session
            .groups
            .back_mut()
            .unwrap()
            .events
            .push_back((event, destroy_cb.map(|cb| (cb, user))));
        true
    }
}
