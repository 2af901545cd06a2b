//! Callback type aliases for the event manager.
//!
//! The original C API passed an explicit `void *user` alongside each
//! callback's function pointer. We keep that shape rather than folding
//! `user` into a closure capture: it lets one listener be registered for
//! several event types while sharing a single piece of state, and it
//! keeps the boundary between "what the event carries" and "what the
//! listener brought with it" explicit.

use std::any::Any;
use std::sync::Arc;

use super::event::Event;
use super::session::{Session, SessionReason};
use super::Eid;

/// Type-erased payload a listener or session was registered with.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Produces a human-readable representation of an event's data, used by
/// [`Event::string_repr`].
pub type Formatter = Arc<dyn Fn(&Event, &mut String) + Send + Sync>;

/// Invoked once per live listener when an event in its type is
/// dispatched. Returning `false` does not stop the list walk; it is
/// surfaced to the session callback (if any) as part of
/// [`SessionReason::ListenerResult`].
pub type ListenerCallback = Arc<dyn Fn(&Session, &Event, &UserData) -> bool + Send + Sync>;

/// Invoked by the maintenance sweep once a listener has been physically
/// unlinked, after the read/write lock has already been released.
pub type ListenerDestroyCallback = Arc<dyn Fn(Eid, &UserData) + Send + Sync>;

/// Invoked when an event is destroyed, whether or not it was ever
/// dispatched. `dispatched` tells the callback which happened.
pub type EventDestroyCallback = Arc<dyn Fn(&Event, bool, &UserData) + Send + Sync>;

/// Invoked for session-level milestones: each listener's result, each
/// event's completion (with the chance to halt further depths), and
/// finally session destruction.
pub type SessionCallback = Arc<dyn Fn(&Session, SessionReason<'_>, &UserData) + Send + Sync>;
