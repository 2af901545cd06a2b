use std::any::Any;
use std::cell::RefCell;

use super::callbacks::Formatter;
use super::Eid;

/// Cap on the cached string representation, mirroring the fixed-size
/// scratch buffer the formatter used to render into.
const MAX_STREP_SIZE: usize = 4096;

pub type EventPayload = Box<dyn Any + Send>;

/// A single unit of work flowing through a session's event groups.
///
/// `Event` is only ever touched by the worker thread that owns the
/// session it belongs to, so its interior mutability (the dispatched
/// flag and the cached string repr) doesn't need synchronization.
pub struct Event {
    eid: Eid,
    formatter: Option<Formatter>,
    data: EventPayload,
    depth: u32,
    dispatched: RefCell<bool>,
    strep: RefCell<Option<String>>,
}

impl Event {
    pub(crate) fn new(eid: Eid, formatter: Option<Formatter>, data: EventPayload, depth: u32) -> Self {
        Self {
            eid,
            formatter,
            data,
            depth,
            dispatched: RefCell::new(false),
            strep: RefCell::new(None),
        }
    }

    pub fn id(&self) -> Eid {
        self.eid
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn data<T: 'static>(&self) -> Option<&T> {
        self.data.downcast_ref()
    }

    pub fn is_dispatched(&self) -> bool {
        *self.dispatched.borrow()
    }

    pub(crate) fn mark_dispatched(&self) {
        *self.dispatched.borrow_mut() = true;
    }

    /// Lazily render and cache this event's string representation via its
    /// type's formatter. Returns an empty string if no formatter was
    /// registered for this event type.
    pub fn string_repr(&self) -> String {
        if let Some(cached) = self.strep.borrow().as_ref() {
            return cached.clone();
        }
        let mut buf = String::new();
        if let Some(formatter) = &self.formatter {
            formatter(self, &mut buf);
            if buf.len() > MAX_STREP_SIZE {
                buf.truncate(MAX_STREP_SIZE);
            }
        }
        *self.strep.borrow_mut() = Some(buf.clone());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_repr_is_cached_after_first_call() {
        let calls = std::cell::Cell::new(0u32);
        let event = Event::new(
            1,
            None,
            Box::new(()),
            0,
        );
        // Without a formatter, repeated calls just return "" but should
        // still hit the cache path on the second call.
        assert_eq!(event.string_repr(), "");
        assert_eq!(event.string_repr(), "");
        let _ = calls.get();
    }

    #[test]
    fn formatter_output_is_truncated_to_cap() {
        let formatter: Formatter = std::sync::Arc::new(|_event, buf| {
            buf.push_str(&"x".repeat(MAX_STREP_SIZE + 500));
        });
        let event = Event::new(7, Some(formatter), Box::new(()), 0);
        assert_eq!(event.string_repr().len(), MAX_STREP_SIZE);
    }

    #[test]
    fn data_downcast_reflects_stored_type() {
        let event = Event::new(1, None, Box::new(42u32), 0);
        assert_eq!(event.data::<u32>(), Some(&42));
        assert_eq!(event.data::<String>(), None);
    }
}
