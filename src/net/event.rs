//! Listener registries for socket events.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use smallvec::SmallVec;

/// Opaque handle identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHandle(u64);

type Handler<E> = Rc<RefCell<dyn FnMut(&E)>>;

/// An insertion-ordered listener registry.
pub(crate) struct Listeners<E> {
    items: RefCell<Vec<(u64, Handler<E>)>>,
    next_handle: Cell<u64>,
}

impl<E> Listeners<E> {
    pub(crate) fn new() -> Self {
        Self {
            items: RefCell::new(Vec::new()),
            next_handle: Cell::new(0),
        }
    }

    pub(crate) fn on(&self, handler: impl FnMut(&E) + 'static) -> EventHandle {
        let handle = self.next_handle.get();
        self.next_handle.set(handle + 1);

        self.items
            .borrow_mut()
            .push((handle, Rc::new(RefCell::new(handler))));
        EventHandle(handle)
    }

    pub(crate) fn off(&self, handle: EventHandle) -> bool {
        let mut items = self.items.borrow_mut();
        let before = items.len();
        items.retain(|(id, _)| *id != handle.0);
        items.len() != before
    }

    /// Calls every listener in registration order.
    ///
    /// Listeners may register or remove listeners while the emission
    /// runs; the snapshot taken here keeps that safe. A listener whose
    /// own execution triggers a nested emission (closing a socket from
    /// an `End` handler, say) is skipped by that nested emission rather
    /// than re-entered.
    pub(crate) fn emit(&self, event: &E) {
        let snapshot: SmallVec<[Handler<E>; 4]> = self
            .items
            .borrow()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in snapshot {
            if let Ok(mut handler) = handler.try_borrow_mut() {
                (&mut *handler)(event);
            }
        }
    }
}
