//! Small synchronous pub/sub used to hand view events to whoever renders
//! them, without the producer knowing who listens.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::error;

type Handler<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct EmitterInner<T> {
    handlers: HashMap<String, Vec<(HandlerId, Handler<T>)>>,
    next_id: u64,
}

pub struct EventEmitter<T> {
    inner: Arc<Mutex<EmitterInner<T>>>,
}

impl<T> Clone for EventEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventEmitter<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EmitterInner {
                handlers: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Register a handler. Handlers for one event run in registration order.
    pub fn on<F>(&self, event: &str, handler: F) -> Unsubscribe<T>
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = HandlerId(inner.next_id);
        inner.next_id += 1;
        inner
            .handlers
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));

        Unsubscribe {
            inner: Arc::downgrade(&self.inner),
            event: event.to_string(),
            id,
        }
    }

    /// Returns true if the handler was registered.
    pub fn off(&self, event: &str, id: HandlerId) -> bool {
        remove_handler(&self.inner, event, id)
    }

    /// Invoke every handler registered for `event`. Handlers are snapshotted
    /// first, so they may (un)register handlers while running. A failing or
    /// panicking handler is logged and the rest still run. Returns how many
    /// handlers completed successfully.
    pub fn emit(&self, event: &str, payload: &T) -> usize {
        let snapshot: Vec<(HandlerId, Handler<T>)> = match self.inner.lock().handlers.get(event) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut ok = 0;
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => ok += 1,
                Ok(Err(e)) => error!("Handler {:?} for '{}' failed: {:#}", id, event, e),
                Err(_) => error!("Handler {:?} for '{}' panicked", id, event),
            }
        }
        ok
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .lock()
            .handlers
            .get(event)
            .map_or(0, Vec::len)
    }
}

/// Returned by [`EventEmitter::on`]. Dropping it keeps the handler
/// registered; call [`Unsubscribe::unsubscribe`] to remove it.
pub struct Unsubscribe<T> {
    inner: Weak<Mutex<EmitterInner<T>>>,
    event: String,
    id: HandlerId,
}

impl<T> Unsubscribe<T> {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn unsubscribe(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => remove_handler(&inner, &self.event, self.id),
            None => false,
        }
    }
}

fn remove_handler<T>(inner: &Mutex<EmitterInner<T>>, event: &str, id: HandlerId) -> bool {
    let mut inner = inner.lock();
    let Some(list) = inner.handlers.get_mut(event) else {
        return false;
    };
    let before = list.len();
    list.retain(|(hid, _)| *hid != id);
    let removed = list.len() != before;
    if list.is_empty() {
        inner.handlers.remove(event);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_registration_order() {
        let emitter: EventEmitter<u32> = EventEmitter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            emitter.on("tick", move |n| {
                seen.lock().push(format!("{}{}", tag, n));
                Ok(())
            });
        }

        assert_eq!(emitter.emit("tick", &1), 3);
        assert_eq!(*seen.lock(), vec!["a1", "b1", "c1"]);
        assert_eq!(emitter.emit("other", &1), 0);
    }

    #[test]
    fn test_failing_handlers_do_not_stop_others() {
        let emitter: EventEmitter<()> = EventEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));

        emitter.on("e", |_| anyhow::bail!("boom"));
        emitter.on("e", |_| panic!("handler panic"));
        let c = calls.clone();
        emitter.on("e", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(emitter.emit("e", &()), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_during_emit() {
        let emitter: EventEmitter<()> = EventEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));

        // The second handler is removed by the first while emit is running;
        // the snapshot still runs it once.
        let second_slot: Arc<Mutex<Option<Unsubscribe<()>>>> = Arc::new(Mutex::new(None));
        let slot = second_slot.clone();
        emitter.on("e", move |_| {
            if let Some(sub) = slot.lock().as_ref() {
                sub.unsubscribe();
            }
            Ok(())
        });
        let c = calls.clone();
        let second = emitter.on("e", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        *second_slot.lock() = Some(second);

        emitter.emit("e", &());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count("e"), 1);

        emitter.emit("e", &());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_and_unsubscribe_are_idempotent() {
        let emitter: EventEmitter<()> = EventEmitter::new();
        let sub = emitter.on("e", |_| Ok(()));

        assert!(emitter.off("e", sub.id()));
        assert!(!emitter.off("e", sub.id()));
        assert!(!sub.unsubscribe());

        let sub = emitter.on("e", |_| Ok(()));
        drop(emitter);
        assert!(!sub.unsubscribe());
    }
}
