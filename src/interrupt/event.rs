//! Deferred events
//!
//! Interrupt handlers post [`Event`]s to a bounded FIFO which is drained
//! later outside interrupt context. The queue holds shared references; the
//! producer keeps its own handle on the event and its data.

use alloc::sync::Arc;
use core::any::Any;
use core::fmt;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::types::EVENT_QUEUE_CAPACITY;

/// Event category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Timer,
    Io,
    Signal,
    Ipc,
}

/// Opaque payload shared between producer and handler
pub type EventData = Arc<dyn Any + Send + Sync>;

/// Callback run when the event is drained
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// A deferred unit of work
pub struct Event {
    pub kind: EventKind,
    pub id: u64,
    data: Option<EventData>,
    handler: Option<EventHandler>,
}

impl Event {
    pub fn new(kind: EventKind, id: u64) -> Self {
        Self {
            kind,
            id,
            data: None,
            handler: None,
        }
    }

    pub fn with_data(mut self, data: EventData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_handler(mut self, handler: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn data(&self) -> Option<&EventData> {
        self.data.as_ref()
    }

    /// Payload downcast to `T`
    pub fn data_as<T: Any>(&self) -> Option<&T> {
        self.data.as_ref()?.downcast_ref::<T>()
    }

    /// Run the handler, if any
    pub fn handle(&self) -> bool {
        match &self.handler {
            Some(handler) => {
                handler(self);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("has_data", &self.data.is_some())
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Bounded FIFO of pending events
pub struct EventQueue {
    events: Mutex<heapless::Deque<Arc<Event>, EVENT_QUEUE_CAPACITY>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(heapless::Deque::new()),
        }
    }

    /// Append `event`; fails with `ResourceExhausted` when full
    pub fn post(&self, event: Arc<Event>) -> KernelResult<()> {
        self.events
            .lock()
            .push_back(event)
            .map_err(|_| KernelError::ResourceExhausted)
    }

    /// Take the oldest event
    pub fn pop(&self) -> Option<Arc<Event>> {
        self.events.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub const fn capacity(&self) -> usize {
        EVENT_QUEUE_CAPACITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo() {
        let q = EventQueue::new();
        for id in 0..3 {
            q.post(Arc::new(Event::new(EventKind::Io, id))).unwrap();
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop().unwrap().id, 0);
        assert_eq!(q.pop().unwrap().id, 1);
        assert_eq!(q.pop().unwrap().id, 2);
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_full_queue_rejects() {
        let q = EventQueue::new();
        for id in 0..1024 {
            q.post(Arc::new(Event::new(EventKind::Timer, id))).unwrap();
        }
        assert_eq!(
            q.post(Arc::new(Event::new(EventKind::Timer, 1024))),
            Err(KernelError::ResourceExhausted)
        );
        assert_eq!(q.len(), 1024);
        assert_eq!(q.pop().unwrap().id, 0);
    }

    #[test]
    fn test_producer_keeps_ownership() {
        let q = EventQueue::new();
        let payload: EventData = Arc::new(41u32);
        let event = Arc::new(Event::new(EventKind::Ipc, 9).with_data(payload.clone()));
        q.post(event.clone()).unwrap();

        let taken = q.pop().unwrap();
        assert!(Arc::ptr_eq(&taken, &event));
        assert_eq!(taken.data_as::<u32>(), Some(&41));
        assert_eq!(taken.data_as::<u64>(), None);
        assert_eq!(Arc::strong_count(&payload), 2);
    }

    #[test]
    fn test_handler_sees_event() {
        use core::sync::atomic::{AtomicU64, Ordering};

        let seen = Arc::new(AtomicU64::new(0));
        let s = seen.clone();
        let event = Event::new(EventKind::Signal, 5).with_handler(move |e| {
            s.store(e.id, Ordering::Relaxed);
        });
        assert!(event.handle());
        assert_eq!(seen.load(Ordering::Relaxed), 5);
        assert!(!Event::new(EventKind::Signal, 6).handle());
    }
}
