//! The queued observation bus.
//!
//! Delivery into a plugin is synchronous within the step by default. The
//! queued bus is the alternative shape: a bounded channel whose producer
//! side blocks when the consumer falls behind, so the coordinator stalls
//! rather than dropping trames, and per-view trame order is preserved.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::trame::{ProtocolError, Trame};
use super::TrameSink;

struct Shared {
    queue: Mutex<QueueState>,
    not_full: Condvar,
    not_empty: Condvar,
}

struct QueueState {
    items: VecDeque<Trame>,
    capacity: usize,
    closed: bool,
}

/// Creates a bounded trame channel of the given capacity.
pub fn bounded(capacity: usize) -> (QueuedSender, QueuedReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(QueueState {
            items: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            closed: false,
        }),
        not_full: Condvar::new(),
        not_empty: Condvar::new(),
    });
    (
        QueuedSender {
            shared: Arc::clone(&shared),
        },
        QueuedReceiver { shared },
    )
}

/// Producer half; implements [`TrameSink`] with blocking backpressure.
pub struct QueuedSender {
    shared: Arc<Shared>,
}

impl QueuedSender {
    /// Marks the stream closed and wakes the consumer.
    pub fn close(&self) {
        let mut state = self.shared.queue.lock();
        state.closed = true;
        drop(state);
        self.shared.not_empty.notify_all();
    }
}

impl Drop for QueuedSender {
    fn drop(&mut self) {
        self.close();
    }
}

impl TrameSink for QueuedSender {
    fn deliver(&mut self, trame: &Trame) -> Result<(), ProtocolError> {
        let mut state = self.shared.queue.lock();
        while state.items.len() >= state.capacity && !state.closed {
            self.shared.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "queued observation bus is closed",
            )));
        }
        state.items.push_back(trame.clone());
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }
}

/// Consumer half of the queued bus.
pub struct QueuedReceiver {
    shared: Arc<Shared>,
}

impl QueuedReceiver {
    /// Blocks for the next trame; `None` once closed and drained.
    pub fn recv(&self) -> Option<Trame> {
        let mut state = self.shared.queue.lock();
        loop {
            if let Some(trame) = state.items.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return Some(trame);
            }
            if state.closed {
                return None;
            }
            self.shared.not_empty.wait(&mut state);
        }
    }

    /// Drains whatever is queued right now, without blocking.
    pub fn try_drain(&self) -> Vec<Trame> {
        let mut state = self.shared.queue.lock();
        let drained: Vec<Trame> = state.items.drain(..).collect();
        drop(state);
        if !drained.is_empty() {
            self.shared.not_full.notify_all();
        }
        drained
    }
}
