use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// Admission control for long-running downloads: at most `capacity` clients
/// hold a ticket at once, the rest wait in FIFO order.
///
/// Clients are identified by name. The queue holds no transfer state of its
/// own; callers poll `lease`/`is_leased` until they are admitted and must
/// `release` when done. Promotion runs under the same lock as every other
/// mutation, so admission order is exactly arrival order.
#[derive(Debug)]
pub struct TicketQueue {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    capacity: usize,
    waiting: VecDeque<String>,
    working: HashSet<String>,
}

impl TicketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity: capacity.max(1),
                waiting: VecDeque::new(),
                working: HashSet::new(),
            }),
        }
    }

    /// Attempts to admit `client`. Returns `true` when the client holds a
    /// ticket after the call. A client already waiting is not re-queued.
    pub fn lease(&self, client: &str) -> bool {
        let mut inner = self.lock();
        if inner.working.contains(client) {
            return true;
        }
        if inner.waiting.iter().any(|c| c == client) {
            return false;
        }
        inner.waiting.push_back(client.to_string());
        inner.promote();
        inner.working.contains(client)
    }

    /// Whether `client` currently holds a ticket. Runs a promotion pass
    /// first so a freed slot is picked up by a late check.
    pub fn is_leased(&self, client: &str) -> bool {
        let mut inner = self.lock();
        inner.promote();
        inner.working.contains(client)
    }

    /// Returns the ticket held by `client`, admitting the next waiter.
    /// Returns whether the client actually held one. A waiting client is
    /// removed from the queue as well.
    pub fn release(&self, client: &str) -> bool {
        let mut inner = self.lock();
        let removed = inner.working.remove(client);
        if !removed {
            inner.waiting.retain(|c| c != client);
        }
        inner.promote();
        removed
    }

    /// Empties both the waiting queue and the working set. In-flight
    /// transfers are expected to be stopped by the caller.
    pub fn cancel_all(&self) {
        let mut inner = self.lock();
        inner.waiting.clear();
        inner.working.clear();
    }

    pub fn working_count(&self) -> usize {
        self.lock().working.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.lock().waiting.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another thread panicked mid-mutation of
        // two plain collections; the sets themselves stay usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Inner {
    fn promote(&mut self) {
        while self.working.len() < self.capacity {
            match self.waiting.pop_front() {
                Some(client) => {
                    self.working.insert(client);
                }
                None => break,
            }
        }
    }
}
