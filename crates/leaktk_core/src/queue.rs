//! A bounded priority queue that behaves like a channel.
//!
//! Messages are drained highest-priority-first rather than in submission
//! order. Both the request and response paths of the engine run through one
//! of these.

use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded};

/// A prioritised value. Larger priorities drain first; ties are unordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<T> {
    /// Ordering key. Larger dequeues first.
    pub priority: i32,
    /// The carried value.
    pub value: T,
}

/// Heap slot ordered by priority alone so `T` needs no ordering.
struct Slot<T>(Message<T>);

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority
    }
}

impl<T> Eq for Slot<T> {}

impl<T> PartialOrd for Slot<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Slot<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.priority.cmp(&other.0.priority)
    }
}

struct State<T> {
    heap: BinaryHeap<Slot<T>>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    max_size: usize,
}

/// Thread-safe max-heap channel with blocking send and receive.
///
/// A single internal pump thread pops the heap and hands each message to a
/// rendezvous channel, so at most one message is in flight outside the heap
/// at a time. [`PriorityQueue::recv`] never returns while the queue is alive;
/// queues live for the life of the process and are not closed in normal
/// operation.
pub struct PriorityQueue<T> {
    shared: Arc<Shared<T>>,
    out: Receiver<Message<T>>,
}

impl<T: Send + 'static> PriorityQueue<T> {
    /// Creates a queue with a pre-allocation hint and an optional bound.
    ///
    /// `max_size == 0` means unbounded. When bounded, [`PriorityQueue::send`]
    /// blocks while the heap holds `max_size` messages.
    #[must_use]
    pub fn new(initial_capacity: usize, max_size: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                heap: BinaryHeap::with_capacity(initial_capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            max_size,
        });

        let (tx, out) = bounded(0);
        spawn_pump(Arc::clone(&shared), tx);

        Self { shared, out }
    }

    /// Inserts a message, blocking while a bounded queue is full.
    ///
    /// Safe for concurrent callers; a blocked send is released as soon as the
    /// pump drains a message below the bound.
    pub fn send(&self, msg: Message<T>) {
        let mut state = lock_state(&self.shared);
        while self.shared.max_size > 0 && state.heap.len() >= self.shared.max_size {
            state = wait_state(&self.shared.not_full, state);
        }
        state.heap.push(Slot(msg));
        drop(state);
        self.shared.not_empty.notify_one();
    }

    /// Delivers messages to `handler`, highest priority first, until the
    /// process exits. May be called from several threads at once; each
    /// message is delivered to exactly one caller.
    pub fn recv<F>(&self, mut handler: F)
    where
        F: FnMut(Message<T>),
    {
        while let Ok(msg) = self.out.recv() {
            handler(msg);
        }
    }

    /// Number of messages currently queued, for back-pressure heuristics.
    ///
    /// A message already handed to the out-channel is no longer counted.
    #[must_use]
    pub fn size(&self) -> usize {
        lock_state(&self.shared).heap.len()
    }
}

impl<T> Drop for PriorityQueue<T> {
    fn drop(&mut self) {
        let mut state = lock_state(&self.shared);
        state.closed = true;
        drop(state);
        self.shared.not_empty.notify_all();
    }
}

fn spawn_pump<T: Send + 'static>(shared: Arc<Shared<T>>, tx: Sender<Message<T>>) {
    thread::Builder::new()
        .name("leaktk-queue-pump".into())
        .spawn(move || {
            loop {
                let msg = {
                    let mut state = lock_state(&shared);
                    // A wakeup does not guarantee a message is still there:
                    // re-check emptiness after every wait.
                    loop {
                        if let Some(slot) = state.heap.pop() {
                            break slot.0;
                        }
                        if state.closed {
                            return;
                        }
                        state = wait_state(&shared.not_empty, state);
                    }
                };

                // Hand off outside the lock; the rendezvous send blocks until
                // a receiver is ready.
                if tx.send(msg).is_err() {
                    return;
                }

                if shared.max_size > 0 {
                    let state = lock_state(&shared);
                    if state.heap.len() < shared.max_size {
                        shared.not_full.notify_one();
                    }
                }
            }
        })
        .expect("failed to spawn queue pump thread");
}

fn lock_state<T>(shared: &Shared<T>) -> std::sync::MutexGuard<'_, State<T>> {
    shared.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn wait_state<'a, T>(
    cond: &Condvar,
    guard: std::sync::MutexGuard<'a, State<T>>,
) -> std::sync::MutexGuard<'a, State<T>> {
    cond.wait(guard).unwrap_or_else(std::sync::PoisonError::into_inner)
}
