//! Dispatch primitives backing the emitted code's concurrency model: binary
//! semaphores with timed waits, dispatch groups, serial queues, and the
//! thread manager that gates chain workers on their upstream chains.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A binary semaphore. Claimed/free, with timed and non-blocking waits.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

struct SemaphoreInner {
    available: Mutex<bool>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Semaphore {
            inner: Arc::new(SemaphoreInner { available: Mutex::new(true), cv: Condvar::new() }),
        }
    }

    /// Block until the semaphore can be claimed.
    pub fn wait(&self) {
        let mut available = self.inner.available.lock();
        while !*available {
            self.inner.cv.wait(&mut available);
        }
        *available = false;
    }

    /// Claim if possible within the timeout. Zero means a single attempt.
    pub fn try_wait_for(&self, timeout: Duration) -> bool {
        let mut available = self.inner.available.lock();
        if *available {
            *available = false;
            return true;
        }
        if timeout.is_zero() {
            return false;
        }
        let deadline = std::time::Instant::now() + timeout;
        while !*available {
            if self.inner.cv.wait_until(&mut available, deadline).timed_out() {
                break;
            }
        }
        if *available {
            *available = false;
            true
        } else {
            false
        }
    }

    pub fn signal(&self) {
        let mut available = self.inner.available.lock();
        *available = true;
        self.inner.cv.notify_one();
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// A dispatch group: a counter that `wait` blocks on until it returns to zero.
#[derive(Clone)]
pub struct DispatchGroup {
    inner: Arc<GroupInner>,
}

struct GroupInner {
    count: Mutex<usize>,
    cv: Condvar,
}

impl DispatchGroup {
    pub fn new() -> Self {
        DispatchGroup {
            inner: Arc::new(GroupInner { count: Mutex::new(0), cv: Condvar::new() }),
        }
    }

    pub fn enter(&self) {
        *self.inner.count.lock() += 1;
    }

    pub fn leave(&self) {
        let mut count = self.inner.count.lock();
        if *count == 0 {
            log::warn!("dispatch group left more times than entered");
            return;
        }
        *count -= 1;
        if *count == 0 {
            self.inner.cv.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut count = self.inner.count.lock();
        while *count > 0 {
            self.inner.cv.wait(&mut count);
        }
    }
}

impl Default for DispatchGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// A serial queue draining jobs on its own thread.
#[derive(Clone)]
pub struct DispatchQueue {
    name: Arc<str>,
    tx: Sender<Job>,
}

impl DispatchQueue {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let thread_name = name.to_string();
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .expect("spawn queue thread");
        DispatchQueue { name: Arc::from(name), tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatch_async(&self, job: Job) {
        let _ = self.tx.send(job);
    }

    /// Run the job on the queue and block until it completes.
    pub fn dispatch_sync(&self, job: Job) {
        let (done_tx, done_rx) = unbounded::<()>();
        let _ = self.tx.send(Box::new(move || {
            job();
            let _ = done_tx.send(());
        }));
        let _ = done_rx.recv();
    }
}

/// Key identifying one event's chain bookkeeping: the composition identifier
/// the trigger belongs to, plus the event ID.
pub type EventKey = (String, u64);

struct PendingChain {
    chain_index: u64,
    upstream: Vec<u64>,
    job: Job,
}

#[derive(Default)]
struct EventEntry {
    chain_count: Option<u64>,
    completed: HashSet<u64>,
    pending: Vec<PendingChain>,
    trigger_returned: bool,
}

/// Tracks thread grants and defers each chain worker until every chain
/// upstream of it has returned its threads for the same event.
pub struct ThreadManager {
    events: Mutex<HashMap<EventKey, EventEntry>>,
}

impl ThreadManager {
    pub fn new() -> Self {
        ThreadManager { events: Mutex::new(HashMap::new()) }
    }

    pub fn register_trigger_event(&self, key: EventKey, chain_count: u64) {
        let mut events = self.events.lock();
        let entry = events.entry(key).or_default();
        entry.chain_count = Some(chain_count);
    }

    pub fn schedule_chain_worker(
        &self,
        key: EventKey,
        chain_index: u64,
        upstream: Vec<u64>,
        job: Job,
    ) {
        let ready = {
            let mut events = self.events.lock();
            let entry = events.entry(key).or_default();
            if upstream.iter().all(|u| entry.completed.contains(u)) {
                true
            } else {
                entry.pending.push(PendingChain { chain_index, upstream, job });
                return;
            }
        };
        if ready {
            thread::spawn(job);
        }
    }

    pub fn grant_threads_to_chain(&self, _key: EventKey, _chain_index: u64) {}

    pub fn grant_threads_to_subcomposition(&self, _key: EventKey, _sub_identifier: &str) {}

    pub fn return_threads_for_chain_worker(&self, key: EventKey, chain_index: u64) {
        let ready: Vec<Job> = {
            let mut events = self.events.lock();
            let Some(entry) = events.get_mut(&key) else { return };
            entry.completed.insert(chain_index);
            let mut ready = Vec::new();
            let mut index = 0;
            while index < entry.pending.len() {
                if entry.pending[index]
                    .upstream
                    .iter()
                    .all(|u| entry.completed.contains(u))
                {
                    ready.push(entry.pending.swap_remove(index).job);
                } else {
                    index += 1;
                }
            }
            Self::cleanup(&mut events, &key);
            ready
        };
        for job in ready {
            thread::spawn(job);
        }
    }

    pub fn return_threads_for_trigger_worker(&self, key: EventKey) {
        let mut events = self.events.lock();
        if let Some(entry) = events.get_mut(&key) {
            entry.trigger_returned = true;
        }
        Self::cleanup(&mut events, &key);
    }

    fn cleanup(events: &mut HashMap<EventKey, EventEntry>, key: &EventKey) {
        let done = events.get(key).is_some_and(|e| {
            e.trigger_returned
                && e.pending.is_empty()
                && e.chain_count.is_some_and(|c| e.completed.len() as u64 >= c)
        });
        if done {
            events.remove(key);
        }
    }
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}
