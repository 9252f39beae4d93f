use std::{
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{Builder, JoinHandle},
};

use tracing::{debug, error};

use crate::{
    config::OverflowPolicy,
    error::{Result, ServerError},
};

/// Handed back by [`ThreadPool::submit`] when the queue is full and the pool
/// runs with [`OverflowPolicy::Reject`].
pub struct Rejected<T>(pub T);

impl<T> Rejected<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Rejected(..)")
    }
}

struct SharedState<T> {
    queue: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    shutdown: AtomicBool,
}

impl<T> SharedState<T> {
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed set of threads pulling items from one bounded FIFO queue.
///
/// Every item is passed to the same job function. A panicking job is caught
/// and logged; the worker thread keeps serving. Dropping the pool lets the
/// workers finish whatever is still queued, then joins them.
pub struct ThreadPool<T: Send + 'static> {
    workers: Vec<JoinHandle<()>>,
    state: Arc<SharedState<T>>,
    capacity: usize,
    overflow: OverflowPolicy,
}

impl<T: Send + 'static> ThreadPool<T> {
    pub fn new<F>(
        name: &str,
        workers: usize,
        capacity: usize,
        overflow: OverflowPolicy,
        job: F,
    ) -> Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let state = Arc::new(SharedState {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let job = Arc::new(job);

        let mut pool = Self {
            workers: Vec::with_capacity(workers),
            state,
            capacity: capacity.max(1),
            overflow,
        };

        for id in 0..workers.max(1) {
            let thread_name = format!("{name}-worker-{id}");
            let state = Arc::clone(&pool.state);
            let job = Arc::clone(&job);
            let handle = Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(&state, &*job))
                .map_err(|source| ServerError::Spawn {
                    name: thread_name,
                    source,
                })?;
            pool.workers.push(handle);
        }

        Ok(pool)
    }

    /// Queues `item` according to the pool's overflow policy.
    ///
    /// Under [`OverflowPolicy::Block`] this call waits for a free slot.
    pub fn submit(&self, item: T) -> std::result::Result<(), Rejected<T>> {
        let mut queue = self.state.lock();

        match self.overflow {
            OverflowPolicy::Block => {
                while queue.len() >= self.capacity && !self.state.shutdown.load(Ordering::Acquire) {
                    queue = self
                        .state
                        .not_full
                        .wait(queue)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
            OverflowPolicy::Reject => {
                if queue.len() >= self.capacity {
                    return Err(Rejected(item));
                }
            }
            OverflowPolicy::Unbounded => {}
        }

        queue.push_back(item);
        drop(queue);
        self.state.not_empty.notify_one();
        Ok(())
    }

    pub fn workers_len(&self) -> usize {
        self.workers.len()
    }

    /// Items waiting for a worker.
    pub fn queued(&self) -> usize {
        self.state.lock().len()
    }
}

fn worker_loop<T>(state: &SharedState<T>, job: &(dyn Fn(T) + Send + Sync)) {
    loop {
        let item = {
            let mut queue = state.lock();
            loop {
                if let Some(item) = queue.pop_front() {
                    break Some(item);
                }
                if state.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                queue = state
                    .not_empty
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        match item {
            Some(item) => {
                state.not_full.notify_one();
                if panic::catch_unwind(AssertUnwindSafe(|| job(item))).is_err() {
                    error!("job panicked, worker continues");
                }
            }
            None => break,
        }
    }
}

impl<T: Send + 'static> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        debug!(queued = self.queued(), "draining worker pool");
        {
            let _queue = self.state.lock();
            self.state.shutdown.store(true, Ordering::Release);
        }
        self.state.not_empty.notify_all();
        self.state.not_full.notify_all();

        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                error!(thread = %name, "worker thread panicked");
            } else {
                debug!(thread = %name, "worker thread exited");
            }
        }
    }
}
