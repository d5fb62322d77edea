//! The default background executor.
//!
//! Hosts normally route background continuations to their own task system
//! (see [`config::set_background_executor`](crate::config::set_background_executor)).
//! When they don't, jobs go to a small static [`ThreadPool`]: a lock-free
//! injector queue drained by a resizable set of worker threads that sleep
//! while there is nothing to do.

use std::{
    cell::Cell,
    panic::{self, AssertUnwindSafe},
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
};

use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::{
    error::PromiseError,
    job::Job,
    latch::{AtomicLatch, Latch, Probe},
};

// -----------------------------------------------------------------------------
// Thread pool types

/// Hard upper bound on the number of workers in one pool. Space for this many
/// workers is reserved up front so pools can be const constructed.
pub const MAX_THREADS: usize = 32;

/// A pool of worker threads that run [`Job`]s.
///
/// Thread pools are meant to be `static`:
///
/// ```
/// # use pledge::thread_pool::ThreadPool;
/// static WORKERS: ThreadPool = ThreadPool::new();
///
/// WORKERS.resize_to(2);
/// WORKERS.spawn(|| println!("running on a worker"));
/// ```
///
/// Pools start with no threads. Posting a job to an empty pool populates it
/// with one worker per available core.
pub struct ThreadPool {
    /// Per-worker control state.
    threads: [CachePadded<ThreadControl>; MAX_THREADS],
    /// Jobs waiting for a worker.
    queue: SegQueue<Job>,
    /// Infrequently written shared state, on its own cache line.
    state: CachePadded<ThreadPoolState>,
}

struct ThreadPoolState {
    /// Number of running workers, sleeping ones included. Only written while
    /// `is_resizing` is held.
    running_threads: AtomicUsize,
    /// Guards the resizing critical section.
    is_resizing: Mutex<bool>,
}

/// Sleeping, waking and termination for a single worker.
struct ThreadControl {
    /// Set while the worker sleeps.
    is_sleeping: Mutex<bool>,
    /// Wakes a sleeping worker.
    awakened: Condvar,
    /// Set while the worker's main loop runs.
    is_running: Mutex<bool>,
    /// Signals changes to `is_running`.
    synchronized: Condvar,
    /// Opened to ask the worker to exit.
    should_terminate: AtomicLatch,
}

// -----------------------------------------------------------------------------
// Thread pool creation and maintenance

/// Initial value of `ThreadControl`, usable in const array initialization.
#[allow(clippy::declare_interior_mutable_const)]
const THREAD_CONTROL: CachePadded<ThreadControl> = CachePadded::new(ThreadControl {
    is_sleeping: Mutex::new(false),
    awakened: Condvar::new(),
    is_running: Mutex::new(false),
    synchronized: Condvar::new(),
    should_terminate: AtomicLatch::new(),
});

impl ThreadPool {
    /// Creates a new, empty thread pool. Use this to define a `static`.
    pub const fn new() -> ThreadPool {
        ThreadPool {
            threads: [THREAD_CONTROL; MAX_THREADS],
            queue: SegQueue::new(),
            state: CachePadded::new(ThreadPoolState {
                running_threads: AtomicUsize::new(0),
                is_resizing: Mutex::new(false),
            }),
        }
    }

    /// Number of running workers.
    pub fn size(&'static self) -> usize {
        self.state.running_threads.load(Ordering::Acquire)
    }

    /// Resizes the pool to one worker per available core.
    pub fn resize_to_available(&'static self) -> usize {
        let available = thread::available_parallelism()
            .map(|num_threads| num_threads.get())
            .unwrap_or(1);
        self.resize_to(available)
    }

    /// Resizes the pool to `new_size` workers. Returns the new size, which may
    /// be smaller than requested.
    pub fn resize_to(&'static self, new_size: usize) -> usize {
        self.resize(|_| new_size)
    }

    /// Adds workers to the pool. Returns the new size.
    pub fn grow(&'static self, added_threads: usize) -> usize {
        self.resize(|current_size| current_size + added_threads)
    }

    /// Removes workers from the pool. Returns the new size.
    pub fn shrink(&'static self, terminated_threads: usize) -> usize {
        self.resize(|current_size| current_size.saturating_sub(terminated_threads))
    }

    /// Ensures the pool has at least one worker. Returns the new size.
    pub fn populate(&'static self) -> usize {
        self.resize(|current_size| current_size.max(1))
    }

    /// Stops every worker. Queued jobs stay queued until the pool grows again.
    pub fn depopulate(&'static self) -> usize {
        self.resize_to(0)
    }

    /// Resizes the pool. Called from one of the pool's own workers this does
    /// nothing, since a worker cannot wait for its own termination.
    pub fn resize<F>(&'static self, get_size: F) -> usize
    where
        F: Fn(usize) -> usize,
    {
        if WorkerThread::current_pool() == Some(self.id()) {
            return self.state.running_threads.load(Ordering::Acquire);
        }

        let mut is_resizing = self.state.is_resizing.lock();
        *is_resizing = true;

        let current_size = self.state.running_threads.load(Ordering::Acquire);
        let new_size = usize::min(get_size(current_size), MAX_THREADS);

        if new_size == current_size {
            *is_resizing = false;
            return current_size;
        }

        self.state
            .running_threads
            .store(new_size, Ordering::Release);

        if current_size < new_size {
            for index in current_size..new_size {
                self.threads[index].run(move || main_loop(self, index));
            }
            for index in current_size..new_size {
                self.threads[index].await_ready();
            }
        } else {
            for index in new_size..current_size {
                self.threads[index].halt();
            }
            for index in new_size..current_size {
                self.threads[index].await_termination();
            }
        }

        debug!(from = current_size, to = new_size, "resized thread pool");
        *is_resizing = false;
        new_size
    }

    /// Returns an opaque identifier for this thread pool.
    pub fn id(&'static self) -> usize {
        self as *const Self as usize
    }

    /// Queues a job and wakes a sleeping worker to run it.
    pub fn inject(&'static self, job: Job) {
        self.queue.push(job);
        if self.state.running_threads.load(Ordering::Acquire) == 0 {
            self.resize_to_available();
        }
        self.wake_any(1);
    }

    /// Spawns a closure onto the pool.
    pub fn spawn<F>(&'static self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inject(Job::new(f));
    }

    /// Pops a job from the queue.
    fn pop(&'static self) -> Option<Job> {
        self.queue.pop()
    }

    /// Tries to wake a number of sleeping workers. Returns how many were woken.
    pub fn wake_any(&'static self, num_to_wake: usize) -> usize {
        let mut num_woken = 0;
        if num_to_wake == 0 {
            return num_woken;
        }
        let num_threads = self.state.running_threads.load(Ordering::Relaxed);
        for index in 0..num_threads {
            if self.threads[index].wake() {
                num_woken += 1;
                if num_woken == num_to_wake {
                    break;
                }
            }
        }
        num_woken
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------------
// Thread control

impl ThreadControl {
    /// Spawns the worker thread. The controller side of the api is `run`,
    /// `await_ready`, `wake`, `halt` and `await_termination`; the worker side
    /// is `post_ready_status` and `post_termination_status`.
    fn run<F>(&'static self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        thread::spawn(f);
    }

    /// Waits until the worker has entered its main loop.
    fn await_ready(&'static self) {
        let mut is_running = self.is_running.lock();
        while !*is_running {
            self.synchronized.wait(&mut is_running);
        }
    }

    /// Called by the worker when it enters its main loop.
    fn post_ready_status(&'static self) {
        let mut is_running = self.is_running.lock();
        *is_running = true;
        self.synchronized.notify_all();
    }

    /// Wakes the worker if it is asleep. Returns `true` if it was.
    fn wake(&'static self) -> bool {
        let mut is_sleeping = self.is_sleeping.lock();
        if *is_sleeping {
            *is_sleeping = false;
            self.awakened.notify_one();
            true
        } else {
            false
        }
    }

    /// Asks the worker to leave its main loop.
    fn halt(&'static self) {
        self.should_terminate.set();
        self.wake();
    }

    /// Waits until the worker has left its main loop.
    fn await_termination(&'static self) {
        let mut is_running = self.is_running.lock();
        while *is_running {
            self.synchronized.wait(&mut is_running);
        }
    }

    /// Called by the worker right before it exits.
    fn post_termination_status(&'static self) {
        self.should_terminate.reset();
        let mut is_running = self.is_running.lock();
        *is_running = false;
        self.synchronized.notify_all();
    }
}

// -----------------------------------------------------------------------------
// Worker threads

/// Marks the current thread as a worker of a particular pool.
struct WorkerThread;

thread_local! {
    static CURRENT_POOL: Cell<*const ThreadPool> = const { Cell::new(ptr::null()) };
}

impl WorkerThread {
    /// The id of the pool the current thread works for, if any.
    fn current_pool() -> Option<usize> {
        let pool = CURRENT_POOL.with(Cell::get);
        (!pool.is_null()).then_some(pool as usize)
    }

    fn set_current(thread_pool: &'static ThreadPool) {
        CURRENT_POOL.with(|current| {
            debug_assert!(current.get().is_null());
            current.set(thread_pool);
        });
    }
}

// -----------------------------------------------------------------------------
// Main worker loop

/// Runs jobs from the pool's queue until asked to terminate, sleeping while
/// the queue is empty.
fn main_loop(thread_pool: &'static ThreadPool, index: usize) {
    let control = &thread_pool.threads[index];
    WorkerThread::set_current(thread_pool);
    control.post_ready_status();
    trace!(index, "worker started");

    while !control.should_terminate.probe() {
        if let Some(job) = thread_pool.pop() {
            // Panics stay on the worker; `halt` waits for every thread.
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job.execute())) {
                let error = PromiseError::from_panic(payload);
                error!(index, %error, "job panicked on worker thread");
            }
            continue;
        }

        let mut is_sleeping = control.is_sleeping.lock();
        // Checked under the lock so a concurrent `inject` or `halt` cannot
        // slip between the check and the wait.
        if control.should_terminate.probe() || !thread_pool.queue.is_empty() {
            continue;
        }
        *is_sleeping = true;
        while *is_sleeping {
            control.awakened.wait(&mut is_sleeping);
        }
    }

    trace!(index, "worker stopped");
    control.post_termination_status();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latch::LockLatch;
    use std::{
        sync::{mpsc, Arc},
        time::Duration,
    };

    #[test]
    fn pool_runs_jobs_and_resizes() {
        static POOL: ThreadPool = ThreadPool::new();
        assert_eq!(POOL.resize_to(2), 2);
        let latch = Arc::new(LockLatch::new());
        let setter = Arc::clone(&latch);
        POOL.spawn(move || setter.set());
        latch.wait();
        assert_eq!(POOL.shrink(1), 1);
        assert_eq!(POOL.grow(1), 2);
        assert_eq!(POOL.depopulate(), 0);
    }

    #[test]
    fn workers_survive_panicking_jobs() {
        static POOL: ThreadPool = ThreadPool::new();
        assert_eq!(POOL.resize_to(1), 1);
        POOL.spawn(|| panic!("job failed"));

        let latch = Arc::new(LockLatch::new());
        let setter = Arc::clone(&latch);
        POOL.spawn(move || setter.set());
        latch.wait();

        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let _ = sender.send(POOL.depopulate());
        });
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)), Ok(0));
    }

    #[test]
    fn posting_to_an_empty_pool_populates_it() {
        static POOL: ThreadPool = ThreadPool::new();
        let latch = Arc::new(LockLatch::new());
        let setter = Arc::clone(&latch);
        POOL.spawn(move || setter.set());
        latch.wait();
        assert!(POOL.size() >= 1);
        POOL.depopulate();
    }
}
