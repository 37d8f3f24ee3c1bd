//! Fixed-size worker pool consuming a shared FIFO job queue.
//!
//! The pool knows nothing about networking. Workers are described at
//! construction and spawned by [`TaskPool::initialize`]; [`TaskPool::submit`]
//! enqueues a job and wakes exactly one idle worker. A job that panics is
//! logged and the worker keeps serving the queue.
//!
//! The queue is unbounded: when every worker is busy, submitted jobs wait.
//! That is the pool's only form of backpressure; nothing is dropped while the
//! pool is running.

use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Completion flag with wait/notify semantics.
#[derive(Default)]
struct Completion {
    finished: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn set(&self) {
        let mut finished = self.finished.lock();
        *finished = true;
        self.cond.notify_all();
    }
}

/// Handle to a submitted job.
///
/// Production dispatch never waits on it; tests use it to block until a job
/// has run.
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Clone)]
pub struct JobHandle {
    completion: Arc<Completion>,
}

#[cfg_attr(not(test), allow(dead_code))]
impl JobHandle {
    /// Whether the job has run (successfully or not).
    pub fn is_finished(&self) -> bool {
        *self.completion.finished.lock()
    }

    /// Block until the job has run.
    pub fn wait(&self) {
        let mut finished = self.completion.finished.lock();
        while !*finished {
            self.completion.cond.wait(&mut finished);
        }
    }
}

struct Job {
    task: Task,
    completion: Arc<Completion>,
}

struct QueueState {
    jobs: VecDeque<Job>,
    running: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    available: Condvar,
}

/// A bounded set of worker threads sharing one job queue.
pub struct TaskPool {
    size: usize,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    started: bool,
}

impl TaskPool {
    /// Describe a pool of `size` workers. No thread runs until
    /// [`initialize`](Self::initialize) is called.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState {
                    jobs: VecDeque::new(),
                    running: false,
                }),
                available: Condvar::new(),
            }),
            workers: Vec::with_capacity(size),
            started: false,
        }
    }

    /// Spawn the worker threads. Calling it twice is a no-op.
    pub fn initialize(&mut self) -> io::Result<()> {
        if self.started {
            return Ok(());
        }
        self.shared.queue.lock().running = true;

        for worker_id in 0..self.size {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &shared))?;
            self.workers.push(handle);
        }

        self.started = true;
        info!(workers = self.size, "Task pool started");
        Ok(())
    }

    /// Queue `task` for execution by the next free worker.
    ///
    /// Returns `None` and drops the task if the pool was never initialized or
    /// is shutting down.
    pub fn submit<F>(&self, task: F) -> Option<JobHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.started {
            warn!("Task submitted before the pool was initialized, dropping it");
            return None;
        }

        let completion = Arc::new(Completion::default());
        {
            let mut queue = self.shared.queue.lock();
            if !queue.running {
                warn!("Task submitted after shutdown, dropping it");
                return None;
            }
            queue.jobs.push_back(Job {
                task: Box::new(task),
                completion: Arc::clone(&completion),
            });
        }
        self.shared.available.notify_one();

        Some(JobHandle { completion })
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Stop every worker and wait for them to exit.
    ///
    /// Workers finish the job they are running; jobs still queued are
    /// discarded. Safe to call more than once.
    pub fn shutdown(&mut self) {
        let abandoned = {
            let mut queue = self.shared.queue.lock();
            queue.running = false;
            let abandoned = queue.jobs.len();
            queue.jobs.clear();
            abandoned
        };
        self.shared.available.notify_all();

        if abandoned > 0 {
            warn!(abandoned, "Discarded queued tasks at shutdown");
        }

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread exited abnormally");
            }
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, shared: &Shared) {
    debug!(worker = worker_id, "Worker started");

    loop {
        let job = {
            let mut queue = shared.queue.lock();
            while queue.jobs.is_empty() && queue.running {
                shared.available.wait(&mut queue);
            }
            if !queue.running {
                break;
            }
            match queue.jobs.pop_front() {
                Some(job) => job,
                None => continue,
            }
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job.task)) {
            error!(
                worker = worker_id,
                reason = panic_message(payload.as_ref()),
                "Task panicked"
            );
        }
        job.completion.set();
    }

    debug!(worker = worker_id, "Worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
