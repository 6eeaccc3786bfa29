//! Named, bounded thread pools
//!
//! Each [`Scheduler`] owns its own multi-thread tokio runtime. Async tasks
//! (accept loops, timers) run on the runtime's worker threads, while blocking
//! work posted with [`Scheduler::post`] runs on the runtime's blocking pool,
//! capped at the configured thread count. Extra posts queue until a thread
//! frees up.

use log::{error, info, warn};
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};

/// Decrements the active task count however the task ends
struct ActiveTask(Arc<AtomicUsize>);

impl Drop for ActiveTask {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Scheduler {
    name: String,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    running: AtomicBool,
    active: Arc<AtomicUsize>,
    panicked: Arc<AtomicUsize>,
}

impl Scheduler {
    /// Builds a pool of `threads` threads named after `name`
    pub fn new(name: &str, threads: usize) -> io::Result<Self> {
        let threads = threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .max_blocking_threads(threads)
            .thread_name(name)
            .enable_all()
            .build()?;

        info!("Scheduler {} started with {} threads", name, threads);

        Ok(Self {
            name: name.to_string(),
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            running: AtomicBool::new(true),
            active: Arc::new(AtomicUsize::new(0)),
            panicked: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runtime handle, for entering the pool's context
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of posted tasks that have not finished yet
    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of posted tasks that panicked since the previous call
    pub fn take_panicked(&self) -> usize {
        self.panicked.swap(0, Ordering::SeqCst)
    }

    /// Queues a blocking task; returns false once the pool is stopped
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_running() {
            return false;
        }

        let guard = self.track();
        let panicked = Arc::clone(&self.panicked);
        self.handle.spawn_blocking(move || {
            let _guard = guard;
            run_isolated(task, &panicked);
        });
        true
    }

    /// Queues a blocking task to run after `delay`
    pub fn post_delayed<F>(&self, delay: Duration, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_running() {
            return false;
        }

        let guard = self.track();
        let panicked = Arc::clone(&self.panicked);
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::task::spawn_blocking(move || {
                let _guard = guard;
                run_isolated(task, &panicked);
            });
        });
        true
    }

    /// Runs a future on the pool's async workers
    pub fn spawn<F>(&self, future: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.is_running() {
            return false;
        }
        self.handle.spawn(future);
        true
    }

    /// Stops accepting work and shuts the pool down
    ///
    /// Blocking tasks get up to `grace` to finish. When called from inside a
    /// runtime the pool is released in the background instead, since a
    /// runtime thread cannot wait for its own pool.
    pub fn stop(&self, grace: Duration) {
        self.running.store(false, Ordering::SeqCst);
        let runtime = self.runtime.lock().take();

        if let Some(runtime) = runtime {
            let active = self.active_tasks();
            if active > 0 {
                warn!(
                    "Scheduler {} stopping with {} tasks still active",
                    self.name, active
                );
            }

            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(grace);
            }
            info!("Scheduler {} stopped", self.name);
        }
    }

    fn track(&self) -> ActiveTask {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveTask(Arc::clone(&self.active))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

fn run_isolated<F>(task: F, panicked: &AtomicUsize)
where
    F: FnOnce(),
{
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("Worker task panicked");
        panicked.fetch_add(1, Ordering::SeqCst);
    }
}
