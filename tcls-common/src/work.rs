use std::{sync::Arc, thread::JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

enum Job {
    Run(Box<dyn FnOnce() + Send + 'static>),
    Barrier(Arc<Gate>),
}

#[derive(Default)]
struct Gate {
    passed: Mutex<bool>,
    cvar: Condvar,
}

impl Gate {
    fn open(&self) {
        *self.passed.lock() = true;
        self.cvar.notify_all();
    }

    fn wait(&self) {
        let mut passed = self.passed.lock();
        while !*passed {
            self.cvar.wait(&mut passed);
        }
    }
}

/// A single worker thread executing deferred jobs in submission order.
///
/// Used to run teardown work (classifier state destruction, callback removal)
/// outside of any lock held by the submitter. [`WorkQueue::flush`] blocks until
/// every job submitted before it has finished, which gives callers a barrier
/// to order unloads against in-flight destruction.
pub struct WorkQueue {
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue").finish_non_exhaustive()
    }
}

impl WorkQueue {
    /// Spawns the worker thread. `name` shows up in thread listings.
    pub fn new(name: &str) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let worker = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                for job in rx {
                    match job {
                        Job::Run(f) => f(),
                        Job::Barrier(gate) => gate.open(),
                    }
                }
            })
            .expect("failed to spawn worker thread");

        Self { tx: Some(tx), worker: Some(worker) }
    }

    /// Submits a job. If the worker is already gone (queue shut down mid-drop),
    /// the job runs inline on the calling thread instead of being lost.
    pub fn defer<F: FnOnce() + Send + 'static>(&self, f: F) {
        if let Some(tx) = &self.tx {
            if let Err(err) = tx.send(Job::Run(Box::new(f))) {
                debug!("work queue closed, running job inline");
                let Job::Run(f) = err.into_inner() else { unreachable!() };
                f();
            }
        } else {
            f();
        }
    }

    /// Blocks until all previously submitted jobs have completed.
    pub fn flush(&self) {
        let Some(tx) = &self.tx else { return };

        let gate = Arc::new(Gate::default());
        if tx.send(Job::Barrier(Arc::clone(&gate))).is_ok() {
            gate.wait();
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain remaining jobs and exit.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            // A job may own the last handle to the queue's owner, in which
            // case this drop runs on the worker itself. Detach instead of
            // joining the current thread.
            if worker.thread().id() == std::thread::current().id() {
                return;
            }
            let _ = worker.join();
        }
    }
}
