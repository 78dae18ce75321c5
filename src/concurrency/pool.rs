use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use anyhow::{Context, anyhow};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of named worker threads fed from one unbounded job queue.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> anyhow::Result<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = unbounded::<Job>();

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver = receiver.clone();
            let name = format!("fg-worker-{i}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    for job in receiver {
                        job();
                    }
                    log::trace!("{} exiting", name);
                })
                .with_context(|| format!("failed to spawn fg-worker-{i}"))?;
            workers.push(handle);
        }

        log::debug!("Started worker pool with {} threads", threads);

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues `task` and returns a handle to its result. A panic inside the
    /// task comes back as an error from [`TaskHandle::join`].
    pub fn submit<T, F>(&self, label: impl Into<String>, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let label = label.into();
        let (result_tx, result_rx) = bounded(1);

        let task_label = label.clone();
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|payload| {
                Err(anyhow!(
                    "task '{}' panicked: {}",
                    task_label,
                    panic_message(payload.as_ref())
                ))
            });
            let _ = result_tx.send(result);
        });

        match &self.sender {
            Some(sender) => {
                if sender.send(job).is_err() {
                    log::error!("worker pool is gone; dropping task '{}'", label);
                }
            }
            None => log::error!("worker pool is shut down; dropping task '{}'", label),
        }

        TaskHandle {
            label,
            receiver: result_rx,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("worker thread panicked during shutdown");
            }
        }
        log::trace!("Worker pool stopped");
    }
}

/// Result slot of one submitted task.
pub struct TaskHandle<T> {
    label: String,
    receiver: Receiver<anyhow::Result<T>>,
}

impl<T> TaskHandle<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Blocks until the task finishes.
    pub fn join(self) -> anyhow::Result<T> {
        self.receiver
            .recv()
            .map_err(|_| anyhow!("task '{}' was dropped before it ran", self.label))?
    }
}

/// Joins every handle, including the ones after a failure.
pub fn join_all<T>(handles: Vec<TaskHandle<T>>) -> Vec<(String, anyhow::Result<T>)> {
    handles
        .into_iter()
        .map(|handle| {
            let label = handle.label.clone();
            (label, handle.join())
        })
        .collect()
}

/// One thread fewer than the machine has, leaving a core for the render thread.
pub fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
