//! Blocking worker pool
//!
//! Attach and detach can block inside the kernel, so they never run on the
//! channel's message-processing task. Jobs are queued over an async channel
//! to a small set of dedicated OS threads; each job's result comes back on a
//! one-shot channel that the submitting task can await.

use async_channel::{Receiver, Sender, unbounded};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of named worker threads
pub struct WorkerPool {
    name: String,
    job_tx: Sender<Job>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `threads` workers named `{name}-{index}`
    pub fn new(name: &str, threads: usize) -> crate::Result<Self> {
        let (job_tx, job_rx) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(threads.max(1));

        for index in 0..threads.max(1) {
            let rx = job_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || worker_loop(rx))?;
            handles.push(handle);
        }

        debug!("Worker pool '{}' started with {} threads", name, handles.len());

        Ok(Self {
            name: name.to_string(),
            job_tx,
            threads: Mutex::new(handles),
        })
    }

    /// Run `f` on a worker thread
    ///
    /// The returned task resolves with the closure's result, or with an
    /// error if the pool shut down or the closure panicked.
    pub fn submit<F, T>(&self, f: F) -> WorkerTask<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let _ = tx.send(f());
        });

        if self.job_tx.try_send(job).is_err() {
            debug!("Worker pool '{}' is shut down, dropping job", self.name);
        }

        WorkerTask { rx }
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.threads
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.job_tx.close();

        let current = std::thread::current().id();
        let handles = std::mem::take(
            &mut *self
                .threads
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );

        for handle in handles {
            // A job may drop the last reference to the pool; never join ourselves
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Worker thread in pool '{}' panicked", self.name);
            }
        }

        debug!("Worker pool '{}' stopped", self.name);
    }
}

fn worker_loop(rx: Receiver<Job>) {
    while let Ok(job) = rx.recv_blocking() {
        // Keep the thread alive if a job panics; its task resolves to an error
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
        if let Err(e) = result {
            error!("Panic in worker job: {:?}", e);
        }
    }
}

/// Pending result of a job submitted to a [`WorkerPool`]
#[derive(Debug)]
pub struct WorkerTask<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for WorkerTask<T> {
    type Output = crate::Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map_err(|_| crate::Error::Worker("job dropped before completing".to_string()))
    }
}
