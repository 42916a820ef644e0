//! Host-thread executor. Work that must run on the host's own thread is queued here and
//! awaited by the submitting task; the host drains the queue from its update tick.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;

use tokio::sync::oneshot;

type Job = Box<dyn FnOnce() + Send>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HostError {
    #[error("host queue closed")]
    Closed,
    /// The job was dropped or panicked before producing a result.
    #[error("host job dropped")]
    Dropped,
}

/// Submits work to the host thread. Cheap to clone.
#[derive(Clone)]
pub struct HostHandle {
    tx: mpsc::Sender<Job>,
}

/// The host side: drains submitted jobs in FIFO order.
pub struct HostQueue {
    rx: mpsc::Receiver<Job>,
}

pub fn host_queue() -> (HostHandle, HostQueue) {
    let (tx, rx) = mpsc::channel();
    (HostHandle { tx }, HostQueue { rx })
}

impl HostHandle {
    /// Run `f` on the host thread and wait for its result.
    pub async fn run<F, R>(&self, f: F) -> Result<R, HostError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Box::new(move || {
                let _ = tx.send(f());
            }))
            .map_err(|_| HostError::Closed)?;
        rx.await.map_err(|_| HostError::Dropped)
    }

    /// Queue `f` without waiting for it.
    pub fn post<F>(&self, f: F) -> Result<(), HostError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Box::new(f)).map_err(|_| HostError::Closed)
    }
}

impl HostQueue {
    /// Run every job queued so far. Returns how many ran.
    pub fn pump(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            run_job(job);
            ran += 1;
        }
        ran
    }

    /// Serve jobs on a dedicated thread until every handle is dropped.
    pub fn spawn_thread(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("mirror-host".into())
            .spawn(move || {
                while let Ok(job) = self.rx.recv() {
                    run_job(job);
                }
                tracing::debug!("host thread exiting");
            })
    }
}

fn run_job(job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::warn!("host job panicked");
    }
}
