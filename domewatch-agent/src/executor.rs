//! Single-thread driver executor
//!
//! Driver objects must always be called from the same thread. Every call goes
//! through one long-lived worker that drains a FIFO queue of closures:
//! - `submit` enqueues immediately and returns a future for the result
//! - a job whose token is already cancelled when dequeued is not run
//! - a panicking job completes its future with `Panicked`, the worker survives
//! - `shutdown` closes the queue, lets the worker drain, joins with a bound

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("driver work cancelled before it ran")]
    Cancelled,
    #[error("driver executor is shut down")]
    ShutDown,
    #[error("driver work panicked: {0}")]
    Panicked(String),
}

pub struct DriverExecutor {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    exited: Mutex<Option<mpsc::Receiver<()>>>,
}

impl DriverExecutor {
    pub fn new() -> std::io::Result<Self> {
        let (sender, queue) = mpsc::channel::<Job>();
        let (exit_tx, exit_rx) = mpsc::channel::<()>();

        let worker = std::thread::Builder::new()
            .name("driver-executor".to_string())
            .spawn(move || {
                // La boucle se termine quand tous les Sender sont droppés et la file vidée
                for job in queue {
                    job();
                }
                let _ = exit_tx.send(());
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            exited: Mutex::new(Some(exit_rx)),
        })
    }

    /// Enqueue `work`; the returned future resolves once the worker ran it.
    ///
    /// The job is queued before this function returns, so submission order is
    /// execution order even if the futures are polled in a different order.
    pub fn submit<T, F>(
        &self,
        cancel: &CancellationToken,
        work: F,
    ) -> impl Future<Output = Result<T, ExecutorError>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let token = cancel.clone();

        let job: Job = Box::new(move || {
            if token.is_cancelled() {
                let _ = tx.send(Err(ExecutorError::Cancelled));
                return;
            }
            let outcome = catch_unwind(AssertUnwindSafe(work)).map_err(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                ExecutorError::Panicked(message)
            });
            let _ = tx.send(outcome);
        });

        let queued = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).map_err(|_| ExecutorError::ShutDown),
            None => Err(ExecutorError::ShutDown),
        };

        async move {
            queued?;
            rx.await.map_err(|_| ExecutorError::ShutDown)?
        }
    }

    /// Stop accepting work, drain the queue and join the worker within `wait`.
    ///
    /// Returns `false` when the worker did not exit in time; it is detached.
    pub fn shutdown(&self, wait: Duration) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            return true;
        };
        drop(sender);

        let exited = self
            .exited
            .lock()
            .take()
            .map(|rx| rx.recv_timeout(wait).is_ok())
            .unwrap_or(true);

        let handle = self.worker.lock().take();
        if exited {
            if let Some(handle) = handle {
                let _ = handle.join();
            }
            debug!("driver executor stopped");
        } else {
            warn!("⚠️ driver executor did not exit within {:?}, detaching worker", wait);
        }
        exited
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl Drop for DriverExecutor {
    // pas d'attente ici : souvent droppé depuis un worker tokio.
    // Le thread vide la file puis s'arrête seul; `shutdown` pour un arrêt borné.
    fn drop(&mut self) {
        self.sender.get_mut().take();
    }
}
