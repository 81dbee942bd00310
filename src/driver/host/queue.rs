//! In-order command queue backed by a dedicated worker thread.

use crate::driver::{NativeError, NativeResult, Status};
use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() -> NativeResult<()> + Send + 'static>;

enum Command {
    Run(Job),
    Fence(Sender<()>),
}

/// Run `job`, turning a panic into a native failure.
fn guarded<F>(job: F) -> NativeResult<()>
where
    F: FnOnce() -> NativeResult<()>,
{
    panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|payload| Err(panicked(payload)))
}

fn panicked(payload: Box<dyn Any + Send>) -> NativeError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    NativeError::new(Status::OUT_OF_RESOURCES, format!("kernel panicked: {message}"))
}

/// A device-ordered FIFO. Commands run on the worker in submission order;
/// the host only waits when it asks to.
pub(crate) struct HostQueue {
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    failure: Arc<Mutex<Option<NativeError>>>,
    completed: Arc<AtomicU64>,
}

impl HostQueue {
    pub(crate) fn spawn(name: String) -> NativeResult<Self> {
        let (sender, receiver) = unbounded::<Command>();
        let failure: Arc<Mutex<Option<NativeError>>> = Arc::new(Mutex::new(None));
        let completed = Arc::new(AtomicU64::new(0));

        let worker_failure = failure.clone();
        let worker_completed = completed.clone();
        let worker = thread::Builder::new()
            .name(name)
            .spawn(move || {
                for command in receiver {
                    match command {
                        Command::Run(job) => {
                            if let Err(err) = guarded(job) {
                                let mut slot = worker_failure.lock();
                                if slot.is_none() {
                                    *slot = Some(err);
                                }
                            }
                            worker_completed.fetch_add(1, Ordering::Relaxed);
                        }
                        Command::Fence(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })
            .map_err(|e| {
                NativeError::new(Status::OUT_OF_HOST_MEMORY, format!("queue spawn failed: {e}"))
            })?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            failure,
            completed,
        })
    }

    fn send(&self, command: Command) -> NativeResult<()> {
        self.sender
            .as_ref()
            .and_then(|sender| sender.send(command).ok())
            .ok_or_else(|| NativeError::new(Status::INVALID_COMMAND_QUEUE, "queue is shut down"))
    }

    /// Queue `job`; with `blocking`, wait for it and return its own result.
    pub(crate) fn submit<F>(&self, blocking: bool, job: F) -> NativeResult<()>
    where
        F: FnOnce() -> NativeResult<()> + Send + 'static,
    {
        if !blocking {
            return self.send(Command::Run(Box::new(job)));
        }

        let (tx, rx) = bounded::<NativeResult<()>>(1);
        self.send(Command::Run(Box::new(move || {
            let result = guarded(job);
            let _ = tx.send(result);
            Ok(())
        })))?;
        rx.recv().unwrap_or_else(|_| {
            Err(NativeError::new(
                Status::OUT_OF_RESOURCES,
                "queue worker dropped a blocking command",
            ))
        })
    }

    /// Wait until every queued command ran, then report the first
    /// asynchronous failure since the last call.
    pub(crate) fn finish(&self) -> NativeResult<()> {
        let (tx, rx) = bounded(1);
        self.send(Command::Fence(tx))?;
        rx.recv().map_err(|_| {
            NativeError::new(Status::OUT_OF_RESOURCES, "queue worker exited")
        })?;
        match self.failure.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub(crate) fn shutdown(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
