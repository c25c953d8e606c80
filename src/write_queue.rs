use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::panic_message;
use crate::error::DataLayerError;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// FIFO queue of remote writes drained by a single task.
///
/// Each job is awaited to completion, success or failure, and followed by a fixed pause before the next one
/// starts. A burst of N writes therefore takes at least `N * delay`. Each write runs in its own task, so a panicking
/// write settles as [`DataLayerError::WritePanicked`] and the drain keeps going. Jobs already queued run even if the submitter
/// stops waiting for them, and dropping the queue lets the drain finish them before it exits.
pub(crate) struct WriteQueue {
    name:    String,
    delay:   Duration,
    tx:      mpsc::UnboundedSender<Job>,
    rx:      Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    drain:   Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl WriteQueue {
    pub(crate) fn new<S: ToString>(name: S, delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            delay,
            tx,
            rx: Mutex::new(Some(rx)),
            drain: Mutex::new(None),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Writes submitted but not yet settled.
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    // The drain task is started by the first submission so that the queue can be built outside of a runtime.
    fn ensure_drain(&self) {
        let mut drain = self.drain.lock();
        if drain.is_some() {
            return;
        }

        let Some(mut rx) = self.rx.lock().take()
        else {
            return;
        };

        let name = self.name.clone();
        let delay = self.delay;
        log::debug!("[{name}] starting write queue drain");
        *drain = Some(tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
                tokio::time::sleep(delay).await;
            }
            log::debug!("[{name}] write queue closed");
        }));
    }

    /// Enqueues `write` and waits for it to settle.
    pub(crate) async fn submit<T, Fut>(&self, write: Fut) -> Result<T, DataLayerError>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, DataLayerError>> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let pending = self.pending.clone();
        let name = self.name.clone();

        let job: Job = Box::pin(async move {
            let settled = PendingGuard(pending);
            let result = match tokio::spawn(write).await {
                Ok(result) => result,
                Err(err) if err.is_panic() => {
                    let message = panic_message(err.into_panic().as_ref());
                    log::error!("[{name}] write panicked: {message}");
                    Err(DataLayerError::WritePanicked(message))
                }
                Err(err) => {
                    log::error!("[{name}] write task cancelled: {err}");
                    Err(DataLayerError::QueueClosed)
                }
            };
            drop(settled);
            // The submitter may have stopped waiting; the write still happened.
            let _ = reply_tx.send(result);
        });

        self.pending.fetch_add(1, Ordering::SeqCst);
        self.ensure_drain();

        if self.tx.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            log::error!("[{}] write submitted to a closed queue", self.name);
            return Err(DataLayerError::QueueClosed);
        }

        reply_rx.await.map_err(|_| DataLayerError::QueueClosed)?
    }
}

// Settles one pending write when the job is done with it, however it ends.
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueue")
            .field("name", &self.name)
            .field("delay", &self.delay)
            .field("pending", &self.pending())
            .finish()
    }
}
