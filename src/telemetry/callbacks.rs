//! Dedicated worker running per-request callbacks
//!
//! Callbacks are queued from any thread and executed on one OS thread that
//! owns a single-threaded runtime. Each callback runs as its own task with a
//! cancellation token derived from the worker's root token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Default capacity of the callback queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Async handler invoked with a status payload
pub type CallbackHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`CallbackHandler`]
pub fn callback<F, Fut>(f: F) -> CallbackHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

struct Job {
    request_id: String,
    handler: CallbackHandler,
    payload: Value,
    token: CancellationToken,
}

type TaskTable = Arc<Mutex<HashMap<String, (CancellationToken, Instant)>>>;

/// Runs callbacks off the caller's runtime
pub struct CallbackWorker {
    tx: mpsc::Sender<Job>,
    root: CancellationToken,
    tasks: TaskTable,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CallbackWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackWorker")
            .field("stopped", &self.root.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl CallbackWorker {
    /// Start the worker thread
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread cannot be spawned
    pub fn spawn(capacity: usize) -> Result<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let root = CancellationToken::new();
        let tasks: TaskTable = Arc::new(Mutex::new(HashMap::new()));

        let thread = std::thread::Builder::new()
            .name("callback-worker".to_string())
            .spawn({
                let root = root.clone();
                let tasks = tasks.clone();
                move || worker_main(rx, root, tasks)
            })?;

        Ok(Self {
            tx,
            root,
            tasks,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue a callback for execution
    ///
    /// # Errors
    ///
    /// Returns a pub/sub error if the worker has stopped or its queue is full
    pub fn enqueue(&self, request_id: &str, handler: CallbackHandler, payload: Value) -> Result<()> {
        if self.root.is_cancelled() {
            return Err(Error::PubSub("callback worker stopped".to_string()));
        }

        let token = self.root.child_token();
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.insert(request_id.to_string(), (token.clone(), Instant::now()));
        }

        self.tx
            .try_send(Job {
                request_id: request_id.to_string(),
                handler,
                payload,
                token,
            })
            .map_err(|e| {
                if let Ok(mut tasks) = self.tasks.lock() {
                    tasks.remove(request_id);
                }
                Error::PubSub(format!("cannot queue callback for {request_id}: {e}"))
            })
    }

    /// Cancel a queued or running callback
    pub fn cancel(&self, request_id: &str) -> bool {
        let entry = self.tasks.lock().ok().and_then(|mut t| t.remove(request_id));
        entry.is_some_and(|(token, _)| {
            token.cancel();
            true
        })
    }

    /// Cancel callbacks queued or started more than `max_age` ago
    pub fn cancel_older_than(&self, max_age: Duration) -> usize {
        let Ok(mut tasks) = self.tasks.lock() else {
            return 0;
        };
        let now = Instant::now();
        let before = tasks.len();
        tasks.retain(|_, (token, started)| {
            let keep = now.duration_since(*started) < max_age;
            if !keep {
                token.cancel();
            }
            keep
        });
        before - tasks.len()
    }

    /// Number of callbacks queued or running
    #[must_use]
    pub fn active(&self) -> usize {
        self.tasks.lock().map_or(0, |t| t.len())
    }

    /// Cancel every callback and wait for the worker thread to exit
    pub fn shutdown(&self) {
        self.root.cancel();
        let thread = self.thread.lock().ok().and_then(|mut t| t.take());
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::error!("callback worker thread panicked");
            }
            tracing::info!("callback worker stopped");
        }
    }
}

impl Drop for CallbackWorker {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

fn worker_main(mut rx: mpsc::Receiver<Job>, root: CancellationToken, tasks: TaskTable) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start callback runtime");
            return;
        }
    };

    tracing::info!("callback worker started");
    runtime.block_on(async move {
        loop {
            let job = tokio::select! {
                () = root.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let tasks = tasks.clone();
            tokio::spawn(async move {
                let Job {
                    request_id,
                    handler,
                    payload,
                    token,
                } = job;

                tokio::select! {
                    () = token.cancelled() => {
                        tracing::debug!(request_id = %request_id, "callback cancelled");
                    }
                    outcome = handler(payload) => {
                        if let Err(e) = outcome {
                            tracing::error!(request_id = %request_id, error = %e, "callback failed");
                        }
                    }
                }

                if let Ok(mut tasks) = tasks.lock() {
                    tasks.remove(&request_id);
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn callbacks_run_on_worker_thread() {
        let worker = CallbackWorker::spawn(8).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handler = callback(move |payload| {
            let tx = tx.clone();
            async move {
                let thread = std::thread::current().name().map(str::to_string);
                tx.send((payload, thread))?;
                Ok(())
            }
        });
        worker.enqueue("r1", handler, json!({"v": 1})).unwrap();

        let (payload, thread) = rx.recv().await.unwrap();
        assert_eq!(payload, json!({"v": 1}));
        assert_eq!(thread.as_deref(), Some("callback-worker"));
        worker.shutdown();
    }

    #[tokio::test]
    async fn cancel_stops_long_running_callback() {
        let worker = CallbackWorker::spawn(8).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let handler = callback(move |_| {
            let tx = tx.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                tx.send(())?;
                Ok(())
            }
        });
        worker.enqueue("slow", handler, Value::Null).unwrap();
        assert!(worker.cancel("slow"));
        assert!(!worker.cancel("slow"));

        worker.shutdown();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_fails() {
        let worker = CallbackWorker::spawn(1).unwrap();
        worker.shutdown();
        let err = worker
            .enqueue("r", callback(|_| async { Ok(()) }), Value::Null)
            .unwrap_err();
        assert!(matches!(err, Error::PubSub(_)));
    }
}
