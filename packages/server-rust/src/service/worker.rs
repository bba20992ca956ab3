//! Dedicated background worker fed by a bounded channel.
//!
//! A `BackgroundWorker<R>` owns one tokio task that drains a bounded mpsc
//! queue and hands each task to a `BackgroundRunnable`. Tasks are processed
//! strictly one at a time, so work submitted to a single worker is
//! serialized. An optional retry tick lets the runnable re-check state that
//! a previous task could not settle.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

/// Task handler executed by a [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called on every tick when the worker was started with a tick interval.
    async fn on_tick(&mut self) {}

    /// Called once after the queue is closed or a stop was requested.
    async fn shutdown(&mut self) {}
}

/// Why a task could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("worker queue is full")]
    Full,
    #[error("worker is not running")]
    Stopped,
}

/// Handle to a single background task processing `R::Task`s in order.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    name: &'static str,
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker task on the current tokio runtime.
    ///
    /// `capacity` bounds the queue; `tick` enables periodic `on_tick` calls.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(
        name: &'static str,
        mut runnable: R,
        capacity: usize,
        tick: Option<Duration>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(capacity.max(1));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            // A disabled tick is modelled as a very long interval so the
            // select below keeps a single shape.
            let period = tick.unwrap_or(Duration::from_secs(86_400));
            let mut tick_interval = tokio::time::interval(period);
            tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            tick_interval.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    _ = tick_interval.tick(), if tick.is_some() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
            tracing::debug!(worker = name, "background worker stopped");
        });

        tracing::debug!(worker = name, capacity, "background worker started");
        Self {
            name,
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether [`stop`](Self::stop) has not been called yet.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.tx.is_some()
    }

    /// Queues a task, waiting for room if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::Stopped`] if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> Result<(), SubmitError> {
        match &self.tx {
            Some(tx) => tx.send(task).await.map_err(|_| SubmitError::Stopped),
            None => Err(SubmitError::Stopped),
        }
    }

    /// Queues a task without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::Full`] if the queue has no room, or
    /// [`SubmitError::Stopped`] if the worker has been stopped.
    pub fn try_submit(&self, task: R::Task) -> Result<(), SubmitError> {
        let Some(tx) = &self.tx else {
            return Err(SubmitError::Stopped);
        };
        tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::Full,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Stopped,
        })
    }

    /// Cloned queue handle, for submitting from code that cannot borrow the
    /// worker across an `.await`. `None` once stopped.
    #[must_use]
    pub fn sender(&self) -> Option<mpsc::Sender<R::Task>> {
        self.tx.clone()
    }

    /// Stops the worker and waits for its task to finish.
    ///
    /// A task already being processed runs to completion first; queued tasks
    /// that were not started are dropped.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(worker = self.name, error = %e, "background worker panicked");
            }
        }
    }
}
