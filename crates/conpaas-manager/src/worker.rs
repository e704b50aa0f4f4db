// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-instance job queue.
//!
//! Every service instance owns one worker task. Jobs run one at a time in
//! submission order and always run to completion; a shutdown request is only
//! observed between jobs.

use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{ManagerError, Result};
use crate::state::lock;

/// A unit of background work.
pub type Job = BoxFuture<'static, ()>;

/// Serial background executor.
#[derive(Debug)]
pub struct Worker {
    name: String,
    tx: mpsc::UnboundedSender<Job>,
    shutdown: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Spawn the worker task on the current runtime.
    pub fn spawn(name: impl Into<String>) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(run(name.clone(), rx, shutdown.clone()));
        Self {
            name,
            tx,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue a job.
    pub fn submit(&self, job: Job) -> Result<()> {
        self.tx
            .send(job)
            .map_err(|_| ManagerError::Unknown(format!("worker {} has stopped", self.name)))
    }

    /// Wait until every job queued so far has finished.
    pub async fn wait_idle(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        let marker = async move {
            let _ = done_tx.send(());
        }
        .boxed();
        if self.submit(marker).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Stop the worker after the running job and wait for the task to exit.
    pub async fn stop(&self) {
        self.shutdown.notify_one();
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run(name: String, mut rx: mpsc::UnboundedReceiver<Job>, shutdown: Arc<Notify>) {
    debug!(worker = %name, "Worker started");
    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => {
                info!(worker = %name, "Worker received shutdown signal");
                break;
            }

            job = rx.recv() => match job {
                Some(job) => job.await,
                None => break,
            }
        }
    }
    debug!(worker = %name, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let worker = Worker::spawn("test");
        let seen = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..5 {
            let seen = seen.clone();
            worker
                .submit(
                    async move {
                        tokio::task::yield_now().await;
                        seen.lock().unwrap().push(i);
                    }
                    .boxed(),
                )
                .unwrap();
        }
        worker.wait_idle().await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_submit_after_stop_fails() {
        let worker = Worker::spawn("test");
        worker.stop().await;
        assert!(worker.submit(async {}.boxed()).is_err());
    }
}
