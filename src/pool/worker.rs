use async_channel::Receiver;
use futures::FutureExt;
use std::{any::Any, panic::AssertUnwindSafe};

use super::{Task, WorkerId};

/// One executor of the pool, draining the shared queue until it is closed and empty.
pub(crate) struct Worker {
    id: WorkerId,
    queue: Receiver<Task>,
}

impl Worker {
    pub fn new(id: WorkerId, queue: Receiver<Task>) -> Self {
        Self { id, queue }
    }

    /// run the worker loop
    /// Every task runs to completion before the next one is received.
    pub async fn run(self) {
        log::debug!("[worker-{:03}] started", self.id);
        while let Ok(task) = self.queue.recv().await {
            // the closure call happens inside the guarded future, so a panic while
            // building the task future is caught as well
            let outcome = AssertUnwindSafe(async move { task.run().await })
                .catch_unwind()
                .await;
            match outcome {
                Ok(()) => log::debug!("[worker-{:03}] done", self.id),
                Err(payload) => log::error!(
                    "[worker-{:03}] task panicked: {}",
                    self.id,
                    panic_message(payload.as_ref())
                ),
            }
        }
        log::debug!("[worker-{:03}] exited", self.id);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
