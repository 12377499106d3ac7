//! In-process transport backed by bounded tokio channels

use super::{
    Delivery, DeliveryError, ResultSink, TaskReceiver, TaskSender, TransportError, WorkerId,
};
use crate::task::{Task, TaskResult};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Create the task queue for one worker plus its result sink into `intake`
pub fn channel(
    capacity: usize,
    intake: mpsc::Sender<Delivery>,
) -> (MemoryTaskSender, MemoryTaskReceiver, MemoryResultSink) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        MemoryTaskSender { tx },
        MemoryTaskReceiver { rx },
        MemoryResultSink { intake },
    )
}

#[derive(Clone)]
pub struct MemoryTaskSender {
    tx: mpsc::Sender<Task>,
}

impl TaskSender for MemoryTaskSender {
    fn try_deliver(&self, task: Task) -> Result<(), DeliveryError> {
        self.tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

pub struct MemoryTaskReceiver {
    rx: mpsc::Receiver<Task>,
}

#[async_trait]
impl TaskReceiver for MemoryTaskReceiver {
    async fn recv(&mut self) -> Option<Task> {
        self.rx.recv().await
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

#[derive(Clone)]
pub struct MemoryResultSink {
    intake: mpsc::Sender<Delivery>,
}

impl MemoryResultSink {
    /// Report the owning worker as gone
    pub async fn worker_lost(&self, worker: WorkerId) {
        let _ = self.intake.send(Delivery::WorkerLost(worker)).await;
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn send(&self, result: TaskResult) -> Result<(), TransportError> {
        self.intake
            .send(Delivery::Result(result))
            .await
            .map_err(|_| TransportError::Closed)
    }
}
