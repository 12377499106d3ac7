//! Message channels between the router and its workers
//!
//! Application code only sees the traits in this module. Two implementations
//! exist: [`memory`] keeps workers inside the serving process, [`process`]
//! talks to one child process per worker over framed stdin/stdout.

pub mod codec;
pub mod memory;
pub mod process;

use crate::task::{Task, TaskResult};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Identity of a worker: its model group and position in that group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId {
    pub group: Arc<str>,
    pub index: usize,
}

impl WorkerId {
    pub fn new(group: impl Into<Arc<str>>, index: usize) -> Self {
        Self {
            group: group.into(),
            index,
        }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.group, self.index)
    }
}

/// Messages flowing into the router's result intake
#[derive(Debug)]
pub enum Delivery {
    Result(TaskResult),
    /// The worker stopped answering; its pending requests will never complete
    WorkerLost(WorkerId),
}

/// Why a task could not be handed to a worker
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("task queue is full")]
    Full,
    #[error("task queue is closed")]
    Closed,
}

/// Failures of the result path
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("result channel closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] codec::FrameError),
}

impl TransportError {
    /// Whether the result path itself is broken, as opposed to one result
    /// that could not be encoded
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Frame(codec::FrameError::TooLarge { .. } | codec::FrameError::Json(_)) => false,
            Self::Frame(_) => true,
        }
    }
}

/// Router side of a worker's task queue
pub trait TaskSender: Send + Sync {
    /// Enqueue without waiting; a full queue is reported, never waited on
    fn try_deliver(&self, task: Task) -> Result<(), DeliveryError>;

    /// Maximum number of queued tasks
    fn capacity(&self) -> usize;

    /// Tasks queued and not yet picked up by the worker
    fn queued(&self) -> usize;
}

/// Worker side of its task queue
#[async_trait]
pub trait TaskReceiver: Send {
    /// Wait for the next task; `None` once the router side is gone
    async fn recv(&mut self) -> Option<Task>;

    /// Stop accepting tasks
    fn close(&mut self);
}

/// Worker side of the result path
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn send(&self, result: TaskResult) -> Result<(), TransportError>;
}
