//! Worker processes connected through framed stdin/stdout pipes
//!
//! The router keeps a bounded queue per worker. A worker writes a
//! [`WorkerFrame::Ready`] frame whenever it is idle, and the feeder answers
//! each one with exactly one task, so at most one task sits in the pipe and
//! the queue behaves like the in-memory transport's.

use super::codec::{self, FrameError, RouterFrame, WorkerFrame};
use super::{
    Delivery, DeliveryError, ResultSink, TaskReceiver, TaskSender, TransportError, WorkerId,
};
use crate::task::{Task, TaskResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How to launch one worker process
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Value for `CUDA_VISIBLE_DEVICES`; `None` leaves the variable untouched
    pub visible_devices: Option<String>,
}

/// Router side of a worker process's task queue
#[derive(Clone)]
pub struct ProcessTaskSender {
    tx: mpsc::Sender<Task>,
}

impl TaskSender for ProcessTaskSender {
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

/// A spawned worker process and the tasks pumping its pipes
pub struct WorkerProcess {
    pub id: WorkerId,
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
    pumps: Vec<JoinHandle<()>>,
}

impl WorkerProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the process to exit, killing it if it outlives `grace`
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(worker = %self.id, %status, "Worker process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(worker = %self.id, error = %e, "Failed to wait for worker process");
            }
            Err(_) => {
                tracing::warn!(
                    worker = %self.id,
                    grace_secs = grace.as_secs(),
                    "Worker did not exit within grace period, killing"
                );
                child.kill().await.context("Failed to kill worker process")?;
            }
        }

        for pump in &self.pumps {
            pump.abort();
        }

        Ok(())
    }
}

/// Spawn a worker process and connect its pipes to the router intake
pub fn spawn(
    command: &ProcessCommand,
    id: WorkerId,
    capacity: usize,
    intake: mpsc::Sender<Delivery>,
    shutdown: CancellationToken,
) -> Result<(ProcessTaskSender, WorkerProcess)> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);

    if let Some(devices) = &command.visible_devices {
        cmd.env("CUDA_VISIBLE_DEVICES", devices);
        tracing::debug!(worker = %id, devices = %devices, "Setting CUDA_VISIBLE_DEVICES");
    }

    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn worker process {:?}", command.program))?;

    let pid = child.id();
    let stdin = child.stdin.take().context("Worker stdin not captured")?;
    let stdout = child.stdout.take().context("Worker stdout not captured")?;

    tracing::info!(worker = %id, pid = ?pid, "Worker process spawned");

    let (sender, pumps) = connect(stdout, stdin, id.clone(), capacity, intake, shutdown);

    Ok((
        sender,
        WorkerProcess {
            id,
            pid,
            child: Mutex::new(Some(child)),
            pumps,
        },
    ))
}

/// Wire the router side of a framed worker connection.
///
/// `reader` carries [`WorkerFrame`]s from the worker and `writer` carries
/// [`RouterFrame`]s to it.
pub fn connect<R, W>(
    reader: R,
    writer: W,
    id: WorkerId,
    capacity: usize,
    intake: mpsc::Sender<Delivery>,
    shutdown: CancellationToken,
) -> (ProcessTaskSender, Vec<JoinHandle<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (task_tx, task_rx) = mpsc::channel(capacity);
    let (credit_tx, credit_rx) = mpsc::unbounded_channel();

    let feeder = tokio::spawn(feed_tasks(
        writer,
        task_rx,
        credit_rx,
        intake.clone(),
        id.clone(),
        shutdown.clone(),
    ));
    let reader = tokio::spawn(pump_results(reader, credit_tx, intake, id, shutdown));

    (ProcessTaskSender { tx: task_tx }, vec![feeder, reader])
}

async fn feed_tasks<W>(
    mut writer: W,
    mut tasks: mpsc::Receiver<Task>,
    mut credits: mpsc::UnboundedReceiver<()>,
    intake: mpsc::Sender<Delivery>,
    id: WorkerId,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let credit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            credit = credits.recv() => credit,
        };
        // Reader gone: the worker's stdout closed
        if credit.is_none() {
            return;
        }

        let task = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            task = tasks.recv() => task,
        };
        let Some(task) = task else { break };

        let request_id = task.id;
        tracing::debug!(worker = %id, request_id, "Writing task to worker");
        if let Err(e) = codec::write_frame(&mut writer, &RouterFrame::Task(task)).await {
            tracing::error!(worker = %id, request_id, error = %e, "Failed to write task to worker");
            // The written task and everything queued behind it would never run
            let _ = intake.send(Delivery::WorkerLost(id)).await;
            return;
        }
    }

    if let Err(e) = codec::write_frame(&mut writer, &RouterFrame::Shutdown).await {
        tracing::debug!(worker = %id, error = %e, "Could not deliver shutdown frame");
    }
}

async fn pump_results<R>(
    mut reader: R,
    credits: mpsc::UnboundedSender<()>,
    intake: mpsc::Sender<Delivery>,
    id: WorkerId,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match codec::read_frame::<_, WorkerFrame>(&mut reader).await {
            Ok(WorkerFrame::Ready) => {
                let _ = credits.send(());
            }
            Ok(WorkerFrame::Result(result)) => {
                if intake.send(Delivery::Result(result)).await.is_err() {
                    return;
                }
            }
            Err(FrameError::ConnectionClosed) => {
                if shutdown.is_cancelled() {
                    tracing::debug!(worker = %id, "Worker output closed");
                } else {
                    tracing::error!(worker = %id, "Worker output closed unexpectedly");
                }
                break;
            }
            Err(e) => {
                tracing::error!(worker = %id, error = %e, "Unreadable frame from worker");
                break;
            }
        }
    }

    let _ = intake.send(Delivery::WorkerLost(id)).await;
}

/// Worker-process side: results written as frames to `writer`
pub struct FramedResultSink<W> {
    writer: Arc<Mutex<W>>,
}

impl<W> Clone for FramedResultSink<W> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
        }
    }
}

impl<W> FramedResultSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    async fn write(&self, frame: &WorkerFrame) -> Result<(), FrameError> {
        let mut writer = self.writer.lock().await;
        codec::write_frame(&mut *writer, frame).await
    }
}

#[async_trait]
impl<W> ResultSink for FramedResultSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, result: TaskResult) -> Result<(), TransportError> {
        self.write(&WorkerFrame::Result(result)).await?;
        Ok(())
    }
}

/// Worker-process side: tasks read as frames from `reader`
pub struct FramedTaskReceiver<R, W> {
    reader: R,
    sink: FramedResultSink<W>,
    closed: bool,
}

impl<R, W> FramedTaskReceiver<R, W> {
    /// `sink` must write to the same pipe the router reads results from
    pub fn new(reader: R, sink: FramedResultSink<W>) -> Self {
        Self {
            reader,
            sink,
            closed: false,
        }
    }
}

#[async_trait]
impl<R, W> TaskReceiver for FramedTaskReceiver<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Option<Task> {
        if self.closed {
            return None;
        }

        if let Err(e) = self.sink.write(&WorkerFrame::Ready).await {
            tracing::error!(error = %e, "Failed to signal readiness");
            self.closed = true;
            return None;
        }

        match codec::read_frame::<_, RouterFrame>(&mut self.reader).await {
            Ok(RouterFrame::Task(task)) => Some(task),
            Ok(RouterFrame::Shutdown) => {
                tracing::info!("Shutdown requested by router");
                self.closed = true;
                None
            }
            Err(FrameError::ConnectionClosed) => {
                self.closed = true;
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Unreadable frame from router");
                self.closed = true;
                None
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Endpoints for a worker process talking over its own stdin/stdout
pub fn stdio() -> (
    FramedTaskReceiver<tokio::io::Stdin, tokio::io::Stdout>,
    FramedResultSink<tokio::io::Stdout>,
) {
    let sink = FramedResultSink::new(tokio::io::stdout());
    (FramedTaskReceiver::new(tokio::io::stdin(), sink.clone()), sink)
}
