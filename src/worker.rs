//! Worker loop: pull one task, run the backend, emit results
//!
//! ```text
//! Idle --task--> Processing --results sent--> Idle
//! Idle --shutdown / queue closed--> Terminating --> Exited
//! ```
//!
//! The shutdown signal is only observed while idle; a task that started
//! processing always runs to completion and emits its terminal result.

use crate::backend::{self, Backend};
use crate::config::ServingConfig;
use crate::shutdown;
use crate::task::{Payload, StreamMode, Task, TaskResult, Turn};
use crate::transport::{self, ResultSink, TaskReceiver, TransportError, WorkerId};
use anyhow::{Context, Result};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Fragments buffered between the backend thread and the worker loop
const FRAGMENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Processing,
    Terminating,
    Exited,
}

/// Groups streamed fragments into flushes according to `n` and `gtype`
#[derive(Debug)]
pub struct StreamBatcher {
    every: usize,
    mode: StreamMode,
    produced: usize,
    reply: String,
    window: String,
}

/// Text of the terminal result plus the whole reply
#[derive(Debug, PartialEq, Eq)]
pub struct FinalFlush {
    pub text: String,
    pub reply: String,
}

impl StreamBatcher {
    pub fn new(n: usize, mode: StreamMode) -> Self {
        Self {
            every: n.max(1),
            mode,
            produced: 0,
            reply: String::new(),
            window: String::new(),
        }
    }

    /// Add one produced unit; returns the text to flush when one is due
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        self.produced += 1;
        self.reply.push_str(fragment);
        self.window.push_str(fragment);

        if self.produced % self.every != 0 {
            return None;
        }

        Some(match self.mode {
            StreamMode::Total => {
                self.window.clear();
                self.reply.clone()
            }
            StreamMode::Increase => std::mem::take(&mut self.window),
        })
    }

    pub fn produced(&self) -> usize {
        self.produced
    }

    pub fn finish(self) -> FinalFlush {
        let text = match self.mode {
            StreamMode::Total => self.reply.clone(),
            StreamMode::Increase => self.window,
        };
        FinalFlush {
            text,
            reply: self.reply,
        }
    }
}

enum Outcome {
    Batch(Vec<String>),
    Reply(String),
    Streamed,
}

/// One worker bound to a device set and a backend
pub struct Worker<R, S> {
    id: WorkerId,
    devices: Vec<u32>,
    backend: Option<Box<dyn Backend>>,
    tasks: R,
    results: S,
    shutdown: CancellationToken,
    state: WorkerState,
}

impl<R, S> Worker<R, S>
where
    R: TaskReceiver,
    S: ResultSink,
{
    pub fn new(
        id: WorkerId,
        devices: Vec<u32>,
        backend: Box<dyn Backend>,
        tasks: R,
        results: S,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            devices,
            backend: Some(backend),
            tasks,
            results,
            shutdown,
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Initialise the backend, then serve until shutdown or until the task
    /// queue closes. Only a broken result path ends the loop with an error.
    pub async fn run(&mut self) -> Result<()> {
        self.init_backend().await?;

        tracing::info!(worker = %self.id, devices = ?self.devices, "Worker ready");
        let outcome = self.serve().await;

        self.state = WorkerState::Terminating;
        self.tasks.close();
        self.state = WorkerState::Exited;

        match &outcome {
            Ok(()) => tracing::info!(worker = %self.id, "Worker exited"),
            Err(e) => tracing::error!(worker = %self.id, error = %e, "Worker exited with error"),
        }
        outcome.map_err(Into::into)
    }

    async fn init_backend(&mut self) -> Result<()> {
        let mut backend = self.backend.take().context("Backend already taken")?;
        let devices = self.devices.clone();

        let (backend, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = backend.init(&devices);
            (backend, outcome)
        })
        .await
        .context("Backend initialisation panicked")?;

        outcome.with_context(|| format!("Failed to initialise backend '{}'", backend.name()))?;
        self.backend = Some(backend);
        Ok(())
    }

    async fn serve(&mut self) -> Result<(), TransportError> {
        loop {
            self.state = WorkerState::Idle;

            let task = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    tracing::info!(worker = %self.id, "Shutdown observed");
                    break;
                }
                task = self.tasks.recv() => task,
            };
            let Some(task) = task else {
                tracing::info!(worker = %self.id, "Task queue closed");
                break;
            };

            self.state = WorkerState::Processing;
            let started = Instant::now();
            let (request_id, method) = (task.id, task.method());

            self.process(task).await?;

            tracing::debug!(
                worker = %self.id,
                request_id,
                method = %method,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Task processed"
            );
        }
        Ok(())
    }

    async fn process(&mut self, task: Task) -> Result<(), TransportError> {
        let Task { id, payload, .. } = task;

        let Some(mut backend) = self.backend.take() else {
            return self
                .results
                .send(TaskResult::failure(id, "backend unavailable"))
                .await;
        };

        let (fragment_tx, mut fragment_rx) = mpsc::channel::<String>(FRAGMENT_BUFFER);
        let job_payload = payload.clone();
        let job = tokio::task::spawn_blocking(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                invoke(backend.as_mut(), &job_payload, &fragment_tx)
            }));
            (backend, outcome)
        });

        let (mut batcher, history, query) = match &payload {
            Payload::ChatStream {
                n,
                gtype,
                history,
                query,
                ..
            } => (
                Some(StreamBatcher::new(*n, *gtype)),
                history.clone(),
                query.clone(),
            ),
            Payload::Chat { history, query, .. } => (None, history.clone(), query.clone()),
            Payload::Generate { .. } => (None, Vec::new(), String::new()),
        };

        let mut rejected = false;
        while let Some(fragment) = fragment_rx.recv().await {
            if let Some(batcher) = batcher.as_mut()
                && let Some(text) = batcher.push(&fragment)
            {
                self.emit(TaskResult::chunk(id, text, history.clone()), &mut rejected)
                    .await?;
            }
        }

        let (backend, outcome) = match job.await {
            Ok(joined) => joined,
            Err(e) => {
                tracing::error!(worker = %self.id, request_id = id, error = %e, "Backend job lost");
                return self
                    .emit(TaskResult::failure(id, "backend job lost"), &mut rejected)
                    .await;
            }
        };
        self.backend = Some(backend);

        let result = match outcome {
            Ok(Ok(Outcome::Batch(outputs))) => TaskResult::batch(id, outputs),
            Ok(Ok(Outcome::Reply(reply))) => {
                let history = with_turn(history, query, reply.clone());
                TaskResult::chat(id, reply, history)
            }
            Ok(Ok(Outcome::Streamed)) => {
                let flush = batcher
                    .map(StreamBatcher::finish)
                    .unwrap_or(FinalFlush {
                        text: String::new(),
                        reply: String::new(),
                    });
                let history = with_turn(history, query, flush.reply);
                TaskResult::chat(id, flush.text, history)
            }
            Ok(Err(e)) => {
                tracing::warn!(worker = %self.id, request_id = id, error = %e, "Backend failed");
                TaskResult::failure(id, format!("{e:#}"))
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                tracing::error!(worker = %self.id, request_id = id, panic = %msg, "Backend panicked");
                TaskResult::failure(id, format!("backend panicked: {msg}"))
            }
        };

        self.emit(result, &mut rejected).await
    }

    /// Send one result of the current task.
    ///
    /// A result the transport cannot encode fails the request in its place;
    /// the task's remaining results are then dropped. Only a broken result
    /// path is returned as an error.
    async fn emit(
        &mut self,
        result: TaskResult,
        rejected: &mut bool,
    ) -> Result<(), TransportError> {
        if *rejected {
            return Ok(());
        }

        let id = result.id;
        match self.results.send(result).await {
            Err(e) if !e.is_fatal() => {
                tracing::warn!(
                    worker = %self.id,
                    request_id = id,
                    error = %e,
                    "Result rejected by transport"
                );
                *rejected = true;
                self.results
                    .send(TaskResult::failure(id, format!("result could not be delivered: {e}")))
                    .await
            }
            outcome => outcome,
        }
    }
}

fn invoke(
    backend: &mut dyn Backend,
    payload: &Payload,
    fragments: &mpsc::Sender<String>,
) -> Result<Outcome> {
    match payload {
        Payload::Generate { texts, params } => Ok(Outcome::Batch(backend.generate(texts, params)?)),
        Payload::Chat {
            query,
            history,
            params,
        } => Ok(Outcome::Reply(backend.chat(query, history, params)?)),
        Payload::ChatStream {
            query,
            history,
            params,
            ..
        } => {
            for fragment in backend.chat_stream(query, history, params)? {
                if fragments.blocking_send(fragment?).is_err() {
                    anyhow::bail!("worker stopped consuming fragments");
                }
            }
            Ok(Outcome::Streamed)
        }
    }
}

fn with_turn(mut history: Vec<Turn>, q: String, a: String) -> Vec<Turn> {
    history.push(Turn { q, a });
    history
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Device ids handed to the backend of a worker process.
///
/// The pool pins a process to its placement through `CUDA_VISIBLE_DEVICES`,
/// and the CUDA runtime numbers the visible devices from zero, so a masked
/// process addresses its devices as `0..len`.
pub fn local_devices(configured: &[u32], visible: Option<&str>) -> Vec<u32> {
    match visible {
        Some(mask) if !mask.trim().is_empty() => (0..configured.len() as u32).collect(),
        _ => configured.to_vec(),
    }
}

/// Entry point of a worker process: serve one placement of `model` over
/// stdin/stdout until the router asks it to stop.
pub async fn run_stdio(config: &ServingConfig, model: &str, index: usize) -> Result<()> {
    let model_config = config
        .models
        .get(model)
        .with_context(|| format!("Model '{}' not found in configuration", model))?;
    let placement = model_config.workers.get(index).with_context(|| {
        format!(
            "Model '{}' has {} workers, no index {}",
            model,
            model_config.workers.len(),
            index
        )
    })?;

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            shutdown::wait_for_signal().await;
            token.cancel();
        }
    });

    let visible = std::env::var("CUDA_VISIBLE_DEVICES").ok();
    let devices = local_devices(&placement.device_id, visible.as_deref());

    let (tasks, results) = transport::process::stdio();
    let mut worker = Worker::new(
        WorkerId::new(model, index),
        devices,
        backend::build(&model_config.backend),
        tasks,
        results,
        token,
    );

    worker.run().await
}
