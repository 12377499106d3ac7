//! Request router
//!
//! Assigns request ids, picks a worker round-robin within the model's group
//! and buffers results per id until the caller collects them.

use crate::error::{ServeError, ServeResult};
use crate::metrics;
use crate::task::{Payload, RequestId, Task, TaskResult};
use crate::transport::{Delivery, DeliveryError, TaskSender, WorkerId};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A worker as seen by the router
pub struct RoutedWorker {
    pub id: WorkerId,
    pub devices: Vec<u32>,
    pub pid: Option<u32>,
    sender: Arc<dyn TaskSender>,
    alive: AtomicBool,
}

impl RoutedWorker {
    pub fn new(
        id: WorkerId,
        devices: Vec<u32>,
        pid: Option<u32>,
        sender: Arc<dyn TaskSender>,
    ) -> Self {
        Self {
            id,
            devices,
            pid,
            sender,
            alive: AtomicBool::new(true),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            model: self.id.group.to_string(),
            index: self.id.index,
            devices: self.devices.clone(),
            pid: self.pid,
            alive: self.is_alive(),
            queued: self.sender.queued(),
            capacity: self.sender.capacity(),
        }
    }
}

/// Snapshot of one worker for health reporting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerStatus {
    pub model: String,
    pub index: usize,
    pub devices: Vec<u32>,
    pub pid: Option<u32>,
    pub alive: bool,
    pub queued: usize,
    pub capacity: usize,
}

struct Group {
    workers: Vec<Arc<RoutedWorker>>,
    next: AtomicUsize,
}

impl Group {
    /// Next live worker in round-robin order
    fn pick(&self) -> Option<&Arc<RoutedWorker>> {
        let len = self.workers.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        (0..len)
            .map(|offset| &self.workers[(start + offset) % len])
            .find(|worker| worker.is_alive())
    }
}

/// Buffered results of one in-flight request
struct PendingEntry {
    worker: WorkerId,
    model: String,
    created: Instant,
    tx: StdMutex<Option<mpsc::UnboundedSender<TaskResult>>>,
    rx: Mutex<mpsc::UnboundedReceiver<TaskResult>>,
    /// A terminal result has been buffered
    terminated: AtomicBool,
}

impl PendingEntry {
    fn new(worker: WorkerId, model: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            worker,
            model,
            created: Instant::now(),
            tx: StdMutex::new(Some(tx)),
            rx: Mutex::new(rx),
            terminated: AtomicBool::new(false),
        }
    }

    fn push(&self, result: TaskResult) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(result);
        }
    }

    /// Fail the request unless a terminal result is already buffered
    fn fail(&self, id: RequestId, msg: String) -> bool {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.push(TaskResult::failure(id, msg));
        true
    }

    /// Wake waiters; buffered results stay readable
    fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

pub struct Router {
    groups: HashMap<String, Group>,
    pending: DashMap<RequestId, Arc<PendingEntry>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Router {
    pub fn new(workers: impl IntoIterator<Item = RoutedWorker>, shutdown: CancellationToken) -> Self {
        let mut groups: HashMap<String, Group> = HashMap::new();
        for worker in workers {
            groups
                .entry(worker.id.group.to_string())
                .or_insert_with(|| Group {
                    workers: Vec::new(),
                    next: AtomicUsize::new(0),
                })
                .workers
                .push(Arc::new(worker));
        }
        for group in groups.values_mut() {
            group.workers.sort_by_key(|w| w.id.index);
        }

        Self {
            groups,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Route a request to a worker of `model` without waiting.
    ///
    /// A full worker queue fails with [`ServeError::Busy`]; nothing is left
    /// enqueued or pending in that case.
    pub fn submit(&self, model: &str, payload: Payload) -> ServeResult<RequestId> {
        self.route(model, payload).inspect_err(|e| {
            metrics::record_task_rejected(model, e.kind());
            tracing::debug!(model = %model, error = %e, "Request rejected");
        })
    }

    fn route(&self, model: &str, payload: Payload) -> ServeResult<RequestId> {
        if self.shutdown.is_cancelled() {
            return Err(ServeError::Cancelled);
        }

        let group = self.groups.get(model).ok_or_else(|| ServeError::UnknownModel {
            model: model.to_string(),
            enabled: self.enabled_models().join(", "),
        })?;
        let worker = group
            .pick()
            .ok_or_else(|| ServeError::WorkerUnavailable(model.to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let method = payload.method();
        let entry = Arc::new(PendingEntry::new(worker.id.clone(), model.to_string()));

        // Registered before delivery so an early result always finds its entry
        self.pending.insert(id, entry.clone());

        let task = Task {
            id,
            model: model.to_string(),
            payload,
        };
        match worker.sender.try_deliver(task) {
            Ok(()) => {}
            Err(DeliveryError::Full) => {
                self.pending.remove(&id);
                return Err(ServeError::Busy {
                    worker: worker.id.clone(),
                    capacity: worker.sender.capacity(),
                });
            }
            Err(DeliveryError::Closed) => {
                self.pending.remove(&id);
                return Err(ServeError::WorkerUnavailable(model.to_string()));
            }
        }

        // Lost between pick and delivery: the loss sweep may have missed us
        if !worker.is_alive() {
            entry.fail(id, format!("worker {} was lost", worker.id));
        }

        metrics::record_task_submitted(model, method.as_str());
        metrics::update_pending(self.pending.len());
        tracing::debug!(
            request_id = id,
            model = %model,
            method = %method,
            worker = %worker.id,
            "Task submitted"
        );

        Ok(id)
    }

    /// Wait for the next result of `id`, in production order.
    ///
    /// The entry is removed once its terminal result is returned; asking again
    /// fails with [`ServeError::UnknownRequest`].
    pub async fn await_result(&self, id: RequestId) -> ServeResult<TaskResult> {
        if self.shutdown.is_cancelled() {
            return Err(ServeError::Cancelled);
        }

        let entry = self
            .pending
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ServeError::UnknownRequest(id))?;

        let mut rx = entry.rx.lock().await;
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(ServeError::Cancelled),
            result = rx.recv() => result,
        };
        // Sender dropped: consumed by another waiter or released
        let result = result.ok_or(ServeError::UnknownRequest(id))?;

        if result.complete {
            entry.close();
            self.pending.remove(&id);
            metrics::record_task_duration(&entry.model, entry.created.elapsed().as_secs_f64());
            metrics::update_pending(self.pending.len());
        }

        Ok(result)
    }

    /// Wait for the terminal result, dropping any intermediate ones.
    ///
    /// Dropping the returned future before it resolves releases the request.
    pub fn await_complete(
        &self,
        id: RequestId,
    ) -> impl Future<Output = ServeResult<TaskResult>> + Send + '_ {
        let release = ReleaseOnDrop { router: self, id };

        async move {
            loop {
                let result = release.router.await_result(id).await?;
                if result.complete {
                    return Ok(result);
                }
            }
        }
    }

    /// Results of `id` as a stream ending after the terminal one.
    ///
    /// Dropping the stream early, polled or not, releases the request.
    pub fn results(
        self: &Arc<Self>,
        id: RequestId,
    ) -> impl Stream<Item = ServeResult<TaskResult>> + Send + 'static {
        let release = ReleaseOnDrop {
            router: Arc::clone(self),
            id,
        };

        async_stream::stream! {
            let router = &release.router;
            loop {
                match router.await_result(id).await {
                    Ok(result) => {
                        let complete = result.complete;
                        yield Ok(result);
                        if complete {
                            break;
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }

    /// Forget a request; later results for it are discarded
    pub fn release(&self, id: RequestId) {
        if let Some((_, entry)) = self.pending.remove(&id) {
            entry.close();
            metrics::update_pending(self.pending.len());
            tracing::debug!(request_id = id, "Request released");
        }
    }

    /// Drain the result intake until shutdown or until every sender is gone
    pub fn spawn_intake(self: &Arc<Self>, mut intake: mpsc::Receiver<Delivery>) -> JoinHandle<()> {
        let router = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    biased;
                    _ = router.shutdown.cancelled() => break,
                    delivery = intake.recv() => delivery,
                };

                match delivery {
                    Some(Delivery::Result(result)) => router.accept(result),
                    Some(Delivery::WorkerLost(worker)) => router.worker_lost(&worker),
                    None => break,
                }
            }
            tracing::debug!("Result intake stopped");
        })
    }

    fn accept(&self, result: TaskResult) {
        let Some(entry) = self.pending.get(&result.id).map(|e| Arc::clone(e.value())) else {
            tracing::debug!(request_id = result.id, "Discarding result for unknown request");
            return;
        };

        if !result.is_ok() {
            metrics::record_task_failed(&entry.model);
        }
        if result.complete && entry.terminated.swap(true, Ordering::SeqCst) {
            tracing::warn!(request_id = result.id, "Duplicate terminal result discarded");
            return;
        }
        entry.push(result);
    }

    fn worker_lost(&self, worker: &WorkerId) {
        let Some(routed) = self
            .groups
            .get(worker.group.as_ref())
            .and_then(|group| group.workers.iter().find(|w| &w.id == worker))
        else {
            return;
        };

        if !routed.alive.swap(false, Ordering::SeqCst) {
            return;
        }

        let orphaned: Vec<(RequestId, Arc<PendingEntry>)> = self
            .pending
            .iter()
            .filter(|entry| &entry.worker == worker)
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut failed = 0;
        for (id, entry) in orphaned {
            if entry.fail(id, format!("worker {} was lost", worker)) {
                failed += 1;
            }
        }

        metrics::record_worker_lost(&worker.to_string());
        tracing::error!(worker = %worker, failed_requests = failed, "Worker lost");
    }

    /// Enabled model names, sorted
    pub fn enabled_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.groups.keys().cloned().collect();
        models.sort();
        models
    }

    pub fn worker_status(&self) -> Vec<WorkerStatus> {
        let mut status: Vec<WorkerStatus> = self
            .groups
            .values()
            .flat_map(|group| group.workers.iter().map(|w| w.status()))
            .collect();
        status.sort_by(|a, b| (&a.model, a.index).cmp(&(&b.model, b.index)));
        status
    }

    /// Requests with results not yet fully consumed
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Releases a request when its caller goes away; a no-op once the terminal
/// result was consumed
struct ReleaseOnDrop<R: Deref<Target = Router>> {
    router: R,
    id: RequestId,
}

impl<R: Deref<Target = Router>> Drop for ReleaseOnDrop<R> {
    fn drop(&mut self) {
        self.router.release(self.id);
    }
}
