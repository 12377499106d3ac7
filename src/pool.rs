//! Worker pool lifecycle
//!
//! Starts one worker per configured placement of every enabled model, wires
//! them into a [`Router`] and tears them down again on shutdown. How a worker
//! is hosted is decided by a [`WorkerSpawner`]: as a task inside this process
//! or as a child process running `infer-mux worker`.

use crate::backend::{self, Backend};
use crate::config::{ModelConfig, ServingConfig, TransportKind};
use crate::gpu;
use crate::router::{RoutedWorker, Router};
use crate::shutdown::ShutdownCoordinator;
use crate::transport::process::{self, ProcessCommand, WorkerProcess};
use crate::transport::{Delivery, TaskSender, WorkerId, memory};
use crate::worker::Worker;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything a spawner needs to bring up one worker
pub struct SpawnContext {
    pub id: WorkerId,
    pub devices: Vec<u32>,
    pub model: ModelConfig,
    /// Task queue capacity
    pub capacity: usize,
    pub intake: mpsc::Sender<Delivery>,
    pub shutdown: CancellationToken,
}

/// How a running worker is stopped
pub enum WorkerControl {
    Process(WorkerProcess),
    Task(JoinHandle<()>),
}

impl WorkerControl {
    /// Wait up to `grace` for the worker to finish, then force it
    pub async fn stop(self, id: &WorkerId, grace: Duration) -> Result<()> {
        match self {
            WorkerControl::Process(process) => process.stop(grace).await,
            WorkerControl::Task(mut handle) => {
                if tokio::time::timeout(grace, &mut handle).await.is_err() {
                    tracing::warn!(
                        worker = %id,
                        grace_secs = grace.as_secs(),
                        "Worker did not exit within grace period, aborting"
                    );
                    handle.abort();
                }
                Ok(())
            }
        }
    }
}

pub struct SpawnedWorker {
    pub sender: Arc<dyn TaskSender>,
    pub pid: Option<u32>,
    pub control: WorkerControl,
}

#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, ctx: SpawnContext) -> Result<SpawnedWorker>;
}

/// Builds the backend for a model
pub type BackendFactory = Arc<dyn Fn(&ModelConfig) -> Box<dyn Backend> + Send + Sync>;

/// Runs workers as tokio tasks over the in-memory transport
pub struct InProcessSpawner {
    factory: BackendFactory,
}

impl InProcessSpawner {
    pub fn new() -> Self {
        Self::with_factory(Arc::new(|model: &ModelConfig| {
            backend::build(&model.backend)
        }))
    }

    pub fn with_factory(factory: BackendFactory) -> Self {
        Self { factory }
    }
}

impl Default for InProcessSpawner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerSpawner for InProcessSpawner {
    async fn spawn(&self, ctx: SpawnContext) -> Result<SpawnedWorker> {
        let (sender, receiver, sink) = memory::channel(ctx.capacity, ctx.intake);
        let backend = (self.factory)(&ctx.model);

        let mut worker = Worker::new(
            ctx.id.clone(),
            ctx.devices,
            backend,
            receiver,
            sink.clone(),
            ctx.shutdown.clone(),
        );

        let id = ctx.id;
        let shutdown = ctx.shutdown;
        let handle = tokio::spawn(async move {
            if let Err(e) = worker.run().await {
                tracing::error!(worker = %id, error = %format!("{e:#}"), "Worker failed");
            }
            if !shutdown.is_cancelled() {
                sink.worker_lost(id).await;
            }
        });

        Ok(SpawnedWorker {
            sender: Arc::new(sender),
            pid: None,
            control: WorkerControl::Task(handle),
        })
    }
}

/// Runs every worker as a child process of `program`
pub struct ProcessSpawner {
    program: PathBuf,
    base_args: Vec<String>,
}

impl ProcessSpawner {
    /// `config_path` and `log_level` are forwarded to the worker command line
    pub fn new(program: PathBuf, config_path: Option<&Path>, log_level: &str) -> Self {
        let mut base_args = Vec::new();
        if let Some(path) = config_path {
            base_args.push("--config".to_string());
            base_args.push(path.display().to_string());
        }
        base_args.push("--log-level".to_string());
        base_args.push(log_level.to_string());

        Self { program, base_args }
    }

    fn command(&self, id: &WorkerId, devices: &[u32]) -> Result<ProcessCommand> {
        let visible_devices = if devices.is_empty() {
            None
        } else {
            gpu::get_or_init()
                .visible_devices(devices)
                .with_context(|| format!("Invalid placement for worker {}", id))?
        };

        let mut args = self.base_args.clone();
        args.extend([
            "worker".to_string(),
            "--model".to_string(),
            id.group.to_string(),
            "--index".to_string(),
            id.index.to_string(),
        ]);

        Ok(ProcessCommand {
            program: self.program.clone(),
            args,
            visible_devices,
        })
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, ctx: SpawnContext) -> Result<SpawnedWorker> {
        let command = self.command(&ctx.id, &ctx.devices)?;
        let (sender, process) =
            process::spawn(&command, ctx.id, ctx.capacity, ctx.intake, ctx.shutdown)?;

        Ok(SpawnedWorker {
            sender: Arc::new(sender),
            pid: process.pid(),
            control: WorkerControl::Process(process),
        })
    }
}

/// Spawner matching the configured transport
pub fn spawner_for(
    config: &ServingConfig,
    config_path: Option<&Path>,
    log_level: &str,
) -> Result<Arc<dyn WorkerSpawner>> {
    match config.transport {
        TransportKind::InProcess => Ok(Arc::new(InProcessSpawner::new())),
        TransportKind::Process => {
            let program = match &config.worker_program {
                Some(program) => program.clone(),
                None => std::env::current_exe().context("Failed to locate own executable")?,
            };
            Ok(Arc::new(ProcessSpawner::new(program, config_path, log_level)))
        }
    }
}

pub struct WorkerPool {
    router: Arc<Router>,
    workers: Vec<(WorkerId, WorkerControl)>,
    intake: JoinHandle<()>,
    coordinator: ShutdownCoordinator,
}

impl WorkerPool {
    pub async fn start(config: &ServingConfig, spawner: Arc<dyn WorkerSpawner>) -> Result<Self> {
        let coordinator = ShutdownCoordinator::new(config.shutdown_grace());
        let (intake_tx, intake_rx) = mpsc::channel(config.result_buffer);

        let mut routed = Vec::new();
        let mut workers = Vec::new();

        for (name, model) in config.enabled_models() {
            for (index, placement) in model.workers.iter().enumerate() {
                let id = WorkerId::new(name.as_str(), index);
                let ctx = SpawnContext {
                    id: id.clone(),
                    devices: placement.device_id.clone(),
                    model: model.clone(),
                    capacity: config.queue_size,
                    intake: intake_tx.clone(),
                    shutdown: coordinator.token(),
                };

                match spawner.spawn(ctx).await {
                    Ok(spawned) => {
                        tracing::info!(
                            worker = %id,
                            devices = ?placement.device_id,
                            pid = ?spawned.pid,
                            "Worker started"
                        );
                        routed.push(RoutedWorker::new(
                            id.clone(),
                            placement.device_id.clone(),
                            spawned.pid,
                            spawned.sender,
                        ));
                        workers.push((id, spawned.control));
                    }
                    Err(e) => {
                        coordinator.trigger();
                        stop_all(workers, coordinator.grace()).await;
                        return Err(e.context(format!("Failed to start worker {}", id)));
                    }
                }
            }
        }
        drop(intake_tx);

        let router = Arc::new(Router::new(routed, coordinator.token()));
        let intake = router.spawn_intake(intake_rx);

        tracing::info!(
            workers = workers.len(),
            models = ?router.enabled_models(),
            "Worker pool started"
        );

        Ok(Self {
            router,
            workers,
            intake,
            coordinator,
        })
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Cancel everything, stop the workers and wait for the intake to end
    pub async fn shutdown(self) -> Result<()> {
        self.coordinator.trigger();
        stop_all(self.workers, self.coordinator.grace()).await;

        if let Err(e) = self.intake.await {
            tracing::warn!(error = %e, "Result intake ended abnormally");
        }

        tracing::info!("Worker pool stopped");
        Ok(())
    }
}

async fn stop_all(workers: Vec<(WorkerId, WorkerControl)>, grace: Duration) {
    let stops = workers.into_iter().map(|(id, control)| async move {
        if let Err(e) = control.stop(&id, grace).await {
            tracing::error!(worker = %id, error = %e, "Failed to stop worker");
        }
    });
    futures::future::join_all(stops).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, EchoConfig, WorkerPlacement};
    use crate::task::{Params, Payload};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn model(workers: usize, prefix: &str) -> ModelConfig {
        ModelConfig {
            enable: true,
            workers: (0..workers)
                .map(|i| WorkerPlacement {
                    device_id: vec![i as u32],
                })
                .collect(),
            backend: BackendConfig::Echo(EchoConfig {
                prefix: prefix.to_string(),
                ..Default::default()
            }),
        }
    }

    fn config() -> ServingConfig {
        let mut config = ServingConfig {
            transport: TransportKind::InProcess,
            shutdown_grace_secs: 1,
            ..Default::default()
        };
        config.models.insert("alpha".to_string(), model(2, "a:"));
        config.models.insert("beta".to_string(), model(1, "b:"));
        config.models.insert(
            "off".to_string(),
            ModelConfig {
                enable: false,
                ..model(1, "")
            },
        );
        config
    }

    fn chat(query: &str) -> Payload {
        Payload::Chat {
            query: query.to_string(),
            history: vec![],
            params: Params::new(),
        }
    }

    #[tokio::test]
    async fn test_pool_serves_every_enabled_model() {
        let pool = WorkerPool::start(&config(), Arc::new(InProcessSpawner::new()))
            .await
            .unwrap();
        let router = pool.router();

        assert_eq!(pool.worker_count(), 3);
        assert_eq!(router.enabled_models(), vec!["alpha", "beta"]);

        let a = router.submit("alpha", chat("x")).unwrap();
        let b = router.submit("beta", chat("y")).unwrap();
        assert_eq!(
            router.await_complete(a).await.unwrap().text(),
            Some("a:x")
        );
        assert_eq!(
            router.await_complete(b).await.unwrap().text(),
            Some("b:y")
        );

        assert!(router.submit("off", chat("z")).is_err());
        pool.shutdown().await.unwrap();
        assert!(router.is_shutting_down());
    }

    struct FailingSpawner {
        inner: InProcessSpawner,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WorkerSpawner for FailingSpawner {
        async fn spawn(&self, ctx: SpawnContext) -> Result<SpawnedWorker> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
                anyhow::bail!("no capacity left");
            }
            self.inner.spawn(ctx).await
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_aborts_start() {
        let spawner = Arc::new(FailingSpawner {
            inner: InProcessSpawner::new(),
            calls: AtomicUsize::new(0),
        });

        let err = match WorkerPool::start(&config(), spawner).await {
            Ok(_) => panic!("pool should not start"),
            Err(e) => e,
        };
        assert!(format!("{err:#}").contains("no capacity left"));
        assert!(err.to_string().contains("alpha#1"));
    }

    #[test]
    fn test_process_command_line() {
        let spawner = ProcessSpawner::new(
            PathBuf::from("/usr/bin/infer-mux"),
            Some(Path::new("/etc/infer-mux.toml")),
            "debug",
        );
        // Empty device set never consults nvidia-smi
        let command = spawner.command(&WorkerId::new("chat", 3), &[]).unwrap();

        assert_eq!(command.program, PathBuf::from("/usr/bin/infer-mux"));
        assert_eq!(
            command.args,
            vec![
                "--config",
                "/etc/infer-mux.toml",
                "--log-level",
                "debug",
                "worker",
                "--model",
                "chat",
                "--index",
                "3"
            ]
        );
        assert_eq!(command.visible_devices, None);
    }
}
