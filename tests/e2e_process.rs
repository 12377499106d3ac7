//! End-to-end tests with real worker processes
//!
//! Workers are child processes of the `infer-mux` binary built for this test
//! run, talking framed JSON over their stdin/stdout.

use futures::StreamExt;
use infer_mux::task::{Params, Payload, Response, StreamMode, Turn};
use infer_mux::{ProcessSpawner, ServingConfig, WorkerPool};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const CONFIG: &str = r#"
transport = "process"
queue_size = 4
shutdown_grace_secs = 5

[models.echo]
enable = true
workers = [{ device_id = [] }, { device_id = [] }]

[models.echo.backend]
kind = "echo"
prefix = "echo: "
fail_marker = "!fail"

[models.slow]
enable = true
workers = [{ device_id = [] }]

[models.slow.backend]
kind = "echo"
fragment_delay_ms = 100
"#;

async fn start_pool() -> (WorkerPool, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("infer-mux.toml");
    std::fs::write(&config_path, CONFIG).expect("Failed to write config");

    let config = ServingConfig::load(Some(&config_path)).expect("Failed to load config");
    config.validate().expect("Invalid config");

    let spawner = ProcessSpawner::new(
        PathBuf::from(env!("CARGO_BIN_EXE_infer-mux")),
        Some(config_path.as_path()),
        "warn",
    );
    let pool = WorkerPool::start(&config, Arc::new(spawner))
        .await
        .expect("Failed to start worker processes");

    (pool, temp_dir)
}

#[tokio::test]
async fn test_process_workers_round_trip() {
    let (pool, _temp_dir) = start_pool().await;
    let router = pool.router();

    let status = router.worker_status();
    assert_eq!(status.len(), 3);
    assert!(status.iter().all(|w| w.alive && w.pid.is_some()));

    let id = router
        .submit(
            "echo",
            Payload::Generate {
                texts: vec!["a".to_string(), "b".to_string()],
                params: Params::new(),
            },
        )
        .unwrap();
    let result = router.await_complete(id).await.unwrap();
    assert_eq!(
        result.response,
        Some(Response::Batch(vec!["echo: a".to_string(), "echo: b".to_string()]))
    );

    let id = router
        .submit(
            "echo",
            Payload::Chat {
                query: "hi".to_string(),
                history: vec![],
                params: Params::new(),
            },
        )
        .unwrap();
    let result = router.await_complete(id).await.unwrap();
    assert_eq!(result.text(), Some("echo: hi"));
    assert_eq!(
        result.history,
        Some(vec![Turn {
            q: "hi".to_string(),
            a: "echo: hi".to_string()
        }])
    );

    let id = router
        .submit(
            "echo",
            Payload::ChatStream {
                query: "abcdefghij".to_string(),
                history: vec![],
                n: 4,
                gtype: StreamMode::Increase,
                params: Params::new(),
            },
        )
        .unwrap();
    let texts: Vec<String> = router
        .results(id)
        .map(|r| r.unwrap().text().unwrap().to_string())
        .collect()
        .await;
    // "echo: abcdefghij" is 16 characters
    assert_eq!(texts, vec!["echo", ": ab", "cdef", "ghij", ""]);

    let id = router
        .submit(
            "echo",
            Payload::Chat {
                query: "!fail".to_string(),
                history: vec![],
                params: Params::new(),
            },
        )
        .unwrap();
    let result = router.await_complete(id).await.unwrap();
    assert!(!result.is_ok());

    tokio::time::timeout(Duration::from_secs(10), pool.shutdown())
        .await
        .expect("shutdown took too long")
        .unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_killed_worker_fails_pending_requests() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let (pool, _temp_dir) = start_pool().await;
    let router = pool.router();

    let slow = router
        .worker_status()
        .into_iter()
        .find(|w| w.model == "slow")
        .unwrap();

    let id = router
        .submit(
            "slow",
            Payload::ChatStream {
                query: "a long reply that takes a while".to_string(),
                history: vec![],
                n: 1,
                gtype: StreamMode::Total,
                params: Params::new(),
            },
        )
        .unwrap();

    // Wait for the first chunk so the task is known to be running
    let first = router.await_result(id).await.unwrap();
    assert!(!first.complete);

    kill(Pid::from_raw(slow.pid.unwrap() as i32), Signal::SIGKILL).unwrap();

    let last = tokio::time::timeout(Duration::from_secs(5), router.await_complete(id))
        .await
        .expect("caller hung on a killed worker")
        .unwrap();
    assert!(last.complete);
    assert!(!last.is_ok());
    assert!(last.status.msg.contains("slow#0"));

    let status = router.worker_status();
    assert!(!status.iter().find(|w| w.model == "slow").unwrap().alive);
    assert!(status.iter().filter(|w| w.model == "echo").all(|w| w.alive));

    pool.shutdown().await.unwrap();
}
