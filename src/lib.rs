//! infer-mux - HTTP inference router over a pool of device-pinned workers
//!
//! Requests for a model are spread round-robin over that model's workers.
//! Each worker runs one request at a time, in its own OS process or as a
//! task in the serving process, and streams results back to the router.

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod gpu;
pub mod metrics;
pub mod pool;
pub mod router;
pub mod shutdown;
pub mod task;
pub mod transport;
pub mod worker;

pub use backend::{Backend, EchoBackend};
pub use config::{ModelConfig, ServingConfig, TransportKind};
pub use error::{ServeError, ServeResult};
pub use pool::{InProcessSpawner, ProcessSpawner, WorkerPool, WorkerSpawner};
pub use router::{Router, WorkerStatus};
pub use shutdown::ShutdownCoordinator;
pub use task::{Payload, RequestId, StreamMode, Task, TaskResult, Turn};
