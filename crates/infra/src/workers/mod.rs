//! Background workers.

mod projection_worker;

pub use projection_worker::{
    ProjectionWorker, ProjectionWorkerConfig, WorkerHandle, WorkerStats,
};
