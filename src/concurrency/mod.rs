mod pool;

pub use pool::{TaskHandle, WorkerPool, default_worker_count, join_all};
