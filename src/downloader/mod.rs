//! 分片下载核心：worker 池、重试、进度、合并以及任务注册表

pub mod decrypt;
pub mod error;
pub mod fetcher;
pub mod manager;
pub mod merger;
pub mod models;
pub mod pool;
pub mod progress;
pub mod retry;
pub mod task;

pub use error::{DownloadError, FetchError};
pub use manager::{RegistryConfig, TaskRegistry};
pub use models::{DownloadOptions, DownloadTask, TaskEvent, TaskStatus};
