pub mod cli;
pub mod common;
pub mod downloader;
pub mod parser;

pub use common::client::{HttpClient, HttpClientConfig, HttpSource};
pub use downloader::{
    DownloadError, DownloadOptions, DownloadTask, FetchError, RegistryConfig, TaskEvent,
    TaskRegistry, TaskStatus,
};
pub use parser::PlaylistResolver;
