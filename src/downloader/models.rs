use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::error::DownloadError;
use super::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Waiting,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// 终止状态不会再发生变化（除非显式重试）
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TaskStatus::Waiting => "等待中",
            TaskStatus::Downloading => "下载中",
            TaskStatus::Paused => "已暂停",
            TaskStatus::Completed => "已完成",
            TaskStatus::Failed => "失败",
            TaskStatus::Cancelled => "已取消",
        };
        f.write_str(text)
    }
}

/// 单个任务的下载参数，创建后不可修改
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DownloadOptions {
    /// 单个分片的最大重试次数
    pub max_retries: u32,
    /// 重试退避基数（毫秒）
    pub retry_delay_ms: u64,
    /// 单个任务同时下载的分片数
    pub max_concurrent: usize,
    /// 单次分片请求超时（毫秒）
    pub segment_timeout_ms: u64,
    /// 分片永久失败时跳过而不是终止任务
    pub continue_on_error: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            max_concurrent: 5,
            segment_timeout_ms: 30_000,
            continue_on_error: false,
        }
    }
}

impl DownloadOptions {
    pub const MAX_CONCURRENT: usize = 64;
    pub const MAX_RETRIES: u32 = 100;
    pub const MAX_RETRY_DELAY_MS: u64 = 600_000;

    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.max_concurrent == 0 || self.max_concurrent > Self::MAX_CONCURRENT {
            return Err(DownloadError::InvalidOptions(format!(
                "max_concurrent 必须在 1..={} 之间，当前为 {}",
                Self::MAX_CONCURRENT,
                self.max_concurrent
            )));
        }
        if self.segment_timeout_ms == 0 {
            return Err(DownloadError::InvalidOptions(
                "segment_timeout_ms 必须大于 0".to_string(),
            ));
        }
        if self.max_retries > Self::MAX_RETRIES {
            return Err(DownloadError::InvalidOptions(format!(
                "max_retries 不能超过 {}",
                Self::MAX_RETRIES
            )));
        }
        if self.retry_delay_ms > Self::MAX_RETRY_DELAY_MS {
            return Err(DownloadError::InvalidOptions(format!(
                "retry_delay_ms 不能超过 {}",
                Self::MAX_RETRY_DELAY_MS
            )));
        }
        Ok(())
    }

    pub fn segment_timeout(&self) -> Duration {
        Duration::from_millis(self.segment_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
    }
}

/// 任务的只读快照
#[derive(Debug, Clone, Serialize)]
pub struct DownloadTask {
    pub id: String,
    pub url: String,
    pub file_name: String,
    pub output_path: PathBuf,
    pub status: TaskStatus,
    pub total_segments: usize,
    pub downloaded_segments: usize,
    /// 因 continue_on_error 被跳过的分片数，已计入 downloaded_segments
    pub skipped_segments: usize,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub progress: u8,
    /// 字节/秒
    pub speed: f64,
    /// 剩余秒数，未知时为 None
    pub estimated_time_remaining: Option<u64>,
    pub retries: u32,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Local>>,
    pub created_at: DateTime<Local>,
    pub options: DownloadOptions,
}

/// 整数百分比，总数未知时为 0
pub fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) as f64 * 100.0 / total as f64).round()) as u8
}

/// 推送给订阅者的任务事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum TaskEvent {
    /// 状态发生变化
    StatusChanged(DownloadTask),
    /// 定时的进度刷新
    Progress(DownloadTask),
    /// 任务被清除
    Removed { id: String },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::StatusChanged(task) | TaskEvent::Progress(task) => &task.id,
            TaskEvent::Removed { id } => id,
        }
    }
}
