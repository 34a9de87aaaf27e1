use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::decrypt::{KeyCache, decrypt_aes128};
use super::error::DownloadError;
use super::models::DownloadOptions;
use super::retry::{AttemptVerdict, RetryPolicy, SegmentAttempts};
use crate::common::client::HttpSource;
use crate::parser::models::SegmentDescriptor;

/// 单个分片的最终结果
#[derive(Debug)]
pub enum SegmentOutcome {
    Completed { bytes: u64 },
    /// 重试用尽或不可重试的错误
    Failed(DownloadError),
    Cancelled,
}

enum AttemptError {
    Retryable(String),
    Fatal(DownloadError),
    Cancelled,
}

/// 带超时与重试的分片下载器，结果写入任务临时目录
pub struct SegmentFetcher {
    source: Arc<dyn HttpSource>,
    keys: KeyCache,
    temp_dir: PathBuf,
    policy: RetryPolicy,
    timeout: Duration,
}

impl SegmentFetcher {
    pub fn new(source: Arc<dyn HttpSource>, temp_dir: impl Into<PathBuf>, options: &DownloadOptions) -> Self {
        Self {
            keys: KeyCache::new(Arc::clone(&source)),
            source,
            temp_dir: temp_dir.into(),
            policy: options.retry_policy(),
            timeout: options.segment_timeout(),
        }
    }

    /// 分片在临时目录中的文件名，按序号命名
    pub fn segment_path(temp_dir: &Path, sequence: usize) -> PathBuf {
        temp_dir.join(format!("{:06}.seg", sequence))
    }

    /// 下载一个分片。每次重试前调用 `on_retry(第几次重试, 失败原因)`
    pub async fn fetch<F>(
        &self,
        segment: &SegmentDescriptor,
        token: &CancellationToken,
        mut on_retry: F,
    ) -> SegmentOutcome
    where
        F: FnMut(u32, &str),
    {
        let mut attempts = SegmentAttempts::new(self.policy);

        loop {
            let reason = match self.fetch_once(segment, token).await {
                Ok(bytes) => return SegmentOutcome::Completed { bytes },
                Err(AttemptError::Cancelled) => return SegmentOutcome::Cancelled,
                Err(AttemptError::Fatal(e)) => return SegmentOutcome::Failed(e),
                Err(AttemptError::Retryable(reason)) => reason,
            };

            match attempts.record_failure() {
                AttemptVerdict::Exhausted => {
                    return SegmentOutcome::Failed(DownloadError::SegmentFetch {
                        sequence: segment.sequence,
                        reason: format!("请求 {} 次后仍然失败: {}", attempts.failures(), reason),
                    });
                }
                AttemptVerdict::RetryAfter { retry, delay } => {
                    warn!(
                        "分片 {} 下载失败，{:?} 后进行第 {}/{} 次重试: {}",
                        segment.sequence, delay, retry, self.policy.max_retries, reason
                    );
                    on_retry(retry, &reason);
                    tokio::select! {
                        _ = token.cancelled() => return SegmentOutcome::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn fetch_once(
        &self,
        segment: &SegmentDescriptor,
        token: &CancellationToken,
    ) -> Result<u64, AttemptError> {
        let body = tokio::select! {
            _ = token.cancelled() => return Err(AttemptError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.download(segment)) => match result {
                Ok(body) => body?,
                Err(_) => {
                    return Err(AttemptError::Retryable(format!("请求超时 ({:?})", self.timeout)));
                }
            },
        };

        self.write_segment(segment.sequence, &body)
            .await
            .map_err(AttemptError::Fatal)?;
        debug!("分片 {} 完成，{} 字节", segment.sequence, body.len());
        Ok(body.len() as u64)
    }

    async fn download(&self, segment: &SegmentDescriptor) -> Result<Bytes, AttemptError> {
        let body = self
            .source
            .get_bytes(&segment.uri, segment.byte_range)
            .await
            .map_err(|e| AttemptError::Retryable(e.to_string()))?;

        match (&segment.key, segment.effective_iv()) {
            (Some(key), Some(iv)) => {
                let key = self
                    .keys
                    .get(&key.uri)
                    .await
                    .map_err(|e| AttemptError::Retryable(e.to_string()))?;
                decrypt_aes128(&body, &key, &iv).map_err(|e| AttemptError::Retryable(e.to_string()))
            }
            _ => Ok(body),
        }
    }

    // 先写入 .part 再改名，临时目录中只会出现完整的分片
    async fn write_segment(&self, sequence: usize, body: &[u8]) -> Result<(), DownloadError> {
        let path = Self::segment_path(&self.temp_dir, sequence);
        let part = path.with_extension("seg.part");

        let mut file = tokio::fs::File::create(&part)
            .await
            .map_err(|e| DownloadError::write(&part, e))?;
        file.write_all(body)
            .await
            .map_err(|e| DownloadError::write(&part, e))?;
        file.flush().await.map_err(|e| DownloadError::write(&part, e))?;
        drop(file);

        tokio::fs::rename(&part, &path)
            .await
            .map_err(|e| DownloadError::write(&path, e))
    }
}
