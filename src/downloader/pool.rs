use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::error::DownloadError;
use super::fetcher::{SegmentFetcher, SegmentOutcome};
use crate::parser::models::SegmentDescriptor;

/// worker 上报给任务的分片事件
#[derive(Debug)]
pub enum SegmentEvent {
    Completed { sequence: usize, bytes: u64 },
    Retrying { sequence: usize, retry: u32, reason: String },
    Failed { sequence: usize, error: DownloadError },
}

/// 待下载分片的先进先出队列，所有 worker 共享
#[derive(Debug, Default)]
pub struct SegmentQueue {
    inner: Mutex<VecDeque<usize>>,
}

impl SegmentQueue {
    pub fn new(sequences: impl IntoIterator<Item = usize>) -> Self {
        Self {
            inner: Mutex::new(sequences.into_iter().collect()),
        }
    }

    pub fn pop(&self) -> Option<usize> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// 正在运行的 worker 集合以及它们的事件出口
pub struct PoolHandle {
    pub events: mpsc::UnboundedReceiver<SegmentEvent>,
    workers: JoinSet<()>,
}

impl PoolHandle {
    /// 等待所有 worker 退出
    pub async fn join(mut self) {
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                error!("分片 worker 异常退出: {}", e);
            }
        }
    }
}

/// 每个任务一个的有界并发下载池
pub struct WorkerPool {
    max_concurrent: usize,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// 启动 `min(max_concurrent, 队列长度)` 个 worker。
    /// 每个 worker 同一时刻只处理一个分片，`pause` 为 true 时不再领取新分片
    pub fn spawn(
        &self,
        fetcher: Arc<SegmentFetcher>,
        segments: Arc<Vec<SegmentDescriptor>>,
        queue: Arc<SegmentQueue>,
        token: CancellationToken,
        pause: watch::Receiver<bool>,
    ) -> PoolHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker_count = self.max_concurrent.min(queue.len());
        debug!("启动 {} 个分片 worker", worker_count);

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            workers.spawn(worker_loop(
                worker_id,
                Arc::clone(&fetcher),
                Arc::clone(&segments),
                Arc::clone(&queue),
                token.clone(),
                pause.clone(),
                tx.clone(),
            ));
        }

        PoolHandle {
            events: rx,
            workers,
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    fetcher: Arc<SegmentFetcher>,
    segments: Arc<Vec<SegmentDescriptor>>,
    queue: Arc<SegmentQueue>,
    token: CancellationToken,
    mut pause: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<SegmentEvent>,
) {
    loop {
        if !wait_until_runnable(&mut pause, &token).await {
            break;
        }
        let Some(sequence) = queue.pop() else {
            break;
        };
        let Some(segment) = segments.get(sequence) else {
            continue;
        };

        let outcome = fetcher
            .fetch(segment, &token, |retry, reason| {
                let _ = events.send(SegmentEvent::Retrying {
                    sequence,
                    retry,
                    reason: reason.to_string(),
                });
            })
            .await;

        let event = match outcome {
            SegmentOutcome::Completed { bytes } => SegmentEvent::Completed { sequence, bytes },
            SegmentOutcome::Failed(error) => SegmentEvent::Failed { sequence, error },
            SegmentOutcome::Cancelled => break,
        };
        if events.send(event).is_err() {
            break;
        }
    }
    debug!("分片 worker {} 退出", worker_id);
}

/// 暂停时阻塞，直到恢复或取消。返回 false 表示已取消
pub(crate) async fn wait_until_runnable(
    pause: &mut watch::Receiver<bool>,
    token: &CancellationToken,
) -> bool {
    loop {
        if token.is_cancelled() {
            return false;
        }
        if !*pause.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = token.cancelled() => return false,
            changed = pause.changed() => {
                if changed.is_err() {
                    // 发送端已销毁，不会再有恢复信号
                    return !*pause.borrow();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_queue_is_fifo() {
        let queue = SegmentQueue::new(0..3);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_running() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(wait_until_runnable(&mut rx, &CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn test_wait_blocks_until_resumed() {
        let (tx, mut rx) = watch::channel(true);
        let token = CancellationToken::new();

        let waiter = tokio::spawn(async move { wait_until_runnable(&mut rx, &token).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tx.send_replace(false);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_aborts_on_cancel() {
        let (_tx, mut rx) = watch::channel(true);
        let token = CancellationToken::new();
        let child = token.clone();

        let waiter = tokio::spawn(async move { wait_until_runnable(&mut rx, &child).await });
        token.cancel();
        assert!(!waiter.await.unwrap());
    }
}
