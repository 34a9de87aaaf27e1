use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub downloaded_bytes: u64,
    pub downloaded_segments: usize,
    /// 字节/秒
    pub speed: f64,
    pub eta: Option<Duration>,
    /// 声明的总大小，或按已完成分片的平均大小推算
    pub estimated_total_bytes: u64,
}

/// 单个任务的进度统计，速度按滑动窗口计算
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    window: Duration,
    total_segments: usize,
    total_bytes: u64,
    downloaded_bytes: u64,
    downloaded_segments: usize,
    skipped_segments: usize,
    samples: VecDeque<(Instant, u64)>,
    speed: f64,
}

impl ProgressTracker {
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

    pub fn new(window: Duration) -> Self {
        Self {
            window,
            total_segments: 0,
            total_bytes: 0,
            downloaded_bytes: 0,
            downloaded_segments: 0,
            skipped_segments: 0,
            samples: VecDeque::new(),
            speed: 0.0,
        }
    }

    /// 开始计时；`total_bytes` 为 0 表示未知
    pub fn start_at(&mut self, total_segments: usize, total_bytes: u64, now: Instant) {
        self.total_segments = total_segments;
        self.total_bytes = total_bytes;
        self.samples.clear();
        self.samples.push_back((now, self.downloaded_bytes));
    }

    pub fn record_segment_complete(&mut self, bytes: u64) {
        self.record_segment_complete_at(bytes, Instant::now());
    }

    pub fn record_segment_complete_at(&mut self, bytes: u64, now: Instant) {
        self.downloaded_bytes += bytes;
        self.downloaded_segments += 1;
        self.push_sample(now);
    }

    /// 被跳过的分片只计数，不计字节
    pub fn record_segment_skipped(&mut self) {
        self.downloaded_segments += 1;
        self.skipped_segments += 1;
    }

    /// 定时调用，重新计算速度
    pub fn refresh(&mut self) {
        self.refresh_at(Instant::now());
    }

    pub fn refresh_at(&mut self, now: Instant) {
        self.push_sample(now);

        let (Some(&(first_at, first_bytes)), Some(&(last_at, last_bytes))) =
            (self.samples.front(), self.samples.back())
        else {
            self.speed = 0.0;
            return;
        };
        let elapsed = last_at.saturating_duration_since(first_at).as_secs_f64();
        self.speed = if elapsed > 0.0 {
            last_bytes.saturating_sub(first_bytes) as f64 / elapsed
        } else {
            0.0
        };
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let estimated_total_bytes = self.estimated_total_bytes();
        let remaining = estimated_total_bytes.saturating_sub(self.downloaded_bytes);
        let eta = if estimated_total_bytes > 0 && self.speed > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / self.speed))
        } else {
            None
        };

        ProgressSnapshot {
            downloaded_bytes: self.downloaded_bytes,
            downloaded_segments: self.downloaded_segments,
            speed: self.speed,
            eta,
            estimated_total_bytes,
        }
    }

    fn estimated_total_bytes(&self) -> u64 {
        if self.total_bytes > 0 {
            return self.total_bytes;
        }
        // 跳过的分片没有字节，平均值只按实际下载的分片计算
        let fetched = self.downloaded_segments - self.skipped_segments;
        if fetched == 0 || self.downloaded_bytes == 0 {
            return 0;
        }
        let average = self.downloaded_bytes as f64 / fetched as f64;
        let expected = self.total_segments.saturating_sub(self.skipped_segments);
        (average * expected as f64) as u64
    }

    fn push_sample(&mut self, now: Instant) {
        self.samples.push_back((now, self.downloaded_bytes));
        // 至少保留两个样本，窗口外的旧样本丢弃
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some(&(at, _)) if now.saturating_duration_since(at) > self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}
