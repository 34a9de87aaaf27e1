use std::time::Duration;

/// 分片重试策略：第 n 次重试前等待 `base_delay * n`，不超过 `max_delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次请求）
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const MAX_DELAY: Duration = Duration::from_secs(30);

    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Self::MAX_DELAY,
        }
    }

    /// `retry` 从 1 开始计数
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        self.base_delay
            .checked_mul(retry.max(1))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// 一次失败之后的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptVerdict {
    /// 等待指定时间后进行第 `retry` 次重试
    RetryAfter { retry: u32, delay: Duration },
    /// 重试次数用尽，分片永久失败
    Exhausted,
}

/// 单个分片的有界重试状态，不依赖时间，便于单独测试
#[derive(Debug, Clone)]
pub struct SegmentAttempts {
    policy: RetryPolicy,
    failures: u32,
}

impl SegmentAttempts {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// 记录一次失败并给出下一步
    pub fn record_failure(&mut self) -> AttemptVerdict {
        self.failures += 1;
        if self.failures > self.policy.max_retries {
            return AttemptVerdict::Exhausted;
        }
        AttemptVerdict::RetryAfter {
            retry: self.failures,
            delay: self.policy.delay_for_retry(self.failures),
        }
    }

    /// 已失败的请求次数
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
