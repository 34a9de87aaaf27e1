use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::DownloadError;
use super::fetcher::SegmentFetcher;
use super::merger::Assembler;
use super::models::{DownloadOptions, DownloadTask, TaskEvent, TaskStatus, percent};
use super::pool::{SegmentEvent, SegmentQueue, WorkerPool, wait_until_runnable};
use super::progress::ProgressTracker;
use crate::common::client::HttpSource;
use crate::common::utils::output_path_for;
use crate::parser::PlaylistResolver;
use crate::parser::models::ResolvedPlaylist;

/// 所有任务共享的运行环境，由注册表创建
#[derive(Clone)]
pub struct TaskContext {
    pub source: Arc<dyn HttpSource>,
    pub events: broadcast::Sender<TaskEvent>,
    /// 同时运行任务数上限，None 表示不限制
    pub admission: Option<Arc<Semaphore>>,
    pub progress_interval: Duration,
}

/// 一次运行的控制信号
#[derive(Clone)]
struct RunControl {
    token: CancellationToken,
    pause: Arc<watch::Sender<bool>>,
    /// 运行循环连同清理全部结束后置为 true
    done: Arc<watch::Sender<bool>>,
}

impl RunControl {
    fn new() -> Self {
        let (pause, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        Self {
            token: CancellationToken::new(),
            pause: Arc::new(pause),
            done: Arc::new(done),
        }
    }

    fn is_same_run(&self, other: &RunControl) -> bool {
        Arc::ptr_eq(&self.done, &other.done)
    }

    /// 等待这次运行结束，可以被多个调用方同时等待
    async fn finished(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }
}

/// 运行循环退出时标记结束，panic 时同样生效
struct RunGuard(Arc<watch::Sender<bool>>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

struct TaskState {
    status: TaskStatus,
    output_path: PathBuf,
    assembling: bool,
    total_segments: usize,
    skipped: BTreeSet<usize>,
    retries: u32,
    error: Option<String>,
    start_time: Option<DateTime<Local>>,
    tracker: ProgressTracker,
    control: RunControl,
}

impl TaskState {
    fn new(output_path: PathBuf) -> Self {
        Self {
            status: TaskStatus::Waiting,
            output_path,
            assembling: false,
            total_segments: 0,
            skipped: BTreeSet::new(),
            retries: 0,
            error: None,
            start_time: None,
            tracker: ProgressTracker::default(),
            control: RunControl::new(),
        }
    }
}

enum RunEnd {
    Completed { bytes: u64 },
    Cancelled,
}

/// `finish` 在锁内决定的终态
enum RunOutcome {
    Completed { bytes: u64 },
    Failed(DownloadError),
    /// `announce` 为 false 时取消事件已由 `cancel` 发出
    Cancelled { announce: bool },
}

enum AssemblyGate {
    Ready,
    Paused,
    Stopped,
}

/// 单个下载任务：状态机、运行循环以及暂停/恢复/取消/重试控制。
///
/// 所有状态修改都经过 `state` 这把锁，锁不会跨越 await
pub struct TaskController {
    id: String,
    url: String,
    file_name: String,
    output_dir: PathBuf,
    temp_dir: PathBuf,
    options: DownloadOptions,
    created_at: DateTime<Local>,
    order: u64,
    context: TaskContext,
    state: Mutex<TaskState>,
    /// 串行化 start 与 retry，值表示是否已启动过运行
    lifecycle: tokio::sync::Mutex<bool>,
}

impl TaskController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        url: String,
        file_name: String,
        output_dir: PathBuf,
        temp_root: &Path,
        options: DownloadOptions,
        order: u64,
        context: TaskContext,
    ) -> Self {
        let provisional = output_dir.join(&file_name);
        Self {
            temp_dir: temp_root.join(&id),
            id,
            url,
            file_name,
            output_dir,
            options,
            created_at: Local::now(),
            order,
            context,
            state: Mutex::new(TaskState::new(provisional)),
            lifecycle: tokio::sync::Mutex::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 创建顺序
    pub fn order(&self) -> u64 {
        self.order
    }

    /// 未确定扩展名前的输出位置，用于检查重名
    pub fn target_path(&self) -> PathBuf {
        self.output_dir.join(&self.file_name)
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    pub fn snapshot(&self) -> DownloadTask {
        let state = self.state.lock();
        let progress = state.tracker.snapshot();
        let downloading = state.status == TaskStatus::Downloading;

        DownloadTask {
            id: self.id.clone(),
            url: self.url.clone(),
            file_name: self.file_name.clone(),
            output_path: state.output_path.clone(),
            status: state.status,
            total_segments: state.total_segments,
            downloaded_segments: progress.downloaded_segments,
            skipped_segments: state.skipped.len(),
            total_bytes: progress.estimated_total_bytes,
            downloaded_bytes: progress.downloaded_bytes,
            progress: percent(progress.downloaded_segments, state.total_segments),
            speed: if downloading { progress.speed } else { 0.0 },
            estimated_time_remaining: if downloading {
                progress.eta.map(|eta| eta.as_secs())
            } else {
                None
            },
            retries: state.retries,
            error: state.error.clone(),
            start_time: state.start_time,
            created_at: self.created_at,
            options: self.options,
        }
    }

    /// 启动首次运行
    pub async fn start(self: &Arc<Self>) {
        let mut started = self.lifecycle.lock().await;
        if *started {
            return;
        }
        *started = true;
        let control = self.state.lock().control.clone();
        self.emit_status();
        tokio::spawn(Arc::clone(self).run(control));
    }

    /// 仅下载中且未进入合并阶段时可以暂停
    pub fn pause(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.status != TaskStatus::Downloading || state.assembling {
                return false;
            }
            state.status = TaskStatus::Paused;
            state.control.pause.send_replace(true);
        }
        info!("⏸️ 任务已暂停: {}", self.id);
        self.emit_status();
        true
    }

    pub fn resume(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.status != TaskStatus::Paused {
                return false;
            }
            state.status = TaskStatus::Downloading;
            state.control.pause.send_replace(false);
        }
        info!("▶️ 任务已恢复: {}", self.id);
        self.emit_status();
        true
    }

    /// 取消任务并等待运行循环清理完临时文件
    pub async fn cancel(&self) -> bool {
        let control = {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return false;
            }
            state.status = TaskStatus::Cancelled;
            state.error = None;
            state.control.clone()
        };
        control.token.cancel();
        info!("⏹️ 任务已取消: {}", self.id);
        self.emit_status();

        control.finished().await;
        true
    }

    /// 对失败或已取消的任务从头重新下载，任务 ID 不变
    pub async fn retry(self: &Arc<Self>) -> Result<(), DownloadError> {
        let mut started = self.lifecycle.lock().await;
        let previous = {
            let state = self.state.lock();
            if !state.status.is_retryable() {
                return Err(DownloadError::InvalidState(format!(
                    "任务 {} 当前状态为 {}，只有失败或已取消的任务可以重试",
                    self.id, state.status
                )));
            }
            state.control.clone()
        };

        // 旧运行的清理完成之后才能重置状态
        if *started {
            previous.finished().await;
        }
        remove_dir_if_exists(&self.temp_dir).await;

        let control = {
            let mut state = self.state.lock();
            if !state.status.is_retryable() || !state.control.is_same_run(&previous) {
                return Err(DownloadError::InvalidState(format!(
                    "任务 {} 的状态已改变",
                    self.id
                )));
            }
            *state = TaskState::new(self.target_path());
            state.control.clone()
        };
        *started = true;
        info!("🔄 重试任务: {}", self.id);
        self.emit_status();
        tokio::spawn(Arc::clone(self).run(control));
        Ok(())
    }

    async fn run(self: Arc<Self>, control: RunControl) {
        let _done = RunGuard(Arc::clone(&control.done));
        let result = self.execute(&control).await;
        self.finish(&control, result).await;
    }

    async fn execute(&self, control: &RunControl) -> Result<RunEnd, DownloadError> {
        let token = &control.token;

        let _permit = match &self.context.admission {
            Some(admission) => {
                let admission = Arc::clone(admission);
                tokio::select! {
                    _ = token.cancelled() => return Ok(RunEnd::Cancelled),
                    permit = admission.acquire_owned() => Some(permit.map_err(|_| {
                        DownloadError::InvalidState("任务调度已关闭".to_string())
                    })?),
                }
            }
            None => None,
        };

        if !self.begin_downloading() {
            return Ok(RunEnd::Cancelled);
        }
        info!("🚀 开始下载任务 {}: {}", self.id, self.url);

        let resolver = PlaylistResolver::new(Arc::clone(&self.context.source), self.options.segment_timeout());
        let playlist = tokio::select! {
            _ = token.cancelled() => return Ok(RunEnd::Cancelled),
            resolved = resolver.resolve(&self.url) => resolved?,
        };

        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|e| DownloadError::write(&self.temp_dir, e))?;
        self.on_resolved(&playlist);

        let segments = Arc::new(playlist.segments);
        let queue = Arc::new(SegmentQueue::new(0..segments.len()));
        let fetcher = Arc::new(SegmentFetcher::new(
            Arc::clone(&self.context.source),
            &self.temp_dir,
            &self.options,
        ));
        let mut pool = WorkerPool::new(self.options.max_concurrent).spawn(
            fetcher,
            Arc::clone(&segments),
            queue,
            token.clone(),
            control.pause.subscribe(),
        );

        let mut ticker = tokio::time::interval(self.context.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut fatal: Option<DownloadError> = None;
        loop {
            tokio::select! {
                event = pool.events.recv() => match event {
                    Some(event) => {
                        if let Some(error) = self.apply_segment_event(event) {
                            if fatal.is_none() {
                                fatal = Some(error);
                                token.cancel();
                            }
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => self.refresh_progress(),
            }
        }
        pool.join().await;
        self.refresh_progress();

        if let Some(error) = fatal {
            return Err(error);
        }

        // 分片全部完成但处于暂停状态时，等恢复后再合并
        let mut pause = control.pause.subscribe();
        loop {
            if !wait_until_runnable(&mut pause, token).await {
                return Ok(RunEnd::Cancelled);
            }
            match self.try_begin_assembling() {
                AssemblyGate::Ready => break,
                AssemblyGate::Paused => continue,
                AssemblyGate::Stopped => return Ok(RunEnd::Cancelled),
            }
        }

        let output_path = self.state.lock().output_path.clone();
        let skipped = self.state.lock().skipped.clone();
        let order: Vec<usize> = segments.iter().map(|segment| segment.sequence).collect();
        // 合并不响应取消，结束后由 finish 按最终状态清理输出
        let bytes = Assembler::new(&self.temp_dir)
            .assemble(&order, &skipped, self.options.continue_on_error, &output_path)
            .await?;
        Ok(RunEnd::Completed { bytes })
    }

    async fn finish(&self, control: &RunControl, result: Result<RunEnd, DownloadError>) {
        let assembled = matches!(result, Ok(RunEnd::Completed { .. }));

        // 检查取消与写入终态在同一把锁内完成
        let (outcome, output_path) = {
            let mut state = self.state.lock();
            if !state.control.is_same_run(control) {
                debug!("任务 {} 的旧运行已被替换，忽略其结果", self.id);
                return;
            }
            state.assembling = false;
            let outcome = match result {
                _ if state.status == TaskStatus::Cancelled => RunOutcome::Cancelled { announce: false },
                Ok(RunEnd::Completed { bytes }) => {
                    state.status = TaskStatus::Completed;
                    RunOutcome::Completed { bytes }
                }
                Err(error) => {
                    state.status = TaskStatus::Failed;
                    state.error = Some(error.to_string());
                    RunOutcome::Failed(error)
                }
                Ok(RunEnd::Cancelled) => {
                    state.status = TaskStatus::Cancelled;
                    RunOutcome::Cancelled { announce: true }
                }
            };
            (outcome, state.output_path.clone())
        };

        match outcome {
            RunOutcome::Completed { bytes } => {
                info!(
                    "✅ 任务完成 {}: {} ({} 字节，{} 个分片)",
                    self.id,
                    output_path.display(),
                    bytes,
                    self.snapshot().total_segments
                );
                self.emit_status();
            }
            RunOutcome::Failed(error) => {
                control.token.cancel();
                error!("❌ 任务失败 {}: {}", self.id, error);
                if tokio::fs::try_exists(&self.temp_dir).await.unwrap_or(false) {
                    warn!("临时文件保留在 {}", self.temp_dir.display());
                }
                self.emit_status();
            }
            RunOutcome::Cancelled { announce } => {
                // 运行已结束，删除临时文件和未完成的输出
                remove_dir_if_exists(&self.temp_dir).await;
                remove_file_if_exists(&Assembler::partial_path(&output_path)).await;
                if assembled {
                    remove_file_if_exists(&output_path).await;
                }
                debug!("任务 {} 已清理临时文件", self.id);
                if announce {
                    self.emit_status();
                }
            }
        }
    }

    fn begin_downloading(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.status != TaskStatus::Waiting {
                return false;
            }
            state.status = TaskStatus::Downloading;
            state.start_time = Some(Local::now());
        }
        self.emit_status();
        true
    }

    fn on_resolved(&self, playlist: &ResolvedPlaylist) {
        let mut state = self.state.lock();
        state.total_segments = playlist.segments.len();
        state.output_path = output_path_for(&self.output_dir, &self.file_name, playlist.has_init_segment());
        state
            .tracker
            .start_at(playlist.segments.len(), playlist.total_bytes, Instant::now());
        info!(
            "📋 任务 {} 共 {} 个分片，总时长 {:.1} 秒",
            self.id,
            playlist.segments.len(),
            playlist.total_duration()
        );
    }

    fn try_begin_assembling(&self) -> AssemblyGate {
        let mut state = self.state.lock();
        match state.status {
            TaskStatus::Downloading => {
                state.assembling = true;
                AssemblyGate::Ready
            }
            TaskStatus::Paused => AssemblyGate::Paused,
            _ => AssemblyGate::Stopped,
        }
    }

    /// 返回需要终止任务的错误
    fn apply_segment_event(&self, event: SegmentEvent) -> Option<DownloadError> {
        let mut state = self.state.lock();
        match event {
            SegmentEvent::Completed { sequence, bytes } => {
                state.tracker.record_segment_complete(bytes);
                debug!("任务 {} 分片 {} 已完成", self.id, sequence);
                None
            }
            SegmentEvent::Retrying { sequence, retry, reason } => {
                state.retries += 1;
                debug!("任务 {} 分片 {} 第 {} 次重试: {}", self.id, sequence, retry, reason);
                None
            }
            SegmentEvent::Failed { sequence, error } => {
                if self.options.continue_on_error {
                    warn!("⚠️ 任务 {} 跳过分片 {}: {}", self.id, sequence, error);
                    state.skipped.insert(sequence);
                    state.tracker.record_segment_skipped();
                    None
                } else {
                    Some(error)
                }
            }
        }
    }

    fn refresh_progress(&self) {
        {
            let mut state = self.state.lock();
            if state.status != TaskStatus::Downloading {
                return;
            }
            state.tracker.refresh();
        }
        let _ = self.context.events.send(TaskEvent::Progress(self.snapshot()));
    }

    fn emit_status(&self) {
        let _ = self.context.events.send(TaskEvent::StatusChanged(self.snapshot()));
    }
}

async fn remove_dir_if_exists(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除临时目录失败 {}: {}", path.display(), e),
    }
}

async fn remove_file_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除文件失败 {}: {}", path.display(), e),
    }
}
