use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, broadcast};
use tracing::{info, warn};

use super::error::{DownloadError, Result};
use super::models::{DownloadOptions, DownloadTask, TaskEvent};
use super::task::{TaskContext, TaskController};
use crate::common::client::{HttpClient, HttpClientConfig, HttpSource};
use crate::common::utils::{
    fallback_name, parse_batch_entries, sanitize_file_name, validate_url, with_suffix,
};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// 每个任务的临时目录为 `temp_root/<任务 ID>`
    pub temp_root: PathBuf,
    /// 同时运行的任务数上限，None 表示不限制
    pub max_active_tasks: Option<usize>,
    pub progress_interval: Duration,
    pub event_capacity: usize,
    pub http: HttpClientConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            temp_root: std::env::temp_dir().join("m3u8dl"),
            max_active_tasks: None,
            progress_interval: Duration::from_millis(500),
            event_capacity: 256,
            http: HttpClientConfig::default(),
        }
    }
}

/// 进程内的任务注册表，对外提供全部任务操作
pub struct TaskRegistry {
    tasks: DashMap<String, Arc<TaskController>>,
    context: TaskContext,
    temp_root: PathBuf,
    next_order: AtomicU64,
    /// 选定文件名与登记任务期间持有，保证未结束的任务不会共用输出文件
    naming: Mutex<()>,
}

impl TaskRegistry {
    /// 使用 reqwest 客户端创建注册表
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let client = HttpClient::new(&config.http)
            .map_err(|e| DownloadError::InvalidOptions(format!("HTTP 客户端配置无效: {}", e)))?;
        Ok(Self::with_source(config, Arc::new(client)))
    }

    /// 使用自定义的 HTTP 实现创建注册表
    pub fn with_source(config: RegistryConfig, source: Arc<dyn HttpSource>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let admission = config
            .max_active_tasks
            .filter(|limit| *limit > 0)
            .map(|limit| Arc::new(Semaphore::new(limit)));

        Self {
            tasks: DashMap::new(),
            context: TaskContext {
                source,
                events,
                admission,
                progress_interval: config.progress_interval,
            },
            temp_root: config.temp_root,
            next_order: AtomicU64::new(0),
            naming: Mutex::new(()),
        }
    }

    /// 创建并立即启动一个下载任务，返回任务 ID
    pub async fn download_m3u8(
        &self,
        url: &str,
        output_dir: impl AsRef<Path>,
        file_name: Option<&str>,
        options: DownloadOptions,
    ) -> Result<String> {
        options.validate()?;
        let url = validate_url(url)?;
        let file_name = match file_name.map(sanitize_file_name) {
            Some(name) if !name.is_empty() => name,
            _ => fallback_name(&url, self.next_order.load(Ordering::Relaxed) as usize + 1),
        };
        Ok(self.spawn_task(url.to_string(), file_name, output_dir.as_ref(), options).await)
    }

    /// 批量创建任务。每行为 `url` 或 `url----文件名`，
    /// 全部校验通过后才会创建任务
    pub async fn batch_download_m3u8<S: AsRef<str>>(
        &self,
        entries: &[S],
        output_dir: impl AsRef<Path>,
        options: DownloadOptions,
    ) -> Result<Vec<String>> {
        options.validate()?;
        let entries = parse_batch_entries(entries)?;
        if entries.is_empty() {
            return Err(DownloadError::InvalidOptions("批量任务列表为空".to_string()));
        }

        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = self
                .spawn_task(entry.url, entry.file_name, output_dir.as_ref(), options)
                .await;
            ids.push(id);
        }
        info!("📥 批量创建了 {} 个任务", ids.len());
        Ok(ids)
    }

    /// 按创建顺序返回所有任务的快照
    pub fn get_all_tasks(&self) -> Vec<DownloadTask> {
        let mut controllers: Vec<Arc<TaskController>> =
            self.tasks.iter().map(|entry| Arc::clone(entry.value())).collect();
        controllers.sort_by_key(|controller| controller.order());
        controllers.iter().map(|controller| controller.snapshot()).collect()
    }

    pub fn get_task_status(&self, id: &str) -> Result<DownloadTask> {
        self.controller(id)
            .map(|controller| controller.snapshot())
            .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))
    }

    pub fn pause_task(&self, id: &str) -> bool {
        self.controller(id).is_some_and(|controller| controller.pause())
    }

    pub fn resume_task(&self, id: &str) -> bool {
        self.controller(id).is_some_and(|controller| controller.resume())
    }

    /// 取消任务并等待其临时文件清理完成
    pub async fn cancel_task(&self, id: &str) -> bool {
        match self.controller(id) {
            Some(controller) => controller.cancel().await,
            None => false,
        }
    }

    /// 重试失败或已取消的任务，返回原任务 ID
    pub async fn retry_task(&self, id: &str) -> Result<String> {
        let controller = self
            .controller(id)
            .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;
        controller.retry().await?;
        Ok(id.to_string())
    }

    /// 移除已结束的任务，运行中的任务保持不变。至少移除一个时返回 true
    pub fn clear_tasks<S: AsRef<str>>(&self, ids: &[S]) -> bool {
        let mut removed = false;
        for id in ids {
            let id = id.as_ref();
            if self
                .tasks
                .remove_if(id, |_, controller| controller.status().is_terminal())
                .is_some()
            {
                removed = true;
                let _ = self.context.events.send(TaskEvent::Removed { id: id.to_string() });
            }
        }
        removed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.context.events.subscribe()
    }

    /// 取消所有未结束的任务并等待清理完成
    pub async fn shutdown(&self) {
        let active: Vec<Arc<TaskController>> = self
            .tasks
            .iter()
            .filter(|entry| !entry.value().status().is_terminal())
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if active.is_empty() {
            return;
        }

        warn!("正在取消 {} 个未完成的任务", active.len());
        join_all(active.iter().map(|controller| controller.cancel())).await;
    }

    fn controller(&self, id: &str) -> Option<Arc<TaskController>> {
        self.tasks.get(id).map(|entry| Arc::clone(entry.value()))
    }

    async fn spawn_task(
        &self,
        url: String,
        file_name: String,
        output_dir: &Path,
        options: DownloadOptions,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let controller = {
            let _naming = self.naming.lock();
            let file_name = self.unique_file_name(output_dir, file_name);
            let order = self.next_order.fetch_add(1, Ordering::Relaxed);
            let controller = Arc::new(TaskController::new(
                id.clone(),
                url,
                file_name,
                output_dir.to_path_buf(),
                &self.temp_root,
                options,
                order,
                self.context.clone(),
            ));
            self.tasks.insert(id.clone(), Arc::clone(&controller));
            controller
        };
        controller.start().await;
        info!("➕ 已创建任务: {}", id);
        id
    }

    /// 与未结束任务的输出重名时追加 `_<n>` 后缀
    fn unique_file_name(&self, output_dir: &Path, file_name: String) -> String {
        let taken: HashSet<PathBuf> = self
            .tasks
            .iter()
            .filter(|entry| !entry.value().status().is_terminal())
            .map(|entry| entry.value().target_path())
            .collect();
        if !taken.contains(&output_dir.join(&file_name)) {
            return file_name;
        }

        let renamed = (2..)
            .map(|n| with_suffix(&file_name, n))
            .find(|candidate| !taken.contains(&output_dir.join(candidate)))
            .unwrap_or_else(|| file_name.clone());
        warn!("文件名 {} 已被其他任务使用，改为 {}", file_name, renamed);
        renamed
    }
}
