use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use m3u8_downloader::cli::Cli;
use m3u8_downloader::common::logger::{PrettyLogger, init_tracing};
use m3u8_downloader::common::utils::format_bytes;
use m3u8_downloader::{DownloadTask, RegistryConfig, TaskRegistry, TaskStatus};

/// 读取批量任务文件
async fn read_batch_file(args: &Cli) -> Result<Option<Vec<String>>> {
    let Some(path) = &args.batch else {
        return Ok(None);
    };
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("读取批量任务文件失败: {}", path.display()))?;
    Ok(Some(content.lines().map(str::to_string).collect()))
}

/// 创建所有任务，返回任务 ID
async fn create_tasks(registry: &TaskRegistry, args: &Cli) -> Result<Vec<String>> {
    let options = args.download_options();
    if let Some(lines) = read_batch_file(args).await? {
        return Ok(registry
            .batch_download_m3u8(lines.as_slice(), &args.output_dir, options)
            .await?);
    }

    let url = args.url.as_deref().context("缺少 --url 或 --batch 参数")?;
    let id = registry
        .download_m3u8(url, &args.output_dir, args.name.as_deref(), options)
        .await?;
    Ok(vec![id])
}

fn progress_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::with_template(
        "{msg:24!} [{bar:30.green/white}] {pos}/{len} 分片 {prefix}",
    )?
    .progress_chars("█▓░"))
}

fn bar_prefix(task: &DownloadTask) -> String {
    match task.status {
        TaskStatus::Downloading => {
            let eta = task
                .estimated_time_remaining
                .map(|secs| format!("，剩余 {}s", secs))
                .unwrap_or_default();
            format!("{}/s{}", format_bytes(task.speed as u64), eta)
        }
        status => status.to_string(),
    }
}

/// 轮询任务状态并刷新进度条，直到全部结束
async fn watch_progress(registry: &TaskRegistry, ids: &[String], quiet: bool) -> Result<()> {
    let multi = MultiProgress::new();
    let style = progress_style()?;
    let mut bars: HashMap<&str, ProgressBar> = HashMap::new();
    if !quiet {
        for id in ids {
            let task = registry.get_task_status(id)?;
            let bar = multi.add(ProgressBar::new(0));
            bar.set_style(style.clone());
            bar.set_message(task.file_name.clone());
            bars.insert(id.as_str(), bar);
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("收到中断信号，正在取消所有任务...");
                registry.shutdown().await;
            }
            _ = ticker.tick() => {}
        }

        let mut finished = 0;
        for id in ids {
            let task = registry.get_task_status(id)?;
            if let Some(bar) = bars.get(id.as_str()) {
                bar.set_length(task.total_segments as u64);
                bar.set_position(task.downloaded_segments as u64);
                bar.set_prefix(bar_prefix(&task));
                if task.status.is_terminal() && !bar.is_finished() {
                    bar.finish();
                }
            }
            if task.status.is_terminal() {
                finished += 1;
            }
        }
        if finished == ids.len() {
            break;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.verbose);
    debug!("命令行参数: {:?}", args);

    let mut config = RegistryConfig {
        max_active_tasks: args.max_active_tasks,
        http: args.http_config(),
        ..Default::default()
    };
    if let Some(temp_dir) = &args.temp_dir {
        config.temp_root = temp_dir.clone();
    }

    tokio::fs::create_dir_all(&args.output_dir)
        .await
        .with_context(|| format!("创建输出目录失败: {}", args.output_dir.display()))?;
    if !args.json {
        PrettyLogger::file_info("输出目录", args.output_dir.display().to_string());
        PrettyLogger::file_info("临时目录", config.temp_root.display().to_string());
    }

    let registry = TaskRegistry::new(config)?;
    let ids = create_tasks(&registry, &args).await?;
    info!("共 {} 个下载任务", ids.len());
    if !args.json {
        PrettyLogger::info(format!("已创建 {} 个下载任务", ids.len()));
    }

    watch_progress(&registry, &ids, args.json).await?;

    let tasks: Vec<DownloadTask> = ids
        .iter()
        .map(|id| registry.get_task_status(id))
        .collect::<Result<_, _>>()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
    } else {
        PrettyLogger::completion_summary(&tasks);
    }

    let unfinished = tasks
        .iter()
        .filter(|task| task.status != TaskStatus::Completed)
        .count();
    if unfinished > 0 {
        bail!("{} 个任务未能完成", unfinished);
    }
    Ok(())
}
