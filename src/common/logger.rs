use colored::*;
use tracing::Level;

use crate::common::utils::format_bytes;
use crate::downloader::models::{DownloadTask, TaskStatus};

/// 初始化 tracing 输出，`verbose` 时输出调试日志
pub fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .try_init();
}

/// 漂亮的终端输出工具
pub struct PrettyLogger;

impl PrettyLogger {
    /// 显示成功消息
    pub fn success(message: impl AsRef<str>) {
        println!("{} {}", "✓".green().bold(), message.as_ref());
    }

    /// 显示信息消息
    pub fn info(message: impl AsRef<str>) {
        println!("{} {}", "ℹ".blue().bold(), message.as_ref());
    }

    /// 显示警告消息
    pub fn warning(message: impl AsRef<str>) {
        println!("{} {}", "⚠".yellow().bold(), message.as_ref());
    }

    /// 显示错误消息
    pub fn error(message: impl AsRef<str>) {
        println!("{} {}", "✗".red().bold(), message.as_ref());
    }

    pub fn file_info(label: impl AsRef<str>, path: impl AsRef<str>) {
        println!("{} {}: {}", "📁".blue().bold(), label.as_ref().bold(), path.as_ref());
    }

    pub fn separator() {
        println!("{}", "─".repeat(50).bright_black());
    }

    /// 居中的标题行
    pub fn title(text: impl AsRef<str>) {
        let text = text.as_ref();
        let width = text.chars().count().min(48);
        let padding = (48 - width) / 2;
        println!(
            "{} {} {}",
            "─".repeat(padding).bright_black(),
            text.bold(),
            "─".repeat(48 - padding - width).bright_black()
        );
    }

    /// 单个任务的结束状态
    pub fn task_result(task: &DownloadTask) {
        let name = task.output_path.display().to_string();
        match task.status {
            TaskStatus::Completed => {
                let mut line = format!(
                    "{} ({}，{} 个分片)",
                    name,
                    format_bytes(task.downloaded_bytes),
                    task.total_segments
                );
                if task.skipped_segments > 0 {
                    line.push_str(&format!("，跳过 {} 个", task.skipped_segments));
                }
                Self::success(line);
            }
            TaskStatus::Cancelled => Self::warning(format!("{} 已取消", task.file_name)),
            _ => Self::error(format!(
                "{} {}: {}",
                task.file_name,
                task.status,
                task.error.as_deref().unwrap_or("未知错误")
            )),
        }
    }

    /// 所有任务结束后的汇总
    pub fn completion_summary(tasks: &[DownloadTask]) {
        let completed = tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Completed)
            .count();
        println!();
        Self::title("下载结果");
        for task in tasks {
            Self::task_result(task);
        }
        Self::separator();
        if completed == tasks.len() {
            println!("{}", format!("🎉 全部 {} 个任务下载完成！", completed).green().bold());
        } else {
            println!(
                "{}",
                format!("完成 {}/{} 个任务", completed, tasks.len()).yellow().bold()
            );
        }
    }
}
