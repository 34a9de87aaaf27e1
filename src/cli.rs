use clap::Parser;
use std::path::PathBuf;

use crate::common::client::HttpClientConfig;
use crate::downloader::models::DownloadOptions;

/// M3U8 分片下载器
#[derive(Parser, Debug)]
#[command(name = "m3u8dl")]
#[command(version)]
#[command(about = "一个支持并发、重试、暂停恢复的 M3U8 下载工具", long_about = None)]
pub struct Cli {
    /// 播放列表地址
    #[arg(long, value_name = "URL")]
    #[arg(value_hint = clap::ValueHint::Url)]
    #[arg(required_unless_present = "batch", conflicts_with = "batch")]
    pub url: Option<String>,

    /// 输出文件名（不含扩展名时自动补全）
    #[arg(long, value_name = "NAME", requires = "url")]
    pub name: Option<String>,

    /// 批量任务文件，每行为 `url` 或 `url----文件名`
    #[arg(long, value_name = "FILE")]
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub batch: Option<PathBuf>,

    /// 视频保存目录
    #[arg(long, value_name = "DIR")]
    #[arg(default_value = ".")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub output_dir: PathBuf,

    /// 每个任务同时下载的分片数
    #[arg(long, value_name = "N", default_value_t = 5)]
    pub concurrency: usize,

    /// 单个分片的最大重试次数
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub max_retries: u32,

    /// 重试退避基数（毫秒）
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    pub retry_delay: u64,

    /// 单次分片请求超时（毫秒）
    #[arg(long, value_name = "MS", default_value_t = 30_000)]
    pub timeout: u64,

    /// 分片永久失败时跳过并继续
    #[arg(long)]
    pub continue_on_error: bool,

    /// 同时运行的任务数上限
    #[arg(long, value_name = "N")]
    pub max_active_tasks: Option<usize>,

    /// 临时分片目录
    #[arg(long, value_name = "DIR", env = "M3U8DL_TEMP_DIR")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub temp_dir: Option<PathBuf>,

    /// 自定义 User-Agent
    #[arg(long, value_name = "UA")]
    pub user_agent: Option<String>,

    /// Referer 请求头
    #[arg(long, value_name = "URL")]
    pub referer: Option<String>,

    /// 附加请求头，格式为 `名称:值`，可重复
    #[arg(long = "header", value_name = "K:V", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// 以 JSON 输出最终任务状态
    #[arg(long)]
    pub json: bool,

    /// 输出调试日志
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn download_options(&self) -> DownloadOptions {
        DownloadOptions {
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay,
            max_concurrent: self.concurrency,
            segment_timeout_ms: self.timeout,
            continue_on_error: self.continue_on_error,
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        let mut config = HttpClientConfig::default();
        if let Some(user_agent) = &self.user_agent {
            config.user_agent = user_agent.clone();
        }
        config.referer = self.referer.clone();
        config.headers = self.headers.clone();
        config
    }
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("请求头格式应为 名称:值，实际为 {}", raw)),
    }
}
