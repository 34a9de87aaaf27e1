use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::parser::errors::PlaylistError;

/// 单次 HTTP 请求层面的错误，由 [`HttpSource`](crate::common::client::HttpSource) 返回
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("网络错误: {0}")]
    Transport(String),

    #[error("HTTP 请求失败，状态码: {status}，URL: {url}")]
    Status { status: u16, url: String },

    #[error("请求超时 ({0:?})")]
    Timeout(Duration),
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        FetchError::Transport(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("获取播放列表失败: {0}")]
    PlaylistFetch(String),

    #[error("播放列表解析失败: {0}")]
    PlaylistParse(String),

    #[error("不支持的播放列表: {0}")]
    UnsupportedPlaylist(String),

    #[error("分片 {sequence} 下载失败: {reason}")]
    SegmentFetch { sequence: usize, reason: String },

    #[error("合并失败，缺少分片: {missing:?}")]
    IncompleteAssembly { missing: Vec<usize> },

    #[error("写入文件失败 {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("解密失败: {0}")]
    Decrypt(String),

    #[error("任务未找到: {0}")]
    TaskNotFound(String),

    #[error("无效的下载参数: {0}")]
    InvalidOptions(String),

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    #[error("无效的状态: {0}")]
    InvalidState(String),
}

impl DownloadError {
    /// 包装写盘错误，保留出错路径
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DownloadError::Write {
            path: path.into(),
            source,
        }
    }
}

impl From<PlaylistError> for DownloadError {
    fn from(err: PlaylistError) -> Self {
        match err {
            PlaylistError::Fetch(e) => DownloadError::PlaylistFetch(e.to_string()),
            PlaylistError::Parse(msg) => DownloadError::PlaylistParse(msg),
            PlaylistError::Unsupported(msg) => DownloadError::UnsupportedPlaylist(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playlist_error_conversion() {
        let err: DownloadError = PlaylistError::Fetch(FetchError::Status {
            status: 404,
            url: "https://example.com/a.m3u8".to_string(),
        })
        .into();
        assert!(matches!(err, DownloadError::PlaylistFetch(ref msg) if msg.contains("404")));

        let err: DownloadError = PlaylistError::Unsupported("SAMPLE-AES".to_string()).into();
        assert!(matches!(err, DownloadError::UnsupportedPlaylist(_)));
    }

    #[test]
    fn test_error_message_is_readable() {
        let err = DownloadError::SegmentFetch {
            sequence: 4,
            reason: "请求超时".to_string(),
        };
        assert_eq!(err.to_string(), "分片 4 下载失败: 请求超时");
    }
}
