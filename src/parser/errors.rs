use thiserror::Error;

use crate::downloader::error::FetchError;

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("播放列表请求失败: {0}")]
    Fetch(#[from] FetchError),

    #[error("播放列表格式错误: {0}")]
    Parse(String),

    #[error("不支持的播放列表: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, PlaylistError>;
