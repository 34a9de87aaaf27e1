use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::downloader::error::DownloadError;

/// 批量任务中 URL 与文件名之间的分隔符
pub const BATCH_DELIMITER: &str = "----";

/// 这些文件名没有区分度，改用上一级目录名
const GENERIC_STEMS: &[&str] = &["index", "playlist", "master", "prog_index", "chunklist"];

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\\/:*?"<>|\x00-\x1f]+"#).expect("文件名过滤正则无效"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub url: String,
    pub file_name: String,
}

/// 去掉文件系统不允许的字符
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned = UNSAFE_CHARS.replace_all(name.trim(), "_");
    cleaned.trim_end_matches(['.', ' ']).trim().to_string()
}

/// 只接受 http/https 地址
pub fn validate_url(raw: &str) -> Result<Url, DownloadError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", raw.trim(), e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(DownloadError::InvalidUrl(format!(
            "不支持的协议 {}: {}",
            scheme, raw
        ))),
    }
}

/// 未指定文件名时由 URL 推导，`index` 为批量中的序号（从 1 开始）
pub fn fallback_name(url: &Url, index: usize) -> String {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let candidate = segments.last().and_then(|last| {
        let stem = Path::new(last).file_stem()?.to_str()?;
        if GENERIC_STEMS.contains(&stem.to_ascii_lowercase().as_str()) {
            segments.iter().rev().nth(1).map(|parent| parent.to_string())
        } else {
            Some(stem.to_string())
        }
    });

    candidate
        .map(|name| sanitize_file_name(&name))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("video_{}", index))
}

/// 解析一行批量任务：`url` 或 `url----文件名`。空行和 `#` 开头的行返回 None
pub fn parse_batch_entry(line: &str) -> Option<(String, Option<String>)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    match line.split_once(BATCH_DELIMITER) {
        Some((url, name)) => {
            let name = name.trim();
            Some((
                url.trim().to_string(),
                (!name.is_empty()).then(|| name.to_string()),
            ))
        }
        None => Some((line.to_string(), None)),
    }
}

/// 解析整批任务。任何一行的 URL 无效都会整体失败；重名文件追加 `_<n>` 后缀
pub fn parse_batch_entries<S: AsRef<str>>(lines: &[S]) -> Result<Vec<BatchEntry>, DownloadError> {
    let mut entries = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for line in lines {
        let Some((raw_url, name)) = parse_batch_entry(line.as_ref()) else {
            continue;
        };
        let url = validate_url(&raw_url)?;
        let base = name
            .map(|name| sanitize_file_name(&name))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| fallback_name(&url, entries.len() + 1));

        let count = seen.entry(base.clone()).or_insert(0);
        *count += 1;
        let file_name = if *count == 1 {
            base
        } else {
            with_suffix(&base, *count)
        };
        entries.push(BatchEntry {
            url: url.to_string(),
            file_name,
        });
    }
    Ok(entries)
}

pub(crate) fn with_suffix(name: &str, n: usize) -> String {
    let path = Path::new(name);
    match (path.file_stem().and_then(|s| s.to_str()), path.extension().and_then(|e| e.to_str())) {
        (Some(stem), Some(ext)) => format!("{}_{}.{}", stem, n, ext),
        _ => format!("{}_{}", name, n),
    }
}

/// 最终输出路径。文件名没有扩展名时，带初始化分片的用 `.mp4`，否则 `.ts`
pub fn output_path_for(output_dir: &Path, file_name: &str, has_init_segment: bool) -> PathBuf {
    if Path::new(file_name).extension().is_some() {
        return output_dir.join(file_name);
    }
    let ext = if has_init_segment { "mp4" } else { "ts" };
    output_dir.join(format!("{}.{}", file_name, ext))
}

/// 人类可读的字节数
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("a/b:c*?.ts"), "a_b_c_.ts");
        assert_eq!(sanitize_file_name("  name.  "), "name");
        assert_eq!(sanitize_file_name("第一集 <预告>"), "第一集 _预告_");
    }

    #[test]
    fn test_fallback_name_from_url() {
        let url = Url::parse("https://cdn.example.com/show/ep01.m3u8?token=1").unwrap();
        assert_eq!(fallback_name(&url, 1), "ep01");

        let url = Url::parse("https://cdn.example.com/show/ep02/index.m3u8").unwrap();
        assert_eq!(fallback_name(&url, 1), "ep02");

        let url = Url::parse("https://cdn.example.com/index.m3u8").unwrap();
        assert_eq!(fallback_name(&url, 3), "video_3");
    }

    #[test]
    fn test_parse_batch_entry() {
        assert_eq!(
            parse_batch_entry("https://a.com/x.m3u8----第一集"),
            Some(("https://a.com/x.m3u8".to_string(), Some("第一集".to_string())))
        );
        assert_eq!(
            parse_batch_entry("  https://a.com/x.m3u8  "),
            Some(("https://a.com/x.m3u8".to_string(), None))
        );
        assert_eq!(parse_batch_entry("# comment"), None);
        assert_eq!(parse_batch_entry(""), None);
    }

    #[test]
    fn test_batch_names_are_deduplicated() {
        let entries = parse_batch_entries(&[
            "https://a.com/a/index.m3u8----clip",
            "https://a.com/b/index.m3u8----clip",
            "https://a.com/c/index.m3u8",
        ])
        .unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(names, vec!["clip", "clip_2", "c"]);
    }

    #[test]
    fn test_batch_rejects_invalid_url() {
        let result = parse_batch_entries(&["https://a.com/x.m3u8", "ftp://a.com/y.m3u8"]);
        assert!(matches!(result, Err(DownloadError::InvalidUrl(_))));
    }

    #[test]
    fn test_output_path_extension() {
        let dir = Path::new("/tmp/out");
        assert_eq!(output_path_for(dir, "clip", false), dir.join("clip.ts"));
        assert_eq!(output_path_for(dir, "clip", true), dir.join("clip.mp4"));
        assert_eq!(output_path_for(dir, "clip.mkv", true), dir.join("clip.mkv"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
    }
}
