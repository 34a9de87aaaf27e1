use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use super::error::DownloadError;
use super::fetcher::SegmentFetcher;

/// 按分片序号顺序把临时文件拼接成最终输出
pub struct Assembler {
    temp_dir: PathBuf,
}

impl Assembler {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
        }
    }

    /// 输出文件写入期间使用的路径
    pub fn partial_path(output_path: &Path) -> PathBuf {
        let mut name = output_path.as_os_str().to_owned();
        name.push(".part");
        PathBuf::from(name)
    }

    /// 拼接 `order` 中的分片，返回写入的字节数。
    ///
    /// `omitted` 中的分片只有在 `allow_omissions` 为 true 时才允许缺失。
    /// 成功后删除临时目录；失败时保留临时文件以便排查
    pub async fn assemble(
        &self,
        order: &[usize],
        omitted: &BTreeSet<usize>,
        allow_omissions: bool,
        output_path: &Path,
    ) -> Result<u64, DownloadError> {
        let mut missing = Vec::new();
        let mut parts = Vec::with_capacity(order.len());
        for &sequence in order {
            if omitted.contains(&sequence) {
                if !allow_omissions {
                    missing.push(sequence);
                }
                continue;
            }
            let path = SegmentFetcher::segment_path(&self.temp_dir, sequence);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                parts.push(path);
            } else {
                missing.push(sequence);
            }
        }
        if !missing.is_empty() {
            return Err(DownloadError::IncompleteAssembly { missing });
        }
        if !omitted.is_empty() {
            warn!("⚠️ 合并时跳过了 {} 个失败的分片: {:?}", omitted.len(), omitted);
        }

        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| DownloadError::write(parent, e))?;
            }
        }

        let partial = Self::partial_path(output_path);
        let written = match Self::concat(&parts, &partial).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };
        tokio::fs::rename(&partial, output_path)
            .await
            .map_err(|e| DownloadError::write(output_path, e))?;
        info!("📦 合并完成: {} ({} 字节)", output_path.display(), written);

        if let Err(e) = tokio::fs::remove_dir_all(&self.temp_dir).await {
            warn!("清理临时目录失败 {}: {}", self.temp_dir.display(), e);
        }
        Ok(written)
    }

    async fn concat(parts: &[PathBuf], target: &Path) -> Result<u64, DownloadError> {
        let file = tokio::fs::File::create(target)
            .await
            .map_err(|e| DownloadError::write(target, e))?;
        let mut writer = BufWriter::new(file);
        let mut written = 0u64;

        for part in parts {
            let mut reader = tokio::fs::File::open(part)
                .await
                .map_err(|e| DownloadError::write(part, e))?;
            written += tokio::io::copy(&mut reader, &mut writer)
                .await
                .map_err(|e| DownloadError::write(target, e))?;
            debug!("已合并 {}", part.display());
        }

        writer
            .flush()
            .await
            .map_err(|e| DownloadError::write(target, e))?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_segment(dir: &Path, sequence: usize, body: &[u8]) {
        std::fs::write(SegmentFetcher::segment_path(dir, sequence), body).unwrap();
    }

    #[tokio::test]
    async fn test_assemble_in_sequence_order() {
        let root = tempfile::tempdir().unwrap();
        let temp = root.path().join("task");
        std::fs::create_dir_all(&temp).unwrap();
        // 写入顺序与序号无关
        write_segment(&temp, 2, b"cc");
        write_segment(&temp, 0, b"aa");
        write_segment(&temp, 1, b"bb");
        let output = root.path().join("out").join("video.ts");

        let written = Assembler::new(&temp)
            .assemble(&[0, 1, 2], &BTreeSet::new(), false, &output)
            .await
            .unwrap();

        assert_eq!(written, 6);
        assert_eq!(std::fs::read(&output).unwrap(), b"aabbcc");
        assert!(!temp.exists());
        assert!(!Assembler::partial_path(&output).exists());
    }

    #[tokio::test]
    async fn test_missing_segment_keeps_temp_files() {
        let root = tempfile::tempdir().unwrap();
        let temp = root.path().join("task");
        std::fs::create_dir_all(&temp).unwrap();
        write_segment(&temp, 0, b"aa");
        let output = root.path().join("video.ts");

        let err = Assembler::new(&temp)
            .assemble(&[0, 1], &BTreeSet::new(), false, &output)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::IncompleteAssembly { ref missing } if missing == &vec![1]));
        assert!(!output.exists());
        assert!(SegmentFetcher::segment_path(&temp, 0).exists());
    }

    #[tokio::test]
    async fn test_omitted_segments_are_skipped_when_allowed() {
        let root = tempfile::tempdir().unwrap();
        let temp = root.path().join("task");
        std::fs::create_dir_all(&temp).unwrap();
        write_segment(&temp, 0, b"aa");
        write_segment(&temp, 2, b"cc");
        let output = root.path().join("video.ts");
        let omitted = BTreeSet::from([1]);

        let refused = Assembler::new(&temp)
            .assemble(&[0, 1, 2], &omitted, false, &output)
            .await;
        assert!(refused.is_err());

        Assembler::new(&temp)
            .assemble(&[0, 1, 2], &omitted, true, &output)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"aacc");
    }
}
