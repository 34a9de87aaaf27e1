use serde::Serialize;

/// AES-128 密钥引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    /// 密钥的绝对地址
    pub uri: String,
    /// 播放列表显式声明的 IV，未声明时由媒体序号推导
    pub iv: Option<[u8; 16]>,
}

/// EXT-X-BYTERANGE 描述的子区间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteSpan {
    pub offset: u64,
    pub length: u64,
}

impl ByteSpan {
    /// HTTP Range 头的取值
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.offset, self.offset + self.length.saturating_sub(1))
    }
}

/// 一个可下载的分片。解析完成后不再修改
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentDescriptor {
    /// 合并顺序
    pub sequence: usize,
    pub media_sequence: u64,
    pub uri: String,
    pub duration: f32,
    pub byte_range: Option<ByteSpan>,
    pub key: Option<KeyInfo>,
    /// 是否为 EXT-X-MAP 初始化分片
    pub is_init: bool,
}

impl SegmentDescriptor {
    /// 播放列表声明的分片大小
    pub fn expected_size(&self) -> Option<u64> {
        self.byte_range.map(|range| range.length)
    }

    /// 解密使用的 IV：显式声明优先，否则为大端序的媒体序号
    pub fn effective_iv(&self) -> Option<[u8; 16]> {
        let key = self.key.as_ref()?;
        Some(key.iv.unwrap_or_else(|| {
            let mut iv = [0u8; 16];
            iv[8..].copy_from_slice(&self.media_sequence.to_be_bytes());
            iv
        }))
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPlaylist {
    /// 实际使用的媒体播放列表地址（主播放列表时为所选码流）
    pub playlist_url: String,
    pub segments: Vec<SegmentDescriptor>,
    /// 所有分片都声明了大小时为其总和，否则为 0
    pub total_bytes: u64,
}

impl ResolvedPlaylist {
    pub fn has_init_segment(&self) -> bool {
        self.segments.iter().any(|segment| segment.is_init)
    }

    /// 播放总时长（秒）
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|segment| segment.duration as f64).sum()
    }
}
