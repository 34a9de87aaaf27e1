//! 播放列表解析：拉取 M3U8 并展开为有序的分片列表

pub mod errors;
pub mod models;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use m3u8_rs::{KeyMethod, MasterPlaylist, MediaPlaylist, Playlist};
use tracing::{debug, info, warn};
use url::Url;

use crate::common::client::HttpSource;
use crate::downloader::error::FetchError;
use errors::{PlaylistError, Result};
use models::{ByteSpan, KeyInfo, ResolvedPlaylist, SegmentDescriptor};

pub struct PlaylistResolver {
    source: Arc<dyn HttpSource>,
    timeout: Duration,
}

impl PlaylistResolver {
    pub fn new(source: Arc<dyn HttpSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    /// 解析播放列表。主播放列表会自动选择第一个码流，不做重试
    pub async fn resolve(&self, url: &str) -> Result<ResolvedPlaylist> {
        let playlist_url = parse_url(url)?;
        let content = self.fetch(&playlist_url).await?;

        let (media, media_url) = match parse_content(&content)? {
            Playlist::MediaPlaylist(media) => (media, playlist_url),
            Playlist::MasterPlaylist(master) => {
                let variant_url = select_first_variant(&master, &playlist_url)?;
                info!("检测到主播放列表，默认选择第一个码流: {}", variant_url);
                match parse_content(&self.fetch(&variant_url).await?)? {
                    Playlist::MediaPlaylist(media) => (media, variant_url),
                    Playlist::MasterPlaylist(_) => {
                        return Err(PlaylistError::Unsupported(format!(
                            "码流地址仍然是主播放列表: {}",
                            variant_url
                        )));
                    }
                }
            }
        };

        if !media.end_list {
            warn!("播放列表缺少 EXT-X-ENDLIST，按当前快照下载: {}", media_url);
        }

        let segments = build_segments(&media, &media_url)?;
        let total_bytes = segments
            .iter()
            .map(SegmentDescriptor::expected_size)
            .sum::<Option<u64>>()
            .unwrap_or(0);

        debug!(
            "播放列表解析完成: {} 个分片, 预计 {} 字节",
            segments.len(),
            total_bytes
        );
        Ok(ResolvedPlaylist {
            playlist_url: media_url.to_string(),
            segments,
            total_bytes,
        })
    }

    async fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        debug!("获取播放列表: {}", url);
        match tokio::time::timeout(self.timeout, self.source.get_bytes(url.as_str(), None)).await
        {
            Ok(Ok(body)) => Ok(body.to_vec()),
            Ok(Err(e)) => Err(PlaylistError::Fetch(e)),
            Err(_) => Err(PlaylistError::Fetch(FetchError::Timeout(self.timeout))),
        }
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url.trim()).map_err(|e| PlaylistError::Parse(format!("无效的播放列表地址 {}: {}", url, e)))
}

fn join_url(base: &Url, uri: &str) -> Result<Url> {
    base.join(uri.trim())
        .map_err(|e| PlaylistError::Parse(format!("无法拼接地址 {}: {}", uri, e)))
}

fn parse_content(content: &[u8]) -> Result<Playlist> {
    let content = content.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(content);
    let start = content
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(content.len());
    if !content[start..].starts_with(b"#EXTM3U") {
        return Err(PlaylistError::Parse("内容不是 M3U8 播放列表 (缺少 #EXTM3U)".to_string()));
    }

    m3u8_rs::parse_playlist_res(&content[start..])
        .map_err(|e| PlaylistError::Parse(format!("{:?}", e)))
}

fn select_first_variant(master: &MasterPlaylist, base: &Url) -> Result<Url> {
    let variant = master
        .variants
        .iter()
        .find(|variant| !variant.is_i_frame)
        .ok_or_else(|| PlaylistError::Unsupported("主播放列表中没有可用的码流".to_string()))?;
    join_url(base, &variant.uri)
}

fn parse_iv(iv: &str) -> Result<[u8; 16]> {
    let hex_str = iv
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let mut bytes = [0u8; 16];
    hex::decode_to_slice(hex_str, &mut bytes)
        .map_err(|e| PlaylistError::Parse(format!("无效的 IV {}: {}", iv, e)))?;
    Ok(bytes)
}

fn resolve_key(key: &m3u8_rs::Key, base: &Url) -> Result<Option<KeyInfo>> {
    match &key.method {
        KeyMethod::None => Ok(None),
        KeyMethod::AES128 => {
            if let Some(format) = &key.keyformat {
                if format != "identity" {
                    return Err(PlaylistError::Unsupported(format!("不支持的密钥格式: {}", format)));
                }
            }
            let uri = key
                .uri
                .as_deref()
                .ok_or_else(|| PlaylistError::Parse("EXT-X-KEY 缺少 URI".to_string()))?;
            Ok(Some(KeyInfo {
                uri: join_url(base, uri)?.to_string(),
                iv: key.iv.as_deref().map(parse_iv).transpose()?,
            }))
        }
        other => Err(PlaylistError::Unsupported(format!("不支持的加密方式: {:?}", other))),
    }
}

/// 按播放顺序展开分片，初始化分片（如有）排在最前
pub fn build_segments(media: &MediaPlaylist, base: &Url) -> Result<Vec<SegmentDescriptor>> {
    if media.segments.is_empty() {
        return Err(PlaylistError::Parse("播放列表中没有分片".to_string()));
    }

    let mut segments = Vec::with_capacity(media.segments.len() + 1);
    let mut current_key: Option<KeyInfo> = None;
    let mut init_uri: Option<String> = None;
    // 同一资源上一个子区间的结束位置
    let mut range_ends: HashMap<String, u64> = HashMap::new();

    for (index, segment) in media.segments.iter().enumerate() {
        let media_sequence = media.media_sequence + index as u64;

        if let Some(key) = &segment.key {
            current_key = resolve_key(key, base)?;
        }

        if let Some(map) = &segment.map {
            let map_uri = join_url(base, &map.uri)?.to_string();
            match &init_uri {
                None => {
                    let byte_range = map.byte_range.as_ref().map(|range| ByteSpan {
                        offset: range.offset.unwrap_or(0),
                        length: range.length,
                    });
                    segments.push(SegmentDescriptor {
                        sequence: 0,
                        media_sequence,
                        uri: map_uri.clone(),
                        duration: 0.0,
                        byte_range,
                        key: current_key.clone(),
                        is_init: true,
                    });
                    init_uri = Some(map_uri);
                }
                Some(existing) if *existing != map_uri => {
                    warn!("播放列表中途更换了 EXT-X-MAP，仅使用第一个: {}", existing);
                }
                Some(_) => {}
            }
        }

        let uri = join_url(base, &segment.uri)?.to_string();
        let byte_range = segment.byte_range.as_ref().map(|range| {
            let offset = range
                .offset
                .unwrap_or_else(|| range_ends.get(&uri).copied().unwrap_or(0));
            range_ends.insert(uri.clone(), offset + range.length);
            ByteSpan {
                offset,
                length: range.length,
            }
        });

        segments.push(SegmentDescriptor {
            sequence: 0,
            media_sequence,
            uri,
            duration: segment.duration,
            byte_range,
            key: current_key.clone(),
            is_init: false,
        });
    }

    for (sequence, segment) in segments.iter_mut().enumerate() {
        segment.sequence = sequence;
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;

    struct StaticSource(HashMap<String, String>);

    #[async_trait]
    impl HttpSource for StaticSource {
        async fn get_bytes(
            &self,
            url: &str,
            _range: Option<ByteSpan>,
        ) -> std::result::Result<Bytes, FetchError> {
            self.0
                .get(url)
                .map(|body| Bytes::from(body.clone()))
                .ok_or_else(|| FetchError::Status {
                    status: 404,
                    url: url.to_string(),
                })
        }
    }

    fn resolver(entries: &[(&str, &str)]) -> PlaylistResolver {
        let map = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PlaylistResolver::new(Arc::new(StaticSource(map)), Duration::from_secs(1))
    }

    const MEDIA: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:7\n#EXTINF:9.0,\nseg0.ts\n#EXTINF:9.0,\nhttps://cdn.example.com/seg1.ts\n#EXTINF:4.5,\nsub/seg2.ts\n#EXT-X-ENDLIST\n";

    #[tokio::test]
    async fn test_resolve_media_playlist() {
        let resolver = resolver(&[("https://example.com/v/index.m3u8", MEDIA)]);
        let resolved = resolver.resolve("https://example.com/v/index.m3u8").await.unwrap();

        let uris: Vec<_> = resolved.segments.iter().map(|s| s.uri.as_str()).collect();
        assert_eq!(
            uris,
            vec![
                "https://example.com/v/seg0.ts",
                "https://cdn.example.com/seg1.ts",
                "https://example.com/v/sub/seg2.ts",
            ]
        );
        assert_eq!(resolved.segments[2].sequence, 2);
        assert_eq!(resolved.segments[2].media_sequence, 9);
        assert_eq!(resolved.total_bytes, 0);
        assert!((resolved.total_duration() - 22.5).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_master_playlist_selects_first_variant() {
        let master = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\nlow/index.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=2000000\nhigh/index.m3u8\n";
        let resolver = resolver(&[
            ("https://example.com/master.m3u8", master),
            ("https://example.com/low/index.m3u8", MEDIA),
        ]);
        let resolved = resolver.resolve("https://example.com/master.m3u8").await.unwrap();
        assert_eq!(resolved.playlist_url, "https://example.com/low/index.m3u8");
        assert_eq!(resolved.segments[0].uri, "https://example.com/low/seg0.ts");
    }

    #[tokio::test]
    async fn test_rejects_non_playlist_content() {
        let resolver = resolver(&[("https://example.com/a.m3u8", "<html>nope</html>")]);
        let err = resolver.resolve("https://example.com/a.m3u8").await.unwrap_err();
        assert!(matches!(err, PlaylistError::Parse(_)));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_reported() {
        let resolver = resolver(&[]);
        let err = resolver.resolve("https://example.com/missing.m3u8").await.unwrap_err();
        assert!(matches!(err, PlaylistError::Fetch(FetchError::Status { status: 404, .. })));
    }

    #[tokio::test]
    async fn test_key_carries_forward_and_iv_defaults_to_sequence() {
        let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:3\n#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n#EXTINF:5.0,\na.ts\n#EXTINF:5.0,\nb.ts\n#EXT-X-ENDLIST\n";
        let resolver = resolver(&[("https://example.com/enc.m3u8", playlist)]);
        let resolved = resolver.resolve("https://example.com/enc.m3u8").await.unwrap();

        for segment in &resolved.segments {
            let key = segment.key.as_ref().expect("每个分片都应继承密钥");
            assert_eq!(key.uri, "https://example.com/key.bin");
        }
        let iv = resolved.segments[1].effective_iv().unwrap();
        assert_eq!(iv[15], 4);
        assert!(iv[..15].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_sample_aes_is_unsupported() {
        let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"key.bin\"\n#EXTINF:5.0,\na.ts\n#EXT-X-ENDLIST\n";
        let resolver = resolver(&[("https://example.com/drm.m3u8", playlist)]);
        let err = resolver.resolve("https://example.com/drm.m3u8").await.unwrap_err();
        assert!(matches!(err, PlaylistError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_byte_ranges_and_init_map() {
        let playlist = "#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-TARGETDURATION:4\n#EXT-X-MAP:URI=\"init.mp4\"\n#EXTINF:4.0,\n#EXT-X-BYTERANGE:100@0\nmedia.mp4\n#EXTINF:4.0,\n#EXT-X-BYTERANGE:50\nmedia.mp4\n#EXT-X-ENDLIST\n";
        let resolver = resolver(&[("https://example.com/fmp4/index.m3u8", playlist)]);
        let resolved = resolver.resolve("https://example.com/fmp4/index.m3u8").await.unwrap();

        assert!(resolved.has_init_segment());
        assert_eq!(resolved.segments.len(), 3);
        assert!(resolved.segments[0].is_init);
        assert_eq!(resolved.segments[0].uri, "https://example.com/fmp4/init.mp4");
        assert_eq!(
            resolved.segments[2].byte_range,
            Some(ByteSpan { offset: 100, length: 50 })
        );
        let sequences: Vec<_> = resolved.segments.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        // 初始化分片没有声明大小，总大小未知
        assert_eq!(resolved.total_bytes, 0);
    }

    #[test]
    fn test_parse_iv() {
        let iv = parse_iv("0x000102030405060708090A0B0C0D0E0F").unwrap();
        assert_eq!(iv[1], 1);
        assert_eq!(iv[15], 15);
        assert!(parse_iv("0x1234").is_err());
    }
}
