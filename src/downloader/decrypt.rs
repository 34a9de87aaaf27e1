use std::collections::HashMap;
use std::sync::Arc;

use aes::Aes128;
use bytes::Bytes;
use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use tokio::sync::Mutex;
use tracing::debug;

use super::error::DownloadError;
use crate::common::client::HttpSource;
use crate::downloader::error::FetchError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES-128-CBC 解密（PKCS7 填充）
pub fn decrypt_aes128(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Result<Bytes, DownloadError> {
    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| DownloadError::Decrypt(format!("初始化 AES 解密器失败: {}", e)))?;
    let mut buffer = data.to_vec();
    let plain_len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|e| DownloadError::Decrypt(format!("分片解密失败: {}", e)))?
        .len();
    buffer.truncate(plain_len);
    Ok(Bytes::from(buffer))
}

/// 单次运行内的密钥缓存，同一地址只请求一次
pub struct KeyCache {
    source: Arc<dyn HttpSource>,
    keys: Mutex<HashMap<String, [u8; 16]>>,
}

impl KeyCache {
    pub fn new(source: Arc<dyn HttpSource>) -> Self {
        Self {
            source,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// 获取密钥。并发请求同一地址时只有一个真正发出
    pub async fn get(&self, uri: &str) -> Result<[u8; 16], KeyError> {
        let mut keys = self.keys.lock().await;
        if let Some(key) = keys.get(uri) {
            return Ok(*key);
        }

        debug!("获取解密密钥: {}", uri);
        let body = self.source.get_bytes(uri, None).await.map_err(KeyError::Fetch)?;
        let key: [u8; 16] = body
            .as_ref()
            .try_into()
            .map_err(|_| KeyError::InvalidLength(body.len()))?;
        keys.insert(uri.to_string(), key);
        Ok(key)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("获取密钥失败: {0}")]
    Fetch(FetchError),

    #[error("密钥长度应为 16 字节，实际为 {0}")]
    InvalidLength(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cbc::cipher::BlockEncryptMut;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::parser::models::ByteSpan;

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    struct CountingKeySource {
        hits: AtomicUsize,
        body: &'static [u8],
    }

    #[async_trait]
    impl HttpSource for CountingKeySource {
        async fn get_bytes(&self, _url: &str, _range: Option<ByteSpan>) -> Result<Bytes, FetchError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(self.body))
        }
    }

    #[test]
    fn test_decrypt_roundtrip() {
        let key = [0x42u8; 16];
        let iv = [0x07u8; 16];
        let plaintext = b"segment payload that spans more than one block";
        let encrypted = Aes128CbcEnc::new_from_slices(&key, &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let decrypted = decrypt_aes128(&encrypted, &key, &iv).unwrap();
        assert_eq!(&decrypted[..], plaintext);
    }

    #[test]
    fn test_decrypt_rejects_garbage() {
        let err = decrypt_aes128(&[1, 2, 3], &[0u8; 16], &[0u8; 16]).unwrap_err();
        assert!(matches!(err, DownloadError::Decrypt(_)));
    }

    #[tokio::test]
    async fn test_key_is_fetched_once() {
        let source = Arc::new(CountingKeySource {
            hits: AtomicUsize::new(0),
            body: b"0123456789abcdef",
        });
        let cache = KeyCache::new(source.clone());
        let first = cache.get("https://example.com/key").await.unwrap();
        let second = cache.get("https://example.com/key").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(source.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_key_with_wrong_length_is_rejected() {
        let cache = KeyCache::new(Arc::new(CountingKeySource {
            hits: AtomicUsize::new(0),
            body: b"short",
        }));
        let err = cache.get("https://example.com/key").await.unwrap_err();
        assert!(matches!(err, KeyError::InvalidLength(5)));
    }
}
