//! 文件存储 - 基础设施层
//!
//! 只提供"按 URL 可访问的持久字节存储"能力，不关心文档内容

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// 已存储对象的信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub url: String,
    pub public_id: String,
    pub size: u64,
}

/// 文件存储能力
pub trait BlobStore: Send + Sync {
    fn upload<'a>(
        &'a self,
        bytes: Arc<[u8]>,
        folder: &'a str,
        filename: &'a str,
    ) -> BoxFuture<'a, Result<StoredBlob>>;

    fn download<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;

    fn delete<'a>(&'a self, public_id: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// 文件名中只保留安全字符
fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned
    }
}

fn new_public_id(folder: &str, filename: &str) -> String {
    let folder = folder.trim_matches('/');
    let name = format!("{}_{}", uuid::Uuid::new_v4().simple(), sanitize_filename(filename));
    if folder.is_empty() {
        name
    } else {
        format!("{}/{}", folder, name)
    }
}

/// 本地目录存储，URL 形如 `file:///abs/path`；下载也支持 http(s) URL
pub struct LocalBlobStore {
    root: PathBuf,
    http: reqwest::Client,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            http: reqwest::Client::new(),
        }
    }

    fn path_for(&self, public_id: &str) -> PathBuf {
        self.root.join(public_id)
    }
}

impl BlobStore for LocalBlobStore {
    fn upload<'a>(
        &'a self,
        bytes: Arc<[u8]>,
        folder: &'a str,
        filename: &'a str,
    ) -> BoxFuture<'a, Result<StoredBlob>> {
        Box::pin(async move {
            let public_id = new_public_id(folder, filename);
            let path = self.path_for(&public_id);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("无法创建目录: {}", parent.display()))?;
            }
            tokio::fs::write(&path, &bytes)
                .await
                .with_context(|| format!("无法写入文件: {}", path.display()))?;
            let abs = std::path::absolute(&path).unwrap_or(path);
            debug!("已存储 {} 字节到 {}", bytes.len(), abs.display());
            Ok(StoredBlob {
                url: format!("file://{}", abs.display()),
                public_id,
                size: bytes.len() as u64,
            })
        })
    }

    fn download<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            if url.starts_with("http://") || url.starts_with("https://") {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .with_context(|| format!("请求失败: {}", url))?
                    .error_for_status()?;
                return Ok(response.bytes().await?.to_vec());
            }
            let path = Path::new(url.strip_prefix("file://").unwrap_or(url));
            tokio::fs::read(path)
                .await
                .with_context(|| format!("无法读取文件: {}", path.display()))
        })
    }

    fn delete<'a>(&'a self, public_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let path = self.path_for(public_id);
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("无法删除文件: {}", path.display()))
        })
    }
}

/// 进程内存储，可注入故障，供测试和离线演示使用
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    fail_next_uploads: AtomicU32,
    fail_downloads: AtomicBool,
    upload_calls: AtomicU32,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接下来的 `n` 次上传将失败
    pub fn fail_next_uploads(&self, n: u32) {
        self.fail_next_uploads.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_downloads(&self, fail: bool) {
        self.fail_downloads.store(fail, Ordering::SeqCst);
    }

    pub fn upload_calls(&self) -> u32 {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn contains(&self, public_id: &str) -> bool {
        self.lock().contains_key(public_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl BlobStore for InMemoryBlobStore {
    fn upload<'a>(
        &'a self,
        bytes: Arc<[u8]>,
        folder: &'a str,
        filename: &'a str,
    ) -> BoxFuture<'a, Result<StoredBlob>> {
        Box::pin(async move {
            self.upload_calls.fetch_add(1, Ordering::SeqCst);
            let should_fail = self
                .fail_next_uploads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                anyhow::bail!("模拟上传失败");
            }
            let public_id = new_public_id(folder, filename);
            let size = bytes.len() as u64;
            self.lock().insert(public_id.clone(), bytes.to_vec());
            Ok(StoredBlob {
                url: format!("mem://{}", public_id),
                public_id,
                size,
            })
        })
    }

    fn download<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            if self.fail_downloads.load(Ordering::SeqCst) {
                anyhow::bail!("模拟下载失败");
            }
            let public_id = url.strip_prefix("mem://").unwrap_or(url);
            self.lock()
                .get(public_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("对象不存在: {}", url))
        })
    }

    fn delete<'a>(&'a self, public_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.lock()
                .remove(public_id)
                .map(|_| ())
                .ok_or_else(|| anyhow::anyhow!("对象不存在: {}", public_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let bytes: Arc<[u8]> = Arc::from(&b"hello world"[..]);
        let blob = store.upload(bytes, "assignments", "My Quiz.pdf").await.unwrap();
        assert!(blob.public_id.starts_with("assignments/"));
        assert!(blob.public_id.ends_with("My_Quiz.pdf"));
        assert_eq!(blob.size, 11);

        let data = store.download(&blob.url).await.unwrap();
        assert_eq!(data, b"hello world");

        store.delete(&blob.public_id).await.unwrap();
        assert!(store.download(&blob.url).await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_failure_injection() {
        let store = InMemoryBlobStore::new();
        store.fail_next_uploads(1);
        let bytes: Arc<[u8]> = Arc::from(&b"x"[..]);
        assert!(store.upload(bytes.clone(), "f", "a.txt").await.is_err());
        let blob = store.upload(bytes, "f", "a.txt").await.unwrap();
        assert_eq!(store.upload_calls(), 2);
        assert!(store.contains(&blob.public_id));
    }
}
