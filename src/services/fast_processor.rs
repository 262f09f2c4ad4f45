//! 快速文档处理 - 业务能力层
//!
//! 文档入库的前门：
//! 1. 上传与解析并发执行（fan-out / fan-in）
//! 2. 按内容哈希缓存处理结果（TTL + 软容量上限）
//! 3. 解析时长按文件大小设上限
//! 4. 上传失败按指数退避重试

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult, DocumentError, UploadError};
use crate::infrastructure::{BlobStore, Clock, StoredBlob};
use crate::models::{Document, DocumentFormat, DocumentMetadata, ParseResult};
use crate::services::document_parser::{clean_text, parse_document, validate_document_with};
use crate::utils::{retry_with_backoff, RetryPolicy};

/// 可替换的解析函数
pub type ParserFn = Arc<dyn Fn(&[u8], &str, &str) -> AppResult<ParseResult> + Send + Sync>;

/// 文档处理结果
#[derive(Debug, Clone)]
pub struct ProcessedDocument {
    pub document_url: String,
    pub public_id: String,
    pub file_size: u64,
    /// 清洗后的文本
    pub document_text: String,
    pub metadata: DocumentMetadata,
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub processing_time: Duration,
    pub cache_hit: bool,
}

struct CacheEntry {
    stored_at: DateTime<Utc>,
    value: ProcessedDocument,
}

/// 进程内处理缓存
///
/// 缓存只是性能优化：未命中时重新处理，结果与命中时一致
pub struct ProcessingCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: chrono::TimeDelta,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl ProcessingCache {
    pub fn new(ttl: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: chrono::TimeDelta::from_std(ttl).unwrap_or(chrono::TimeDelta::MAX),
            capacity: capacity.max(1),
            clock,
        }
    }

    /// 缓存键：内容哈希 + mime 类型 + 文件名
    pub fn key(bytes: &[u8], mime_type: &str, filename: &str) -> String {
        format!("{}:{}:{}", blake3::hash(bytes).to_hex(), mime_type, filename)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<ProcessedDocument> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if now - entry.stored_at < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// 写入缓存；超过容量时先清理过期条目，仍超出则淘汰最旧条目
    pub fn insert(&self, key: String, value: ProcessedDocument) {
        let now = self.clock.now();
        let mut entries = self.lock();
        entries.insert(
            key,
            CacheEntry {
                stored_at: now,
                value,
            },
        );
        if entries.len() <= self.capacity {
            return;
        }

        let ttl = self.ttl;
        entries.retain(|_, e| now - e.stored_at < ttl);
        if entries.len() > self.capacity {
            let mut by_age: Vec<(String, DateTime<Utc>)> = entries
                .iter()
                .map(|(k, e)| (k.clone(), e.stored_at))
                .collect();
            by_age.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            let excess = entries.len() - self.capacity;
            for (k, _) in by_age.into_iter().take(excess) {
                entries.remove(&k);
            }
        }
        debug!("缓存清理后剩余 {} 条", entries.len());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// 快速文档处理器
pub struct FastDocumentProcessor {
    blob_store: Arc<dyn BlobStore>,
    cache: ProcessingCache,
    parser: ParserFn,
    upload_policy: RetryPolicy,
    config: Config,
}

impl FastDocumentProcessor {
    pub fn new(config: &Config, blob_store: Arc<dyn BlobStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_parser(
            config,
            blob_store,
            clock,
            Arc::new(|bytes: &[u8], mime: &str, name: &str| parse_document(bytes, mime, name)),
        )
    }

    /// 使用自定义解析函数创建处理器
    pub fn with_parser(
        config: &Config,
        blob_store: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        parser: ParserFn,
    ) -> Self {
        Self {
            blob_store,
            cache: ProcessingCache::new(config.cache_ttl(), config.cache_capacity, clock),
            parser,
            upload_policy: RetryPolicy::new(
                config.upload_max_retries,
                Duration::from_millis(config.upload_retry_base_delay_ms),
            ),
            config: config.clone(),
        }
    }

    pub fn cache(&self) -> &ProcessingCache {
        &self.cache
    }

    /// 处理文档：上传与解析并发执行，两者都完成后返回
    ///
    /// 两者都失败时优先返回解析错误；上传成功但解析失败时尽力删除已上传的文件
    pub async fn process_document(&self, doc: &Document, folder: &str) -> AppResult<ProcessedDocument> {
        let started = Instant::now();
        let key = ProcessingCache::key(&doc.bytes, &doc.mime_type, &doc.filename);

        if let Some(hit) = self.cache.get(&key) {
            info!("⚡ 缓存命中: {}", doc.filename);
            return Ok(ProcessedDocument {
                processing_time: started.elapsed(),
                cache_hit: true,
                ..hit
            });
        }

        if DocumentFormat::from_mime(&doc.mime_type).is_none() {
            return Err(AppError::unsupported_format(&doc.mime_type, &doc.filename));
        }

        let timeout = self.config.parse_timeout_for(doc.size());
        let (uploaded, parsed) = tokio::join!(
            self.upload_with_retry(doc, folder),
            self.parse_with_deadline(doc, timeout)
        );

        let (blob, parsed) = match (uploaded, parsed) {
            (Ok(blob), Ok(parsed)) => (blob, parsed),
            (Ok(blob), Err(parse_err)) => {
                self.discard_orphan(&blob).await;
                return Err(parse_err);
            }
            (Err(_), Err(parse_err)) => return Err(parse_err),
            (Err(upload_err), Ok(_)) => return Err(upload_err),
        };

        let cleaned = ParseResult {
            text: clean_text(&parsed.text),
            metadata: parsed.metadata,
        };
        let report = validate_document_with(
            &cleaned,
            self.config.min_document_chars,
            self.config.short_document_warning_chars,
        );
        for warning in &report.warnings {
            warn!("⚠️ {}: {}", doc.filename, warning);
        }

        let result = ProcessedDocument {
            document_url: blob.url,
            public_id: blob.public_id,
            file_size: blob.size,
            document_text: cleaned.text,
            metadata: cleaned.metadata,
            is_valid: report.is_valid,
            errors: report.errors,
            warnings: report.warnings,
            processing_time: started.elapsed(),
            cache_hit: false,
        };
        info!(
            "✓ 文档处理完成: {} ({} 字符, {}ms)",
            doc.filename,
            result.document_text.chars().count(),
            result.processing_time.as_millis()
        );
        self.cache.insert(key, result.clone());
        Ok(result)
    }

    /// 重新下载已存储的文档并解析（抽取重试路径使用）
    pub async fn reparse_stored(&self, url: &str, mime_type: &str, filename: &str) -> AppResult<String> {
        let bytes = self
            .blob_store
            .download(url)
            .await
            .map_err(|e| UploadError::DownloadFailed {
                url: url.to_string(),
                source: e.into(),
            })?;
        let doc = Document::new(bytes, mime_type, filename);
        let parsed = self
            .parse_with_deadline(&doc, self.config.parse_timeout_for(doc.size()))
            .await?;
        Ok(clean_text(&parsed.text))
    }

    async fn upload_with_retry(&self, doc: &Document, folder: &str) -> AppResult<StoredBlob> {
        let (result, attempts) = retry_with_backoff(self.upload_policy, "上传文档", |_| {
            self.blob_store.upload(doc.bytes.clone(), folder, &doc.filename)
        })
        .await;
        result.map_err(|e| {
            UploadError::Failed {
                filename: doc.filename.clone(),
                attempts,
                source: e.into(),
            }
            .into()
        })
    }

    /// 在阻塞线程池中解析，超过时限返回 `ParseTimeout`
    async fn parse_with_deadline(&self, doc: &Document, timeout: Duration) -> AppResult<ParseResult> {
        let parser = self.parser.clone();
        let bytes = doc.bytes.clone();
        let mime_type = doc.mime_type.clone();
        let filename = doc.filename.clone();
        let task = tokio::task::spawn_blocking(move || parser(&bytes, &mime_type, &filename));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(AppError::parse_failed(doc.filename.clone(), join_err)),
            Err(_) => {
                warn!("解析 {} 超时 ({}ms)", doc.filename, timeout.as_millis());
                Err(DocumentError::ParseTimeout {
                    filename: doc.filename.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }

    async fn discard_orphan(&self, blob: &StoredBlob) {
        if let Err(e) = self.blob_store.delete(&blob.public_id).await {
            warn!("清理孤立文件 {} 失败: {}", blob.public_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{InMemoryBlobStore, ManualClock};
    use crate::models::document::MIME_TEXT;

    const SAMPLE: &str = "1. What is the boiling point of water at sea level?\n\n\n\n2. Name   the largest ocean.";

    fn test_config() -> Config {
        Config {
            upload_retry_base_delay_ms: 1,
            ..Config::default()
        }
    }

    fn setup() -> (Arc<InMemoryBlobStore>, Arc<ManualClock>, FastDocumentProcessor) {
        let store = Arc::new(InMemoryBlobStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let processor = FastDocumentProcessor::new(&test_config(), store.clone(), clock.clone());
        (store, clock, processor)
    }

    fn text_doc(content: &str) -> Document {
        Document::new(content.as_bytes().to_vec(), MIME_TEXT, "quiz.txt")
    }

    #[tokio::test]
    async fn test_returns_cleaned_text_and_validation() {
        let (_, _, processor) = setup();
        let result = processor.process_document(&text_doc(SAMPLE), "assignments").await.unwrap();
        assert_eq!(
            result.document_text,
            "1. What is the boiling point of water at sea level?\n\n2. Name the largest ocean."
        );
        assert!(result.is_valid);
        assert!(result.document_url.starts_with("mem://assignments/"));
        assert!(!result.cache_hit);
    }

    #[tokio::test]
    async fn test_cache_hit_then_expiry() {
        let (store, clock, processor) = setup();
        let doc = text_doc(SAMPLE);
        let first = processor.process_document(&doc, "a").await.unwrap();
        let second = processor.process_document(&doc, "a").await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.document_url, first.document_url);
        assert_eq!(second.document_text, first.document_text);
        assert_eq!(store.upload_calls(), 1);

        clock.advance(Duration::from_secs(301));
        let third = processor.process_document(&doc, "a").await.unwrap();
        assert!(!third.cache_hit);
        assert_eq!(store.upload_calls(), 2);
    }

    #[tokio::test]
    async fn test_upload_retries_then_succeeds() {
        let (store, _, processor) = setup();
        store.fail_next_uploads(2);
        let result = processor.process_document(&text_doc(SAMPLE), "a").await;
        assert!(result.is_ok());
        assert_eq!(store.upload_calls(), 3);
    }

    #[tokio::test]
    async fn test_upload_error_after_budget() {
        let (store, _, processor) = setup();
        store.fail_next_uploads(3);
        let err = processor.process_document(&text_doc(SAMPLE), "a").await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Upload(UploadError::Failed { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_unsupported_format_skips_upload() {
        let (store, _, processor) = setup();
        let doc = Document::new(vec![1, 2, 3], "image/png", "scan.png");
        let err = processor.process_document(&doc, "a").await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Document(DocumentError::UnsupportedFormat { .. })
        ));
        assert_eq!(store.upload_calls(), 0);
    }

    #[tokio::test]
    async fn test_parse_failure_removes_uploaded_blob() {
        let (store, _, processor) = setup();
        let doc = Document::new(b"garbage".to_vec(), "application/pdf", "bad.pdf");
        let err = processor.process_document(&doc, "a").await.unwrap_err();
        assert!(matches!(err, AppError::Document(DocumentError::Parse { .. })));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_slow_parse_times_out() {
        let store = Arc::new(InMemoryBlobStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = Config {
            parse_timeout_base_ms: 20,
            ..test_config()
        };
        let slow: ParserFn = Arc::new(|_: &[u8], _: &str, _: &str| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(ParseResult::default())
        });
        let processor = FastDocumentProcessor::with_parser(&config, store.clone(), clock, slow);
        let err = processor.process_document(&text_doc(SAMPLE), "a").await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Document(DocumentError::ParseTimeout { timeout_ms: 20, .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_cache_capacity_evicts_expired_then_oldest() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = ProcessingCache::new(Duration::from_secs(300), 2, clock.clone());
        let entry = ProcessedDocument {
            document_url: "u".to_string(),
            public_id: "p".to_string(),
            file_size: 1,
            document_text: "t".to_string(),
            metadata: DocumentMetadata::default(),
            is_valid: true,
            errors: vec![],
            warnings: vec![],
            processing_time: Duration::ZERO,
            cache_hit: false,
        };
        cache.insert("old".to_string(), entry.clone());
        clock.advance(Duration::from_secs(400));
        cache.insert("a".to_string(), entry.clone());
        cache.insert("b".to_string(), entry.clone());
        assert_eq!(cache.len(), 2);
        assert!(cache.get("old").is_none());

        clock.advance(Duration::from_secs(1));
        cache.insert("c".to_string(), entry);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("c").is_some());
    }
}
