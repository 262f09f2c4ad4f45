use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AppResult, ConfigError};

/// 题目抽取模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
    /// 调用 AI 模型抽取（主路径）
    Ai,
    /// 离线启发式抽取（AI 不可用时的降级路径）
    Heuristic,
}

impl std::str::FromStr for ExtractionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ai" => Ok(ExtractionMode::Ai),
            "heuristic" => Ok(ExtractionMode::Heuristic),
            other => Err(format!("未知的抽取模式: {}", other)),
        }
    }
}

/// 程序配置
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    // --- AI 配置 ---
    pub ai_api_key: String,
    pub ai_api_base_url: String,
    pub ai_model_name: String,
    /// 送入模型的文档文本最大字符数
    pub ai_max_text_length: usize,
    pub ai_max_tokens: u32,
    /// 单次模型调用超时
    pub ai_request_timeout_secs: u64,
    pub ai_max_retries: u32,
    pub extraction_mode: ExtractionMode,
    /// 模型未给出分值时的默认分值
    pub default_question_points: f64,
    /// 模型未给出置信度时的默认值
    pub default_grade_confidence: f64,

    // --- 文档处理 ---
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    /// 上传失败后的额外重试次数
    pub upload_max_retries: u32,
    pub upload_retry_base_delay_ms: u64,
    pub parse_timeout_base_ms: u64,
    pub parse_timeout_per_mb_ms: u64,
    pub min_document_chars: usize,
    pub short_document_warning_chars: usize,

    // --- 提交与抽取状态 ---
    pub auto_submit_grace_secs: i64,
    pub stale_pending_after_secs: i64,

    // --- 批处理 ---
    /// 同时处理的文档数量
    pub max_concurrent_documents: usize,
    /// 后台任务并发上限
    pub max_background_tasks: usize,
    /// 文件存储根目录
    pub storage_root: String,
    /// 作业清单（TOML）目录
    pub manifest_folder: String,
    /// 抽取结果输出目录
    pub output_folder: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 输出日志文件
    pub output_log_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ai_api_key: String::new(),
            ai_api_base_url: "https://api.openai.com/v1".to_string(),
            ai_model_name: "gpt-4o-mini".to_string(),
            ai_max_text_length: 8000,
            ai_max_tokens: 4096,
            ai_request_timeout_secs: 120,
            ai_max_retries: 2,
            extraction_mode: ExtractionMode::Ai,
            default_question_points: 10.0,
            default_grade_confidence: 0.8,
            cache_ttl_secs: 300,
            cache_capacity: 100,
            upload_max_retries: 2,
            upload_retry_base_delay_ms: 1000,
            parse_timeout_base_ms: 10_000,
            parse_timeout_per_mb_ms: 1000,
            min_document_chars: 50,
            short_document_warning_chars: 100,
            auto_submit_grace_secs: 300,
            stale_pending_after_secs: 900,
            max_concurrent_documents: 8,
            max_background_tasks: 16,
            storage_root: "storage".to_string(),
            manifest_folder: "manifests".to_string(),
            output_folder: "output".to_string(),
            verbose_logging: false,
            output_log_file: "output.txt".to_string(),
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// 从环境变量加载配置，无法解析的值回退为默认值
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// 从 TOML 文件加载配置，缺失字段使用默认值，随后应用环境变量覆盖
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config =
            toml::from_str(&content).map_err(|source| ConfigError::TomlParseFailed {
                path: path.display().to_string(),
                source,
            })?;
        Ok(config.with_env_overrides())
    }

    fn with_env_overrides(self) -> Self {
        let d = self;
        Self {
            ai_api_key: std::env::var("AI_API_KEY").unwrap_or(d.ai_api_key),
            ai_api_base_url: std::env::var("AI_API_BASE_URL").unwrap_or(d.ai_api_base_url),
            ai_model_name: std::env::var("AI_MODEL_NAME").unwrap_or(d.ai_model_name),
            ai_max_text_length: env_or("AI_MAX_TEXT_LENGTH", d.ai_max_text_length),
            ai_max_tokens: env_or("AI_MAX_TOKENS", d.ai_max_tokens),
            ai_request_timeout_secs: env_or("AI_REQUEST_TIMEOUT_SECS", d.ai_request_timeout_secs),
            ai_max_retries: env_or("AI_MAX_RETRIES", d.ai_max_retries),
            extraction_mode: env_or("EXTRACTION_MODE", d.extraction_mode),
            default_question_points: env_or("DEFAULT_QUESTION_POINTS", d.default_question_points),
            default_grade_confidence: env_or("DEFAULT_GRADE_CONFIDENCE", d.default_grade_confidence),
            cache_ttl_secs: env_or("CACHE_TTL_SECS", d.cache_ttl_secs),
            cache_capacity: env_or("CACHE_CAPACITY", d.cache_capacity),
            upload_max_retries: env_or("UPLOAD_MAX_RETRIES", d.upload_max_retries),
            upload_retry_base_delay_ms: env_or("UPLOAD_RETRY_BASE_DELAY_MS", d.upload_retry_base_delay_ms),
            parse_timeout_base_ms: env_or("PARSE_TIMEOUT_BASE_MS", d.parse_timeout_base_ms),
            parse_timeout_per_mb_ms: env_or("PARSE_TIMEOUT_PER_MB_MS", d.parse_timeout_per_mb_ms),
            min_document_chars: env_or("MIN_DOCUMENT_CHARS", d.min_document_chars),
            short_document_warning_chars: env_or("SHORT_DOCUMENT_WARNING_CHARS", d.short_document_warning_chars),
            auto_submit_grace_secs: env_or("AUTO_SUBMIT_GRACE_SECS", d.auto_submit_grace_secs),
            stale_pending_after_secs: env_or("STALE_PENDING_AFTER_SECS", d.stale_pending_after_secs),
            max_concurrent_documents: env_or("MAX_CONCURRENT_DOCUMENTS", d.max_concurrent_documents),
            max_background_tasks: env_or("MAX_BACKGROUND_TASKS", d.max_background_tasks),
            storage_root: std::env::var("STORAGE_ROOT").unwrap_or(d.storage_root),
            manifest_folder: std::env::var("MANIFEST_FOLDER").unwrap_or(d.manifest_folder),
            output_folder: std::env::var("OUTPUT_FOLDER").unwrap_or(d.output_folder),
            verbose_logging: env_or("VERBOSE_LOGGING", d.verbose_logging),
            output_log_file: std::env::var("OUTPUT_LOG_FILE").unwrap_or(d.output_log_file),
        }
    }

    /// 根据文件大小计算解析超时：基础时长 + 每 MB 追加时长
    pub fn parse_timeout_for(&self, size_bytes: usize) -> Duration {
        let mb = size_bytes as u64 / (1024 * 1024);
        Duration::from_millis(self.parse_timeout_base_ms + mb * self.parse_timeout_per_mb_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn ai_request_timeout(&self) -> Duration {
        Duration::from_secs(self.ai_request_timeout_secs)
    }
}
