use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 文档解析相关错误
    #[error("文档错误: {0}")]
    Document(#[from] DocumentError),
    /// 文件存储上传/下载错误
    #[error("上传错误: {0}")]
    Upload(#[from] UploadError),
    /// AI 模型相关错误
    #[error("AI错误: {0}")]
    Ai(#[from] AiError),
    /// 提交流程错误（用户可修正）
    #[error("提交错误: {0}")]
    Submission(#[from] SubmissionError),
    /// 持久化存储错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 其他错误（用于包装第三方库错误）
    #[error("错误: {0}")]
    Other(String),
}

/// 文档解析错误
#[derive(Debug, Error)]
pub enum DocumentError {
    /// 不支持的文件格式
    #[error("不支持的文件格式 '{mime_type}' ({filename})")]
    UnsupportedFormat { mime_type: String, filename: String },
    /// 解析失败（文件损坏、PDF 加密等）
    #[error("解析文档 {filename} 失败: {source}")]
    Parse {
        filename: String,
        #[source]
        source: BoxError,
    },
    /// 解析超时
    #[error("解析文档 {filename} 超时 ({timeout_ms}ms)")]
    ParseTimeout { filename: String, timeout_ms: u64 },
    /// 没有可供抽取的文档文本
    #[error("没有可用的文档文本: {reason}")]
    MissingText { reason: String },
}

/// 文件存储错误
#[derive(Debug, Error)]
pub enum UploadError {
    /// 重试耗尽后上传仍失败
    #[error("上传 {filename} 失败 (已尝试 {attempts} 次): {source}")]
    Failed {
        filename: String,
        attempts: u32,
        #[source]
        source: BoxError,
    },
    /// 下载已存储的文档失败
    #[error("下载文档 {url} 失败: {source}")]
    DownloadFailed {
        url: String,
        #[source]
        source: BoxError,
    },
}

/// AI 模型错误
#[derive(Debug, Error)]
pub enum AiError {
    /// API 调用失败
    #[error("AI API调用失败 (模型: {model}): {source}")]
    RequestFailed {
        model: String,
        #[source]
        source: BoxError,
    },
    /// 返回内容为空
    #[error("AI返回内容为空 (模型: {model})")]
    EmptyResponse { model: String },
    /// 调用超时
    #[error("AI调用超时 (模型: {model}, {timeout_secs}秒)")]
    Timeout { model: String, timeout_secs: u64 },
    /// 无法从返回内容中恢复题目数组
    #[error("题目抽取失败: {message}")]
    ExtractionFailed { message: String },
    /// 无法从返回内容中恢复评分结果
    #[error("AI评分失败: {message}")]
    GradingFailed { message: String },
}

/// 提交流程错误
#[derive(Debug, Error)]
pub enum SubmissionError {
    /// 提交内容不完整
    #[error("提交内容不完整: {requirement}")]
    Incomplete { requirement: String },
    /// 重复提交
    #[error("作业 {assignment_id} 已由学生 {student_id} 提交，不能重复提交")]
    Duplicate {
        assignment_id: String,
        student_id: String,
    },
    /// 作业当前不接受提交
    #[error("作业 {assignment_id} 当前状态为 {status}，不接受提交")]
    NotOpen { assignment_id: String, status: String },
    /// 评分参数不合法
    #[error("评分参数不合法: {reason}")]
    InvalidGrade { reason: String },
}

/// 持久化存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 记录不存在
    #[error("{entity} 不存在: {id}")]
    NotFound { entity: &'static str, id: String },
    /// 无权操作
    #[error("无权操作: {reason}")]
    Forbidden { reason: String },
    /// 文件读写失败
    #[error("文件读写失败 ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 读取配置文件失败
    #[error("读取配置文件 {path} 失败: {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

// ========== 从常见错误类型转换 ==========

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Store(StoreError::Io {
            path: String::new(),
            source: err,
        })
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Other(format!("{:#}", err))
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建不支持格式错误
    pub fn unsupported_format(mime_type: impl Into<String>, filename: impl Into<String>) -> Self {
        AppError::Document(DocumentError::UnsupportedFormat {
            mime_type: mime_type.into(),
            filename: filename.into(),
        })
    }

    /// 创建解析失败错误
    pub fn parse_failed(filename: impl Into<String>, source: impl Into<BoxError>) -> Self {
        AppError::Document(DocumentError::Parse {
            filename: filename.into(),
            source: source.into(),
        })
    }

    /// 创建 AI 调用失败错误
    pub fn ai_request_failed(model: impl Into<String>, source: impl Into<BoxError>) -> Self {
        AppError::Ai(AiError::RequestFailed {
            model: model.into(),
            source: source.into(),
        })
    }

    /// 创建题目抽取失败错误
    pub fn extraction_failed(message: impl Into<String>) -> Self {
        AppError::Ai(AiError::ExtractionFailed {
            message: message.into(),
        })
    }

    /// 创建提交不完整错误
    pub fn incomplete(requirement: impl Into<String>) -> Self {
        AppError::Submission(SubmissionError::Incomplete {
            requirement: requirement.into(),
        })
    }

    /// 创建记录不存在错误
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        AppError::Store(StoreError::NotFound {
            entity,
            id: id.into(),
        })
    }

    /// 创建无权操作错误
    pub fn forbidden(reason: impl Into<String>) -> Self {
        AppError::Store(StoreError::Forbidden {
            reason: reason.into(),
        })
    }

    /// 是否为用户可修正的提交错误（对应 4xx）
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            AppError::Submission(_) | AppError::Document(DocumentError::UnsupportedFormat { .. })
        )
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
