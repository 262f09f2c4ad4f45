use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_DOC: &str = "application/msword";
pub const MIME_TEXT: &str = "text/plain";

/// 上传的原始文档（临时对象，抽取文本后即丢弃）
#[derive(Debug, Clone)]
pub struct Document {
    pub bytes: Arc<[u8]>,
    pub mime_type: String,
    pub filename: String,
}

impl Document {
    pub fn new(bytes: impl Into<Arc<[u8]>>, mime_type: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
            filename: filename.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// 支持的文档格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    /// docx 以及旧版 doc 的 mime 声明
    Word,
    PlainText,
}

impl DocumentFormat {
    /// 根据声明的 mime 类型判断格式，忽略参数部分（如 `; charset=utf-8`）
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        let essence = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            MIME_PDF => Some(DocumentFormat::Pdf),
            MIME_DOCX | MIME_DOC => Some(DocumentFormat::Word),
            MIME_TEXT => Some(DocumentFormat::PlainText),
            _ => None,
        }
    }

    /// 根据文件扩展名推断 mime 类型（批处理清单使用）
    pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(MIME_PDF),
            "docx" => Some(MIME_DOCX),
            "doc" => Some(MIME_DOC),
            "txt" | "text" | "md" => Some(MIME_TEXT),
            _ => None,
        }
    }
}

/// 文档元数据（仅 PDF 提供）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

/// 解析结果
///
/// `text` 只有在源文档没有可抽取文本时才为空
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    pub text: String,
    pub metadata: DocumentMetadata,
}

/// 文档校验报告
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}
