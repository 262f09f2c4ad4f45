use crate::models::assignment::{AssessmentType, SubmissionType};
use crate::models::document::DocumentFormat;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 批处理作业清单（一个 TOML 文件描述一个待抽取的作业）
#[derive(Debug, Clone, Deserialize)]
pub struct AssignmentManifest {
    pub title: String,
    /// 文档路径，相对路径按清单所在目录解析
    pub document: String,
    #[serde(default)]
    pub assessment_type: AssessmentType,
    #[serde(default)]
    pub submission_type: SubmissionType,
    #[serde(default)]
    pub instructor: String,
    #[serde(default)]
    pub instructions: String,
    pub due_date: Option<DateTime<Utc>>,
    /// 及格线百分比（0-100）
    pub passing_score: Option<f64>,
    /// 显式 mime 类型，缺省时按扩展名推断
    pub mime_type: Option<String>,
    #[serde(skip)]
    pub file_path: Option<String>,
}

impl AssignmentManifest {
    /// 文档的绝对路径
    pub fn document_path(&self) -> PathBuf {
        let doc = PathBuf::from(&self.document);
        if doc.is_absolute() {
            return doc;
        }
        self.file_path
            .as_deref()
            .and_then(|p| Path::new(p).parent())
            .map(|dir| dir.join(&doc))
            .unwrap_or(doc)
    }

    /// 文档的 mime 类型
    pub fn resolved_mime_type(&self) -> String {
        if let Some(mime) = &self.mime_type {
            return mime.clone();
        }
        Path::new(&self.document)
            .extension()
            .and_then(|e| e.to_str())
            .and_then(DocumentFormat::mime_for_extension)
            .unwrap_or("application/octet-stream")
            .to_string()
    }
}

/// 加载单个清单文件
pub async fn load_manifest(toml_file_path: &Path) -> Result<AssignmentManifest> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .with_context(|| format!("无法读取TOML文件: {}", toml_file_path.display()))?;

    let mut manifest: AssignmentManifest = toml::from_str(&content)
        .with_context(|| format!("无法解析TOML文件: {}", toml_file_path.display()))?;

    manifest.file_path = Some(toml_file_path.to_string_lossy().to_string());

    Ok(manifest)
}

/// 从文件夹中加载所有清单，按文件名排序；单个文件加载失败只记录警告
pub async fn load_all_manifests(folder_path: &str) -> Result<Vec<AssignmentManifest>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        anyhow::bail!("文件夹不存在: {}", folder_path);
    }

    let mut paths = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder_path))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut manifests = Vec::new();
    for path in paths {
        tracing::info!(
            "正在加载: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );
        match load_manifest(&path).await {
            Ok(manifest) => manifests.push(manifest),
            Err(e) => tracing::warn!("加载文件失败 {}: {:#}", path.display(), e),
        }
    }

    Ok(manifests)
}
