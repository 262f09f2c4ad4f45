//! 批量作业处理器 - 编排层
//!
//! ## 职责
//!
//! 程序入口：扫描作业清单，为每个清单创建作业、上传文档、等待题目抽取结束，
//! 把抽取结果写入输出目录。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：日志文件、按配置组装 `Pipeline`
//! 2. **批量加载**：扫描清单目录（`Vec<AssignmentManifest>`）
//! 3. **并发控制**：Semaphore 限制同时处理的文档数量，分批推进
//! 4. **全局统计**：成功 / 未发现题目 / 失败

use crate::config::{Config, ExtractionMode};
use crate::models::{
    load_all_manifests, AiProcessingStatus, AssignmentManifest, AssignmentStatus, Document,
    ExtractedQuestion,
};
use crate::orchestrator::pipeline::Pipeline;
use crate::utils::logging::{
    append_log_line, init_log_file, log_batch_complete, log_batch_start, log_manifests_loaded,
    log_startup, print_final_stats,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// 清单未指定教师时使用的账号
const BATCH_INSTRUCTOR: &str = "batch";
/// 轮询抽取状态的间隔
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// 应用主结构
pub struct App {
    config: Config,
    pipeline: Arc<Pipeline>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        init_log_file(&config.output_log_file)?;

        let mode = match config.extraction_mode {
            ExtractionMode::Ai => "AI",
            ExtractionMode::Heuristic => "启发式",
        };
        log_startup(config.max_concurrent_documents, mode);

        let pipeline = Pipeline::from_config(config.clone());
        Ok(Self::with_pipeline(config, pipeline))
    }

    /// 使用已组装好的流水线创建应用
    pub fn with_pipeline(config: Config, pipeline: Pipeline) -> Self {
        Self {
            config,
            pipeline: Arc::new(pipeline),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<ProcessingStats> {
        info!("\n📁 正在扫描待处理的作业清单...");
        let manifests = load_all_manifests(&self.config.manifest_folder).await?;

        if manifests.is_empty() {
            warn!("⚠️ 没有找到待处理的TOML文件，程序结束");
            return Ok(ProcessingStats::default());
        }

        log_manifests_loaded(manifests.len(), self.config.max_concurrent_documents);

        tokio::fs::create_dir_all(&self.config.output_folder)
            .await
            .with_context(|| format!("无法创建输出目录: {}", self.config.output_folder))?;

        let stats = self.process_all(manifests).await?;
        self.pipeline.wait_idle().await;

        print_final_stats(
            stats.completed,
            stats.no_questions,
            stats.failed,
            stats.total,
            &self.config.output_log_file,
        );
        Ok(stats)
    }

    async fn process_all(&self, manifests: Vec<AssignmentManifest>) -> Result<ProcessingStats> {
        let batch_size = self.config.max_concurrent_documents.max(1);
        let semaphore = Arc::new(Semaphore::new(batch_size));
        let total = manifests.len();
        let total_batches = total.div_ceil(batch_size);
        let mut stats = ProcessingStats {
            total,
            ..Default::default()
        };

        for (batch_idx, batch) in manifests.chunks(batch_size).enumerate() {
            let batch_start = batch_idx * batch_size;
            log_batch_start(
                batch_idx + 1,
                total_batches,
                batch_start + 1,
                batch_start + batch.len(),
                total,
            );

            let result = self.process_batch(batch, batch_start, semaphore.clone()).await?;
            stats.completed += result.completed;
            stats.no_questions += result.no_questions;
            stats.failed += result.failed;

            log_batch_complete(batch_idx + 1, result.completed, batch.len());
        }

        Ok(stats)
    }

    async fn process_batch(
        &self,
        batch: &[AssignmentManifest],
        batch_start: usize,
        semaphore: Arc<Semaphore>,
    ) -> Result<ProcessingStats> {
        let mut handles = Vec::new();

        for (idx, manifest) in batch.iter().enumerate() {
            let index = batch_start + idx + 1;
            let permit = semaphore.clone().acquire_owned().await?;
            let pipeline = self.pipeline.clone();
            let manifest = manifest.clone();
            let output_folder = self.config.output_folder.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                process_manifest(&pipeline, &manifest, &output_folder).await
            });
            handles.push((index, handle));
        }

        let mut result = ProcessingStats {
            total: batch.len(),
            ..Default::default()
        };
        for (index, handle) in handles {
            let (title, status) = match handle.await {
                Ok(Ok(report)) => (report.title, report.ai_processing_status),
                Ok(Err(e)) => {
                    error!("[作业 {}] ❌ 处理过程中发生错误: {:#}", index, e);
                    (format!("#{}", index), AiProcessingStatus::Failed)
                }
                Err(e) => {
                    error!("[作业 {}] 任务执行失败: {}", index, e);
                    (format!("#{}", index), AiProcessingStatus::Failed)
                }
            };
            match status {
                AiProcessingStatus::Completed => result.completed += 1,
                AiProcessingStatus::NoQuestionsFound => result.no_questions += 1,
                _ => result.failed += 1,
            }
            let line = format!("[{}] {} | {}", index, title, status.as_str());
            if let Err(e) = append_log_line(&self.config.output_log_file, &line) {
                warn!("写入日志文件失败: {}", e);
            }
        }

        Ok(result)
    }
}

/// 处理统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessingStats {
    pub completed: usize,
    pub no_questions: usize,
    pub failed: usize,
    pub total: usize,
}

/// 写入输出目录的单个作业抽取结果
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionReport {
    pub assignment_id: String,
    pub title: String,
    pub source_document: String,
    pub ai_processing_status: AiProcessingStatus,
    pub processing_error: Option<String>,
    pub max_points: f64,
    pub questions: Vec<ExtractedQuestion>,
}

/// 处理单个清单：创建作业 → 上传文档 → 等待抽取终态 → 写出结果
async fn process_manifest(
    pipeline: &Pipeline,
    manifest: &AssignmentManifest,
    output_folder: &str,
) -> Result<ExtractionReport> {
    let doc_path = manifest.document_path();
    let bytes = tokio::fs::read(&doc_path)
        .await
        .with_context(|| format!("无法读取文档: {}", doc_path.display()))?;
    let filename = doc_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| manifest.document.clone());

    let instructor = if manifest.instructor.is_empty() {
        BATCH_INSTRUCTOR.to_string()
    } else {
        manifest.instructor.clone()
    };

    let assignment = pipeline
        .create_assignment(
            &manifest.title,
            &instructor,
            manifest.assessment_type,
            manifest.submission_type,
        )
        .await?;
    let instructions = manifest.instructions.clone();
    let due_date = manifest.due_date;
    let passing_score = manifest.passing_score;
    pipeline
        .repository()
        .update_assignment(
            &assignment.id,
            Box::new(move |a| {
                a.instructions = instructions;
                a.due_date = due_date;
                if let Some(score) = passing_score {
                    a.passing_score = score;
                }
                Ok(())
            }),
        )
        .await?;
    pipeline
        .set_assignment_status(&assignment.id, &instructor, AssignmentStatus::Published)
        .await?;

    let doc = Document::new(bytes, manifest.resolved_mime_type(), filename.clone());
    if let Err(e) = pipeline
        .extraction()
        .upload_document(&assignment.id, &instructor, &doc)
        .await
    {
        warn!("[作业 ID#{}] ⚠️ 文档上传失败: {}", assignment.id, e);
        let report = ExtractionReport {
            assignment_id: assignment.id.clone(),
            title: manifest.title.clone(),
            source_document: filename,
            ai_processing_status: AiProcessingStatus::Failed,
            processing_error: Some(e.to_string()),
            max_points: 0.0,
            questions: Vec::new(),
        };
        write_report(output_folder, &report).await?;
        return Ok(report);
    }

    wait_for_terminal(pipeline, &assignment.id).await?;

    let stored = pipeline
        .repository()
        .find_assignment(&assignment.id)
        .await?
        .with_context(|| format!("作业 {} 已不存在", assignment.id))?;
    let report = ExtractionReport {
        assignment_id: stored.id.clone(),
        title: stored.title.clone(),
        source_document: filename,
        ai_processing_status: stored.ai_processing_status,
        processing_error: stored.ai_processing_error.clone(),
        max_points: stored.max_points,
        questions: stored.extracted_questions,
    };
    write_report(output_folder, &report).await?;

    info!(
        "[作业 ID#{}] ✓ {}: {} 道题目，满分 {}",
        report.assignment_id,
        report.ai_processing_status.as_str(),
        report.questions.len(),
        report.max_points
    );
    Ok(report)
}

/// 轮询抽取状态直到终态
///
/// 等待上限为一次模型调用的全部重试时间再加一分钟
async fn wait_for_terminal(pipeline: &Pipeline, assignment_id: &str) -> Result<()> {
    let config = pipeline.config();
    let limit = Duration::from_secs(
        config.ai_request_timeout_secs * (u64::from(config.ai_max_retries) + 1) + 60,
    );

    tokio::time::timeout(limit, async {
        loop {
            let status = pipeline.extraction().status(assignment_id).await?;
            if status.ai_processing_status.is_terminal() {
                return Ok::<_, anyhow::Error>(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .with_context(|| format!("等待作业 {} 抽取结束超时 ({:?})", assignment_id, limit))?
}

async fn write_report(output_folder: &str, report: &ExtractionReport) -> Result<()> {
    let path = Path::new(output_folder).join(format!("{}.json", report.assignment_id));
    let json = serde_json::to_string_pretty(report)?;
    tokio::fs::write(&path, json)
        .await
        .with_context(|| format!("无法写入结果文件: {}", path.display()))?;
    Ok(())
}
