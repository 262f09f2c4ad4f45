//! 题目抽取状态机 - 流程层
//!
//! 核心职责：管理一个作业从"上传文档"到"题目就绪"的状态流转
//!
//! ```text
//! not_started → pending → {completed | failed | no_questions_found}
//! ```
//!
//! 1. 接受请求时同步写入 `pending`，然后才调度后台任务
//! 2. 后台任务无论成功还是出错，都会写入一个终态
//! 3. 每次接受请求都会递增 `extraction_attempt`，被取代的尝试不写回结果
//! 4. 任何终态都会清空 `document_text`

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult, DocumentError};
use crate::infrastructure::{BackgroundTasks, Clock, Repository};
use crate::models::{AiProcessingStatus, Assignment, AssignmentDocument, Document, ExtractedQuestion};
use crate::services::document_parser::extract_structured_questions_at;
use crate::services::{organize, FastDocumentProcessor, IdPrefix, QuestionExtractor};
use crate::workflow::ctx::AssignmentCtx;

/// 作业文档在文件存储中的目录
pub const DOCUMENT_FOLDER: &str = "assignments";

/// 题目来源
#[derive(Clone)]
pub enum ExtractionStrategy {
    /// 调用 AI 模型
    Ai(Arc<QuestionExtractor>),
    /// 离线启发式抽取
    Heuristic,
}

/// 轮询接口返回的抽取状态
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionStatus {
    pub ai_processing_status: AiProcessingStatus,
    pub questions_count: usize,
    pub has_questions: bool,
    pub processing_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl ExtractionStatus {
    pub fn from_assignment(assignment: &Assignment) -> Self {
        let message = match assignment.ai_processing_status {
            AiProcessingStatus::Pending | AiProcessingStatus::Processing => {
                Some("正在抽取题目，请稍后查询".to_string())
            }
            AiProcessingStatus::NoQuestionsFound => {
                Some("文档已成功处理，但没有找到可抽取的题目".to_string())
            }
            _ => None,
        };
        Self {
            ai_processing_status: assignment.ai_processing_status,
            questions_count: assignment.extracted_questions.len(),
            has_questions: assignment.has_questions,
            processing_error: assignment.ai_processing_error.clone(),
            message,
            last_updated: assignment.updated_at,
        }
    }
}

/// 一次抽取尝试的结果（失败以错误返回）
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionOutcome {
    Completed { questions: usize, max_points: f64 },
    NoQuestionsFound,
    /// 已被更新的尝试取代，结果被丢弃
    Superseded,
}

/// 题目抽取状态机
#[derive(Clone)]
pub struct ExtractionStatusMachine {
    repository: Arc<dyn Repository>,
    processor: Arc<FastDocumentProcessor>,
    strategy: ExtractionStrategy,
    clock: Arc<dyn Clock>,
    tasks: BackgroundTasks,
    default_points: f64,
    stale_after: TimeDelta,
}

impl ExtractionStatusMachine {
    pub fn new(
        repository: Arc<dyn Repository>,
        processor: Arc<FastDocumentProcessor>,
        strategy: ExtractionStrategy,
        clock: Arc<dyn Clock>,
        tasks: BackgroundTasks,
        default_points: f64,
        stale_after_secs: i64,
    ) -> Self {
        Self {
            repository,
            processor,
            strategy,
            clock,
            tasks,
            default_points,
            stale_after: TimeDelta::seconds(stale_after_secs),
        }
    }

    /// 上传作业文档并在后台抽取题目
    ///
    /// 格式/解析/上传错误直接返回给调用方；成功时立即返回 `pending` 状态。
    /// 文档校验不通过时记录 `failed`，不调度抽取。
    pub async fn upload_document(
        &self,
        assignment_id: &str,
        requested_by: &str,
        doc: &Document,
    ) -> AppResult<ExtractionStatus> {
        let assignment = self.load(assignment_id).await?;
        ensure_instructor(&assignment, requested_by)?;

        let processed = self.processor.process_document(doc, DOCUMENT_FOLDER).await?;
        let now = self.clock.now();
        let stored = AssignmentDocument {
            filename: processed
                .public_id
                .rsplit('/')
                .next()
                .unwrap_or(&processed.public_id)
                .to_string(),
            original_name: doc.filename.clone(),
            file_url: processed.document_url.clone(),
            public_id: processed.public_id.clone(),
            mime_type: doc.mime_type.clone(),
            file_size: processed.file_size,
            uploaded_at: now,
        };
        let validation_error = (!processed.is_valid)
            .then(|| format!("文档校验失败: {}", processed.errors.join("; ")));
        let text = processed.document_text;

        let updated = self
            .repository
            .update_assignment(
                assignment_id,
                Box::new(move |a| {
                    a.assignment_document = Some(stored);
                    a.extraction_attempt += 1;
                    a.last_question_extraction_attempt = Some(now);
                    a.updated_at = now;
                    match validation_error {
                        None => {
                            a.document_text = Some(text);
                            a.ai_processing_status = AiProcessingStatus::Pending;
                            a.ai_processing_error = None;
                        }
                        Some(err) => {
                            a.document_text = None;
                            a.ai_processing_status = AiProcessingStatus::Failed;
                            a.ai_processing_error = Some(err);
                            a.extracted_questions.clear();
                            a.has_questions = false;
                        }
                    }
                    Ok(())
                }),
            )
            .await?;

        let ctx = AssignmentCtx::new(assignment_id, updated.extraction_attempt);
        if updated.ai_processing_status == AiProcessingStatus::Pending {
            info!("{} 📄 文档已上传: {}，开始后台抽取", ctx, doc.filename);
            self.schedule(assignment_id, updated.extraction_attempt, IdPrefix::Extracted);
        } else {
            warn!(
                "{} ⚠️ 文档校验未通过: {}",
                ctx,
                updated.ai_processing_error.as_deref().unwrap_or_default()
            );
        }
        Ok(ExtractionStatus::from_assignment(&updated))
    }

    /// 重新抽取（重新生成）题目，结果整体替换已有题目
    pub async fn request_retry(
        &self,
        assignment_id: &str,
        requested_by: &str,
    ) -> AppResult<ExtractionStatus> {
        let updated = self
            .mark_pending(assignment_id, Some(requested_by.to_string()))
            .await?;
        info!(
            "{} 🔄 已接受重新抽取请求",
            AssignmentCtx::new(assignment_id, updated.extraction_attempt)
        );
        self.schedule(assignment_id, updated.extraction_attempt, IdPrefix::Retry);
        Ok(ExtractionStatus::from_assignment(&updated))
    }

    /// 同步抽取：等待结果，写入终态后把错误返回给调用方
    pub async fn extract_now(
        &self,
        assignment_id: &str,
        requested_by: &str,
    ) -> AppResult<ExtractionOutcome> {
        let updated = self
            .mark_pending(assignment_id, Some(requested_by.to_string()))
            .await?;
        self.run_attempt(assignment_id, updated.extraction_attempt, IdPrefix::ManualDebug)
            .await
    }

    /// 查询抽取状态
    pub async fn status(&self, assignment_id: &str) -> AppResult<ExtractionStatus> {
        let assignment = self.load(assignment_id).await?;
        Ok(ExtractionStatus::from_assignment(&assignment))
    }

    /// 找出长时间停留在 `pending` 的作业并重新调度，返回重新调度的数量
    pub async fn reconcile_stale_pending(&self) -> AppResult<usize> {
        let now = self.clock.now();
        let stale: Vec<String> = self
            .repository
            .list_assignments()
            .await?
            .into_iter()
            .filter(|a| a.ai_processing_status == AiProcessingStatus::Pending)
            .filter(|a| {
                a.last_question_extraction_attempt
                    .map_or(true, |t| now - t > self.stale_after)
            })
            .map(|a| a.id)
            .collect();

        let mut rescheduled = 0;
        for id in stale {
            match self.mark_pending(&id, None).await {
                Ok(updated) => {
                    warn!(
                        "{} ⏰ 抽取长时间未完成，重新调度",
                        AssignmentCtx::new(&id, updated.extraction_attempt)
                    );
                    self.schedule(&id, updated.extraction_attempt, IdPrefix::Retry);
                    rescheduled += 1;
                }
                Err(e) => error!("[作业 ID#{}] 无法重新调度抽取: {}", id, e),
            }
        }
        Ok(rescheduled)
    }

    async fn load(&self, assignment_id: &str) -> AppResult<Assignment> {
        self.repository
            .find_assignment(assignment_id)
            .await?
            .ok_or_else(|| AppError::not_found("作业", assignment_id))
    }

    /// 写入 `pending` 并占有新的尝试编号
    async fn mark_pending(
        &self,
        assignment_id: &str,
        requested_by: Option<String>,
    ) -> AppResult<Assignment> {
        let now = self.clock.now();
        self.repository
            .update_assignment(
                assignment_id,
                Box::new(move |a| {
                    if let Some(who) = &requested_by {
                        ensure_instructor(a, who)?;
                    }
                    a.extraction_attempt += 1;
                    a.ai_processing_status = AiProcessingStatus::Pending;
                    a.ai_processing_error = None;
                    a.last_question_extraction_attempt = Some(now);
                    a.updated_at = now;
                    Ok(())
                }),
            )
            .await
    }

    fn schedule(&self, assignment_id: &str, attempt: u64, prefix: IdPrefix) {
        let machine = self.clone();
        let id = assignment_id.to_string();
        self.tasks
            .spawn(format!("extract-{}-{}", id, attempt), async move {
                // 终态已在 run_attempt 内写入，这里只记录日志
                if let Err(e) = machine.run_attempt(&id, attempt, prefix).await {
                    warn!("{} 后台抽取结束: {}", AssignmentCtx::new(&id, attempt), e);
                }
            });
    }

    /// 执行一次抽取尝试并写入终态
    async fn run_attempt(
        &self,
        assignment_id: &str,
        attempt: u64,
        prefix: IdPrefix,
    ) -> AppResult<ExtractionOutcome> {
        let ctx = AssignmentCtx::new(assignment_id, attempt);
        info!("{} 🚀 开始抽取题目", ctx);

        let (status, questions, failure) = match self.extract(assignment_id, prefix, &ctx).await {
            Ok(questions) if questions.is_empty() => {
                (AiProcessingStatus::NoQuestionsFound, questions, None)
            }
            Ok(questions) => (AiProcessingStatus::Completed, questions, None),
            Err(e) => (AiProcessingStatus::Failed, Vec::new(), Some(e)),
        };
        let error_message = failure.as_ref().map(|e| e.to_string());
        let count = questions.len();
        let now = self.clock.now();
        let default_points = self.default_points;

        let written = self
            .repository
            .update_assignment(
                assignment_id,
                Box::new(move |a| {
                    if a.extraction_attempt == attempt {
                        apply_terminal(a, status, questions, error_message, now, default_points);
                    }
                    Ok(())
                }),
            )
            .await;

        let updated = match written {
            Ok(updated) => updated,
            Err(e) => {
                error!("{} ❌ 无法写入抽取终态: {}", ctx, e);
                return Err(failure.unwrap_or(e));
            }
        };
        if updated.extraction_attempt != attempt {
            info!(
                "{} 已被尝试#{} 取代，丢弃本次结果",
                ctx, updated.extraction_attempt
            );
            return Ok(ExtractionOutcome::Superseded);
        }

        match failure {
            Some(e) => {
                error!("{} ❌ 抽取失败: {}", ctx, e);
                Err(e)
            }
            None if status == AiProcessingStatus::Completed => {
                info!(
                    "{} ✓ 抽取完成: {} 道题目，总分 {}",
                    ctx, count, updated.max_points
                );
                Ok(ExtractionOutcome::Completed {
                    questions: count,
                    max_points: updated.max_points,
                })
            }
            None => {
                info!("{} 📭 文档中没有找到题目", ctx);
                Ok(ExtractionOutcome::NoQuestionsFound)
            }
        }
    }

    async fn extract(
        &self,
        assignment_id: &str,
        prefix: IdPrefix,
        ctx: &AssignmentCtx,
    ) -> AppResult<Vec<ExtractedQuestion>> {
        let assignment = self.load(assignment_id).await?;
        let text = match assignment
            .document_text
            .as_deref()
            .filter(|t| !t.trim().is_empty())
        {
            Some(text) => text.to_string(),
            None => self.reload_text(&assignment, ctx).await?,
        };

        let questions = match &self.strategy {
            ExtractionStrategy::Ai(extractor) => {
                extractor
                    .extract_questions_from_document(&text, assignment.assessment_type, prefix)
                    .await?
            }
            ExtractionStrategy::Heuristic => {
                extract_structured_questions_at(&text, self.clock.now().timestamp_millis())
            }
        };
        Ok(organize(questions))
    }

    /// 文档文本已被清空时，重新下载并解析已存储的文档
    async fn reload_text(&self, assignment: &Assignment, ctx: &AssignmentCtx) -> AppResult<String> {
        let Some(doc) = &assignment.assignment_document else {
            return Err(DocumentError::MissingText {
                reason: "作业没有文档文本，也没有已存储的文档".to_string(),
            }
            .into());
        };
        info!("{} 🔄 文档文本已清空，重新解析: {}", ctx, doc.original_name);

        let text = self
            .processor
            .reparse_stored(&doc.file_url, &doc.mime_type, &doc.original_name)
            .await
            .map_err(|e| DocumentError::MissingText {
                reason: format!("重新解析已存储的文档失败: {}", e),
            })?;
        if text.trim().is_empty() {
            return Err(DocumentError::MissingText {
                reason: "已存储的文档没有可抽取的文本".to_string(),
            }
            .into());
        }
        Ok(text)
    }
}

fn ensure_instructor(assignment: &Assignment, requested_by: &str) -> AppResult<()> {
    if assignment.instructor_id != requested_by {
        return Err(AppError::forbidden(format!(
            "{} 不是作业 {} 的教师",
            requested_by, assignment.id
        )));
    }
    Ok(())
}

fn apply_terminal(
    a: &mut Assignment,
    status: AiProcessingStatus,
    questions: Vec<ExtractedQuestion>,
    error_message: Option<String>,
    now: DateTime<Utc>,
    default_points: f64,
) {
    a.ai_processing_status = status;
    a.document_text = None;
    a.has_questions = !questions.is_empty();
    a.extracted_questions = questions;
    a.ai_processing_error = error_message;
    a.updated_at = now;
    if status == AiProcessingStatus::Completed {
        a.max_points = a.actual_max_points(default_points);
    }
}
