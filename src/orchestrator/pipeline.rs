//! 流水线装配 - 编排层
//!
//! 持有所有基础设施，按配置组装 services 和 workflow。
//! 只负责组装，不包含业务判断。

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{Config, ExtractionMode};
use crate::error::{AppError, AppResult};
use crate::infrastructure::{
    BackgroundTasks, BlobStore, Clock, InMemoryRepository, LocalBlobStore, OpenAiTextModel,
    Repository, SystemClock, TextModel,
};
use crate::models::{AssessmentType, Assignment, AssignmentStatus, SubmissionType};
use crate::services::{AiGrader, FastDocumentProcessor, QuestionExtractor};
use crate::workflow::{
    ExtractionStatusMachine, ExtractionStrategy, GradingEngine, GradingStrategy,
    SubmissionLifecycle,
};

/// 文档处理与评分流水线
pub struct Pipeline {
    config: Config,
    repository: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    tasks: BackgroundTasks,
    processor: Arc<FastDocumentProcessor>,
    extraction: ExtractionStatusMachine,
    grading: GradingEngine,
    submissions: SubmissionLifecycle,
}

impl Pipeline {
    /// 使用给定的基础设施组装流水线
    ///
    /// 没有文本模型时抽取走启发式路径，评分只做客观题
    pub fn new(
        config: Config,
        model: Option<Arc<dyn TextModel>>,
        blob_store: Arc<dyn BlobStore>,
        repository: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let tasks = BackgroundTasks::new(config.max_background_tasks);
        let processor = Arc::new(FastDocumentProcessor::new(&config, blob_store, clock.clone()));

        let model = match (config.extraction_mode, model) {
            (ExtractionMode::Ai, Some(model)) => Some(model),
            (ExtractionMode::Ai, None) => {
                warn!("⚠️ 未提供文本模型，改用启发式抽取");
                None
            }
            (ExtractionMode::Heuristic, _) => None,
        };

        let (extraction_strategy, grading_strategy) = match &model {
            Some(model) => (
                ExtractionStrategy::Ai(Arc::new(QuestionExtractor::new(
                    model.clone(),
                    clock.clone(),
                    config.ai_max_text_length,
                    config.default_question_points,
                ))),
                GradingStrategy::Ai(Arc::new(AiGrader::new(
                    model.clone(),
                    config.default_grade_confidence,
                ))),
            ),
            None => (ExtractionStrategy::Heuristic, GradingStrategy::Objective),
        };

        let extraction = ExtractionStatusMachine::new(
            repository.clone(),
            processor.clone(),
            extraction_strategy,
            clock.clone(),
            tasks.clone(),
            config.default_question_points,
            config.stale_pending_after_secs,
        );
        let grading = GradingEngine::new(repository.clone(), clock.clone(), grading_strategy);
        let submissions = SubmissionLifecycle::new(
            repository.clone(),
            clock.clone(),
            tasks.clone(),
            grading.clone(),
            config.auto_submit_grace_secs,
        );

        Self {
            config,
            repository,
            clock,
            tasks,
            processor,
            extraction,
            grading,
            submissions,
        }
    }

    /// 按配置组装：OpenAI 兼容模型、本地文件存储、进程内存储、系统时钟
    pub fn from_config(config: Config) -> Self {
        let model: Option<Arc<dyn TextModel>> = match config.extraction_mode {
            ExtractionMode::Ai => Some(Arc::new(OpenAiTextModel::new(&config))),
            ExtractionMode::Heuristic => None,
        };
        let blob_store = Arc::new(LocalBlobStore::new(&config.storage_root));
        Self::new(
            config,
            model,
            blob_store,
            Arc::new(InMemoryRepository::new()),
            Arc::new(SystemClock),
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn processor(&self) -> &FastDocumentProcessor {
        &self.processor
    }

    pub fn extraction(&self) -> &ExtractionStatusMachine {
        &self.extraction
    }

    pub fn grading(&self) -> &GradingEngine {
        &self.grading
    }

    pub fn submissions(&self) -> &SubmissionLifecycle {
        &self.submissions
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    /// 创建草稿状态的作业
    pub async fn create_assignment(
        &self,
        title: &str,
        instructor_id: &str,
        assessment_type: AssessmentType,
        submission_type: SubmissionType,
    ) -> AppResult<Assignment> {
        let assignment = Assignment::new(
            title,
            instructor_id,
            assessment_type,
            submission_type,
            self.clock.now(),
        );
        self.repository.insert_assignment(assignment.clone()).await?;
        info!("[作业 ID#{}] 已创建: {}", assignment.id, title);
        Ok(assignment)
    }

    /// 修改作业发布状态（只有作业的教师可以操作）
    pub async fn set_assignment_status(
        &self,
        assignment_id: &str,
        teacher_id: &str,
        status: AssignmentStatus,
    ) -> AppResult<Assignment> {
        let now = self.clock.now();
        let teacher = teacher_id.to_string();
        self.repository
            .update_assignment(
                assignment_id,
                Box::new(move |a| {
                    if a.instructor_id != teacher {
                        return Err(AppError::forbidden(format!(
                            "{} 不是作业 {} 的教师",
                            teacher, a.id
                        )));
                    }
                    a.status = status;
                    a.updated_at = now;
                    Ok(())
                }),
            )
            .await
    }

    /// 等待所有后台任务结束
    pub async fn wait_idle(&self) {
        self.tasks.wait_idle().await;
    }
}
