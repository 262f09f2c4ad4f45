//! 提交生命周期 - 流程层
//!
//! ```text
//! draft ⇄ draft（自动保存） → submitted → graded
//! ```
//!
//! 每次保存/提交都按 (作业, 学生) 查找或创建提交记录。
//! 正式提交成功后在后台触发评分，评分失败不影响提交本身。

use chrono::TimeDelta;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult, SubmissionError};
use crate::infrastructure::{BackgroundTasks, Clock, Repository};
use crate::models::{
    Answer, Assignment, AssignmentStatus, FileRef, SectionAnswer, Submission, SubmissionStatus,
    SubmissionType,
};
use crate::workflow::ctx::SubmissionCtx;
use crate::workflow::grading_flow::GradingEngine;

/// 保存/提交方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// 草稿保存，可无限重复
    Draft,
    /// 学生正式提交
    Final,
    /// 到时自动提交：跳过重复提交和内容校验
    AutoSubmit,
    /// 对账修复：跳过重复提交校验
    Reconcile,
}

impl SubmitMode {
    fn is_final(self) -> bool {
        self != SubmitMode::Draft
    }
}

/// 作答内容
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmissionPayload {
    pub submission_text: Option<String>,
    pub attachments: Vec<FileRef>,
    pub sections: Vec<SectionAnswer>,
    pub extracted_answers: Vec<Answer>,
}

impl SubmissionPayload {
    fn has_text_content(&self) -> bool {
        self.submission_text
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
            || self.sections.iter().any(|s| !s.content.trim().is_empty())
            || self.extracted_answers.iter().any(|a| !a.answer.trim().is_empty())
    }
}

/// 校验正式提交的内容是否满足作业的提交形式
fn validate_content(assignment: &Assignment, payload: &SubmissionPayload) -> AppResult<()> {
    let has_text = payload.has_text_content();
    let has_files = !payload.attachments.is_empty();
    match assignment.submission_type {
        SubmissionType::Text if !has_text => Err(AppError::incomplete(
            "文本作答需要填写作答内容，或至少一个分节的内容",
        )),
        SubmissionType::File if !has_files => Err(AppError::incomplete("文件作答至少需要一个附件")),
        SubmissionType::Both if !has_text && !has_files => {
            Err(AppError::incomplete("需要填写作答内容或上传附件"))
        }
        _ => Ok(()),
    }
}

fn ensure_open(assignment: &Assignment, mode: SubmitMode) -> AppResult<()> {
    match assignment.status {
        AssignmentStatus::Published => Ok(()),
        AssignmentStatus::Closed if matches!(mode, SubmitMode::AutoSubmit | SubmitMode::Reconcile) => {
            Ok(())
        }
        status => Err(SubmissionError::NotOpen {
            assignment_id: assignment.id.clone(),
            status: status.as_str().to_string(),
        }
        .into()),
    }
}

/// 已提交的记录只允许自动提交（未评分时）和对账路径覆盖
fn guard_existing(submission: &Submission, mode: SubmitMode) -> AppResult<()> {
    let blocked = match mode {
        SubmitMode::Draft | SubmitMode::Final => submission.status != SubmissionStatus::Draft,
        SubmitMode::AutoSubmit => submission.status == SubmissionStatus::Graded,
        SubmitMode::Reconcile => false,
    };
    if blocked {
        return Err(SubmissionError::Duplicate {
            assignment_id: submission.assignment_id.clone(),
            student_id: submission.student_id.clone(),
        }
        .into());
    }
    Ok(())
}

/// 提交生命周期
#[derive(Clone)]
pub struct SubmissionLifecycle {
    repository: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    tasks: BackgroundTasks,
    grading: GradingEngine,
    auto_submit_grace: TimeDelta,
}

impl SubmissionLifecycle {
    pub fn new(
        repository: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
        tasks: BackgroundTasks,
        grading: GradingEngine,
        auto_submit_grace_secs: i64,
    ) -> Self {
        Self {
            repository,
            clock,
            tasks,
            grading,
            auto_submit_grace: TimeDelta::seconds(auto_submit_grace_secs),
        }
    }

    async fn load_assignment(&self, assignment_id: &str) -> AppResult<Assignment> {
        self.repository
            .find_assignment(assignment_id)
            .await?
            .ok_or_else(|| AppError::not_found("作业", assignment_id))
    }

    /// 保存草稿或提交作答
    pub async fn submit(
        &self,
        assignment_id: &str,
        student_id: &str,
        payload: SubmissionPayload,
        mode: SubmitMode,
    ) -> AppResult<Submission> {
        let ctx = SubmissionCtx::new(assignment_id, student_id);
        let assignment = self.load_assignment(assignment_id).await?;
        ensure_open(&assignment, mode)?;
        if matches!(mode, SubmitMode::Final | SubmitMode::Reconcile) {
            validate_content(&assignment, &payload)?;
        }

        let now = self.clock.now();
        let deadline = assignment.due_date.map(|due| match mode {
            SubmitMode::AutoSubmit => due + self.auto_submit_grace,
            _ => due,
        });

        let submission = self
            .repository
            .upsert_submission(
                assignment_id,
                student_id,
                Box::new(move |s| {
                    guard_existing(s, mode)?;
                    if s.version == 0 {
                        s.created_at = now;
                    }
                    s.submission_text = payload.submission_text;
                    s.attachments = payload.attachments;
                    s.sections = payload.sections;
                    s.extracted_answers = payload.extracted_answers;
                    s.version += 1;
                    s.updated_at = now;

                    if !mode.is_final() {
                        s.auto_saved_at = Some(now);
                        return Ok(());
                    }
                    s.status = SubmissionStatus::Submitted;
                    s.submitted_at = Some(now);
                    s.is_late = deadline.is_some_and(|d| now > d);
                    s.auto_submitted = mode == SubmitMode::AutoSubmit;
                    s.grading_error = None;
                    Ok(())
                }),
            )
            .await?;

        if !mode.is_final() {
            info!("{} 💾 草稿已保存 (版本 {})", ctx, submission.version);
            return Ok(submission);
        }

        info!(
            "{} 📨 已提交{}{}",
            ctx,
            if submission.auto_submitted { "（自动提交）" } else { "" },
            if submission.is_late { "，已逾期" } else { "" }
        );
        self.schedule_grading(&submission.id, ctx);
        Ok(submission)
    }

    /// 自动保存针对抽取题目的作答进度
    pub async fn save_progress(
        &self,
        assignment_id: &str,
        student_id: &str,
        answers: Vec<Answer>,
    ) -> AppResult<Submission> {
        let assignment = self.load_assignment(assignment_id).await?;
        ensure_open(&assignment, SubmitMode::Draft)?;

        let now = self.clock.now();
        let submission = self
            .repository
            .upsert_submission(
                assignment_id,
                student_id,
                Box::new(move |s| {
                    guard_existing(s, SubmitMode::Draft)?;
                    if s.version == 0 {
                        s.created_at = now;
                    }
                    s.extracted_answers = answers;
                    s.version += 1;
                    s.auto_saved_at = Some(now);
                    s.updated_at = now;
                    Ok(())
                }),
            )
            .await?;
        info!(
            "{} 💾 作答进度已保存: {} 题",
            SubmissionCtx::new(assignment_id, student_id),
            submission.extracted_answers.len()
        );
        Ok(submission)
    }

    /// 教师把已提交/已评分的作答退回为草稿，学生可以重新提交
    ///
    /// 分数与 AI 评分记录保留；退回草稿的记录再次调用时不做修改
    pub async fn reopen(&self, submission_id: &str, teacher_id: &str) -> AppResult<Submission> {
        let now = self.clock.now();
        let teacher = teacher_id.to_string();
        let (submission, _) = self
            .repository
            .update_submission_and_assignment(
                submission_id,
                Box::new(move |s, a| {
                    if a.instructor_id != teacher {
                        return Err(AppError::forbidden(format!(
                            "{} 不是作业 {} 的教师",
                            teacher, a.id
                        )));
                    }
                    if s.status == SubmissionStatus::Draft {
                        return Ok(());
                    }
                    s.status = SubmissionStatus::Draft;
                    s.submitted_at = None;
                    s.is_late = false;
                    s.auto_submitted = false;
                    s.version += 1;
                    s.updated_at = now;
                    Ok(())
                }),
            )
            .await?;
        info!(
            "{} ↩️ 提交已退回为草稿",
            SubmissionCtx::new(&submission.assignment_id, &submission.student_id)
        );
        Ok(submission)
    }

    /// 后台评分，失败只记录原因
    fn schedule_grading(&self, submission_id: &str, ctx: SubmissionCtx) {
        let engine = self.grading.clone();
        let id = submission_id.to_string();
        self.tasks.spawn(format!("grade-{}", id), async move {
            if let Err(e) = engine.grade_submission(&id).await {
                warn!("{} ⚠️ 自动评分失败，提交保持已提交状态: {}", ctx, e);
                if let Err(record_err) = engine.record_failure(&id, e.to_string()).await {
                    error!("{} 无法记录评分失败原因: {}", ctx, record_err);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{InMemoryRepository, ManualClock, ScriptedTextModel};
    use crate::models::AssessmentType;
    use crate::services::AiGrader;
    use crate::workflow::grading_flow::GradingStrategy;
    use chrono::Utc;
    use std::time::Duration;

    struct Harness {
        repo: Arc<InMemoryRepository>,
        clock: Arc<ManualClock>,
        tasks: BackgroundTasks,
        model: Arc<ScriptedTextModel>,
        lifecycle: SubmissionLifecycle,
    }

    fn harness() -> Harness {
        let repo = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tasks = BackgroundTasks::new(4);
        let model = Arc::new(ScriptedTextModel::new());
        let grading = GradingEngine::new(
            repo.clone(),
            clock.clone(),
            GradingStrategy::Ai(Arc::new(AiGrader::new(model.clone(), 0.8))),
        );
        let lifecycle =
            SubmissionLifecycle::new(repo.clone(), clock.clone(), tasks.clone(), grading, 300);
        Harness {
            repo,
            clock,
            tasks,
            model,
            lifecycle,
        }
    }

    async fn published(h: &Harness, submission_type: SubmissionType, due_in_secs: Option<i64>) -> String {
        let mut assignment = Assignment::new(
            "Essay",
            "teacher-1",
            AssessmentType::Assignment,
            submission_type,
            h.clock.now(),
        );
        assignment.status = AssignmentStatus::Published;
        assignment.due_date = due_in_secs.map(|s| h.clock.now() + TimeDelta::seconds(s));
        let id = assignment.id.clone();
        h.repo.insert_assignment(assignment).await.unwrap();
        id
    }

    fn text(content: &str) -> SubmissionPayload {
        SubmissionPayload {
            submission_text: Some(content.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_draft_saves_repeat_without_submitting() {
        let h = harness();
        let id = published(&h, SubmissionType::Text, Some(-60)).await;
        h.lifecycle.submit(&id, "s1", text("v1"), SubmitMode::Draft).await.unwrap();
        let draft = h.lifecycle.submit(&id, "s1", text("v2"), SubmitMode::Draft).await.unwrap();

        assert_eq!(draft.version, 2);
        assert_eq!(draft.status, SubmissionStatus::Draft);
        assert!(draft.submitted_at.is_none());
        assert!(!draft.is_late);
        assert_eq!(h.repo.count_submissions(&id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_guard_and_auto_submit_override() {
        let h = harness();
        h.model.push_failure("busy").push_failure("busy").push_failure("busy");
        let id = published(&h, SubmissionType::Text, None).await;

        h.lifecycle.submit(&id, "s1", text("final"), SubmitMode::Final).await.unwrap();
        let err = h
            .lifecycle
            .submit(&id, "s1", text("again"), SubmitMode::Final)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Submission(SubmissionError::Duplicate { .. })));
        assert!(err.is_user_error());

        let auto = h
            .lifecycle
            .submit(&id, "s1", SubmissionPayload::default(), SubmitMode::AutoSubmit)
            .await
            .unwrap();
        assert!(auto.auto_submitted);
        assert_eq!(auto.status, SubmissionStatus::Submitted);
        assert!(auto.submission_text.is_none());
        h.tasks.wait_idle().await;
    }

    #[tokio::test]
    async fn test_content_validation() {
        let h = harness();
        let text_id = published(&h, SubmissionType::Text, None).await;
        let file_id = published(&h, SubmissionType::File, None).await;

        let err = h
            .lifecycle
            .submit(&text_id, "s1", text("   "), SubmitMode::Final)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Submission(SubmissionError::Incomplete { .. })));

        let sections = SubmissionPayload {
            sections: vec![SectionAnswer {
                section_id: "a".to_string(),
                content: "answer".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        h.model.push_response(r#"{"score": 50, "feedback": "ok"}"#);
        assert!(h.lifecycle.submit(&text_id, "s1", sections, SubmitMode::Final).await.is_ok());

        let err = h
            .lifecycle
            .submit(&file_id, "s1", text("no files"), SubmitMode::Final)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Submission(SubmissionError::Incomplete { .. })));
        h.tasks.wait_idle().await;
    }

    #[tokio::test]
    async fn test_lateness_uses_grace_for_auto_submit() {
        let h = harness();
        h.model
            .push_response(r#"{"score": 1}"#)
            .push_response(r#"{"score": 1}"#)
            .push_response(r#"{"score": 1}"#);
        let id = published(&h, SubmissionType::Text, Some(-120)).await;

        let manual = h.lifecycle.submit(&id, "s1", text("x"), SubmitMode::Final).await.unwrap();
        assert!(manual.is_late);

        let auto = h
            .lifecycle
            .submit(&id, "s2", text("x"), SubmitMode::AutoSubmit)
            .await
            .unwrap();
        assert!(!auto.is_late);

        h.clock.advance(Duration::from_secs(240));
        let auto_late = h
            .lifecycle
            .submit(&id, "s3", text("x"), SubmitMode::AutoSubmit)
            .await
            .unwrap();
        assert!(auto_late.is_late);
        h.tasks.wait_idle().await;
    }

    #[tokio::test]
    async fn test_grading_failure_keeps_submission() {
        let h = harness();
        h.model.push_failure("model down");
        let id = published(&h, SubmissionType::Text, None).await;

        let submitted = h.lifecycle.submit(&id, "s1", text("essay"), SubmitMode::Final).await.unwrap();
        h.tasks.wait_idle().await;

        let stored = h.repo.find_submission_by_id(&submitted.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubmissionStatus::Submitted);
        assert!(stored.grade.is_none());
        assert!(stored.grading_error.unwrap().contains("model down"));
    }

    #[tokio::test]
    async fn test_successful_submit_is_graded_in_background() {
        let h = harness();
        h.model.push_response(r#"{"score": 64, "feedback": "Good", "confidence": 0.7}"#);
        let id = published(&h, SubmissionType::Text, None).await;

        let submitted = h.lifecycle.submit(&id, "s1", text("essay"), SubmitMode::Final).await.unwrap();
        h.tasks.wait_idle().await;

        let stored = h.repo.find_submission_by_id(&submitted.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubmissionStatus::Graded);
        assert_eq!(stored.grade, Some(64.0));
        let assignment = h.repo.find_assignment(&id).await.unwrap().unwrap();
        assert_eq!(assignment.stats.passed_submissions, 1);
    }

    #[tokio::test]
    async fn test_unpublished_assignment_rejects_students() {
        let h = harness();
        let id = published(&h, SubmissionType::Text, None).await;
        h.repo
            .update_assignment(
                &id,
                Box::new(|a| {
                    a.status = AssignmentStatus::Closed;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let err = h
            .lifecycle
            .submit(&id, "s1", text("late"), SubmitMode::Final)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Submission(SubmissionError::NotOpen { .. })));
        h.model.push_failure("skip grading");
        assert!(h
            .lifecycle
            .submit(&id, "s1", text("auto"), SubmitMode::AutoSubmit)
            .await
            .is_ok());
        h.tasks.wait_idle().await;
    }

    #[tokio::test]
    async fn test_save_progress_and_reopen() {
        let h = harness();
        h.model.push_failure("later");
        let id = published(&h, SubmissionType::Text, None).await;
        let answers = vec![Answer {
            question_index: 0,
            question_id: None,
            answer: "B".to_string(),
        }];

        let progress = h.lifecycle.save_progress(&id, "s1", answers.clone()).await.unwrap();
        assert_eq!(progress.extracted_answers, answers);
        assert!(progress.auto_saved_at.is_some());

        let submitted = h
            .lifecycle
            .submit(
                &id,
                "s1",
                SubmissionPayload {
                    extracted_answers: answers.clone(),
                    ..Default::default()
                },
                SubmitMode::Final,
            )
            .await
            .unwrap();
        h.tasks.wait_idle().await;
        assert!(h.lifecycle.save_progress(&id, "s1", vec![]).await.is_err());

        let err = h.lifecycle.reopen(&submitted.id, "teacher-9").await.unwrap_err();
        assert!(matches!(err, AppError::Store(crate::error::StoreError::Forbidden { .. })));
        let reopened = h.lifecycle.reopen(&submitted.id, "teacher-1").await.unwrap();
        assert_eq!(reopened.status, SubmissionStatus::Draft);
        assert!(reopened.submitted_at.is_none());
        assert!(h.lifecycle.save_progress(&id, "s1", answers).await.is_ok());
    }
}
