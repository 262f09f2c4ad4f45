//! 评分流程 - 流程层
//!
//! 核心职责：把评分结果合并进提交记录，并维护作业统计
//!
//! - `ai_grade` 是独立的审计记录，教师评分不会覆盖它
//! - `grade` / `feedback` / `status` 是权威字段，教师可以覆盖
//! - 统计在提交与作业的同一次原子更新中完成，每份提交只计入一次

use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{AiError, AppError, AppResult, SubmissionError};
use crate::infrastructure::{Clock, Repository};
use crate::models::{AiGrade, Assignment, Submission, SubmissionStatus};
use crate::services::{grade_objective, AiGrader, GradeOutcome};

/// AI 评分写入 `graded_by` 的标识
pub const AI_GRADER_ID: &str = "ai";

/// 分节评分
#[derive(Debug, Clone, PartialEq)]
pub struct SectionScore {
    pub section_id: String,
    pub score: f64,
    pub feedback: Option<String>,
}

/// 教师评分
///
/// `grade` 与 `percentage` 二选一，同时提供时以 `grade` 为准
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManualGrade {
    pub grade: Option<f64>,
    pub percentage: Option<f64>,
    pub feedback: Option<String>,
    pub section_scores: Vec<SectionScore>,
}

/// 自动评分方式
#[derive(Clone)]
pub enum GradingStrategy {
    Ai(Arc<AiGrader>),
    /// 只做客观题离线评分
    Objective,
}

fn invalid_grade(reason: impl Into<String>) -> AppError {
    SubmissionError::InvalidGrade {
        reason: reason.into(),
    }
    .into()
}

/// 首次进入已评分状态时计入统计
fn record_stats(submission: &mut Submission, assignment: &mut Assignment) {
    if submission.counted_in_stats {
        return;
    }
    let Some(score) = submission.grade else {
        return;
    };
    assignment
        .stats
        .record(score, assignment.max_points, assignment.passing_score);
    submission.counted_in_stats = true;
}

/// 评分引擎
#[derive(Clone)]
pub struct GradingEngine {
    repository: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    strategy: GradingStrategy,
}

impl GradingEngine {
    pub fn new(repository: Arc<dyn Repository>, clock: Arc<dyn Clock>, strategy: GradingStrategy) -> Self {
        Self {
            repository,
            clock,
            strategy,
        }
    }

    /// 自动评分一份已提交的作答
    pub async fn grade_submission(&self, submission_id: &str) -> AppResult<Submission> {
        let submission = self
            .repository
            .find_submission_by_id(submission_id)
            .await?
            .ok_or_else(|| AppError::not_found("提交", submission_id))?;
        if submission.status == SubmissionStatus::Draft {
            return Err(invalid_grade("草稿不能评分"));
        }
        let assignment = self
            .repository
            .find_assignment(&submission.assignment_id)
            .await?
            .ok_or_else(|| AppError::not_found("作业", submission.assignment_id.clone()))?;

        let outcome = self.compute(&assignment, &submission).await?;
        if !outcome.needs_review.is_empty() {
            info!(
                "提交 {} 有 {} 道题需要教师复核",
                submission_id,
                outcome.needs_review.len()
            );
        }
        self.apply_ai_grade(submission_id, outcome).await
    }

    async fn compute(&self, assignment: &Assignment, submission: &Submission) -> AppResult<GradeOutcome> {
        let answers_questions =
            !submission.extracted_answers.is_empty() && !assignment.extracted_questions.is_empty();
        match (&self.strategy, answers_questions) {
            (GradingStrategy::Ai(grader), true) => {
                grader
                    .grade_assignment_submission(
                        &assignment.extracted_questions,
                        &submission.extracted_answers,
                    )
                    .await
            }
            (GradingStrategy::Objective, true) => Ok(grade_objective(
                &assignment.extracted_questions,
                &submission.extracted_answers,
            )),
            (GradingStrategy::Ai(grader), false) => {
                grader.grade_text_submission(assignment, submission).await
            }
            (GradingStrategy::Objective, false) => Err(AiError::GradingFailed {
                message: "没有可用的评分模型，文本作答需要教师评分".to_string(),
            }
            .into()),
        }
    }

    /// 写入自动评分结果
    ///
    /// 教师已经评过分时只更新 `ai_grade`，不覆盖权威分数
    pub async fn apply_ai_grade(&self, submission_id: &str, outcome: GradeOutcome) -> AppResult<Submission> {
        let now = self.clock.now();
        let (submission, assignment) = self
            .repository
            .update_submission_and_assignment(
                submission_id,
                Box::new(move |s, a| {
                    if s.status == SubmissionStatus::Draft {
                        return Err(invalid_grade("提交已被退回为草稿"));
                    }
                    s.ai_grade = Some(AiGrade {
                        score: outcome.score,
                        feedback: outcome.feedback.clone(),
                        confidence: outcome.confidence,
                        graded_at: now,
                        detailed_grading: outcome.detailed_grading,
                    });
                    s.grading_error = None;
                    s.updated_at = now;

                    let teacher_graded = s.status == SubmissionStatus::Graded
                        && s.graded_by.as_deref().is_some_and(|by| by != AI_GRADER_ID);
                    if !teacher_graded {
                        s.grade = Some(outcome.score);
                        s.feedback = Some(outcome.feedback);
                        s.status = SubmissionStatus::Graded;
                        s.graded_at = Some(now);
                        s.graded_by = Some(AI_GRADER_ID.to_string());
                    }
                    record_stats(s, a);
                    Ok(())
                }),
            )
            .await?;

        info!(
            "[作业 ID#{} 学生#{}] ✓ 自动评分完成: {:.1} (平均分 {:.1}，及格 {}/{})",
            submission.assignment_id,
            submission.student_id,
            submission.ai_grade.as_ref().map(|g| g.score).unwrap_or_default(),
            assignment.stats.average_score,
            assignment.stats.passed_submissions,
            assignment.stats.total_submissions
        );
        Ok(submission)
    }

    /// 教师评分
    ///
    /// 百分比按作业的 `max_points` 换算；分节分数写入对应分节
    pub async fn manual_grade(
        &self,
        submission_id: &str,
        teacher_id: &str,
        grade: ManualGrade,
    ) -> AppResult<Submission> {
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
                        return Err(invalid_grade("草稿不能评分"));
                    }

                    let value = match (grade.grade, grade.percentage) {
                        (Some(value), _) => value,
                        (None, Some(pct)) if (0.0..=100.0).contains(&pct) => pct / 100.0 * a.max_points,
                        (None, Some(pct)) => {
                            return Err(invalid_grade(format!("百分比 {} 超出 0-100 范围", pct)))
                        }
                        (None, None) => return Err(invalid_grade("需要提供分数或百分比")),
                    };
                    if !value.is_finite() || value < 0.0 || value > a.max_points {
                        return Err(invalid_grade(format!(
                            "分数 {} 超出 0-{} 范围",
                            value, a.max_points
                        )));
                    }

                    for entry in grade.section_scores {
                        let section = s
                            .sections
                            .iter_mut()
                            .find(|sec| sec.section_id == entry.section_id)
                            .ok_or_else(|| invalid_grade(format!("分节 {} 不存在", entry.section_id)))?;
                        section.score = Some(entry.score);
                        if entry.feedback.is_some() {
                            section.feedback = entry.feedback;
                        }
                    }

                    s.grade = Some(value);
                    if grade.feedback.is_some() {
                        s.feedback = grade.feedback;
                    }
                    s.status = SubmissionStatus::Graded;
                    s.graded_at = Some(now);
                    s.graded_by = Some(teacher);
                    s.updated_at = now;
                    record_stats(s, a);
                    Ok(())
                }),
            )
            .await?;

        info!(
            "[作业 ID#{} 学生#{}] ✓ 教师评分: {:.1}",
            submission.assignment_id,
            submission.student_id,
            submission.grade.unwrap_or_default()
        );
        Ok(submission)
    }

    /// 记录后台评分失败原因，提交保持已提交状态
    pub async fn record_failure(&self, submission_id: &str, message: String) -> AppResult<()> {
        warn!("提交 {} 自动评分失败: {}", submission_id, message);
        self.repository
            .update_submission(
                submission_id,
                Box::new(move |s| {
                    s.grading_error = Some(message);
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{InMemoryRepository, ManualClock, ScriptedTextModel};
    use crate::models::{
        Answer, AssessmentType, CorrectAnswer, ExtractedQuestion, QuestionType, SectionAnswer,
        SubmissionType,
    };
    use chrono::Utc;

    struct Harness {
        repo: Arc<InMemoryRepository>,
        engine: GradingEngine,
        assignment_id: String,
    }

    fn mc(points: f64, answer: &str) -> ExtractedQuestion {
        ExtractedQuestion {
            id: "q".to_string(),
            question: "Pick one".to_string(),
            question_type: QuestionType::MultipleChoice,
            options: Some(vec!["a".into(), "b".into()]),
            correct_answer: Some(CorrectAnswer::Single(answer.to_string())),
            points,
            section: None,
            section_title: None,
            difficulty: None,
            topic: None,
            ai_extracted: true,
            left_items: None,
            right_items: None,
            matching_pairs: None,
        }
    }

    async fn harness(strategy: GradingStrategy) -> Harness {
        let repo = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut assignment = Assignment::new(
            "Essay",
            "teacher-1",
            AssessmentType::Assignment,
            SubmissionType::Text,
            clock.now(),
        );
        assignment.extracted_questions = vec![mc(10.0, "A"), mc(20.0, "B")];
        assignment.has_questions = true;
        let assignment_id = assignment.id.clone();
        repo.insert_assignment(assignment).await.unwrap();
        let engine = GradingEngine::new(repo.clone(), clock, strategy);
        Harness {
            repo,
            engine,
            assignment_id,
        }
    }

    async fn submitted(h: &Harness, student: &str, answers: Vec<Answer>) -> String {
        let submission = h
            .repo
            .upsert_submission(
                &h.assignment_id,
                student,
                Box::new(move |s| {
                    s.status = SubmissionStatus::Submitted;
                    s.submission_text = Some("My answer".to_string());
                    s.extracted_answers = answers;
                    s.sections = vec![SectionAnswer {
                        section_id: "intro".to_string(),
                        title: "Intro".to_string(),
                        content: "Hello".to_string(),
                        score: None,
                        feedback: None,
                    }];
                    Ok(())
                }),
            )
            .await
            .unwrap();
        submission.id
    }

    fn outcome(score: f64) -> GradeOutcome {
        GradeOutcome {
            score,
            feedback: "AI feedback".to_string(),
            confidence: 0.9,
            max_points: 100.0,
            detailed_grading: None,
            needs_review: vec![],
        }
    }

    #[tokio::test]
    async fn test_manual_grade_preserves_ai_grade() {
        let h = harness(GradingStrategy::Objective).await;
        let id = submitted(&h, "s1", vec![]).await;
        h.engine.apply_ai_grade(&id, outcome(72.0)).await.unwrap();

        let graded = h
            .engine
            .manual_grade(
                &id,
                "teacher-1",
                ManualGrade {
                    grade: Some(85.0),
                    feedback: Some("Well argued".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(graded.grade, Some(85.0));
        assert_eq!(graded.ai_grade.as_ref().unwrap().score, 72.0);
        assert_eq!(graded.graded_by.as_deref(), Some("teacher-1"));
        assert_eq!(graded.status, SubmissionStatus::Graded);

        let assignment = h.repo.find_assignment(&h.assignment_id).await.unwrap().unwrap();
        assert_eq!(assignment.stats.total_submissions, 1);
    }

    #[tokio::test]
    async fn test_override_keeps_first_grade_in_running_mean() {
        let h = harness(GradingStrategy::Objective).await;
        let id = submitted(&h, "s1", vec![]).await;
        h.engine.apply_ai_grade(&id, outcome(72.0)).await.unwrap();
        h.engine
            .manual_grade(
                &id,
                "teacher-1",
                ManualGrade {
                    grade: Some(85.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let assignment = h.repo.find_assignment(&h.assignment_id).await.unwrap().unwrap();
        assert_eq!(assignment.stats.total_submissions, 1);
        assert!((assignment.stats.average_score - 72.0).abs() < 1e-9);
        assert_eq!(assignment.stats.passed_submissions, 1);
    }

    #[tokio::test]
    async fn test_late_ai_grade_does_not_override_teacher() {
        let h = harness(GradingStrategy::Objective).await;
        let id = submitted(&h, "s1", vec![]).await;
        h.engine
            .manual_grade(
                &id,
                "teacher-1",
                ManualGrade {
                    grade: Some(90.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let after = h.engine.apply_ai_grade(&id, outcome(40.0)).await.unwrap();
        assert_eq!(after.grade, Some(90.0));
        assert_eq!(after.ai_grade.unwrap().score, 40.0);
    }

    #[tokio::test]
    async fn test_percentage_and_section_scores() {
        let h = harness(GradingStrategy::Objective).await;
        let id = submitted(&h, "s1", vec![]).await;
        let graded = h
            .engine
            .manual_grade(
                &id,
                "teacher-1",
                ManualGrade {
                    percentage: Some(50.0),
                    section_scores: vec![SectionScore {
                        section_id: "intro".to_string(),
                        score: 8.0,
                        feedback: Some("Clear".to_string()),
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(graded.grade, Some(50.0));
        assert_eq!(graded.sections[0].score, Some(8.0));
        assert_eq!(graded.sections[0].feedback.as_deref(), Some("Clear"));
    }

    #[tokio::test]
    async fn test_rejected_manual_grade_changes_nothing() {
        let h = harness(GradingStrategy::Objective).await;
        let id = submitted(&h, "s1", vec![]).await;

        let err = h
            .engine
            .manual_grade(
                &id,
                "teacher-1",
                ManualGrade {
                    grade: Some(70.0),
                    section_scores: vec![SectionScore {
                        section_id: "missing".to_string(),
                        score: 1.0,
                        feedback: None,
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Submission(SubmissionError::InvalidGrade { .. })));

        let err = h
            .engine
            .manual_grade(&id, "teacher-2", ManualGrade { grade: Some(70.0), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Store(crate::error::StoreError::Forbidden { .. })));

        let stored = h.repo.find_submission_by_id(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubmissionStatus::Submitted);
        assert!(stored.grade.is_none());
    }

    #[tokio::test]
    async fn test_objective_grading_and_running_stats() {
        let h = harness(GradingStrategy::Objective).await;
        let answer = |i: usize, a: &str| Answer {
            question_index: i,
            question_id: None,
            answer: a.to_string(),
        };
        let full = submitted(&h, "s1", vec![answer(0, "A"), answer(1, "B")]).await;
        let partial = submitted(&h, "s2", vec![answer(0, "A"), answer(1, "A")]).await;

        let first = h.engine.grade_submission(&full).await.unwrap();
        assert_eq!(first.grade, Some(30.0));
        let second = h.engine.grade_submission(&partial).await.unwrap();
        assert_eq!(second.grade, Some(10.0));
        // 重复评分不重复计入统计
        h.engine.grade_submission(&partial).await.unwrap();

        let assignment = h.repo.find_assignment(&h.assignment_id).await.unwrap().unwrap();
        assert_eq!(assignment.stats.total_submissions, 2);
        assert!((assignment.stats.average_score - 20.0).abs() < 1e-9);
        assert_eq!(assignment.stats.passed_submissions, 0);
    }

    #[tokio::test]
    async fn test_text_submission_without_model_fails() {
        let h = harness(GradingStrategy::Objective).await;
        let id = submitted(&h, "s1", vec![]).await;
        let err = h.engine.grade_submission(&id).await.unwrap_err();
        assert!(matches!(err, AppError::Ai(AiError::GradingFailed { .. })));
    }

    #[tokio::test]
    async fn test_ai_text_grading_uses_assignment_max_points() {
        let model = Arc::new(ScriptedTextModel::new());
        model.push_response(r#"{"score": 150, "feedback": "Excellent"}"#);
        let h = harness(GradingStrategy::Ai(Arc::new(AiGrader::new(model.clone(), 0.8)))).await;
        let id = submitted(&h, "s1", vec![]).await;

        let graded = h.engine.grade_submission(&id).await.unwrap();
        assert_eq!(graded.grade, Some(100.0));
        assert_eq!(graded.ai_grade.unwrap().confidence, 0.8);
        assert!(model.prompts()[0].contains("My answer"));
    }
}
