use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::question::ExtractedQuestion;

/// AI 抽取状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiProcessingStatus {
    #[default]
    NotStarted,
    Pending,
    Processing,
    Completed,
    Failed,
    NoQuestionsFound,
}

impl AiProcessingStatus {
    /// 是否为终态
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AiProcessingStatus::Completed
                | AiProcessingStatus::Failed
                | AiProcessingStatus::NoQuestionsFound
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AiProcessingStatus::NotStarted => "not_started",
            AiProcessingStatus::Pending => "pending",
            AiProcessingStatus::Processing => "processing",
            AiProcessingStatus::Completed => "completed",
            AiProcessingStatus::Failed => "failed",
            AiProcessingStatus::NoQuestionsFound => "no_questions_found",
        }
    }
}

impl std::fmt::Display for AiProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 测评类型，只影响提示词措辞
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssessmentType {
    Quiz,
    #[default]
    Assignment,
    Exam,
    Project,
    Homework,
}

impl AssessmentType {
    pub fn as_str(self) -> &'static str {
        match self {
            AssessmentType::Quiz => "quiz",
            AssessmentType::Assignment => "assignment",
            AssessmentType::Exam => "exam",
            AssessmentType::Project => "project",
            AssessmentType::Homework => "homework",
        }
    }
}

/// 作业要求的提交形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionType {
    File,
    #[default]
    Text,
    Both,
}

/// 作业发布状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    #[default]
    Draft,
    Published,
    Closed,
}

impl AssignmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AssignmentStatus::Draft => "draft",
            AssignmentStatus::Published => "published",
            AssignmentStatus::Closed => "closed",
        }
    }
}

/// 作业原始文档的存储信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentDocument {
    pub filename: String,
    pub original_name: String,
    pub file_url: String,
    pub public_id: String,
    pub mime_type: String,
    pub file_size: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// 作业层面的成绩统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentStats {
    /// 已评分提交数
    pub total_submissions: u64,
    pub average_score: f64,
    /// 及格提交数（计数，不是比例）
    pub passed_submissions: u64,
}

impl AssessmentStats {
    /// 计入一次新评分，按增量方式更新平均分
    ///
    /// `passing_percent` 是及格线占满分的百分比；返回本次是否及格
    pub fn record(&mut self, score: f64, max_points: f64, passing_percent: f64) -> bool {
        self.total_submissions += 1;
        let n = self.total_submissions as f64;
        self.average_score = (self.average_score * (n - 1.0) + score) / n;
        let passed = max_points > 0.0 && score / max_points * 100.0 >= passing_percent;
        if passed {
            self.passed_submissions += 1;
        }
        passed
    }

    /// 及格率（百分比）
    pub fn pass_rate(&self) -> f64 {
        if self.total_submissions == 0 {
            return 0.0;
        }
        self.passed_submissions as f64 / self.total_submissions as f64 * 100.0
    }
}

/// 作业 / 测评聚合
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub instructions: String,
    pub instructor_id: String,
    pub assessment_type: AssessmentType,
    pub submission_type: SubmissionType,
    pub status: AssignmentStatus,
    pub due_date: Option<DateTime<Utc>>,
    pub max_points: f64,
    /// 及格线，占 `max_points` 的百分比
    pub passing_score: f64,
    pub assignment_document: Option<AssignmentDocument>,
    /// 抽取暂存文本，任何终态都会清空
    pub document_text: Option<String>,
    pub extracted_questions: Vec<ExtractedQuestion>,
    pub has_questions: bool,
    pub ai_processing_status: AiProcessingStatus,
    pub ai_processing_error: Option<String>,
    pub last_question_extraction_attempt: Option<DateTime<Utc>>,
    /// 当前持有 `document_text` 的抽取尝试编号
    pub extraction_attempt: u64,
    pub stats: AssessmentStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Assignment {
    pub fn new(
        title: impl Into<String>,
        instructor_id: impl Into<String>,
        assessment_type: AssessmentType,
        submission_type: SubmissionType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            instructions: String::new(),
            instructor_id: instructor_id.into(),
            assessment_type,
            submission_type,
            status: AssignmentStatus::Draft,
            due_date: None,
            max_points: 100.0,
            passing_score: 60.0,
            assignment_document: None,
            document_text: None,
            extracted_questions: Vec::new(),
            has_questions: false,
            ai_processing_status: AiProcessingStatus::NotStarted,
            ai_processing_error: None,
            last_question_extraction_attempt: None,
            extraction_attempt: 0,
            stats: AssessmentStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 题目分值之和，缺失或非正分值按默认分值计
    pub fn actual_max_points(&self, default_points: f64) -> f64 {
        self.extracted_questions
            .iter()
            .map(|q| if q.points > 0.0 { q.points } else { default_points })
            .sum()
    }
}
