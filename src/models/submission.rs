use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 提交状态，只能前进：draft → submitted → graded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    #[default]
    Draft,
    Submitted,
    Graded,
}

impl SubmissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionStatus::Draft => "draft",
            SubmissionStatus::Submitted => "submitted",
            SubmissionStatus::Graded => "graded",
        }
    }
}

/// 附件引用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub public_id: Option<String>,
    #[serde(default)]
    pub size: u64,
}

/// 分节作答
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionAnswer {
    pub section_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub feedback: Option<String>,
}

/// 针对抽取题目的作答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub question_index: usize,
    #[serde(default)]
    pub question_id: Option<String>,
    pub answer: String,
}

/// 单题评分明细
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedGrade {
    pub question_index: usize,
    pub earned_points: f64,
    pub max_points: f64,
    pub feedback: String,
}

/// AI 评分记录，写入后只用于审计对照，不被人工评分覆盖
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiGrade {
    pub score: f64,
    pub feedback: String,
    pub confidence: f64,
    pub graded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detailed_grading: Option<Vec<DetailedGrade>>,
}

/// 学生对某个作业的一次作答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: String,
    pub assignment_id: String,
    pub student_id: String,
    pub submission_text: Option<String>,
    pub attachments: Vec<FileRef>,
    pub sections: Vec<SectionAnswer>,
    pub extracted_answers: Vec<Answer>,
    pub status: SubmissionStatus,
    pub submitted_at: Option<DateTime<Utc>>,
    pub is_late: bool,
    pub auto_submitted: bool,
    /// 每次保存单调递增
    pub version: u64,
    pub auto_saved_at: Option<DateTime<Utc>>,
    pub grade: Option<f64>,
    pub feedback: Option<String>,
    pub ai_grade: Option<AiGrade>,
    pub graded_at: Option<DateTime<Utc>>,
    pub graded_by: Option<String>,
    /// 最近一次后台评分失败的原因
    pub grading_error: Option<String>,
    /// 该提交是否已计入作业统计
    pub counted_in_stats: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Submission {
    pub fn new(assignment_id: impl Into<String>, student_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            assignment_id: assignment_id.into(),
            student_id: student_id.into(),
            submission_text: None,
            attachments: Vec::new(),
            sections: Vec::new(),
            extracted_answers: Vec::new(),
            status: SubmissionStatus::Draft,
            submitted_at: None,
            is_late: false,
            auto_submitted: false,
            version: 0,
            auto_saved_at: None,
            grade: None,
            feedback: None,
            ai_grade: None,
            graded_at: None,
            graded_by: None,
            grading_error: None,
            counted_in_stats: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// 是否有非空的文本作答（正文或任一分节）
    pub fn has_text_content(&self) -> bool {
        self.submission_text
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
            || self.sections.iter().any(|s| !s.content.trim().is_empty())
    }
}
