//! 流程上下文
//!
//! 封装"我正在处理哪个作业 / 哪份提交"这一信息，只用于日志前缀

use std::fmt::Display;

/// 作业抽取上下文
#[derive(Debug, Clone)]
pub struct AssignmentCtx {
    pub assignment_id: String,
    /// 抽取尝试编号
    pub attempt: u64,
}

impl AssignmentCtx {
    pub fn new(assignment_id: impl Into<String>, attempt: u64) -> Self {
        Self {
            assignment_id: assignment_id.into(),
            attempt,
        }
    }
}

impl Display for AssignmentCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[作业 ID#{} 尝试#{}]", self.assignment_id, self.attempt)
    }
}

/// 提交上下文
#[derive(Debug, Clone)]
pub struct SubmissionCtx {
    pub assignment_id: String,
    pub student_id: String,
}

impl SubmissionCtx {
    pub fn new(assignment_id: impl Into<String>, student_id: impl Into<String>) -> Self {
        Self {
            assignment_id: assignment_id.into(),
            student_id: student_id.into(),
        }
    }
}

impl Display for SubmissionCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[作业 ID#{} 学生#{}]", self.assignment_id, self.student_id)
    }
}
