//! 持久化存储 - 基础设施层
//!
//! 作业与提交聚合的存取。所有修改都通过闭包在存储内部原子完成
//! （读-改-写在同一把锁内），闭包返回错误时不落盘任何修改。

use futures::future::BoxFuture;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{AppError, AppResult};
use crate::models::{Assignment, Submission};

/// 作业原子修改
pub type AssignmentUpdate = Box<dyn FnOnce(&mut Assignment) -> AppResult<()> + Send>;
/// 提交原子修改
pub type SubmissionUpdate = Box<dyn FnOnce(&mut Submission) -> AppResult<()> + Send>;
/// 提交与所属作业的联合原子修改
pub type GradeUpdate =
    Box<dyn FnOnce(&mut Submission, &mut Assignment) -> AppResult<()> + Send>;

/// 持久化能力
pub trait Repository: Send + Sync {
    fn insert_assignment(&self, assignment: Assignment) -> BoxFuture<'_, AppResult<()>>;

    fn find_assignment<'a>(&'a self, id: &'a str) -> BoxFuture<'a, AppResult<Option<Assignment>>>;

    fn list_assignments(&self) -> BoxFuture<'_, AppResult<Vec<Assignment>>>;

    /// 原子修改作业，返回修改后的副本
    fn update_assignment<'a>(
        &'a self,
        id: &'a str,
        update: AssignmentUpdate,
    ) -> BoxFuture<'a, AppResult<Assignment>>;

    fn find_submission<'a>(
        &'a self,
        assignment_id: &'a str,
        student_id: &'a str,
    ) -> BoxFuture<'a, AppResult<Option<Submission>>>;

    fn find_submission_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, AppResult<Option<Submission>>>;

    /// 按 (作业, 学生) 查找或创建提交并原子修改
    ///
    /// 同一对 (作业, 学生) 至多存在一条提交记录
    fn upsert_submission<'a>(
        &'a self,
        assignment_id: &'a str,
        student_id: &'a str,
        update: SubmissionUpdate,
    ) -> BoxFuture<'a, AppResult<Submission>>;

    fn update_submission<'a>(
        &'a self,
        id: &'a str,
        update: SubmissionUpdate,
    ) -> BoxFuture<'a, AppResult<Submission>>;

    /// 同时原子修改提交及其所属作业（评分与统计）
    fn update_submission_and_assignment<'a>(
        &'a self,
        submission_id: &'a str,
        update: GradeUpdate,
    ) -> BoxFuture<'a, AppResult<(Submission, Assignment)>>;

    fn count_submissions<'a>(&'a self, assignment_id: &'a str) -> BoxFuture<'a, AppResult<usize>>;
}

#[derive(Default)]
struct State {
    assignments: HashMap<String, Assignment>,
    submissions: HashMap<String, Submission>,
    /// (assignment_id, student_id) → submission_id
    submission_index: HashMap<(String, String), String>,
}

/// 进程内存储
#[derive(Default)]
pub struct InMemoryRepository {
    state: RwLock<State>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Repository for InMemoryRepository {
    fn insert_assignment(&self, assignment: Assignment) -> BoxFuture<'_, AppResult<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.assignments.insert(assignment.id.clone(), assignment);
            Ok(())
        })
    }

    fn find_assignment<'a>(&'a self, id: &'a str) -> BoxFuture<'a, AppResult<Option<Assignment>>> {
        Box::pin(async move { Ok(self.state.read().await.assignments.get(id).cloned()) })
    }

    fn list_assignments(&self) -> BoxFuture<'_, AppResult<Vec<Assignment>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut all: Vec<Assignment> = state.assignments.values().cloned().collect();
            all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            Ok(all)
        })
    }

    fn update_assignment<'a>(
        &'a self,
        id: &'a str,
        update: AssignmentUpdate,
    ) -> BoxFuture<'a, AppResult<Assignment>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let current = state
                .assignments
                .get(id)
                .ok_or_else(|| AppError::not_found("作业", id))?;
            let mut next = current.clone();
            update(&mut next)?;
            state.assignments.insert(id.to_string(), next.clone());
            Ok(next)
        })
    }

    fn find_submission<'a>(
        &'a self,
        assignment_id: &'a str,
        student_id: &'a str,
    ) -> BoxFuture<'a, AppResult<Option<Submission>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let key = (assignment_id.to_string(), student_id.to_string());
            Ok(state
                .submission_index
                .get(&key)
                .and_then(|id| state.submissions.get(id))
                .cloned())
        })
    }

    fn find_submission_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, AppResult<Option<Submission>>> {
        Box::pin(async move { Ok(self.state.read().await.submissions.get(id).cloned()) })
    }

    fn upsert_submission<'a>(
        &'a self,
        assignment_id: &'a str,
        student_id: &'a str,
        update: SubmissionUpdate,
    ) -> BoxFuture<'a, AppResult<Submission>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let key = (assignment_id.to_string(), student_id.to_string());
            let mut next = match state
                .submission_index
                .get(&key)
                .and_then(|id| state.submissions.get(id))
            {
                Some(existing) => existing.clone(),
                None => Submission::new(assignment_id, student_id, chrono::Utc::now()),
            };
            update(&mut next)?;
            state.submission_index.insert(key, next.id.clone());
            state.submissions.insert(next.id.clone(), next.clone());
            Ok(next)
        })
    }

    fn update_submission<'a>(
        &'a self,
        id: &'a str,
        update: SubmissionUpdate,
    ) -> BoxFuture<'a, AppResult<Submission>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let mut next = state
                .submissions
                .get(id)
                .cloned()
                .ok_or_else(|| AppError::not_found("提交", id))?;
            update(&mut next)?;
            state.submissions.insert(id.to_string(), next.clone());
            Ok(next)
        })
    }

    fn update_submission_and_assignment<'a>(
        &'a self,
        submission_id: &'a str,
        update: GradeUpdate,
    ) -> BoxFuture<'a, AppResult<(Submission, Assignment)>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let mut submission = state
                .submissions
                .get(submission_id)
                .cloned()
                .ok_or_else(|| AppError::not_found("提交", submission_id))?;
            let mut assignment = state
                .assignments
                .get(&submission.assignment_id)
                .cloned()
                .ok_or_else(|| AppError::not_found("作业", submission.assignment_id.clone()))?;
            update(&mut submission, &mut assignment)?;
            state
                .assignments
                .insert(assignment.id.clone(), assignment.clone());
            state
                .submissions
                .insert(submission.id.clone(), submission.clone());
            Ok((submission, assignment))
        })
    }

    fn count_submissions<'a>(&'a self, assignment_id: &'a str) -> BoxFuture<'a, AppResult<usize>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .submissions
                .values()
                .filter(|s| s.assignment_id == assignment_id)
                .count())
        })
    }
}
