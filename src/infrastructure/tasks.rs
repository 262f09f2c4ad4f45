//! 后台任务调度 - 基础设施层
//!
//! 在请求路径之外运行耗时工作（AI 抽取、评分）。调用方必须在调度之前
//! 写入可观察的中间状态，任务本身负责写入终态。

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// 有并发上限的后台任务调度器
#[derive(Clone)]
pub struct BackgroundTasks {
    semaphore: Arc<Semaphore>,
    handles: Arc<Mutex<Vec<(String, JoinHandle<()>)>>>,
}

impl BackgroundTasks {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 调度一个后台任务，立即返回
    pub fn spawn<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let semaphore = self.semaphore.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                error!("后台任务 {} 无法获取执行许可", task_name);
                return;
            };
            debug!("后台任务开始: {}", task_name);
            task.await;
            debug!("后台任务结束: {}", task_name);
        });
        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        handles.retain(|(_, h)| !h.is_finished());
        handles.push((name, handle));
    }

    /// 当前未结束的任务数
    pub fn in_flight(&self) -> usize {
        let handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        handles.iter().filter(|(_, h)| !h.is_finished()).count()
    }

    /// 等待所有已调度任务结束（包括等待期间新调度的任务）
    pub async fn wait_idle(&self) {
        loop {
            let drained: Vec<(String, JoinHandle<()>)> = {
                let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
                handles.drain(..).collect()
            };
            if drained.is_empty() {
                return;
            }
            for (name, handle) in drained {
                if let Err(e) = handle.await {
                    error!("后台任务 {} 异常退出: {}", name, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_wait_idle_waits_for_all_tasks() {
        let tasks = BackgroundTasks::new(2);
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..5 {
            let done = done.clone();
            tasks.spawn(format!("task-{}", i), async move {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        tasks.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(tasks.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_poison_runner() {
        let tasks = BackgroundTasks::new(1);
        tasks.spawn("boom", async { panic!("boom") });
        let flag = Arc::new(AtomicUsize::new(0));
        let f = flag.clone();
        tasks.spawn("after", async move {
            f.store(1, Ordering::SeqCst);
        });
        tasks.wait_idle().await;
        assert_eq!(flag.load(Ordering::SeqCst), 1);
    }
}
