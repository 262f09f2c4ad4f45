//! # Doc Grader
//!
//! 作业文档处理与 AI 评分流水线
//!
//! ## 架构设计
//!
//! 本系统采用四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有外部资源，只暴露能力
//! - `Repository` - 作业与提交的原子存取
//! - `BlobStore` - 原始文档的文件存储
//! - `TextModel` - 文本生成模型（OpenAI 兼容接口）
//! - `Clock` / `BackgroundTasks` - 时间与后台任务
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"
//! - `document_parser` - PDF / Word / 文本解析与启发式题目识别
//! - `FastDocumentProcessor` - 上传与解析并行、内容缓存
//! - `QuestionExtractor` - AI 题目抽取与规范化
//! - `AiGrader` / `grade_objective` - 评分
//!
//! ### ③ 流程层（Workflow）
//! - `ExtractionStatusMachine` - 抽取状态流转
//! - `SubmissionLifecycle` - 草稿 / 提交 / 自动提交 / 补录
//! - `GradingEngine` - AI 评分与教师评分合并
//!
//! ### ④ 编排层（Orchestration）
//! - `Pipeline` - 装配
//! - `App` - 批量处理作业清单

pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult};
pub use orchestrator::{App, Pipeline};
