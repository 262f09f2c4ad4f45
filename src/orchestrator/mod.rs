//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 组装基础设施与各层能力，负责批量处理和并发调度。
//!
//! ## 模块划分
//!
//! ### `pipeline` - 流水线装配
//! - 持有存储、文件存储、时钟、后台任务
//! - 按抽取模式选择 AI 或启发式策略
//! - 对外暴露抽取状态机、提交生命周期、评分引擎
//!
//! ### `batch_processor` - 批量作业处理器
//! - 扫描作业清单（Vec<AssignmentManifest>）
//! - Semaphore 控制并发，分批推进
//! - 每个作业的抽取结果写入输出目录
//! - 输出全局统计信息
//!
//! ## 层次关系
//!
//! ```text
//! batch_processor (处理 Vec<AssignmentManifest>)
//!     ↓
//! pipeline (装配)
//!     ↓
//! workflow (抽取状态机 / 提交生命周期 / 评分引擎)
//!     ↓
//! services (解析 / 缓存 / 抽取 / 评分)
//!     ↓
//! infrastructure (存储 / 文件存储 / 模型 / 时钟 / 后台任务)
//! ```

pub mod batch_processor;
pub mod pipeline;

pub use batch_processor::{App, ExtractionReport, ProcessingStats};
pub use pipeline::Pipeline;
