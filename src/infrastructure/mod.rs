//! 基础设施层（Infrastructure Layer）
//!
//! 持有外部/稀缺资源，只暴露能力，不认识业务流程

pub mod blob_store;
pub mod clock;
pub mod llm_client;
pub mod store;
pub mod tasks;

pub use blob_store::{BlobStore, InMemoryBlobStore, LocalBlobStore, StoredBlob};
pub use clock::{Clock, ManualClock, SystemClock};
pub use llm_client::{OpenAiTextModel, ScriptedTextModel, TextModel};
pub use store::{InMemoryRepository, Repository};
pub use tasks::BackgroundTasks;
