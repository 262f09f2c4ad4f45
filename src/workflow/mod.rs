pub mod ctx;
pub mod extraction_flow;
pub mod grading_flow;
pub mod submission_flow;

pub use ctx::{AssignmentCtx, SubmissionCtx};
pub use extraction_flow::{
    ExtractionOutcome, ExtractionStatus, ExtractionStatusMachine, ExtractionStrategy,
};
pub use grading_flow::{GradingEngine, GradingStrategy, ManualGrade, SectionScore};
pub use submission_flow::{SubmissionLifecycle, SubmissionPayload, SubmitMode};
