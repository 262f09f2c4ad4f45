pub mod assignment;
pub mod document;
pub mod loaders;
pub mod question;
pub mod submission;

/// 未指定章节时的默认章节名
pub const DEFAULT_SECTION: &str = "general";
/// 默认章节标题
pub const DEFAULT_SECTION_TITLE: &str = "General Questions";

pub use assignment::{
    AiProcessingStatus, AssessmentStats, AssessmentType, Assignment, AssignmentDocument,
    AssignmentStatus, SubmissionType,
};
pub use document::{Document, DocumentFormat, DocumentMetadata, ParseResult, ValidationReport};
pub use loaders::{load_all_manifests, load_manifest, AssignmentManifest};
pub use question::{CorrectAnswer, Difficulty, ExtractedQuestion, MatchingPair, QuestionType};
pub use submission::{
    AiGrade, Answer, DetailedGrade, FileRef, SectionAnswer, Submission, SubmissionStatus,
};
