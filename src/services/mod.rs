pub mod document_parser;
pub mod fast_processor;
pub mod grading_service;
pub mod question_extractor;
pub mod question_organizer;

pub use fast_processor::{FastDocumentProcessor, ProcessedDocument, ProcessingCache};
pub use grading_service::{grade_objective, AiGrader, GradeOutcome};
pub use question_extractor::{IdPrefix, QuestionExtractor};
pub use question_organizer::organize;
