//! AI 题目抽取服务 - 业务能力层
//!
//! 负责提示词构建和模型返回的解析/修复/规范化，只处理一份文档文本，
//! 不关心抽取状态的流转。

use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::infrastructure::{Clock, TextModel};
use crate::models::{
    AssessmentType, CorrectAnswer, Difficulty, ExtractedQuestion, MatchingPair, QuestionType,
    DEFAULT_SECTION, DEFAULT_SECTION_TITLE,
};
use crate::utils::truncate_text;

/// 截断后追加的提示
pub const TRUNCATION_NOTICE: &str = "\n\n[Document truncated for processing...]";

static CODE_FENCE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*```(?:json|JSON)?\s*$").unwrap());
static JSON_ARRAY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[[\s\S]*\]").unwrap());
static TRAILING_COMMA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",(\s*[\]}])").unwrap());

const SYSTEM_MESSAGE: &str = "You are an expert educator who converts assessment documents into \
structured question data. You always answer with a JSON array and nothing else.";

/// 题目 ID 前缀，标记题目来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPrefix {
    /// 上传后首次抽取
    Extracted,
    /// 重试 / 重新生成
    Retry,
    /// 手动调试触发
    ManualDebug,
    /// 启发式降级抽取
    Heuristic,
}

impl IdPrefix {
    pub fn as_str(self) -> &'static str {
        match self {
            IdPrefix::Extracted => "extracted",
            IdPrefix::Retry => "retry",
            IdPrefix::ManualDebug => "manual_debug",
            IdPrefix::Heuristic => "heuristic",
        }
    }
}

/// 生成 `<prefix>_<timestamp>_<index>` 形式的题目 ID
pub fn question_id(prefix: IdPrefix, timestamp_ms: i64, index: usize) -> String {
    format!("{}_{}_{}", prefix.as_str(), timestamp_ms, index)
}

/// 截断送入模型的文本
pub fn truncate_for_prompt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str(TRUNCATION_NOTICE);
    truncated
}

/// 构建抽取提示词
pub fn build_extraction_prompt(text: &str, assessment_type: AssessmentType) -> String {
    format!(
        r#"Analyze the following {kind} document and extract every question it contains as structured data.

QUESTION TYPES (in priority order):
1. multiple-choice: one correct option (5-10 points)
2. numerical: numeric answer (8-15 points)
3. true-false: statement to judge (3-5 points)
4. short-answer: brief written response (10-15 points)
5. essay: extended written response (15-25 points)
Other allowed types: multiple-choice-multiple, fill-in-blank, matching.

INSTRUCTIONS:
- Extract between 8 and 20 questions when the document supports it; never invent content that is not in the document.
- Group questions by section and topic. Use the document's own section names when present.
- Aim for a difficulty distribution of roughly 40% easy, 40% medium and 20% hard.
- Include the options for choice questions and the correct answer whenever the document provides one.
- For matching questions include "leftItems", "rightItems" and "matchingPairs".

OUTPUT FORMAT:
Return ONLY a JSON array. No markdown, no commentary. Each element must look like:
{{"question": "...", "type": "multiple-choice", "options": ["...", "..."], "correctAnswer": "...", "points": 5, "section": "...", "sectionTitle": "...", "difficulty": "easy", "topic": "..."}}

DOCUMENT:
{text}"#,
        kind = assessment_type.as_str(),
        text = text
    )
}

/// 去掉 markdown 代码块包裹
///
/// 只删除独占一行的围栏和首尾紧贴内容的围栏，题目文本里的反引号保持原样
pub fn strip_code_fences(response: &str) -> String {
    let cleaned = CODE_FENCE_LINE.replace_all(response.trim(), "");
    let cleaned = cleaned.trim();
    let cleaned = cleaned
        .strip_prefix("```json")
        .or_else(|| cleaned.strip_prefix("```"))
        .unwrap_or(cleaned);
    let cleaned = cleaned.strip_suffix("```").unwrap_or(cleaned);
    cleaned.trim().to_string()
}

/// 删除 `]` / `}` 之前的尾随逗号
pub fn remove_trailing_commas(json: &str) -> String {
    TRAILING_COMMA.replace_all(json, "$1").into_owned()
}

/// 从模型返回中恢复 JSON 数组：去代码块 → 定位数组 → 删除尾随逗号 → 解析
pub fn parse_model_response(response: &str) -> AppResult<Vec<JsonValue>> {
    let stripped = strip_code_fences(response);
    let candidate = JSON_ARRAY
        .find(&stripped)
        .map(|m| m.as_str())
        .ok_or_else(|| {
            AppError::extraction_failed(format!(
                "AI 返回中没有 JSON 数组: {}",
                truncate_text(&stripped, 200)
            ))
        })?;

    match serde_json::from_str::<Vec<JsonValue>>(candidate) {
        Ok(items) => Ok(items),
        Err(first_err) => {
            let repaired = remove_trailing_commas(candidate);
            serde_json::from_str::<Vec<JsonValue>>(&repaired).map_err(|_| {
                AppError::extraction_failed(format!("无法解析 AI 返回的 JSON: {}", first_err))
            })
        }
    }
}

/// 模型返回的单个题目，所有字段均按不可信处理
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawQuestion {
    question: Option<JsonValue>,
    #[serde(rename = "type")]
    question_type: Option<JsonValue>,
    options: Option<JsonValue>,
    #[serde(alias = "correct_answer")]
    correct_answer: Option<JsonValue>,
    points: Option<JsonValue>,
    section: Option<JsonValue>,
    #[serde(alias = "section_title")]
    section_title: Option<JsonValue>,
    difficulty: Option<JsonValue>,
    topic: Option<JsonValue>,
    left_items: Option<JsonValue>,
    right_items: Option<JsonValue>,
    matching_pairs: Option<JsonValue>,
}

fn non_empty_str(value: &Option<JsonValue>) -> Option<String> {
    match value {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn string_list(value: &Option<JsonValue>) -> Option<Vec<String>> {
    let JsonValue::Array(items) = value.as_ref()? else {
        return None;
    };
    let list: Vec<String> = items
        .iter()
        .filter_map(|v| match v {
            JsonValue::String(s) => Some(s.trim().to_string()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect();
    (!list.is_empty()).then_some(list)
}

/// 规范化模型返回的题目
///
/// - 题干为空的条目丢弃
/// - 题型缺失或不合法时为 `short-answer`（下划线形式先转换为连字符形式）
/// - 分值不是正数时使用默认分值
/// - 章节缺省为 `general`，章节标题缺省为章节名或 `General Questions`
pub fn normalize_questions(
    items: Vec<JsonValue>,
    prefix: IdPrefix,
    timestamp_ms: i64,
    default_points: f64,
) -> Vec<ExtractedQuestion> {
    let mut questions = Vec::new();
    for item in items {
        if !item.is_object() {
            continue;
        }
        let raw: RawQuestion = match serde_json::from_value(item) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("跳过无法识别的题目条目: {}", e);
                continue;
            }
        };
        let Some(text) = non_empty_str(&raw.question) else {
            continue;
        };

        let question_type = non_empty_str(&raw.question_type)
            .and_then(|t| QuestionType::parse_lenient(&t))
            .unwrap_or(QuestionType::ShortAnswer);
        let points = match &raw.points {
            Some(JsonValue::Number(n)) => n.as_f64().filter(|p| p.is_finite() && *p > 0.0),
            _ => None,
        }
        .unwrap_or(default_points);
        let section = non_empty_str(&raw.section);
        let section_title = non_empty_str(&raw.section_title)
            .or_else(|| section.clone())
            .unwrap_or_else(|| DEFAULT_SECTION_TITLE.to_string());
        let matching_pairs = raw
            .matching_pairs
            .and_then(|v| serde_json::from_value::<Vec<MatchingPair>>(v).ok())
            .filter(|pairs| !pairs.is_empty());

        questions.push(ExtractedQuestion {
            id: question_id(prefix, timestamp_ms, questions.len()),
            question: text,
            question_type,
            options: string_list(&raw.options),
            correct_answer: raw.correct_answer.as_ref().and_then(CorrectAnswer::from_json),
            points,
            section: Some(section.unwrap_or_else(|| DEFAULT_SECTION.to_string())),
            section_title: Some(section_title),
            difficulty: Some(
                non_empty_str(&raw.difficulty)
                    .and_then(|d| Difficulty::parse_lenient(&d))
                    .unwrap_or(Difficulty::Medium),
            ),
            topic: Some(non_empty_str(&raw.topic).unwrap_or_else(|| "general".to_string())),
            ai_extracted: true,
            left_items: string_list(&raw.left_items),
            right_items: string_list(&raw.right_items),
            matching_pairs,
        });
    }
    questions
}

/// AI 题目抽取器
pub struct QuestionExtractor {
    model: Arc<dyn TextModel>,
    clock: Arc<dyn Clock>,
    max_text_length: usize,
    default_points: f64,
}

impl QuestionExtractor {
    pub fn new(
        model: Arc<dyn TextModel>,
        clock: Arc<dyn Clock>,
        max_text_length: usize,
        default_points: f64,
    ) -> Self {
        Self {
            model,
            clock,
            max_text_length,
            default_points,
        }
    }

    /// 从文档文本中抽取题目
    ///
    /// 返回空列表表示文档中没有可抽取的题目（不是错误）；
    /// 模型调用失败或返回内容无法解析时返回错误
    pub async fn extract_questions_from_document(
        &self,
        text: &str,
        assessment_type: AssessmentType,
        prefix: IdPrefix,
    ) -> AppResult<Vec<ExtractedQuestion>> {
        let input = truncate_for_prompt(text, self.max_text_length);
        if input.len() != text.len() {
            info!(
                "文档文本过长 ({} 字符)，截断为 {} 字符",
                text.chars().count(),
                self.max_text_length
            );
        }

        let prompt = build_extraction_prompt(&input, assessment_type);
        let response = self.model.generate(&prompt, Some(SYSTEM_MESSAGE)).await?;
        debug!(
            "AI 返回 {} 字符: {}",
            response.len(),
            truncate_text(&response, 120)
        );

        let items = parse_model_response(&response)?;
        let timestamp = self.clock.now().timestamp_millis();
        let questions = normalize_questions(items, prefix, timestamp, self.default_points);
        info!(
            "AI 抽取完成: {} 道题目 (模型: {})",
            questions.len(),
            self.model.model_name()
        );
        Ok(questions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AiError;
    use crate::infrastructure::{ScriptedTextModel, SystemClock};
    use serde_json::json;

    #[test]
    fn test_truncate_for_prompt() {
        let text = "x".repeat(8005);
        let truncated = truncate_for_prompt(&text, 8000);
        assert!(truncated.ends_with(TRUNCATION_NOTICE));
        assert_eq!(truncated.chars().count(), 8000 + TRUNCATION_NOTICE.chars().count());
        assert_eq!(truncate_for_prompt("short", 8000), "short");
    }

    #[test]
    fn test_parse_response_with_fences_and_prose() {
        let response = "Here you go:\n```json\n[{\"question\": \"Q1\", \"type\": \"essay\"},]\n```\nHope it helps!";
        let items = parse_model_response(response).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["type"], "essay");
    }

    #[test]
    fn test_strip_fences_keeps_backticks_in_question_text() {
        let response = "```json\n[{\"question\": \"What does ```let x = 1;``` declare?\"}]\n```";
        let items = parse_model_response(response).unwrap();
        assert_eq!(items[0]["question"], "What does ```let x = 1;``` declare?");

        let inline = "```[{\"question\": \"Q\"}]```";
        assert_eq!(strip_code_fences(inline), "[{\"question\": \"Q\"}]");
    }

    #[test]
    fn test_parse_response_without_array_fails() {
        let err = parse_model_response("I could not find any questions.").unwrap_err();
        assert!(matches!(err, AppError::Ai(AiError::ExtractionFailed { .. })));
    }

    #[test]
    fn test_normalize_applies_defaults() {
        let items = vec![
            json!({"question": "  ", "type": "essay"}),
            json!({"question": "Pick one", "type": "multiple_choice", "options": ["a", "b"], "correctAnswer": "a", "points": 5}),
            json!({"question": "Explain", "type": "interpretive-dance", "points": "ten"}),
            json!({"question": "Algebra", "section": "algebra", "difficulty": "HARD", "points": -3}),
            json!("not an object"),
        ];
        let questions = normalize_questions(items, IdPrefix::Retry, 1700, 10.0);
        assert_eq!(questions.len(), 3);

        assert_eq!(questions[0].id, "retry_1700_0");
        assert_eq!(questions[0].question_type, QuestionType::MultipleChoice);
        assert_eq!(questions[0].points, 5.0);
        assert_eq!(questions[0].section.as_deref(), Some("general"));
        assert_eq!(questions[0].section_title.as_deref(), Some("General Questions"));
        assert_eq!(questions[0].difficulty, Some(Difficulty::Medium));
        assert_eq!(questions[0].topic.as_deref(), Some("general"));
        assert!(questions.iter().all(|q| q.ai_extracted));

        assert_eq!(questions[1].question_type, QuestionType::ShortAnswer);
        assert_eq!(questions[1].points, 10.0);

        assert_eq!(questions[2].id, "retry_1700_2");
        assert_eq!(questions[2].section.as_deref(), Some("algebra"));
        assert_eq!(questions[2].section_title.as_deref(), Some("algebra"));
        assert_eq!(questions[2].difficulty, Some(Difficulty::Hard));
        assert_eq!(questions[2].points, 10.0);
    }

    #[test]
    fn test_normalize_keeps_matching_fields() {
        let items = vec![json!({
            "question": "Match capitals",
            "type": "matching",
            "leftItems": ["France", "Italy"],
            "rightItems": ["Rome", "Paris"],
            "matchingPairs": [{"left": "France", "right": "Paris"}, {"left": "Italy", "right": "Rome"}]
        })];
        let q = &normalize_questions(items, IdPrefix::Extracted, 1, 10.0)[0];
        assert_eq!(q.question_type, QuestionType::Matching);
        assert_eq!(q.left_items.as_ref().map(|v| v.len()), Some(2));
        assert_eq!(q.matching_pairs.as_ref().map(|v| v.len()), Some(2));
    }

    #[tokio::test]
    async fn test_extractor_truncates_and_parses() {
        let model = Arc::new(ScriptedTextModel::new());
        model.push_response(r#"[{"question": "What is 2+2?", "type": "numerical", "correctAnswer": 4, "points": 8}]"#);
        let extractor = QuestionExtractor::new(model.clone(), Arc::new(SystemClock), 100, 10.0);

        let text = "y".repeat(500);
        let questions = extractor
            .extract_questions_from_document(&text, AssessmentType::Quiz, IdPrefix::Extracted)
            .await
            .unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(
            questions[0].correct_answer,
            Some(CorrectAnswer::Single("4".to_string()))
        );
        assert!(questions[0].id.starts_with("extracted_"));

        let prompt = &model.prompts()[0];
        assert!(prompt.contains("quiz document"));
        assert!(prompt.contains(TRUNCATION_NOTICE.trim()));
        assert!(!prompt.contains(&"y".repeat(101)));
    }

    #[tokio::test]
    async fn test_extractor_empty_array_is_not_error() {
        let model = Arc::new(ScriptedTextModel::new());
        model.push_response("[]");
        let extractor = QuestionExtractor::new(model, Arc::new(SystemClock), 8000, 10.0);
        let questions = extractor
            .extract_questions_from_document("text", AssessmentType::Exam, IdPrefix::Extracted)
            .await
            .unwrap();
        assert!(questions.is_empty());
    }
}
