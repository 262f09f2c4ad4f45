//! 评分服务 - 业务能力层
//!
//! 两种评分方式：
//! - AI 评分：构建提示词，解析模型返回的 JSON 评分结果
//! - 客观题离线评分：选择题/判断题精确匹配，数值题 1% 容差
//!
//! 只产出评分结果，写回提交记录和统计由 workflow 层负责。

use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::fmt::Write as _;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info};

use crate::error::{AiError, AppError, AppResult};
use crate::infrastructure::TextModel;
use crate::models::{
    Answer, Assignment, CorrectAnswer, DetailedGrade, ExtractedQuestion, QuestionType, Submission,
};
use crate::services::question_extractor::{remove_trailing_commas, strip_code_fences};
use crate::utils::truncate_text;

static JSON_OBJECT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{[\s\S]*\}").unwrap());

const SYSTEM_MESSAGE: &str = "You are a fair and consistent teacher grading student work. \
You always answer with a single JSON object and nothing else.";

/// 数值题允许的相对误差
const NUMERICAL_TOLERANCE: f64 = 0.01;

/// 评分结果
#[derive(Debug, Clone, PartialEq)]
pub struct GradeOutcome {
    pub score: f64,
    pub feedback: String,
    pub confidence: f64,
    /// 评分所用的满分
    pub max_points: f64,
    pub detailed_grading: Option<Vec<DetailedGrade>>,
    /// 需要教师复核的题目序号
    pub needs_review: Vec<usize>,
}

fn format_correct_answer(answer: &CorrectAnswer) -> String {
    match answer {
        CorrectAnswer::Single(s) => s.clone(),
        CorrectAnswer::Multiple(items) => items.join(", "),
    }
}

fn answer_for(answers: &[Answer], index: usize) -> Option<&str> {
    answers
        .iter()
        .find(|a| a.question_index == index)
        .map(|a| a.answer.trim())
        .filter(|a| !a.is_empty())
}

/// 构建题目作答评分提示词
pub fn build_question_grading_prompt(
    questions: &[ExtractedQuestion],
    answers: &[Answer],
    max_points: f64,
) -> String {
    let mut body = String::new();
    for (i, q) in questions.iter().enumerate() {
        let _ = writeln!(body, "Question {} ({}, {} points): {}", i, q.question_type, q.points, q.question);
        if let Some(options) = &q.options {
            let _ = writeln!(body, "Options: {}", options.join(" | "));
        }
        if let Some(correct) = &q.correct_answer {
            let _ = writeln!(body, "Reference answer: {}", format_correct_answer(correct));
        }
        let _ = writeln!(
            body,
            "Student answer: {}\n",
            answer_for(answers, i).unwrap_or("(no answer)")
        );
    }

    format!(
        r#"Grade the student's answers below. The total available is {max_points} points.

{body}
Return ONLY a JSON object shaped like:
{{"score": <total earned>, "feedback": "<overall feedback>", "confidence": <0..1>, "detailedGrading": [{{"questionIndex": 0, "earnedPoints": 0, "maxPoints": 0, "feedback": "..."}}]}}"#
    )
}

/// 构建文本作答评分提示词
pub fn build_text_grading_prompt(assignment: &Assignment, submission: &Submission) -> String {
    let mut answer = String::new();
    if let Some(text) = submission.submission_text.as_deref().filter(|t| !t.trim().is_empty()) {
        answer.push_str(text.trim());
        answer.push('\n');
    }
    for section in &submission.sections {
        if section.content.trim().is_empty() {
            continue;
        }
        let _ = writeln!(answer, "\n## {}\n{}", section.title, section.content.trim());
    }

    format!(
        r#"Grade the following {kind} submission out of {max} points.

TITLE: {title}
INSTRUCTIONS:
{instructions}

STUDENT SUBMISSION:
{answer}

Return ONLY a JSON object shaped like:
{{"score": <earned points>, "feedback": "<constructive feedback>", "confidence": <0..1>}}"#,
        kind = assignment.assessment_type.as_str(),
        max = assignment.max_points,
        title = assignment.title,
        instructions = assignment.instructions,
        answer = answer.trim(),
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawGrade {
    score: Option<JsonValue>,
    feedback: Option<JsonValue>,
    confidence: Option<JsonValue>,
    detailed_grading: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDetail {
    question_index: usize,
    #[serde(default)]
    earned_points: f64,
    #[serde(default)]
    max_points: f64,
    #[serde(default)]
    feedback: String,
}

fn as_number(value: &Option<JsonValue>) -> Option<f64> {
    let number = match value {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

/// 解析模型返回的评分结果
///
/// 分数限制在 `[0, max_points]`；缺少总分时用明细之和；两者都没有则报错
pub fn parse_grading_response(
    response: &str,
    max_points: f64,
    default_confidence: f64,
) -> AppResult<GradeOutcome> {
    let grading_failed = |message: String| AppError::Ai(AiError::GradingFailed { message });

    let stripped = strip_code_fences(response);
    let candidate = JSON_OBJECT.find(&stripped).map(|m| m.as_str()).ok_or_else(|| {
        grading_failed(format!("AI 返回中没有 JSON 对象: {}", truncate_text(&stripped, 200)))
    })?;
    let raw: RawGrade = serde_json::from_str(candidate)
        .or_else(|_| serde_json::from_str(&remove_trailing_commas(candidate)))
        .map_err(|e| grading_failed(format!("无法解析 AI 评分结果: {}", e)))?;

    let detailed: Option<Vec<DetailedGrade>> = raw
        .detailed_grading
        .and_then(|v| serde_json::from_value::<Vec<RawDetail>>(v).ok())
        .map(|items| {
            items
                .into_iter()
                .map(|d| {
                    let max = d.max_points.max(0.0);
                    DetailedGrade {
                        question_index: d.question_index,
                        earned_points: d.earned_points.clamp(0.0, max),
                        max_points: max,
                        feedback: d.feedback,
                    }
                })
                .collect()
        })
        .filter(|items: &Vec<DetailedGrade>| !items.is_empty());

    let score = as_number(&raw.score)
        .or_else(|| {
            detailed
                .as_ref()
                .map(|items| items.iter().map(|d| d.earned_points).sum())
        })
        .ok_or_else(|| grading_failed("AI 评分结果缺少分数".to_string()))?;

    let feedback = match raw.feedback {
        Some(JsonValue::String(s)) => s.trim().to_string(),
        _ => String::new(),
    };

    Ok(GradeOutcome {
        score: score.clamp(0.0, max_points.max(0.0)),
        feedback,
        confidence: as_number(&raw.confidence)
            .unwrap_or(default_confidence)
            .clamp(0.0, 1.0),
        max_points,
        detailed_grading: detailed,
        needs_review: Vec::new(),
    })
}

fn matches_choice(question: &ExtractedQuestion, expected: &str, given: &str) -> bool {
    if expected.eq_ignore_ascii_case(given) {
        return true;
    }
    // 标准答案为选项字母时，也接受该选项的文本
    let Some(options) = &question.options else {
        return false;
    };
    let letter_index = |s: &str| {
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_alphabetic() => {
                Some((c.to_ascii_uppercase() as u8 - b'A') as usize)
            }
            _ => None,
        }
    };
    let option_text = |idx: usize| options.get(idx).map(|o| o.trim());
    match (letter_index(expected), letter_index(given)) {
        (Some(i), None) => option_text(i).is_some_and(|o| o.eq_ignore_ascii_case(given)),
        (None, Some(j)) => option_text(j).is_some_and(|o| o.eq_ignore_ascii_case(expected)),
        _ => false,
    }
}

fn matches_numerical(expected: &str, given: &str) -> Option<bool> {
    let expected: f64 = expected.trim().parse().ok()?;
    let given: f64 = given.trim().parse().ok()?;
    if expected == 0.0 {
        return Some(given.abs() < f64::EPSILON);
    }
    Some((given - expected).abs() <= expected.abs() * NUMERICAL_TOLERANCE)
}

/// 客观题离线评分
///
/// 非客观题或缺少标准答案的题目记 0 分并标记为待复核
pub fn grade_objective(questions: &[ExtractedQuestion], answers: &[Answer]) -> GradeOutcome {
    let mut details = Vec::with_capacity(questions.len());
    let mut needs_review = Vec::new();
    let mut correct_count = 0;

    for (i, q) in questions.iter().enumerate() {
        let expected = q
            .correct_answer
            .as_ref()
            .and_then(|c| c.as_single())
            .map(str::trim);
        let given = answer_for(answers, i);

        let (earned, feedback) = match (q.question_type.is_objective(), expected, given) {
            (false, _, _) | (true, None, _) => {
                needs_review.push(i);
                (0.0, "需要教师复核".to_string())
            }
            (true, Some(_), None) => (0.0, "未作答".to_string()),
            (true, Some(expected), Some(given)) => {
                let correct = match q.question_type {
                    QuestionType::Numerical => matches_numerical(expected, given).unwrap_or(false),
                    _ => matches_choice(q, expected, given),
                };
                if correct {
                    correct_count += 1;
                    (q.points, "正确".to_string())
                } else {
                    (0.0, format!("错误，正确答案: {}", expected))
                }
            }
        };
        details.push(DetailedGrade {
            question_index: i,
            earned_points: earned,
            max_points: q.points,
            feedback,
        });
    }

    let max_points: f64 = questions.iter().map(|q| q.points).sum();
    let score: f64 = details.iter().map(|d| d.earned_points).sum();
    let reviewed_points: f64 = needs_review.iter().map(|&i| questions[i].points).sum();
    let confidence = if max_points > 0.0 {
        (max_points - reviewed_points) / max_points
    } else {
        0.0
    };

    let mut feedback = format!("客观题自动评分: {}/{} 题正确", correct_count, questions.len());
    if !needs_review.is_empty() {
        let _ = write!(feedback, "，{} 题需要教师复核", needs_review.len());
    }

    GradeOutcome {
        score,
        feedback,
        confidence,
        max_points,
        detailed_grading: Some(details),
        needs_review,
    }
}

/// AI 评分器
pub struct AiGrader {
    model: Arc<dyn TextModel>,
    default_confidence: f64,
}

impl AiGrader {
    pub fn new(model: Arc<dyn TextModel>, default_confidence: f64) -> Self {
        Self {
            model,
            default_confidence,
        }
    }

    /// 按抽取题目评分，满分取题目分值之和
    pub async fn grade_assignment_submission(
        &self,
        questions: &[ExtractedQuestion],
        answers: &[Answer],
    ) -> AppResult<GradeOutcome> {
        let max_points: f64 = questions.iter().map(|q| q.points).sum();
        let prompt = build_question_grading_prompt(questions, answers, max_points);
        self.run(&prompt, max_points).await
    }

    /// 按作业说明评分文本作答，满分取作业的 `max_points`
    pub async fn grade_text_submission(
        &self,
        assignment: &Assignment,
        submission: &Submission,
    ) -> AppResult<GradeOutcome> {
        let prompt = build_text_grading_prompt(assignment, submission);
        self.run(&prompt, assignment.max_points).await
    }

    async fn run(&self, prompt: &str, max_points: f64) -> AppResult<GradeOutcome> {
        let response = self.model.generate(prompt, Some(SYSTEM_MESSAGE)).await?;
        debug!("AI 评分返回: {}", truncate_text(&response, 120));
        let outcome = parse_grading_response(&response, max_points, self.default_confidence)?;
        info!(
            "AI 评分完成: {:.1}/{:.1} (模型: {})",
            outcome.score,
            max_points,
            self.model.model_name()
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::ScriptedTextModel;
    use crate::models::Difficulty;

    fn question(question_type: QuestionType, answer: Option<&str>, points: f64) -> ExtractedQuestion {
        ExtractedQuestion {
            id: "q".to_string(),
            question: "?".to_string(),
            question_type,
            options: Some(vec!["3".into(), "4".into(), "5".into(), "6".into()]),
            correct_answer: answer.map(|a| CorrectAnswer::Single(a.to_string())),
            points,
            section: None,
            section_title: None,
            difficulty: Some(Difficulty::Easy),
            topic: None,
            ai_extracted: false,
            left_items: None,
            right_items: None,
            matching_pairs: None,
        }
    }

    fn answer(index: usize, text: &str) -> Answer {
        Answer {
            question_index: index,
            question_id: None,
            answer: text.to_string(),
        }
    }

    #[test]
    fn test_parse_response_clamps_score() {
        let outcome = parse_grading_response(
            "```json\n{\"score\": 130, \"feedback\": \"Great\", \"confidence\": 0.9,}\n```",
            100.0,
            0.8,
        )
        .unwrap();
        assert_eq!(outcome.score, 100.0);
        assert_eq!(outcome.feedback, "Great");
        assert_eq!(outcome.confidence, 0.9);
    }

    #[test]
    fn test_parse_response_sums_details_when_score_missing() {
        let outcome = parse_grading_response(
            r#"{"feedback": "ok", "detailedGrading": [
                {"questionIndex": 0, "earnedPoints": 4, "maxPoints": 5, "feedback": "close"},
                {"questionIndex": 1, "earnedPoints": 12, "maxPoints": 10, "feedback": "full"}
            ]}"#,
            15.0,
            0.8,
        )
        .unwrap();
        assert_eq!(outcome.score, 14.0);
        assert_eq!(outcome.confidence, 0.8);
        let details = outcome.detailed_grading.unwrap();
        assert_eq!(details[1].earned_points, 10.0);
    }

    #[test]
    fn test_parse_response_without_score_fails() {
        let err = parse_grading_response("no json here", 10.0, 0.8).unwrap_err();
        assert!(matches!(err, AppError::Ai(AiError::GradingFailed { .. })));
    }

    #[test]
    fn test_objective_scoring() {
        let questions = vec![
            question(QuestionType::MultipleChoice, Some("B"), 5.0),
            question(QuestionType::TrueFalse, Some("True"), 3.0),
            question(QuestionType::Numerical, Some("9.81"), 10.0),
            question(QuestionType::Essay, None, 20.0),
            question(QuestionType::MultipleChoice, Some("C"), 5.0),
        ];
        let answers = vec![
            answer(0, " b "),
            answer(1, "true"),
            answer(2, "9.8"),
            answer(3, "Long essay"),
        ];
        let outcome = grade_objective(&questions, &answers);
        assert_eq!(outcome.max_points, 43.0);
        assert_eq!(outcome.score, 18.0);
        assert_eq!(outcome.needs_review, vec![3]);
        let details = outcome.detailed_grading.unwrap();
        assert_eq!(details[4].feedback, "未作答");
    }

    #[test]
    fn test_choice_accepts_option_text_for_letter_key() {
        let q = question(QuestionType::MultipleChoice, Some("B"), 5.0);
        assert!(matches_choice(&q, "B", "4"));
        assert!(!matches_choice(&q, "B", "5"));
    }

    #[test]
    fn test_numerical_tolerance() {
        assert_eq!(matches_numerical("100", "100.9"), Some(true));
        assert_eq!(matches_numerical("100", "101.5"), Some(false));
        assert_eq!(matches_numerical("0", "0"), Some(true));
        assert_eq!(matches_numerical("abc", "1"), None);
    }

    #[tokio::test]
    async fn test_ai_grader_uses_summed_points() {
        let model = Arc::new(ScriptedTextModel::new());
        model.push_response(r#"{"score": 12, "feedback": "Solid"}"#);
        let grader = AiGrader::new(model.clone(), 0.8);
        let questions = vec![
            question(QuestionType::ShortAnswer, None, 10.0),
            question(QuestionType::Essay, None, 5.0),
        ];
        let outcome = grader
            .grade_assignment_submission(&questions, &[answer(0, "x")])
            .await
            .unwrap();
        assert_eq!(outcome.max_points, 15.0);
        assert_eq!(outcome.score, 12.0);
        assert!(model.prompts()[0].contains("total available is 15 points"));
    }
}
