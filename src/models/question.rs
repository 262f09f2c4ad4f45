use phf::phf_map;
use serde::{Deserialize, Serialize};

/// 题型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuestionType {
    MultipleChoice,
    MultipleChoiceMultiple,
    TrueFalse,
    ShortAnswer,
    Essay,
    FillInBlank,
    Numerical,
    Matching,
}

/// 规范题型名称（连字符形式）到题型的映射
static QUESTION_TYPES: phf::Map<&'static str, QuestionType> = phf_map! {
    "multiple-choice" => QuestionType::MultipleChoice,
    "multiple-choice-multiple" => QuestionType::MultipleChoiceMultiple,
    "true-false" => QuestionType::TrueFalse,
    "short-answer" => QuestionType::ShortAnswer,
    "essay" => QuestionType::Essay,
    "fill-in-blank" => QuestionType::FillInBlank,
    "numerical" => QuestionType::Numerical,
    "matching" => QuestionType::Matching,
};

impl QuestionType {
    /// 宽松解析模型返回的题型名
    ///
    /// 下划线/空格形式会先转换为连字符形式，例如 `multiple_choice` → `multiple-choice`
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        QUESTION_TYPES.get(normalized.as_str()).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QuestionType::MultipleChoice => "multiple-choice",
            QuestionType::MultipleChoiceMultiple => "multiple-choice-multiple",
            QuestionType::TrueFalse => "true-false",
            QuestionType::ShortAnswer => "short-answer",
            QuestionType::Essay => "essay",
            QuestionType::FillInBlank => "fill-in-blank",
            QuestionType::Numerical => "numerical",
            QuestionType::Matching => "matching",
        }
    }

    /// 排序用题型优先级，未列出的题型排在最后
    pub fn rank(self) -> u8 {
        match self {
            QuestionType::MultipleChoice => 1,
            QuestionType::Numerical => 2,
            QuestionType::TrueFalse => 3,
            QuestionType::ShortAnswer => 4,
            QuestionType::Essay => 5,
            _ => 6,
        }
    }

    /// 是否可以离线客观评分
    pub fn is_objective(self) -> bool {
        matches!(
            self,
            QuestionType::MultipleChoice | QuestionType::TrueFalse | QuestionType::Numerical
        )
    }
}

impl std::fmt::Display for QuestionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 难度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "easy" => Some(Difficulty::Easy),
            "medium" => Some(Difficulty::Medium),
            "hard" => Some(Difficulty::Hard),
            _ => None,
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            Difficulty::Easy => 1,
            Difficulty::Medium => 2,
            Difficulty::Hard => 3,
        }
    }
}

/// 标准答案：单个或多个
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrectAnswer {
    Single(String),
    Multiple(Vec<String>),
}

impl CorrectAnswer {
    /// 从任意 JSON 值转换，数字/布尔值转为字符串
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;
        match value {
            Value::String(s) if !s.trim().is_empty() => Some(CorrectAnswer::Single(s.trim().to_string())),
            Value::Number(n) => Some(CorrectAnswer::Single(n.to_string())),
            Value::Bool(b) => Some(CorrectAnswer::Single(b.to_string())),
            Value::Array(items) => {
                let answers: Vec<String> = items
                    .iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s.trim().to_string()),
                        Value::Number(n) => Some(n.to_string()),
                        Value::Bool(b) => Some(b.to_string()),
                        _ => None,
                    })
                    .filter(|s| !s.is_empty())
                    .collect();
                (!answers.is_empty()).then_some(CorrectAnswer::Multiple(answers))
            }
            _ => None,
        }
    }

    pub fn as_single(&self) -> Option<&str> {
        match self {
            CorrectAnswer::Single(s) => Some(s),
            CorrectAnswer::Multiple(items) if items.len() == 1 => Some(&items[0]),
            CorrectAnswer::Multiple(_) => None,
        }
    }
}

/// 连线题配对
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingPair {
    pub left: String,
    pub right: String,
}

/// 抽取出的题目
///
/// 由 AI 抽取或启发式抽取批量生成，归属于作业；重新抽取时整体替换
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedQuestion {
    pub id: String,
    pub question: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_answer: Option<CorrectAnswer>,
    /// 分值，恒大于 0
    pub points: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub ai_extracted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_items: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_items: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matching_pairs: Option<Vec<MatchingPair>>,
}

impl ExtractedQuestion {
    /// 分组用的章节名，缺省为 `general`
    pub fn section_key(&self) -> &str {
        self.section.as_deref().unwrap_or(super::DEFAULT_SECTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lenient_translates_underscores() {
        assert_eq!(
            QuestionType::parse_lenient("multiple_choice"),
            Some(QuestionType::MultipleChoice)
        );
        assert_eq!(
            QuestionType::parse_lenient(" True_False "),
            Some(QuestionType::TrueFalse)
        );
        assert_eq!(
            QuestionType::parse_lenient("fill in blank"),
            Some(QuestionType::FillInBlank)
        );
        assert_eq!(QuestionType::parse_lenient("riddle"), None);
    }

    #[test]
    fn test_question_serializes_with_camel_case_fields() {
        let q = ExtractedQuestion {
            id: "extracted_1_0".to_string(),
            question: "2+2?".to_string(),
            question_type: QuestionType::MultipleChoiceMultiple,
            options: None,
            correct_answer: Some(CorrectAnswer::Single("4".to_string())),
            points: 5.0,
            section: None,
            section_title: None,
            difficulty: Some(Difficulty::Easy),
            topic: None,
            ai_extracted: true,
            left_items: None,
            right_items: None,
            matching_pairs: None,
        };
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["type"], "multiple-choice-multiple");
        assert_eq!(json["correctAnswer"], "4");
        assert_eq!(json["aiExtracted"], true);
        assert!(json.get("options").is_none());
    }

    #[test]
    fn test_correct_answer_from_json() {
        let v = serde_json::json!(["A", 2, true]);
        assert_eq!(
            CorrectAnswer::from_json(&v),
            Some(CorrectAnswer::Multiple(vec![
                "A".to_string(),
                "2".to_string(),
                "true".to_string()
            ]))
        );
        assert_eq!(CorrectAnswer::from_json(&serde_json::json!("")), None);
        assert_eq!(CorrectAnswer::from_json(&serde_json::json!(null)), None);
    }
}
