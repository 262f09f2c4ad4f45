//! 题目编排 - 业务能力层
//!
//! 按章节分组、组内按难度和题型排序，再按题型轮转穿插，避免同类题目扎堆。
//! 结果只取决于输入顺序：同样的输入总得到同样的输出。

use std::collections::HashMap;
use tracing::debug;

use crate::models::{Difficulty, ExtractedQuestion, QuestionType, DEFAULT_SECTION};

/// 少于等于此数量的分组不做穿插
const INTERLEAVE_MIN_GROUP: usize = 3;

fn difficulty_rank(q: &ExtractedQuestion) -> u8 {
    q.difficulty.unwrap_or(Difficulty::Medium).rank()
}

/// 编排题目顺序，长度不变
pub fn organize(questions: Vec<ExtractedQuestion>) -> Vec<ExtractedQuestion> {
    let total = questions.len();

    let mut section_order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<ExtractedQuestion>> = HashMap::new();
    for q in questions {
        let key = q.section_key().to_string();
        if !groups.contains_key(&key) {
            section_order.push(key.clone());
        }
        groups.entry(key).or_default().push(q);
    }

    section_order.sort_by(|a, b| match (a == DEFAULT_SECTION, b == DEFAULT_SECTION) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.cmp(b),
    });

    let mut organized = Vec::with_capacity(total);
    for section in &section_order {
        let Some(mut group) = groups.remove(section) else {
            continue;
        };
        group.sort_by_key(|q| (difficulty_rank(q), q.question_type.rank()));
        organized.extend(interleave_by_type(group));
    }

    debug!(
        "题目编排完成: {} 道题目，{} 个章节",
        organized.len(),
        section_order.len()
    );
    organized
}

/// 按题型首次出现的顺序轮转取题
fn interleave_by_type(questions: Vec<ExtractedQuestion>) -> Vec<ExtractedQuestion> {
    if questions.len() <= INTERLEAVE_MIN_GROUP {
        return questions;
    }

    let mut type_order: Vec<QuestionType> = Vec::new();
    let mut buckets: HashMap<QuestionType, std::collections::VecDeque<ExtractedQuestion>> =
        HashMap::new();
    let total = questions.len();
    for q in questions {
        if !buckets.contains_key(&q.question_type) {
            type_order.push(q.question_type);
        }
        buckets.entry(q.question_type).or_default().push_back(q);
    }

    let mut distributed = Vec::with_capacity(total);
    while distributed.len() < total {
        for t in &type_order {
            if let Some(q) = buckets.get_mut(t).and_then(|b| b.pop_front()) {
                distributed.push(q);
            }
        }
    }
    distributed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(id: &str, section: Option<&str>, difficulty: Difficulty, t: QuestionType) -> ExtractedQuestion {
        ExtractedQuestion {
            id: id.to_string(),
            question: format!("question {}", id),
            question_type: t,
            options: None,
            correct_answer: None,
            points: 10.0,
            section: section.map(str::to_string),
            section_title: None,
            difficulty: Some(difficulty),
            topic: None,
            ai_extracted: true,
            left_items: None,
            right_items: None,
            matching_pairs: None,
        }
    }

    fn ids(questions: &[ExtractedQuestion]) -> Vec<&str> {
        questions.iter().map(|q| q.id.as_str()).collect()
    }

    fn sample() -> Vec<ExtractedQuestion> {
        use Difficulty::*;
        use QuestionType::*;
        vec![
            q("z1", Some("zoology"), Hard, Essay),
            q("g1", None, Hard, Essay),
            q("a1", Some("algebra"), Easy, ShortAnswer),
            q("g2", Some("general"), Easy, MultipleChoice),
            q("g3", None, Easy, MultipleChoice),
            q("g4", None, Medium, TrueFalse),
            q("a2", Some("algebra"), Easy, MultipleChoice),
            q("g5", None, Easy, Numerical),
        ]
    }

    #[test]
    fn test_general_first_then_alphabetical() {
        let organized = organize(sample());
        assert_eq!(organized.len(), 8);
        let sections: Vec<&str> = organized.iter().map(|q| q.section_key()).collect();
        assert_eq!(
            sections,
            vec!["general", "general", "general", "general", "general", "algebra", "algebra", "zoology"]
        );
    }

    #[test]
    fn test_sort_and_interleave_within_group() {
        let organized = organize(sample());
        // general 组排序后: g2(easy,mc) g3(easy,mc) g5(easy,num) g4(medium,tf) g1(hard,essay)
        // 题型轮转: mc, num, tf, essay, mc
        assert_eq!(&ids(&organized)[..5], &["g2", "g5", "g4", "g1", "g3"]);
        // algebra 组只有两题，只排序不穿插
        assert_eq!(&ids(&organized)[5..7], &["a2", "a1"]);
    }

    #[test]
    fn test_deterministic() {
        let first = organize(sample());
        for _ in 0..5 {
            let again = organize(sample());
            assert_eq!(
                serde_json::to_string(&again).unwrap(),
                serde_json::to_string(&first).unwrap()
            );
        }
    }

    #[test]
    fn test_small_group_untouched_by_interleave() {
        use Difficulty::*;
        use QuestionType::*;
        let input = vec![
            q("1", None, Easy, MultipleChoice),
            q("2", None, Easy, MultipleChoice),
            q("3", None, Easy, Essay),
        ];
        assert_eq!(ids(&organize(input)), vec!["1", "2", "3"]);
    }
}
