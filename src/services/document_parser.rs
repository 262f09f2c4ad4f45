//! 文档解析服务 - 业务能力层
//!
//! 只负责"把字节变成文本"：
//! - PDF：文本 + 页数 + 标题/作者
//! - Word：只抽取正文
//! - 纯文本：按 UTF-8 解码
//!
//! 另外提供文本清洗、可用性校验，以及不依赖 AI 的启发式题目抽取（降级路径）。

use anyhow::{anyhow, Context};
use lopdf::Object;
use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use regex::Regex;
use std::io::{Cursor, Read};
use std::sync::LazyLock;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::error::{AppError, AppResult};
use crate::models::{
    CorrectAnswer, DocumentFormat, DocumentMetadata, ExtractedQuestion, ParseResult,
    QuestionType, ValidationReport, DEFAULT_SECTION, DEFAULT_SECTION_TITLE,
};
use crate::services::question_extractor::{question_id, IdPrefix};

/// 文档最少字符数，低于此值判定为不可用
pub const MIN_DOCUMENT_CHARS: usize = 50;
/// 低于此字符数给出"题目可能很少"的警告
pub const SHORT_DOCUMENT_WARNING_CHARS: usize = 100;
/// 启发式抽取的默认分值
const HEURISTIC_POINTS: f64 = 10.0;

static MULTI_NEWLINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static MULTI_SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" {2,}").unwrap());
static NUMBERED_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+[.)]").unwrap());
static QUESTION_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+[.)]\s+").unwrap());
static OPTION_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Da-d])[.)]\s*(.+)$").unwrap());
static INLINE_OPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)([A-D])[.)]\s+").unwrap());
static ANSWER_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)\b(?:answer|correct|solution)\s*[:：]\s*(.*)$").unwrap()
});
static SECTION_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:section|part)\s+([A-Za-z0-9]+)\b\s*[:：.\-]?\s*(.*)$").unwrap()
});

/// 解析文档
///
/// # 参数
/// - `bytes`: 原始字节
/// - `mime_type`: 声明的 mime 类型
/// - `filename`: 原始文件名（仅用于诊断信息）
///
/// # 错误
/// - 不支持的 mime 类型返回 `UnsupportedFormat`
/// - 底层解析失败返回带文件名的 `Parse`
pub fn parse_document(bytes: &[u8], mime_type: &str, filename: &str) -> AppResult<ParseResult> {
    let format = DocumentFormat::from_mime(mime_type)
        .ok_or_else(|| AppError::unsupported_format(mime_type, filename))?;

    debug!("解析文档 {} ({:?}, {} 字节)", filename, format, bytes.len());

    let result = match format {
        DocumentFormat::Pdf => parse_pdf(bytes),
        DocumentFormat::Word => extract_word_text(bytes).map(|text| ParseResult {
            text,
            metadata: DocumentMetadata::default(),
        }),
        DocumentFormat::PlainText => Ok(ParseResult {
            text: decode_plain_text(bytes),
            metadata: DocumentMetadata::default(),
        }),
    };

    result.map_err(|e| AppError::parse_failed(filename, e))
}

fn decode_plain_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

fn parse_pdf(bytes: &[u8]) -> anyhow::Result<ParseResult> {
    let doc = lopdf::Document::load_mem(bytes).map_err(|e| anyhow!("无法读取PDF: {}", e))?;
    if doc.trailer.get(b"Encrypt").is_ok() {
        anyhow::bail!("PDF 已加密，无法抽取文本");
    }

    let pages = doc.get_pages();
    let mut text = String::new();
    let mut failed_pages = 0usize;
    for page_number in pages.keys() {
        match doc.extract_text(&[*page_number]) {
            Ok(page_text) => {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&page_text);
            }
            Err(e) => {
                warn!("PDF 第 {} 页文本抽取失败: {}", page_number, e);
                failed_pages += 1;
            }
        }
    }
    if !pages.is_empty() && failed_pages == pages.len() {
        anyhow::bail!("PDF 所有页面的文本抽取均失败");
    }

    let (title, author) = pdf_info(&doc);
    Ok(ParseResult {
        text,
        metadata: DocumentMetadata {
            pages: Some(pages.len() as u32),
            title,
            author,
        },
    })
}

/// 读取 PDF Info 字典中的标题和作者
fn pdf_info(doc: &lopdf::Document) -> (Option<String>, Option<String>) {
    let info = match doc.trailer.get(b"Info") {
        Ok(Object::Reference(id)) => doc.get_object(*id).ok(),
        Ok(other) => Some(other),
        Err(_) => None,
    };
    let Some(Object::Dictionary(dict)) = info else {
        return (None, None);
    };
    let field = |key: &[u8]| match dict.get(key) {
        Ok(Object::String(bytes, _)) => {
            let value = decode_pdf_string(bytes);
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        }
        _ => None,
    };
    (field(b"Title"), field(b"Author"))
}

/// PDF 文本字符串：UTF-16BE（带 BOM）或单字节编码
fn decode_pdf_string(bytes: &[u8]) -> String {
    match bytes.strip_prefix(&[0xFE, 0xFF]) {
        Some(rest) => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        None => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// 抽取 Word 文档正文
fn extract_word_text(bytes: &[u8]) -> anyhow::Result<String> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).context("无法打开DOCX压缩包")?;
    let mut document = archive
        .by_name("word/document.xml")
        .context("DOCX 中缺少 word/document.xml")?;

    let mut xml = String::new();
    document
        .read_to_string(&mut xml)
        .context("无法读取DOCX正文XML")?;

    let mut reader = XmlReader::from_str(&xml);
    let mut buf = Vec::new();
    let mut output = String::new();
    let mut in_text_node = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"w:p" => {
                    if !output.is_empty() {
                        output.push_str("\n\n");
                    }
                }
                b"w:tab" => output.push('\t'),
                b"w:br" => output.push('\n'),
                b"w:t" => in_text_node = true,
                _ => {}
            },
            Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"w:p" => {
                    if !output.is_empty() {
                        output.push_str("\n\n");
                    }
                }
                b"w:tab" => output.push('\t'),
                b"w:br" => output.push('\n'),
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_text_node {
                    let value = e.unescape().map_err(|err| anyhow!(err))?.into_owned();
                    output.push_str(&value);
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"w:t" {
                    in_text_node = false;
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(anyhow!("DOCX XML 解析失败: {}", err)),
            _ => {}
        }
        buf.clear();
    }

    Ok(output)
}

/// 清洗文本：统一换行符、3 个以上连续换行压缩为 2 个、连续空格压缩为 1 个、去除首尾空白
///
/// 幂等：`clean_text(&clean_text(x)) == clean_text(x)`
pub fn clean_text(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let collapsed = MULTI_NEWLINES.replace_all(&normalized, "\n\n");
    let collapsed = MULTI_SPACES.replace_all(&collapsed, " ");
    collapsed.trim().to_string()
}

/// 使用默认阈值校验文档
pub fn validate_document(result: &ParseResult) -> ValidationReport {
    validate_document_with(result, MIN_DOCUMENT_CHARS, SHORT_DOCUMENT_WARNING_CHARS)
}

/// 校验文档是否可用于题目抽取
///
/// 长度不足 `min_chars` 判定为不可用；长度不足 `warn_chars`
/// 或没有编号题目标记只给出警告
pub fn validate_document_with(
    result: &ParseResult,
    min_chars: usize,
    warn_chars: usize,
) -> ValidationReport {
    let trimmed = result.text.trim();
    let length = trimmed.chars().count();
    let mut report = ValidationReport {
        is_valid: true,
        ..Default::default()
    };

    if length == 0 {
        report.is_valid = false;
        report.errors.push("文档没有可抽取的文本内容".to_string());
        return report;
    }
    if length < min_chars {
        report.is_valid = false;
        report.errors.push(format!(
            "文档内容过短 ({} 字符，至少需要 {} 字符)",
            length, min_chars
        ));
    }
    if length < warn_chars {
        report
            .warnings
            .push(format!("文档内容较短 ({} 字符)，可抽取的题目可能很少", length));
    }
    if !NUMBERED_MARKER.is_match(trimmed) {
        report
            .warnings
            .push("未检测到编号题目标记（如 1. 或 1)），可抽取的题目可能很少".to_string());
    }
    report
}

/// 启发式抽取题目（离线降级路径，不与 AI 结果混用）
pub fn extract_structured_questions(text: &str) -> Vec<ExtractedQuestion> {
    extract_structured_questions_at(text, chrono::Utc::now().timestamp_millis())
}

/// 同 [`extract_structured_questions`]，使用给定时间戳生成题目 ID
pub fn extract_structured_questions_at(text: &str, timestamp_ms: i64) -> Vec<ExtractedQuestion> {
    let mut questions = Vec::new();
    for block in split_blocks(text) {
        if let Some(mut q) = parse_block(&block) {
            q.id = question_id(IdPrefix::Heuristic, timestamp_ms, questions.len());
            questions.push(q);
        }
    }
    debug!("启发式抽取得到 {} 道题目", questions.len());
    questions
}

struct Block {
    section: Option<(String, String)>,
    lines: Vec<String>,
}

/// 按空行或编号行切分题目块，同时跟踪章节标题
fn split_blocks(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current: Option<Block> = None;
    let mut section: Option<(String, String)> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            blocks.extend(current.take());
            continue;
        }
        if !QUESTION_START.is_match(trimmed) {
            if let Some(caps) = SECTION_HEADER.captures(trimmed) {
                blocks.extend(current.take());
                let key = format!("section_{}", caps[1].to_ascii_lowercase());
                section = Some((key, trimmed.to_string()));
                continue;
            }
        }
        if QUESTION_START.is_match(trimmed) {
            blocks.extend(current.take());
            current = Some(Block {
                section: section.clone(),
                lines: vec![trimmed.to_string()],
            });
        } else if let Some(block) = current.as_mut() {
            block.lines.push(trimmed.to_string());
        }
    }
    blocks.extend(current);
    blocks
}

fn parse_block(block: &Block) -> Option<ExtractedQuestion> {
    let joined = block.lines.join("\n");
    let body = QUESTION_START.replace(&joined, "").into_owned();

    let (body, answer_key) = match find_answer_marker(&body) {
        Some((start, key)) => (body[..start].to_string(), (!key.is_empty()).then_some(key)),
        None => (body, None),
    };

    let (stem, options) = split_line_options(&body)
        .or_else(|| split_inline_options(&body.replace('\n', " ")))
        .unwrap_or_else(|| (body.trim().to_string(), Vec::new()));

    let stem = stem.split_whitespace().collect::<Vec<_>>().join(" ");
    if stem.is_empty() {
        return None;
    }

    let is_choice = options.len() >= 2;
    let correct_answer = answer_key.map(|key| {
        let letter = key.trim_end_matches(['.', ')']).to_ascii_uppercase();
        if is_choice && letter.len() == 1 && matches!(letter.as_str(), "A" | "B" | "C" | "D") {
            CorrectAnswer::Single(letter)
        } else {
            CorrectAnswer::Single(key)
        }
    });
    let (section, section_title) = match &block.section {
        Some((key, title)) => (key.clone(), title.clone()),
        None => (DEFAULT_SECTION.to_string(), DEFAULT_SECTION_TITLE.to_string()),
    };

    Some(ExtractedQuestion {
        id: String::new(),
        question: stem,
        question_type: if is_choice {
            QuestionType::MultipleChoice
        } else {
            QuestionType::ShortAnswer
        },
        options: is_choice.then_some(options),
        correct_answer,
        points: HEURISTIC_POINTS,
        section: Some(section),
        section_title: Some(section_title),
        difficulty: None,
        topic: None,
        ai_extracted: false,
        left_items: None,
        right_items: None,
        matching_pairs: None,
    })
}

/// 取块内最后一个答案标记，返回 (标记起点, 答案文本)
///
/// 标记之后还有选项时视为题干里的措辞，不算答案
fn find_answer_marker(body: &str) -> Option<(usize, String)> {
    let caps = ANSWER_MARKER.captures_iter(body).last()?;
    let whole = caps.get(0)?;
    let rest = &body[whole.end()..];
    if rest
        .lines()
        .any(|l| OPTION_LINE.is_match(l) || INLINE_OPTION.is_match(l))
    {
        return None;
    }
    Some((whole.start(), caps[1].trim().to_string()))
}

/// 每行一个选项的形式
fn split_line_options(body: &str) -> Option<(String, Vec<String>)> {
    let lines: Vec<&str> = body.lines().collect();
    let first = lines.iter().position(|l| OPTION_LINE.is_match(l))?;
    let options: Vec<String> = lines[first..]
        .iter()
        .filter_map(|l| OPTION_LINE.captures(l).map(|c| c[2].trim().to_string()))
        .take(4)
        .collect();
    if options.len() < 2 {
        return None;
    }
    Some((lines[..first].join(" "), options))
}

/// 同一行内 `A. x B. y C. z D. w` 的形式
fn split_inline_options(body: &str) -> Option<(String, Vec<String>)> {
    let mut expected = b'A';
    let mut marks: Vec<(usize, usize)> = Vec::new();
    for caps in INLINE_OPTION.captures_iter(body) {
        let (Some(whole), Some(letter)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if letter.as_str().as_bytes()[0] == expected {
            marks.push((whole.start(), whole.end()));
            expected += 1;
            if expected > b'D' {
                break;
            }
        }
    }
    if marks.len() < 2 {
        return None;
    }
    let stem = body[..marks[0].0].trim().to_string();
    let options = marks
        .iter()
        .enumerate()
        .map(|(i, &(_, end))| {
            let stop = marks.get(i + 1).map(|m| m.0).unwrap_or(body.len());
            body[end..stop].trim().to_string()
        })
        .collect();
    Some((stem, options))
}
