//! Structured answer extraction from free-form model output.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::results::ParsingStatus;

/// Answer keys extracted from a reply plus how they were obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedAnswer {
    pub answer: Vec<String>,
    pub status: ParsingStatus,
}

impl ParsedAnswer {
    fn failed() -> Self {
        Self {
            answer: Vec::new(),
            status: ParsingStatus::ParsingError,
        }
    }
}

/// Extract the `answer` field from a model reply.
///
/// 1. The whole trimmed reply is a JSON object with `answer`: `Success`.
/// 2. Otherwise the last well-formed object with `answer`, scanning opening
///    braces right to left: `RegexExtracted`. Reasoning preambles often quote
///    example objects, so the final one is taken as the answer.
/// 3. Otherwise an empty answer with `ParsingError`.
pub fn parse_answer(raw: &str) -> ParsedAnswer {
    let text = raw.trim();
    if text.is_empty() {
        return ParsedAnswer::failed();
    }

    if let Some(answer) = answer_field(text) {
        return ParsedAnswer {
            answer,
            status: ParsingStatus::Success,
        };
    }

    let opens: Vec<usize> = text.match_indices('{').map(|(i, _)| i).collect();
    for &open in opens.iter().rev() {
        let Some(close) = matching_brace(text, open) else {
            continue;
        };
        if let Some(answer) = answer_field(&text[open..=close]) {
            return ParsedAnswer {
                answer,
                status: ParsingStatus::RegexExtracted,
            };
        }
    }

    ParsedAnswer::failed()
}

/// True iff `answer` is non-empty and every key is one of `choice_keys`.
pub fn is_valid_answer<S: AsRef<str>>(answer: &[String], choice_keys: &[S]) -> bool {
    !answer.is_empty()
        && answer
            .iter()
            .all(|a| choice_keys.iter().any(|k| k.as_ref() == a))
}

fn answer_field(candidate: &str) -> Option<Vec<String>> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let field = value.as_object()?.get("answer")?;
    Some(match field {
        Value::Array(items) => items.iter().map(key_string).collect(),
        Value::Null => Vec::new(),
        Value::String(s) if s.is_empty() => Vec::new(),
        scalar => vec![key_string(scalar)],
    })
}

/// Array elements are kept one for one; non-strings keep their JSON text.
fn key_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Byte offset of the `}` closing the `{` at `open`, skipping braces inside
/// string literals.
fn matching_brace(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, b) in text.as_bytes()[open..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if *b == b'\\' {
                escaped = true;
            } else if *b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}
