//! Testing prompt templates.
//!
//! Templates use `{context}`, `{question}` and `{choices}` placeholders, with
//! `{{`/`}}` for literal braces. Rendering is a single left-to-right pass, so
//! braces inside the substituted context or question text are never
//! re-interpreted.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

const DEFAULT_SYSTEM: &str = "你是一位专业的阅读理解专家。请仔细阅读提供的文本内容，\
并根据文本内容准确回答问题。你的回答必须基于文本内容，不要编造信息。";

const DEFAULT_USER: &str = "请阅读以下文本：\n\n\
{context}\n\n\
---\n\n\
问题：{question}\n\n\
选项：\n\
{choices}\n\n\
请根据文本内容选择正确答案。\n\
要求：\n\
1. 仔细阅读文本，确保答案准确\n\
2. 对于单选题，选择一个最符合文本内容的选项\n\
3. 对于多选题，选择所有符合文本内容的选项\n\
4. 必须以JSON格式输出答案，格式如下：\n\
{{\"answer\": [\"a\"]}}  // 单选题示例\n\
{{\"answer\": [\"a\", \"c\"]}}  // 多选题示例\n\n\
请直接输出JSON格式的答案，不要添加任何其他说明文字。";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub system: String,
    pub user: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM.to_string(),
            user: DEFAULT_USER.to_string(),
        }
    }
}

impl PromptTemplate {
    /// Load a `{"system": ..., "user": ...}` JSON template. Extra keys are ignored.
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let template: Self = serde_json::from_str(&raw)?;
        template.validate()?;
        Ok(template)
    }

    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |message: &str| EngineError::InvalidTemplate {
            message: message.to_string(),
        };
        if self.system.trim().is_empty() {
            return Err(invalid("system prompt is empty"));
        }
        if !self.user.contains("{context}") {
            return Err(invalid("user prompt lacks a {context} placeholder"));
        }
        if !self.user.contains("{question}") {
            return Err(invalid("user prompt lacks a {question} placeholder"));
        }
        Ok(())
    }

    /// Render `(system, user)` for one question.
    pub fn render(
        &self,
        context: &str,
        question: &str,
        choices: &BTreeMap<String, String>,
    ) -> (String, String) {
        let choices = format_choices(choices);
        let lookup = |name: &str| match name {
            "context" => Some(context),
            "question" => Some(question),
            "choices" => Some(choices.as_str()),
            _ => None,
        };
        (substitute(&self.system, &lookup), substitute(&self.user, &lookup))
    }
}

/// One `key. text` line per choice, in key order.
pub fn format_choices(choices: &BTreeMap<String, String>) -> String {
    choices
        .iter()
        .map(|(k, v)| format!("{k}. {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn substitute<'a>(template: &str, lookup: &dyn Fn(&str) -> Option<&'a str>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(i) = rest.find(['{', '}']) {
        out.push_str(&rest[..i]);
        let tail = &rest[i..];

        if tail.starts_with("{{") {
            out.push('{');
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            out.push('}');
            rest = &tail[2..];
        } else if tail.starts_with('{') {
            let replaced = tail[1..]
                .find('}')
                .and_then(|end| lookup(&tail[1..1 + end]).map(|v| (v, end)));
            match replaced {
                Some((value, end)) => {
                    out.push_str(value);
                    rest = &tail[end + 2..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        } else {
            out.push('}');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}
