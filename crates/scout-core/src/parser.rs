//! Response parser: tool-call extraction, boxed answers, refusal and
//! protocol-tag detection.
//!
//! The tag grammar is deliberately parsed with regular expressions, not an
//! XML parser: model output is not well-formed XML and is not expected to
//! be.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A validated tool invocation extracted from model text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub server_name: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// A tool-call block whose arguments did not parse.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseError {}

static TOOL_CALL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?s)<use_mcp_tool>\s*<server_name>(.*?)</server_name>\s*<tool_name>(.*?)</tool_name>\s*<arguments>(.*?)</arguments>\s*</use_mcp_tool>",
    )
    .expect("tool call regex")
});

static THINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("think regex"));

/// Every tag of the tool-use grammar; any occurrence marks a response as
/// protocol-shaped even when no complete block parses.
const PROTOCOL_TAGS: &[&str] = &[
    "<use_mcp_tool>",
    "</use_mcp_tool>",
    "<server_name>",
    "</server_name>",
    "<arguments>",
    "</arguments>",
];

/// Phrases that mark a response as a refusal. Both apostrophe variants are
/// matched; models emit either.
const REFUSAL_PHRASES: &[&str] = &[
    "time constraint",
    "I'm sorry, but I can't",
    "I\u{2019}m sorry, but I can\u{2019}t",
    "I'm sorry, I cannot solve",
    "I\u{2019}m sorry, I cannot solve",
];

/// Extract tool-call blocks in order of appearance.
///
/// Malformed JSON in any block's arguments fails the whole extraction; the
/// orchestrator treats that as a rollback cause.
pub fn parse_tool_calls(text: &str) -> Result<Vec<ToolCall>, ParseError> {
    let mut calls = Vec::new();

    for captures in TOOL_CALL_RE.captures_iter(text) {
        let server_name = captures[1].trim().to_string();
        let tool_name = captures[2].trim().to_string();
        let raw_arguments = captures[3].trim();

        let arguments: Value = serde_json::from_str(raw_arguments).map_err(|e| ParseError {
            message: format!("invalid JSON in <arguments> for tool '{tool_name}': {e}"),
        })?;

        calls.push(ToolCall {
            server_name,
            tool_name,
            arguments,
        });
    }

    Ok(calls)
}

/// Whether the text carries any tag of the tool-use grammar.
pub fn contains_protocol_tags(text: &str) -> bool {
    PROTOCOL_TAGS.iter().any(|tag| text.contains(tag))
}

/// Whether the text matches a known refusal phrase.
pub fn is_refusal(text: &str) -> bool {
    REFUSAL_PHRASES.iter().any(|phrase| text.contains(phrase))
}

/// Extract the content of the first `\boxed{…}` sentinel, brace-balanced.
pub fn extract_boxed_answer(text: &str) -> Option<String> {
    let start = text.find("\\boxed{")?;
    let body = &text[start + "\\boxed{".len()..];

    let mut depth = 1usize;
    for (idx, ch) in body.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let answer = body[..idx].trim();
                    if answer.is_empty() {
                        return None;
                    }
                    return Some(answer.to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Remove complete tool-call blocks. Display layers use this so protocol
/// syntax never leaks into reasoning transcripts.
pub fn remove_tool_call_blocks(text: &str) -> String {
    TOOL_CALL_RE.replace_all(text, "").trim().to_string()
}

/// Remove `<think>…</think>` spans. An unterminated `<think>` drops the rest
/// of the text, which is what display layers want.
pub fn strip_think_tags(text: &str) -> String {
    let stripped = THINK_RE.replace_all(text, "");
    let stripped = stripped.as_ref();
    match stripped.find("<think>") {
        Some(idx) => stripped[..idx].trim().to_string(),
        None => stripped.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CALL: &str = r#"I will search for this.

<use_mcp_tool>
<server_name>search</server_name>
<tool_name>google_search</tool_name>
<arguments>
{"q": "rust async runtime"}
</arguments>
</use_mcp_tool>"#;

    #[test]
    fn extracts_a_single_call() {
        let calls = parse_tool_calls(CALL).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].server_name, "search");
        assert_eq!(calls[0].tool_name, "google_search");
        assert_eq!(calls[0].arguments, json!({"q": "rust async runtime"}));
    }

    #[test]
    fn extracts_multiple_calls_in_order() {
        let text = format!("{CALL}\n{}", CALL.replace("rust async runtime", "tokio"));
        let calls = parse_tool_calls(&text).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments["q"], "rust async runtime");
        assert_eq!(calls[1].arguments["q"], "tokio");
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let text = CALL.replace(r#"{"q": "rust async runtime"}"#, "{not json");
        assert!(parse_tool_calls(&text).is_err());
    }

    #[test]
    fn escaped_quotes_survive() {
        let text = CALL.replace(
            r#"{"q": "rust async runtime"}"#,
            r#"{"q": "say \"hello\""}"#,
        );
        let calls = parse_tool_calls(&text).unwrap();
        assert_eq!(calls[0].arguments["q"], "say \"hello\"");
    }

    #[test]
    fn no_calls_in_plain_text() {
        assert!(parse_tool_calls("The answer is 4.").unwrap().is_empty());
    }

    #[test]
    fn protocol_tags_detected_without_complete_block() {
        assert!(contains_protocol_tags("<use_mcp_tool>\n<server_name>search"));
        assert!(!contains_protocol_tags("plain prose"));
    }

    #[test]
    fn refusal_phrases_detected() {
        assert!(is_refusal("Given the time constraint, I will stop here."));
        assert!(is_refusal("I'm sorry, but I can't help with that."));
        assert!(is_refusal("I\u{2019}m sorry, but I can\u{2019}t continue."));
        assert!(!is_refusal("Here is what I found."));
    }

    #[test]
    fn boxed_answer_balances_braces() {
        assert_eq!(extract_boxed_answer(r"\boxed{4}").as_deref(), Some("4"));
        assert_eq!(
            extract_boxed_answer(r"so \boxed{f(x) = {x + 1}} holds").as_deref(),
            Some("f(x) = {x + 1}")
        );
        assert!(extract_boxed_answer(r"\boxed{unterminated").is_none());
        assert!(extract_boxed_answer("no box here").is_none());
        assert!(extract_boxed_answer(r"\boxed{}").is_none());
    }

    #[test]
    fn tool_call_blocks_are_removable() {
        let cleaned = remove_tool_call_blocks(CALL);
        assert_eq!(cleaned, "I will search for this.");
    }

    #[test]
    fn think_tags_are_stripped() {
        assert_eq!(
            strip_think_tags("<think>internal</think>The answer is 4."),
            "The answer is 4."
        );
        assert_eq!(strip_think_tags("<think>never closed"), "");
        assert_eq!(strip_think_tags("untouched"), "untouched");
    }
}
