//! Tool-call recovery for models that answer in prose
//!
//! Small local models often describe a tool call as JSON inside their reply
//! instead of using the structured `tool_calls` field. This module extracts
//! those calls, and when no JSON shape is present at all, guesses intent
//! from a few keywords. Results are best effort.

use serde_json::Value;
use tracing::debug;

use crate::tools::registry::ToolRegistry;
use crate::types::ToolCall;

/// Condition under which a keyword rule fires
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Every keyword must appear
    AllOf(Vec<String>),
    /// At least one keyword must appear
    AnyOf(Vec<String>),
}

/// Infers a tool call from keywords in the reply
#[derive(Debug, Clone)]
pub struct KeywordRule {
    pub tool: String,
    pub trigger: Trigger,
    /// Arguments passed to the handler when the rule fires
    pub arguments: String,
}

impl KeywordRule {
    pub fn all_of(tool: &str, keywords: &[&str], arguments: &str) -> Self {
        Self {
            tool: tool.to_string(),
            trigger: Trigger::AllOf(keywords.iter().map(|k| k.to_lowercase()).collect()),
            arguments: arguments.to_string(),
        }
    }

    pub fn any_of(tool: &str, keywords: &[&str], arguments: &str) -> Self {
        Self {
            tool: tool.to_string(),
            trigger: Trigger::AnyOf(keywords.iter().map(|k| k.to_lowercase()).collect()),
            arguments: arguments.to_string(),
        }
    }

    fn matches(&self, words: &[String]) -> bool {
        // "files" counts for "file", "listing" for "list"
        let present = |keyword: &String| words.iter().any(|w| w.starts_with(keyword.as_str()));
        match self.trigger {
            Trigger::AllOf(ref keywords) => keywords.iter().all(present),
            Trigger::AnyOf(ref keywords) => keywords.iter().any(present),
        }
    }
}

fn default_rules() -> Vec<KeywordRule> {
    vec![
        KeywordRule::all_of(
            "write_file",
            &["write", "file"],
            r#"{"path":"output.txt","content":""}"#,
        ),
        KeywordRule::any_of("list_directory", &["list", "directory"], r#"{"path":"."}"#),
        KeywordRule::any_of("get_current_time", &["time", "date"], "{}"),
    ]
}

/// Extracts tool calls from free text
#[derive(Debug, Clone)]
pub struct FallbackParser {
    rules: Vec<KeywordRule>,
}

impl Default for FallbackParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackParser {
    /// Parser with the default keyword rules
    pub fn new() -> Self {
        Self {
            rules: default_rules(),
        }
    }

    /// Parser that only recognizes explicit JSON tool calls
    pub fn without_heuristics() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule(mut self, rule: KeywordRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[KeywordRule] {
        &self.rules
    }

    /// Tool calls to run for `text`, limited to tools present in `registry`
    ///
    /// Keyword rules are consulted only when the text contains no tool-call
    /// JSON at all, registered or not.
    pub fn detect(&self, text: &str, registry: &ToolRegistry) -> Vec<ToolCall> {
        let parsed = parse_json_tool_calls(text);
        if !parsed.is_empty() {
            let calls: Vec<ToolCall> = parsed
                .into_iter()
                .filter(|(name, _)| {
                    let known = registry.contains(name);
                    if !known {
                        debug!(tool = %name, "Ignoring tool call for unregistered tool");
                    }
                    known
                })
                .map(|(name, arguments)| synthesized_call(name, arguments))
                .collect();
            debug!(count = calls.len(), "Recovered tool calls from JSON in content");
            return calls;
        }

        let words = words(text);
        let calls: Vec<ToolCall> = self
            .rules
            .iter()
            .filter(|rule| registry.contains(&rule.tool) && rule.matches(&words))
            .map(|rule| synthesized_call(rule.tool.clone(), rule.arguments.clone()))
            .collect();
        if !calls.is_empty() {
            debug!(count = calls.len(), "Inferred tool calls from keywords");
        }
        calls
    }
}

fn synthesized_call(name: String, arguments: String) -> ToolCall {
    ToolCall::new(format!("fallback_{}", uuid::Uuid::new_v4()), name, arguments)
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Find every `{"name": ..., "arguments": ...}` object in `content`
///
/// Handles raw JSON, fenced code blocks, arrays of calls and JSON embedded
/// in prose. Returns `(name, raw arguments)` pairs in order of appearance.
pub(crate) fn parse_json_tool_calls(content: &str) -> Vec<(String, String)> {
    let mut calls = Vec::new();
    collect_calls(content, &mut calls);
    calls
}

fn collect_calls(content: &str, calls: &mut Vec<(String, String)>) {
    let bytes = content.as_bytes();
    let mut pos = 0;

    while let Some(offset) = content[pos..].find('{') {
        let start = pos + offset;
        let Some(end) = matching_brace(bytes, start) else {
            // Unbalanced brace; later objects may still close
            pos = start + 1;
            continue;
        };

        let object = &content[start..=end];
        match try_parse_tool_call(object) {
            Some(call) => calls.push(call),
            // Not a call itself; a wrapper object may still hold one
            None => collect_calls(&content[start + 1..end], calls),
        }
        pos = end + 1;
    }
}

fn try_parse_tool_call(object: &str) -> Option<(String, String)> {
    let value: Value = serde_json::from_str(object).ok()?;
    let name = value.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }

    let arguments = match value.get("arguments")? {
        // Some models double-encode the arguments
        Value::String(s) => s.clone(),
        Value::Object(_) => raw_arguments(object).unwrap_or_else(|| value["arguments"].to_string()),
        _ => return None,
    };

    Some((name.to_string(), arguments))
}

/// Index of the `}` closing the `{` at `open`, skipping braces inside strings
fn matching_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// The exact source text of the top-level `arguments` object
fn raw_arguments(object: &str) -> Option<String> {
    let bytes = object.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' => depth += 1,
            b'}' => depth = depth.saturating_sub(1),
            b'"' => {
                let end = string_end(bytes, i)?;
                if depth == 1 && &object[i + 1..end] == "arguments" {
                    let rest = object[end + 1..].trim_start();
                    let rest = rest.strip_prefix(':')?.trim_start();
                    let open = object.len() - rest.len();
                    if !rest.starts_with('{') {
                        return None;
                    }
                    let close = matching_brace(bytes, open)?;
                    return Some(object[open..=close].to_string());
                }
                i = end;
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Index of the quote closing the string opened at `open`
fn string_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open + 1) {
        match b {
            _ if escaped => escaped = false,
            b'\\' => escaped = true,
            b'"' => return Some(i),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ParameterSchema;
    use crate::types::ToolDefinition;

    fn registry(names: &[&str]) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for name in names {
            registry.register_fn(
                ToolDefinition::from_schema(*name, "test tool", &ParameterSchema::new()),
                |_args| async { Ok(String::new()) },
            );
        }
        registry
    }

    #[test]
    fn test_parse_json_tool_call_after_stray_brace() {
        let content = r#"Hmm :{ let me check. {"name": "get_current_time", "arguments": {}}"#;
        let calls = parse_json_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "get_current_time");
        assert_eq!(calls[0].1, "{}");
    }

    #[test]
    fn test_stray_brace_keeps_model_arguments() {
        let registry = registry(&["list_directory"]);
        let text = r#"Listing {now: {"name": "list_directory", "arguments": {"path": "src"}}"#;
        let calls = FallbackParser::new().detect(text, &registry);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments(), r#"{"path": "src"}"#);
    }

    #[test]
    fn test_parse_json_tool_call_raw() {
        let content = r#"{"name": "glob", "arguments": {"pattern": "*.rs"}}"#;
        let calls = parse_json_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "glob");
        assert_eq!(calls[0].1, r#"{"pattern": "*.rs"}"#);
    }

    #[test]
    fn test_parse_json_tool_call_markdown() {
        let content = r#"```json
{"name": "read_file", "arguments": {"path": "/tmp/test.txt"}}
```"#;
        let calls = parse_json_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "read_file");
    }

    #[test]
    fn test_parse_json_tool_call_with_text() {
        let content = r#"I'll search for that file.
{"name": "glob", "arguments": {"pattern": "src/**/*.rs"}}
Let me know if you need more."#;
        let calls = parse_json_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, r#"{"pattern": "src/**/*.rs"}"#);
    }

    #[test]
    fn test_parse_json_tool_call_array() {
        let content = r#"[
            {"name": "read_file", "arguments": {"path": "a.txt"}},
            {"name": "read_file", "arguments": {"path": "b.txt"}}
        ]"#;
        let calls = parse_json_tool_calls(content);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].1, r#"{"path": "b.txt"}"#);
    }

    #[test]
    fn test_braces_inside_strings() {
        let content = r#"{"name": "write_file", "arguments": {"path": "a.rs", "content": "fn main() { }"}}"#;
        let calls = parse_json_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, r#"{"path": "a.rs", "content": "fn main() { }"}"#);
    }

    #[test]
    fn test_wrapped_tool_call() {
        let content = r#"{"tool_call": {"name": "get_current_time", "arguments": {}}}"#;
        let calls = parse_json_tool_calls(content);
        assert_eq!(calls, vec![("get_current_time".to_string(), "{}".to_string())]);
    }

    #[test]
    fn test_string_encoded_arguments() {
        let content = r#"{"name": "list_directory", "arguments": "{\"path\": \"src\"}"}"#;
        let calls = parse_json_tool_calls(content);
        assert_eq!(calls[0].1, r#"{"path": "src"}"#);
    }

    #[test]
    fn test_parse_json_tool_call_no_match() {
        assert!(parse_json_tool_calls("Just a regular response with no tool calls.").is_empty());
        assert!(parse_json_tool_calls(r#"{"answer": 42}"#).is_empty());
        assert!(parse_json_tool_calls(r#"{"name": "x", "arguments": {"#).is_empty());
    }

    #[test]
    fn test_detect_filters_unregistered_tools() {
        let parser = FallbackParser::new();
        let registry = registry(&["get_current_time"]);
        let content = r#"{"name": "get_current_time", "arguments": {}} {"name": "launch_rocket", "arguments": {}}"#;

        let calls = parser.detect(content, &registry);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name(), "get_current_time");
        assert!(calls[0].id.starts_with("fallback_"));
    }

    #[test]
    fn test_json_shape_suppresses_heuristics() {
        let parser = FallbackParser::new();
        let registry = registry(&["get_current_time"]);
        let content = r#"What time is it? {"name": "unknown_tool", "arguments": {}}"#;
        assert!(parser.detect(content, &registry).is_empty());
    }

    #[test]
    fn test_keyword_heuristics() {
        let parser = FallbackParser::new();
        let registry = registry(&["write_file", "list_directory", "get_current_time"]);

        let calls = parser.detect("I would list the files in the directory.", &registry);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name(), "list_directory");
        assert_eq!(calls[0].arguments(), r#"{"path":"."}"#);

        let calls = parser.detect("Let me check the current Time.", &registry);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name(), "get_current_time");

        let calls = parser.detect("I will write that into a file, then tell you the date.", &registry);
        let names: Vec<&str> = calls.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["write_file", "get_current_time"]);
    }

    #[test]
    fn test_heuristics_need_registered_handler() {
        let parser = FallbackParser::new();
        let registry = registry(&["write_file"]);
        assert!(parser.detect("What is the date today?", &registry).is_empty());
    }

    #[test]
    fn test_without_heuristics() {
        let parser = FallbackParser::without_heuristics();
        let registry = registry(&["get_current_time"]);
        assert!(parser.detect("What time is it?", &registry).is_empty());

        let custom = parser.with_rule(KeywordRule::any_of("get_current_time", &["clock"], "{}"));
        assert_eq!(custom.detect("Check the clock", &registry).len(), 1);
    }
}
