//! Recovers tool calls from raw model output.
//!
//! Recognized shapes, in any mix and surrounded by arbitrary prose:
//! - JSON objects (or arrays of them) carrying `name` plus `arguments`/`parameters`,
//!   bare or wrapped in `<tool_call>…</tool_call>`, `<tool_call={…}>`, `[TOOL_CALLS]`
//!   or a fenced code block; OpenAI-style `{"function": {…}}` and `{"tool_calls": […]}`
//! - `tool_call: name(args)` / `function_call: name(args)` with JSON or keyword arguments
//! - `<function=name>{…}</function>`
//!
//! Truncated JSON is closed before parsing. Fragments that still do not parse are
//! skipped; extraction never fails.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::session::{ModelOutput, NativeCall};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Provenance {
    /// Byte range of the fragment in the raw output.
    Text { start: usize, end: usize, raw: String },
    /// Position in the server's structured `tool_calls` list.
    Native { index: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallAttempt {
    pub name: String,
    pub arguments: Map<String, Value>,
    pub provenance: Provenance,
}

static RE_CALL_SYNTAX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:tool_call|function_call)\s*:\s*([A-Za-z_][\w.\-]*)\s*\(").unwrap()
});

static RE_FUNCTION_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<function=([^>\s]+)>(.*?)(?:</function>|\z)").unwrap());

static RE_THINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?(?:</think>|\z)").unwrap());

// Text immediately before a JSON fragment that marks it as a tool call even
// when the payload carries no arguments.
const CALL_MARKERS: &[&str] = &["<tool_call>", "<tool_call=", "[TOOL_CALLS]", "```json", "<|python_tag|>"];

const ARGUMENT_KEYS: &[&str] = &["arguments", "parameters", "args"];

#[derive(Debug)]
struct Candidate {
    start: usize,
    end: usize,
    calls: Vec<(String, Map<String, Value>)>,
}

/// Parses free text into tool call attempts in order of appearance.
pub fn extract(raw: &str) -> Vec<ToolCallAttempt> {
    let hidden: Vec<(usize, usize)> = RE_THINK
        .find_iter(raw)
        .map(|found| (found.start(), found.end()))
        .collect();

    let mut candidates = Vec::new();
    candidates.extend(call_syntax_candidates(raw));
    candidates.extend(function_tag_candidates(raw));
    candidates.extend(json_candidates(raw));
    candidates.retain(|candidate| {
        !hidden
            .iter()
            .any(|(start, end)| candidate.start >= *start && candidate.start < *end)
    });
    candidates.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

    let mut attempts = Vec::new();
    let mut cursor = 0usize;
    for candidate in candidates {
        if candidate.start < cursor {
            debug!(
                start = candidate.start,
                end = candidate.end,
                "ambiguous extraction: fragment overlaps an earlier tool call, skipping"
            );
            continue;
        }
        cursor = candidate.end;
        let fragment = &raw[candidate.start..candidate.end];
        for (name, arguments) in candidate.calls {
            attempts.push(ToolCallAttempt {
                name,
                arguments,
                provenance: Provenance::Text {
                    start: candidate.start,
                    end: candidate.end,
                    raw: fragment.to_string(),
                },
            });
        }
    }
    attempts
}

/// Structured calls win over text parsing; free text is only parsed when the
/// server returned no native calls.
pub fn extract_output(output: &ModelOutput) -> Vec<ToolCallAttempt> {
    match output {
        ModelOutput::Native { content, calls } if calls.is_empty() => {
            extract(content.as_deref().unwrap_or_default())
        }
        ModelOutput::Native { calls, .. } => calls
            .iter()
            .enumerate()
            .map(|(index, call)| native_attempt(index, call))
            .collect(),
        ModelOutput::Text { content } => extract(content),
    }
}

fn native_attempt(index: usize, call: &NativeCall) -> ToolCallAttempt {
    ToolCallAttempt {
        name: call.name.clone(),
        arguments: argument_map(&call.arguments),
        provenance: Provenance::Native { index },
    }
}

fn argument_map(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        Value::String(text) => match parse_lenient(text) {
            Some(Value::Object(map)) => map,
            _ => {
                debug!(arguments = %text, "tool call arguments are not a JSON object");
                Map::new()
            }
        },
        Value::Null => Map::new(),
        other => {
            debug!(arguments = %other, "tool call arguments are not a JSON object");
            Map::new()
        }
    }
}

fn json_candidates(raw: &str) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for (from, to) in tag_segments(raw) {
        let mut cursor = from;
        while let Some((start, end, closed)) = json_span(raw, cursor, to) {
            match parse_lenient(&raw[start..end]) {
                Some(value) => {
                    let lenient = CALL_MARKERS
                        .iter()
                        .any(|marker| raw[..start].trim_end().ends_with(marker));
                    let mut calls = Vec::new();
                    collect_calls(&value, lenient, &mut calls);
                    if !calls.is_empty() {
                        candidates.push(Candidate { start, end, calls });
                        cursor = end;
                    } else if closed {
                        cursor = end;
                    } else {
                        cursor = start + 1;
                    }
                }
                // A stray bracket in prose; objects nested behind it are
                // still top-level candidates.
                None => cursor = start + 1,
            }
        }
    }
    candidates
}

/// Regions between `<tool_call>` / `</tool_call>` delimiters. JSON spans never
/// cross a delimiter, so an unbalanced block cannot swallow the next one.
fn tag_segments(raw: &str) -> Vec<(usize, usize)> {
    let mut delimiters: Vec<(usize, usize)> = ["<tool_call>", "</tool_call>"]
        .iter()
        .flat_map(|tag| {
            raw.match_indices(*tag)
                .map(|(index, found)| (index, index + found.len()))
        })
        .collect();
    delimiters.sort_unstable();

    let mut segments = Vec::with_capacity(delimiters.len() + 1);
    let mut from = 0usize;
    for (start, end) in delimiters {
        if start > from {
            segments.push((from, start));
        }
        from = end;
    }
    if from < raw.len() {
        segments.push((from, raw.len()));
    }
    segments
}

fn collect_calls(value: &Value, lenient: bool, calls: &mut Vec<(String, Map<String, Value>)>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_calls(item, lenient, calls);
            }
        }
        Value::Object(map) => {
            if let Some(Value::Array(nested)) = map.get("tool_calls") {
                for item in nested {
                    collect_calls(item, true, calls);
                }
                return;
            }
            if let Some(function @ Value::Object(_)) = map.get("function") {
                collect_calls(function, true, calls);
                return;
            }
            let Some(Value::String(name)) = map.get("name") else {
                return;
            };
            let arguments = ARGUMENT_KEYS.iter().find_map(|key| map.get(*key));
            match arguments {
                Some(arguments) => calls.push((name.clone(), argument_map(arguments))),
                None if lenient => calls.push((name.clone(), Map::new())),
                None => {}
            }
        }
        _ => {}
    }
}

fn call_syntax_candidates(raw: &str) -> Vec<Candidate> {
    RE_CALL_SYNTAX
        .captures_iter(raw)
        .filter_map(|captures| {
            let whole = captures.get(0)?;
            let name = captures.get(1)?.as_str().to_string();
            let args_start = whole.end();
            let (args_end, end) = match closing_paren(&raw[args_start..]) {
                Some(offset) => (args_start + offset, args_start + offset + 1),
                None => {
                    let line_end = raw[args_start..]
                        .find('\n')
                        .map_or(raw.len(), |offset| args_start + offset);
                    (line_end, line_end)
                }
            };
            let arguments = parse_call_arguments(&raw[args_start..args_end])?;
            Some(Candidate {
                start: whole.start(),
                end,
                calls: vec![(name, arguments)],
            })
        })
        .collect()
}

fn function_tag_candidates(raw: &str) -> Vec<Candidate> {
    RE_FUNCTION_TAG
        .captures_iter(raw)
        .filter_map(|captures| {
            let whole = captures.get(0)?;
            let name = captures.get(1)?.as_str().to_string();
            let body = captures.get(2).map_or("", |body| body.as_str()).trim();
            let arguments = if body.is_empty() {
                Map::new()
            } else {
                match parse_lenient(body)? {
                    Value::Object(map) => map,
                    _ => return None,
                }
            };
            Some(Candidate {
                start: whole.start(),
                end: whole.end(),
                calls: vec![(name, arguments)],
            })
        })
        .collect()
}

/// Byte offset of the `)` closing an argument list that has already been opened.
fn closing_paren(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (index, ch) in text.char_indices() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '(' | '{' | '[' => depth += 1,
            ')' if depth == 0 => return Some(index),
            ')' | '}' | ']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    None
}

fn parse_call_arguments(text: &str) -> Option<Map<String, Value>> {
    let text = text.trim();
    if text.is_empty() {
        return Some(Map::new());
    }
    if text.starts_with('{') {
        return match parse_lenient(text)? {
            Value::Object(map) => Some(map),
            _ => None,
        };
    }

    let mut arguments = Map::new();
    for part in split_top_level(text) {
        let Some((key, value)) = part.split_once('=') else {
            debug!(fragment = part, "positional argument in call syntax, skipping");
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        arguments.insert(key.to_string(), keyword_value(value.trim()));
    }
    if arguments.is_empty() {
        None
    } else {
        Some(arguments)
    }
}

fn keyword_value(text: &str) -> Value {
    if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') {
        return Value::String(text[1..text.len() - 1].to_string());
    }
    match text {
        "True" => return Value::Bool(true),
        "False" => return Value::Bool(false),
        "None" => return Value::Null,
        _ => {}
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.trim_matches('"').to_string()))
}

fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut last = 0usize;
    for (index, ch) in text.char_indices() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '(' | '{' | '[' => depth += 1,
            ')' | '}' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&text[last..index]);
                last = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[last..]);
    parts.into_iter().filter(|part| !part.trim().is_empty()).collect()
}

/// First `{…}` / `[…]` region in `content[from..to]`, with whether it closed.
/// A region still open at `to` is returned up to `to` so truncated output can
/// be repaired.
fn json_span(content: &str, from: usize, to: usize) -> Option<(usize, usize, bool)> {
    let bytes = &content.as_bytes()[..to];
    let start = from + bytes[from..].iter().position(|b| matches!(b, b'{' | b'['))?;
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_str {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_str = false;
            }
            continue;
        }

        match b {
            b'"' => in_str = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some((start, i + 1, true));
                }
            }
            _ => {}
        }
    }
    Some((start, to, false))
}

/// Parses JSON, closing unterminated strings and brackets if needed. When the
/// fragment ends mid-member, trailing members are dropped until it parses.
fn parse_lenient(fragment: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(fragment) {
        return Some(value);
    }

    let mut candidate = fragment.trim_end();
    for _ in 0..8 {
        let (closed, last_comma) = close_fragment(candidate);
        if let Ok(value) = serde_json::from_str(&closed) {
            return Some(value);
        }
        candidate = &candidate[..last_comma?];
    }
    None
}

fn close_fragment(fragment: &str) -> (String, Option<usize>) {
    let mut stack = Vec::new();
    let mut in_str = false;
    let mut escaped = false;
    let mut last_comma = None;

    for (index, ch) in fragment.char_indices() {
        if in_str {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_str = false;
            }
            continue;
        }
        match ch {
            '"' => in_str = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            ',' => last_comma = Some(index),
            _ => {}
        }
    }

    let mut closed = fragment.to_string();
    if escaped {
        closed.pop();
    }
    if in_str {
        closed.push('"');
    }
    let trimmed_len = closed.trim_end().len();
    closed.truncate(trimmed_len);
    if closed.ends_with(',') {
        closed.pop();
    }
    if closed.ends_with(':') {
        closed.push_str("null");
    }
    while let Some(closer) = stack.pop() {
        closed.push(closer);
    }
    (closed, last_comma)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(attempts: &[ToolCallAttempt]) -> Vec<&str> {
        attempts.iter().map(|attempt| attempt.name.as_str()).collect()
    }

    #[test]
    fn parses_tool_call_tag_with_equals() {
        let raw = r#"<tool_call={"name": "get_weather", "arguments": {"location": "Tokyo"}}>"#;
        let attempts = extract(raw);
        assert_eq!(names(&attempts), vec!["get_weather"]);
        assert_eq!(attempts[0].arguments["location"], "Tokyo");
        match &attempts[0].provenance {
            Provenance::Text { start, end, raw: fragment } => {
                assert_eq!(*start, "<tool_call=".len());
                assert_eq!(&raw[*start..*end], fragment);
            }
            other => panic!("unexpected provenance {other:?}"),
        }
    }

    #[test]
    fn parses_hermes_blocks_in_order() {
        let raw = "Sure, checking both.\n<tool_call>\n{\"name\": \"get_weather\", \"arguments\": {\"location\": \"Paris\"}}\n</tool_call>\n<tool_call>\n{\"name\": \"get_weather\", \"arguments\": {\"location\": \"London\"}}\n</tool_call>";
        let attempts = extract(raw);
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].arguments["location"], "Paris");
        assert_eq!(attempts[1].arguments["location"], "London");
    }

    #[test]
    fn parses_llama_parameters_and_fenced_json() {
        let raw = "```json\n{\"name\": \"calculate\", \"parameters\": {\"expression\": \"15 * 7\"}}\n```";
        let attempts = extract(raw);
        assert_eq!(names(&attempts), vec!["calculate"]);
        assert_eq!(attempts[0].arguments["expression"], "15 * 7");
    }

    #[test]
    fn parses_arrays_and_openai_shapes() {
        let raw = r#"[TOOL_CALLS] [{"name": "search_web", "arguments": {"query": "AI"}}, {"type": "function", "function": {"name": "get_current_time", "arguments": "{}"}}]"#;
        let attempts = extract(raw);
        assert_eq!(names(&attempts), vec!["search_web", "get_current_time"]);
        assert!(attempts[1].arguments.is_empty());
    }

    #[test]
    fn parses_call_syntax_with_json_and_keywords() {
        let raw = "tool_call: get_weather({\"location\": \"Paris\", \"unit\": \"fahrenheit\"})\nthen function_call: search_web(query='latest news', num_results=3)";
        let attempts = extract(raw);
        assert_eq!(names(&attempts), vec!["get_weather", "search_web"]);
        assert_eq!(attempts[0].arguments["unit"], "fahrenheit");
        assert_eq!(attempts[1].arguments["query"], "latest news");
        assert_eq!(attempts[1].arguments["num_results"], 3);
    }

    #[test]
    fn parses_function_tags() {
        let raw = "<function=get_weather>{\"location\": \"Berlin\"}</function>";
        let attempts = extract(raw);
        assert_eq!(names(&attempts), vec!["get_weather"]);
        assert_eq!(attempts[0].arguments["location"], "Berlin");
    }

    #[test]
    fn recovers_truncated_json() {
        let raw = "<tool_call>{\"name\": \"get_weather\", \"arguments\": {\"location\": \"New York Ci";
        let attempts = extract(raw);
        assert_eq!(names(&attempts), vec!["get_weather"]);
        assert_eq!(attempts[0].arguments["location"], "New York Ci");

        let cut_in_key = "{\"name\": \"get_weather\", \"arguments\": {\"location\": \"Oslo\", \"uni";
        let attempts = extract(cut_in_key);
        assert_eq!(attempts[0].arguments, json!({"location": "Oslo"}).as_object().unwrap().clone());
    }

    #[test]
    fn unbalanced_block_does_not_hide_the_next_call() {
        let raw = "<tool_call>{\"name\": \"get_weather\", \"arguments\": {\"location\": \"Paris\"}</tool_call>\n<tool_call>{\"name\": \"get_time\", \"arguments\": {\"tz\": \"UTC\"}}</tool_call>";
        let attempts = extract(raw);
        assert_eq!(names(&attempts), vec!["get_weather", "get_time"]);
        assert_eq!(attempts[0].arguments["location"], "Paris");
        assert_eq!(attempts[1].arguments["tz"], "UTC");
    }

    #[test]
    fn stray_bracket_in_prose_is_skipped() {
        let raw = "Results [pending. <tool_call>{\"name\": \"get_weather\", \"arguments\": {\"location\": \"Boston\"}}</tool_call>";
        let attempts = extract(raw);
        assert_eq!(names(&attempts), vec!["get_weather"]);
        assert_eq!(attempts[0].arguments["location"], "Boston");

        let untagged = "Checking {maybe: {\"name\": \"search_web\", \"arguments\": {\"query\": \"rust\"}} and {\"name\": \"get_time\", \"arguments\": {}}";
        assert_eq!(names(&extract(untagged)), vec!["search_web", "get_time"]);
    }

    #[test]
    fn ignores_prose_and_unrelated_json() {
        assert!(extract("The weather in Tokyo is sunny {mostly}.").is_empty());
        assert!(extract(r#"Result: {"temperature": 21, "name": "Tokyo"}"#).is_empty());
        assert!(extract("").is_empty());
    }

    #[test]
    fn skips_reasoning_blocks() {
        let raw = "<think>maybe {\"name\": \"search_web\", \"arguments\": {}}</think>{\"name\": \"get_weather\", \"arguments\": {\"location\": \"Kyoto\"}}";
        assert_eq!(names(&extract(raw)), vec!["get_weather"]);
    }

    #[test]
    fn native_calls_take_precedence() {
        let output = ModelOutput::Native {
            content: Some(r#"{"name": "search_web", "arguments": {}}"#.to_string()),
            calls: vec![NativeCall {
                name: "get_weather".to_string(),
                arguments: json!("{\"location\": \"Kyoto\"}"),
            }],
        };
        let attempts = extract_output(&output);
        assert_eq!(names(&attempts), vec!["get_weather"]);
        assert_eq!(attempts[0].arguments["location"], "Kyoto");
        assert_eq!(attempts[0].provenance, Provenance::Native { index: 0 });
    }
}
