//! Resilient extraction of structured actions from free-form model text.
//!
//! The pipeline, in order of trust:
//! 1. fenced ```json blocks,
//! 2. a lookahead scan for a plausible `{`/`[` start plus bracket counting
//!    that respects string and escape state,
//! 3. a strict parse, then a repair pass (escape naked quotes inside
//!    `content`/`code` values, escape literal newlines and tabs inside
//!    strings),
//! 4. keyed regex salvage of `tool`/`path`/`steps`/`content`,
//! 5. wrapping recognisable raw source code as a FINAL_ANSWER.
//!
//! For strictly valid JSON the pipeline is the identity.

use regex::Regex;
use serde_json::{Value, json};
use synapse_protocol::ToolAction;
use tracing::debug;

/// Extract the best JSON value from raw model output. Returns an empty
/// object when nothing extractable remains.
pub fn extract_json(raw: &str) -> Value {
    if let Some(fenced) = fenced_json_block(raw)
        && let Ok(value) = serde_json::from_str::<Value>(&fenced)
    {
        return value;
    }

    if let Some((start, open, close)) = find_json_start(raw) {
        let candidate = balanced_slice(raw, start, open, close);

        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            return value;
        }

        let repaired = repair_json(candidate);
        if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
            debug!("repair pass recovered malformed model JSON");
            return value;
        }
    }

    if let Some(value) = keyed_salvage(raw) {
        debug!("keyed salvage recovered a tool call");
        return value;
    }

    fallback(raw)
}

/// The contents of the first ```json fenced block, if any.
fn fenced_json_block(raw: &str) -> Option<String> {
    let fence = raw.find("```json")?;
    let body_start = raw[fence..].find('\n')? + fence + 1;
    let body_end = raw[body_start..].find("```")? + body_start;
    Some(raw[body_start..body_end].to_owned())
}

/// Scan for a `{` or `[` whose next non-space character makes it a
/// plausible JSON start; rejects brace noise in prose or code.
fn find_json_start(raw: &str) -> Option<(usize, u8, u8)> {
    let bytes = raw.as_bytes();
    for (index, &byte) in bytes.iter().enumerate() {
        if byte != b'{' && byte != b'[' {
            continue;
        }
        let mut lookahead = index + 1;
        while lookahead < bytes.len() && bytes[lookahead].is_ascii_whitespace() {
            lookahead += 1;
        }
        let Some(&next) = bytes.get(lookahead) else {
            continue;
        };
        if byte == b'{' && (next == b'"' || next == b'}') {
            return Some((index, b'{', b'}'));
        }
        if byte == b'[' && (next == b'{' || next == b'"' || next == b']' || next.is_ascii_digit())
        {
            return Some((index, b'[', b']'));
        }
    }
    None
}

/// Count brackets from `start`, respecting string and escape state, and
/// return the slice up to the matching close (or the tail when unclosed).
fn balanced_slice(raw: &str, start: usize, open: u8, close: u8) -> &str {
    let bytes = raw.as_bytes();
    let mut balance = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for index in start..bytes.len() {
        let byte = bytes[index];
        if escape {
            escape = false;
            continue;
        }
        match byte {
            b'\\' => escape = true,
            b'"' => in_string = !in_string,
            _ if in_string => {}
            _ if byte == open => balance += 1,
            _ if byte == close => {
                balance -= 1;
                if balance == 0 {
                    return &raw[start..=index];
                }
            }
            _ => {}
        }
    }
    &raw[start..]
}

/// Keys whose string values routinely carry source code and therefore
/// naked quotes.
const CODE_VALUE_KEYS: &[&str] = &["content", "code", "answer"];

/// Two-stage repair: escape literal control characters inside strings,
/// then escape unescaped quotes inside code-bearing values.
fn repair_json(candidate: &str) -> String {
    let control_fixed = escape_control_chars(candidate);
    escape_inner_quotes(&control_fixed)
}

/// Literal newlines/tabs/carriage returns inside string literals become
/// their escape forms.
fn escape_control_chars(candidate: &str) -> String {
    let mut out = String::with_capacity(candidate.len() + 16);
    let mut in_string = false;
    let mut escape = false;

    for ch in candidate.chars() {
        if escape {
            out.push(ch);
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => {
                out.push(ch);
                escape = true;
            }
            '"' => {
                in_string = !in_string;
                out.push(ch);
            }
            '\n' if in_string => out.push_str("\\n"),
            '\t' if in_string => out.push_str("\\t"),
            '\r' if in_string => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out
}

/// For each code-bearing key, rescan its string value and escape any
/// quote that does not terminate it. A quote terminates the value when
/// the next non-space character is `,`, `}` or `]`.
fn escape_inner_quotes(candidate: &str) -> String {
    let mut out = candidate.to_owned();
    for key in CODE_VALUE_KEYS {
        let needle = format!("\"{key}\"");
        let Some(key_pos) = out.find(&needle) else {
            continue;
        };
        let after_key = key_pos + needle.len();
        let Some(colon) = out[after_key..].find(':') else {
            continue;
        };
        let Some(quote_rel) = out[after_key + colon..].find('"') else {
            continue;
        };
        let value_start = after_key + colon + quote_rel + 1;

        let bytes: Vec<char> = out[value_start..].chars().collect();
        let mut fixed = String::new();
        let mut index = 0usize;
        let mut closed = false;
        while index < bytes.len() {
            let ch = bytes[index];
            if ch == '\\' && index + 1 < bytes.len() {
                fixed.push(ch);
                fixed.push(bytes[index + 1]);
                index += 2;
                continue;
            }
            if ch == '"' {
                let mut peek = index + 1;
                while peek < bytes.len() && bytes[peek].is_whitespace() {
                    peek += 1;
                }
                let terminator = peek >= bytes.len()
                    || bytes[peek] == ','
                    || bytes[peek] == '}'
                    || bytes[peek] == ']';
                if terminator {
                    fixed.push('"');
                    fixed.push_str(&bytes[index + 1..].iter().collect::<String>());
                    closed = true;
                    break;
                }
                fixed.push_str("\\\"");
                index += 1;
                continue;
            }
            fixed.push(ch);
            index += 1;
        }
        if closed {
            out = format!("{}{}", &out[..value_start], fixed);
        }
    }
    out
}

/// Last-resort keyed extraction of the fields a tool call needs.
fn keyed_salvage(raw: &str) -> Option<Value> {
    let tool_re = Regex::new(r#""(?:tool|name|function)"\s*:\s*"([^"]+)""#).ok()?;
    let tool = tool_re.captures(raw)?.get(1)?.as_str().to_owned();

    let mut parameters = serde_json::Map::new();

    let path_re = Regex::new(r#""path"\s*:\s*"([^"]*)""#).ok()?;
    if let Some(cap) = path_re.captures(raw) {
        parameters.insert("path".into(), json!(cap[1].to_owned()));
    }

    if let Some(steps) = salvage_steps(raw) {
        parameters.insert("steps".into(), steps);
    }

    if let Some(content) = salvage_content(raw) {
        parameters.insert("content".into(), json!(content));
    }

    Some(json!({"tool": tool, "parameters": Value::Object(parameters)}))
}

/// Bracket-balanced extraction of the `steps` array.
fn salvage_steps(raw: &str) -> Option<Value> {
    let key = raw.find("\"steps\"")?;
    let open = raw[key..].find('[')? + key;
    let slice = balanced_slice(raw, open, b'[', b']');
    serde_json::from_str(slice)
        .or_else(|_| serde_json::from_str(&repair_json(slice)))
        .ok()
}

/// Terminator-aware extraction of the `content` value: everything up to a
/// quote followed by `,`/`}`/`]` (or the end of text).
fn salvage_content(raw: &str) -> Option<String> {
    let key = raw.find("\"content\"")?;
    let colon = raw[key..].find(':')? + key;
    let quote = raw[colon..].find('"')? + colon;
    let value_start = quote + 1;

    let chars: Vec<char> = raw[value_start..].chars().collect();
    let mut out = String::new();
    let mut index = 0usize;
    while index < chars.len() {
        let ch = chars[index];
        if ch == '\\' && index + 1 < chars.len() {
            match chars[index + 1] {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                '"' => out.push('"'),
                '\\' => out.push('\\'),
                other => {
                    out.push('\\');
                    out.push(other);
                }
            }
            index += 2;
            continue;
        }
        if ch == '"' {
            let mut peek = index + 1;
            while peek < chars.len() && chars[peek].is_whitespace() {
                peek += 1;
            }
            if peek >= chars.len() || matches!(chars[peek], ',' | '}' | ']') {
                return Some(out);
            }
        }
        out.push(ch);
        index += 1;
    }
    Some(out)
}

/// Markers that make bare text recognisable as source code.
const CODE_MARKERS: &[&str] = &["def ", "class ", "function ", "import ", "#include"];

/// When all parsing fails but the text clearly carries code, hand it back
/// as a terminal answer instead of dropping the model turn.
fn fallback(raw: &str) -> Value {
    if CODE_MARKERS.iter().any(|marker| raw.contains(marker)) {
        return json!({"tool": "FINAL_ANSWER", "parameters": {"answer": raw}});
    }
    json!({})
}

/// Flatten an extracted value into an ordered action batch.
pub fn as_action_batch(extracted: Value) -> Vec<Value> {
    match extracted {
        Value::Array(items) => items,
        other => vec![other],
    }
}

/// Read the tool name, accepting the documented aliases.
pub fn action_tool_name(action: &Value) -> String {
    for key in ["tool", "name", "function"] {
        if let Some(tool) = action.get(key).and_then(Value::as_str) {
            return tool.to_owned();
        }
    }
    String::new()
}

/// Read the parameter object, accepting aliases; falls back to the action
/// itself minus the control keys.
pub fn action_parameters(action: &Value) -> Value {
    for key in ["parameters", "arguments", "args"] {
        if let Some(params) = action.get(key) {
            if params.is_object() {
                return params.clone();
            }
        }
    }
    let mut residual = action.clone();
    if let Some(map) = residual.as_object_mut() {
        for key in ["tool", "name", "function", "thought"] {
            map.remove(key);
        }
    }
    if residual.is_object() {
        residual
    } else {
        json!({})
    }
}

/// Lift a raw extracted value into the canonical action shape, resolving
/// the tool and parameter aliases. `None` when no tool name is present.
pub fn normalise_action(value: &Value) -> Option<ToolAction> {
    let tool = action_tool_name(value);
    if tool.is_empty() {
        return None;
    }
    Some(ToolAction {
        thought: value
            .get("thought")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        tool,
        parameters: action_parameters(value),
    })
}

/// Fenced code blocks in the model output, used for placeholder
/// injection. ```json fences are not code.
pub fn extract_code_blocks(raw: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut cursor = 0usize;
    while let Some(rel) = raw[cursor..].find("```") {
        let fence = cursor + rel;
        let Some(line_end) = raw[fence..].find('\n') else {
            break;
        };
        let info = raw[fence + 3..fence + line_end].trim();
        let body_start = fence + line_end + 1;
        let Some(close_rel) = raw[body_start..].find("```") else {
            break;
        };
        let body_end = body_start + close_rel;
        if info != "json" {
            let body = raw[body_start..body_end].trim_matches('\n');
            if !body.trim().is_empty() {
                blocks.push(body.to_owned());
            }
        }
        cursor = body_end + 3;
    }

    if blocks.is_empty()
        && let Some(recovered) = bare_code_before_json(raw)
    {
        blocks.push(recovered);
    }
    blocks
}

/// Smart split: code the model wrote above a JSON array without fencing
/// it. Only recognised when the pre-JSON text carries code markers.
fn bare_code_before_json(raw: &str) -> Option<String> {
    let (start, open, _) = find_json_start(raw)?;
    if open != b'[' || start <= 10 {
        return None;
    }
    let pre = &raw[..start];
    if !pre.contains("import ") && !pre.contains("def ") {
        return None;
    }
    let pre = match pre.find("Python\n") {
        Some(marker) => &pre[marker + 7..],
        None => pre,
    };
    let trimmed = pre.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

/// Replace `__CODE_BLOCK_n__` placeholders (and close variants) inside a
/// params object's `content` with the captured block.
pub fn inject_code_blocks(params: &mut Value, blocks: &[String]) {
    let Some(content) = params.get("content").and_then(Value::as_str) else {
        return;
    };
    let placeholder = Regex::new(r"(?:__)?CODE_BLOCK_(\d+)(?:__)?").ok();
    if let Some(re) = placeholder
        && let Some(cap) = re.captures(content)
        && let Ok(index) = cap[1].parse::<usize>()
        && let Some(block) = blocks.get(index)
    {
        params["content"] = json!(block.clone());
        return;
    }
    // One captured block and a stub content: assume the block was meant.
    if blocks.len() == 1 && (content.contains("CODE_BLOCK") || content.len() < 20) {
        params["content"] = json!(blocks[0].clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_json_object_is_identity() {
        let value = json!({"thought": "t", "tool": "read_file", "parameters": {"path": "a.py"}});
        let raw = serde_json::to_string(&value).unwrap();
        assert_eq!(extract_json(&raw), value);
    }

    #[test]
    fn strict_json_array_is_identity() {
        let value = json!([
            {"tool": "apply_edit", "parameters": {"path": "a.py", "content": "x = 1\n"}},
            {"tool": "FINAL_ANSWER", "parameters": {"answer": "done"}}
        ]);
        let raw = serde_json::to_string(&value).unwrap();
        assert_eq!(extract_json(&raw), value);
    }

    #[test]
    fn fenced_block_wins_over_surrounding_prose() {
        let raw = "Here is my plan { not json }:\n```json\n{\"tool\": \"list_dir\", \"parameters\": {\"path\": \"src\"}}\n```\nDone.";
        let value = extract_json(raw);
        assert_eq!(value["tool"], "list_dir");
    }

    #[test]
    fn prose_braces_are_skipped_by_lookahead() {
        let raw = "I think {maybe} we should run: {\"tool\": \"list_dir\", \"parameters\": {\"path\": \"src\"}}";
        let value = extract_json(raw);
        assert_eq!(value["tool"], "list_dir");
    }

    #[test]
    fn bracket_counting_ignores_braces_in_strings() {
        let raw = r#"{"tool": "apply_edit", "parameters": {"content": "if x { return; }"}}"#;
        let value = extract_json(raw);
        assert_eq!(value["parameters"]["content"], "if x { return; }");
    }

    #[test]
    fn literal_newlines_in_strings_are_repaired() {
        let raw = "{\"tool\": \"apply_edit\", \"parameters\": {\"path\": \"a.py\", \"content\": \"def foo():\n    return 1\n\"}}";
        let value = extract_json(raw);
        assert_eq!(
            value["parameters"]["content"],
            "def foo():\n    return 1\n"
        );
    }

    #[test]
    fn naked_quotes_in_content_are_repaired() {
        let raw = r#"{"tool": "apply_edit", "parameters": {"path": "a.py", "content": "print("hi")"}}"#;
        let value = extract_json(raw);
        assert_eq!(value["parameters"]["content"], "print(\"hi\")");
    }

    #[test]
    fn keyed_salvage_recovers_tool_and_path() {
        // Hopelessly broken structure, but the keys survive.
        let raw = r#"oops "tool": "read_file" and "path": "src/x.py" trailing"#;
        let value = extract_json(raw);
        assert_eq!(value["tool"], "read_file");
        assert_eq!(value["parameters"]["path"], "src/x.py");
    }

    #[test]
    fn raw_code_wraps_into_final_answer() {
        let raw = "def foo():\n    return 42\n";
        let value = extract_json(raw);
        assert_eq!(value["tool"], "FINAL_ANSWER");
        assert!(
            value["parameters"]["answer"]
                .as_str()
                .unwrap()
                .contains("def foo")
        );
    }

    #[test]
    fn hopeless_text_yields_empty_object() {
        let value = extract_json("I will think about it.");
        assert_eq!(value, json!({}));
    }

    #[test]
    fn action_aliases_are_accepted() {
        let action = json!({"name": "read_file", "arguments": {"path": "a.py"}});
        assert_eq!(action_tool_name(&action), "read_file");
        assert_eq!(action_parameters(&action)["path"], "a.py");

        let action = json!({"function": "list_dir", "args": {"path": "."}});
        assert_eq!(action_tool_name(&action), "list_dir");
        assert_eq!(action_parameters(&action)["path"], ".");
    }

    #[test]
    fn flat_action_params_exclude_control_keys() {
        let action = json!({"tool": "read_file", "thought": "look", "path": "a.py"});
        let params = action_parameters(&action);
        assert_eq!(params["path"], "a.py");
        assert!(params.get("tool").is_none());
        assert!(params.get("thought").is_none());
    }

    #[test]
    fn batch_flattening() {
        assert_eq!(as_action_batch(json!([{"a": 1}, {"b": 2}])).len(), 2);
        assert_eq!(as_action_batch(json!({"a": 1})).len(), 1);
    }

    #[test]
    fn code_blocks_are_captured_and_json_fences_skipped() {
        let raw = "```python\ndef foo():\n    return 1\n```\n```json\n{\"tool\": \"x\"}\n```";
        let blocks = extract_code_blocks(raw);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].contains("def foo"));
    }

    #[test]
    fn bare_code_before_json_is_recovered() {
        let raw = "import os\ndef foo():\n    return os.name\n\n[{\"tool\": \"apply_edit\", \"parameters\": {\"path\": \"a.py\", \"content\": \"__CODE_BLOCK_0__\"}}]";
        let blocks = extract_code_blocks(raw);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].starts_with("import os"));
    }

    #[test]
    fn placeholder_injection() {
        let blocks = vec!["def foo():\n    return 1".to_owned()];
        let mut params = json!({"path": "a.py", "content": "__CODE_BLOCK_0__"});
        inject_code_blocks(&mut params, &blocks);
        assert_eq!(params["content"], "def foo():\n    return 1");

        // Single-block fallback for stub content.
        let mut params = json!({"path": "a.py", "content": "see above"});
        inject_code_blocks(&mut params, &blocks);
        assert_eq!(params["content"], "def foo():\n    return 1");
    }

    #[test]
    fn extractor_is_idempotent_on_reserialised_output() {
        let raw = "Some prose {\"tool\": \"read_file\", \"parameters\": {\"path\": \"a.py\"}} more prose";
        let first = extract_json(raw);
        let second = extract_json(&serde_json::to_string(&first).unwrap());
        assert_eq!(first, second);
    }
}
