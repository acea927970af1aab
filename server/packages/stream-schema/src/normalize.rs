//! Canonical shape for tool output, whichever backend produced it.
//!
//! Backends hand tool results over as plain result objects, as wrappers whose
//! `content` is a JSON string or nested object, as content-block arrays, or as
//! bare JSON strings. Everything downstream of this module only ever sees the
//! flat object returned by [`extract`].

use serde_json::{Map, Value};

const MAX_UNWRAP_DEPTH: usize = 8;

const FILE_WRITE_TOOLS: &[&str] = &["write_file", "create_file"];
const FILE_EDIT_TOOLS: &[&str] = &["edit_file"];

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedToolResult {
    pub tool_name: String,
    pub tool_id: String,
    pub output: Map<String, Value>,
    pub is_error: bool,
}

impl NormalizedToolResult {
    pub fn new(tool_id: &str, tool_name: &str, raw: &Value, flagged_error: bool) -> Self {
        let output = extract(raw);
        let is_error = flagged_error || output_is_error(&output);
        Self {
            tool_name: tool_name.to_string(),
            tool_id: tool_id.to_string(),
            output,
            is_error,
        }
    }

    /// Path written by a successful file mutation tool, if this was one.
    ///
    /// Falls back to the `path`/`file_path` of the tool input when the output
    /// does not echo it.
    pub fn modified_path(&self, input: Option<&Value>) -> Option<FileMutation> {
        if self.is_error {
            return None;
        }
        let created = FILE_WRITE_TOOLS.contains(&self.tool_name.as_str());
        if !created && !FILE_EDIT_TOOLS.contains(&self.tool_name.as_str()) {
            return None;
        }
        let path = self
            .output
            .get("path")
            .and_then(Value::as_str)
            .or_else(|| {
                input.and_then(|input| {
                    input
                        .get("path")
                        .or_else(|| input.get("file_path"))
                        .and_then(Value::as_str)
                })
            })
            .filter(|path| !path.trim().is_empty())?;
        Some(FileMutation {
            path: path.to_string(),
            created,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMutation {
    pub path: String,
    /// The tool writes whole files (`write_file`, `create_file`) rather than
    /// editing in place.
    pub created: bool,
}

/// Flattens raw tool output into a single JSON object.
pub fn extract(raw: &Value) -> Map<String, Value> {
    extract_at_depth(raw, 0)
}

fn extract_at_depth(raw: &Value, depth: usize) -> Map<String, Value> {
    if depth > MAX_UNWRAP_DEPTH {
        return raw_content(raw);
    }
    match raw {
        Value::Object(map) => {
            if let Some(content) = map.get("content") {
                match content {
                    Value::String(text) => return extract_string(text, depth + 1),
                    Value::Object(_) => return extract_at_depth(content, depth + 1),
                    Value::Array(blocks) => {
                        if let Some(text) = join_text_blocks(blocks) {
                            return extract_string(&text, depth + 1);
                        }
                    }
                    _ => {}
                }
            }
            map.clone()
        }
        Value::String(text) => extract_string(text, depth + 1),
        _ => Map::new(),
    }
}

fn extract_string(text: &str, depth: usize) -> Map<String, Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(parsed @ Value::Object(_)) => extract_at_depth(&parsed, depth),
        Ok(Value::String(inner)) if depth <= MAX_UNWRAP_DEPTH => extract_string(&inner, depth + 1),
        _ => raw_content(&Value::String(text.to_string())),
    }
}

fn raw_content(value: &Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("rawContent".to_string(), value.clone());
    map
}

fn join_text_blocks(blocks: &[Value]) -> Option<String> {
    let texts: Vec<&str> = blocks
        .iter()
        .filter_map(|block| match block {
            Value::String(text) => Some(text.as_str()),
            Value::Object(_) => block.get("text").and_then(Value::as_str),
            _ => None,
        })
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join(""))
    }
}

fn output_is_error(output: &Map<String, Value>) -> bool {
    if output.get("success").and_then(Value::as_bool) == Some(false) {
        return true;
    }
    matches!(output.get("error"), Some(value) if !value.is_null() && value != &Value::Bool(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_encoded_content_round_trips() {
        let inner = json!({ "success": true, "path": "src/app.py", "bytes": 42 });
        let wrapped = json!({ "content": inner.to_string() });
        assert_eq!(Value::Object(extract(&wrapped)), inner);
    }

    #[test]
    fn nested_wrappers_unwrap_recursively() {
        let wrapped = json!({
            "content": { "content": json!({ "success": true, "path": "a.txt" }).to_string() }
        });
        assert_eq!(
            Value::Object(extract(&wrapped)),
            json!({ "success": true, "path": "a.txt" })
        );
    }

    #[test]
    fn content_blocks_are_joined() {
        let wrapped = json!({
            "content": [{ "type": "text", "text": "{\"success\":false,\"error\":\"denied\"}" }]
        });
        assert_eq!(
            Value::Object(extract(&wrapped)),
            json!({ "success": false, "error": "denied" })
        );
    }

    #[test]
    fn tool_results_pass_through() {
        let result = json!({ "success": true, "path": "x.rs" });
        assert_eq!(Value::Object(extract(&result)), result);
    }

    #[test]
    fn bare_strings_parse_or_wrap() {
        assert_eq!(
            Value::Object(extract(&json!("{\"error\":\"boom\"}"))),
            json!({ "error": "boom" })
        );
        assert_eq!(
            Value::Object(extract(&json!("plain output"))),
            json!({ "rawContent": "plain output" })
        );
        assert_eq!(
            Value::Object(extract(&json!({ "content": "ls output" }))),
            json!({ "rawContent": "ls output" })
        );
    }

    #[test]
    fn other_values_become_empty() {
        assert!(extract(&json!(42)).is_empty());
        assert!(extract(&Value::Null).is_empty());
        assert!(extract(&json!([1, 2])).is_empty());
    }

    #[test]
    fn error_flag_considers_output() {
        let result = NormalizedToolResult::new("t1", "edit_file", &json!({ "success": false }), false);
        assert!(result.is_error);
        let result = NormalizedToolResult::new("t1", "edit_file", &json!({ "error": null, "path": "a" }), false);
        assert!(!result.is_error);
        let result = NormalizedToolResult::new("t1", "run", &json!("ok"), true);
        assert!(result.is_error);
    }

    #[test]
    fn modified_path_only_for_successful_mutations() {
        let written = NormalizedToolResult::new(
            "t1",
            "write_file",
            &json!({ "content": "{\"success\":true,\"path\":\"main.py\"}" }),
            false,
        );
        assert_eq!(
            written.modified_path(None),
            Some(FileMutation {
                path: "main.py".to_string(),
                created: true
            })
        );

        let edited = NormalizedToolResult::new("t2", "edit_file", &json!({ "success": true }), false);
        assert_eq!(
            edited.modified_path(Some(&json!({ "file_path": "lib.rs" }))),
            Some(FileMutation {
                path: "lib.rs".to_string(),
                created: false
            })
        );

        let failed = NormalizedToolResult::new(
            "t3",
            "write_file",
            &json!({ "success": false, "path": "main.py" }),
            false,
        );
        assert_eq!(failed.modified_path(None), None);

        let read = NormalizedToolResult::new("t4", "read_file", &json!({ "path": "main.py" }), false);
        assert_eq!(read.modified_path(None), None);
    }
}
