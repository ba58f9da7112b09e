//! Built-in tool implementations.
//!
//! Each sub-module implements one (or a small family of) tool(s). This
//! module ties them to the [`BuiltinTool`] variants: name, description,
//! argument schema and dispatch.

pub mod edit_file;
pub mod memory;
pub mod read_file;
pub mod restart;
pub mod shell;
pub mod web;
pub mod write_file;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::{ToolContext, ToolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinTool {
    Shell,
    ReadFile,
    WriteFile,
    EditFile,
    PatchFile,
    SaveMemory,
    RecallMemory,
    RestartSelf,
    WebSearch,
    WebFetch,
}

impl BuiltinTool {
    pub const ALL: &'static [BuiltinTool] = &[
        BuiltinTool::Shell,
        BuiltinTool::ReadFile,
        BuiltinTool::WriteFile,
        BuiltinTool::EditFile,
        BuiltinTool::PatchFile,
        BuiltinTool::SaveMemory,
        BuiltinTool::RecallMemory,
        BuiltinTool::RestartSelf,
        BuiltinTool::WebSearch,
        BuiltinTool::WebFetch,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BuiltinTool::Shell => "shell",
            BuiltinTool::ReadFile => "read_file",
            BuiltinTool::WriteFile => "write_file",
            BuiltinTool::EditFile => "edit_file",
            BuiltinTool::PatchFile => "patch_file",
            BuiltinTool::SaveMemory => "save_memory",
            BuiltinTool::RecallMemory => "recall_memory",
            BuiltinTool::RestartSelf => "restart_self",
            BuiltinTool::WebSearch => "web_search",
            BuiltinTool::WebFetch => "web_fetch",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            BuiltinTool::Shell => "Execute a shell command in the workspace and return stdout+stderr.",
            BuiltinTool::ReadFile => "Read the contents of a file.",
            BuiltinTool::WriteFile => "Write content to a file (creates parent dirs if needed).",
            BuiltinTool::EditFile => {
                "Replace one exact occurrence of `old` with `new` in a file. `old` must match exactly once."
            }
            BuiltinTool::PatchFile => {
                "Apply several exact replacements to one file at once. Each `old` must match exactly once; nothing is written if any patch fails."
            }
            BuiltinTool::SaveMemory => {
                "Persist an important fact to long-term memory. Memory is shown to you at the start of every conversation."
            }
            BuiltinTool::RecallMemory => "Read current long-term memory.",
            BuiltinTool::RestartSelf => {
                "Restart kkbot by re-executing the current process. MUST be called after modifying kkbot's own source code or config."
            }
            BuiltinTool::WebSearch => "Search the web using Brave Search. Returns titles, URLs and snippets.",
            BuiltinTool::WebFetch => "Fetch a URL and return its readable text content.",
        }
    }

    /// JSON Schema for the argument object.
    pub fn schema(self) -> Value {
        match self {
            BuiltinTool::Shell => json!({
                "type": "object",
                "properties": {
                    "cmd": { "type": "string", "description": "Command line, run with `sh -c`." },
                    "timeout": { "type": "integer", "description": "Timeout in seconds (default 30)." }
                },
                "required": ["cmd"]
            }),
            BuiltinTool::ReadFile => json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Absolute, ~/ or workspace-relative path." }
                },
                "required": ["path"]
            }),
            BuiltinTool::WriteFile => json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            }),
            BuiltinTool::EditFile => json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "old": { "type": "string", "description": "Exact text to replace (must be unique in file)." },
                    "new": { "type": "string", "description": "Replacement text." }
                },
                "required": ["path", "old", "new"]
            }),
            BuiltinTool::PatchFile => json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "patches": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "old": { "type": "string" },
                                "new": { "type": "string" }
                            },
                            "required": ["old", "new"]
                        }
                    }
                },
                "required": ["path", "patches"]
            }),
            BuiltinTool::SaveMemory => json!({
                "type": "object",
                "properties": {
                    "content": { "type": "string", "description": "One fact, a single line." }
                },
                "required": ["content"]
            }),
            BuiltinTool::RecallMemory | BuiltinTool::RestartSelf => json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
            BuiltinTool::WebSearch => json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "count": { "type": "integer", "description": "Number of results (1-10, default 5)." }
                },
                "required": ["query"]
            }),
            BuiltinTool::WebFetch => json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string" },
                    "max_chars": { "type": "integer", "description": "Max chars to return (default 8000)." }
                },
                "required": ["url"]
            }),
        }
    }

    /// Validate `args` and run the tool.
    pub async fn run(self, ctx: &ToolContext, args: &Value) -> Result<String, ToolError> {
        let out = match self {
            BuiltinTool::Shell => shell::shell(ctx, self.parse(args)?).await?,
            BuiltinTool::ReadFile => read_file::read_file(ctx, self.parse(args)?).await?,
            BuiltinTool::WriteFile => write_file::write_file(ctx, self.parse(args)?).await?,
            BuiltinTool::EditFile => edit_file::edit_file(ctx, self.parse(args)?).await?,
            BuiltinTool::PatchFile => edit_file::patch_file(ctx, self.parse(args)?).await?,
            BuiltinTool::SaveMemory => memory::save_memory(ctx, self.parse(args)?).await?,
            BuiltinTool::RecallMemory => memory::recall_memory(ctx).await?,
            BuiltinTool::RestartSelf => restart::restart_self(),
            BuiltinTool::WebSearch => web::web_search(ctx, self.parse(args)?).await?,
            BuiltinTool::WebFetch => web::web_fetch(ctx, self.parse(args)?).await?,
        };
        Ok(out)
    }

    fn parse<T: DeserializeOwned>(self, args: &Value) -> Result<T, ToolError> {
        let invalid = |reason: String| ToolError::InvalidArguments {
            tool: self.name(),
            reason,
            schema: self.schema().to_string(),
        };
        let obj = match args {
            Value::Object(_) => args.clone(),
            Value::Null => json!({}),
            Value::String(raw) => {
                return Err(invalid(format!(
                    "arguments are not valid JSON: {}",
                    crate::utils::truncate_str(raw, 200)
                )))
            }
            other => return Err(invalid(format!("expected a JSON object, got {other}"))),
        };
        serde_json::from_value(obj).map_err(|e| invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        let mut names: Vec<&str> = BuiltinTool::ALL.iter().map(|t| t.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), BuiltinTool::ALL.len());
    }

    #[test]
    fn required_fields_exist_in_properties() {
        for tool in BuiltinTool::ALL {
            let schema = tool.schema();
            for req in schema["required"].as_array().unwrap() {
                let key = req.as_str().unwrap();
                assert!(
                    schema["properties"].get(key).is_some(),
                    "{} requires undeclared `{key}`",
                    tool.name()
                );
            }
        }
    }

    #[test]
    fn missing_field_reports_serde_reason() {
        let err = BuiltinTool::EditFile
            .parse::<edit_file::EditFileArgs>(&json!({ "path": "a" }))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("missing field `old`"), "{msg}");
        assert!(msg.contains("\"required\""), "{msg}");
    }

    #[test]
    fn null_arguments_count_as_empty_object() {
        let args: memory::SaveMemoryArgs = BuiltinTool::SaveMemory
            .parse(&json!({ "text": "x" }))
            .unwrap();
        assert_eq!(args.content, "x");
        assert!(BuiltinTool::SaveMemory
            .parse::<memory::SaveMemoryArgs>(&Value::Null)
            .is_err());
    }
}
