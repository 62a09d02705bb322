//! Filesystem and shell tools that operate through the context's backend.

use std::collections::BTreeMap;

use agentloop_core::backend::Backend;
use agentloop_core::tools::{Tool, ToolBox, ToolContext, ToolOutput, ToolParameterSchema, ToolSchema};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Lines longer than this are cut when displayed by `read_file`.
pub const MAX_LINE_LENGTH: usize = 2000;
pub const DEFAULT_READ_LIMIT: usize = 2000;

fn properties<const N: usize>(
    entries: [(&str, ToolParameterSchema); N],
) -> BTreeMap<String, ToolParameterSchema> {
    entries
        .into_iter()
        .map(|(name, schema)| (name.to_string(), schema))
        .collect()
}

pub struct LsTool;

#[derive(Deserialize)]
struct LsArgs {
    #[serde(default = "default_dir")]
    path: String,
}

fn default_dir() -> String {
    "/".to_string()
}

#[async_trait]
impl Tool for LsTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "ls",
            "List the files and directories directly inside a directory",
            ToolParameterSchema::object(
                "ls parameters",
                properties([(
                    "path",
                    ToolParameterSchema::string("Absolute directory path (default: /)"),
                )]),
                vec![],
            ),
        )
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> anyhow::Result<ToolOutput> {
        let args: LsArgs = serde_json::from_value(args)?;
        let entries = ctx.backend.list(&args.path).await?;
        if entries.is_empty() {
            return Ok(ToolOutput::text(format!("No files found in {}", args.path)));
        }
        let listing: Vec<String> = entries.into_iter().map(|e| e.path).collect();
        Ok(ToolOutput::text(listing.join("\n")))
    }
}

pub struct ReadFileTool;

#[derive(Deserialize)]
struct ReadFileArgs {
    file_path: String,
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

const fn default_limit() -> usize {
    DEFAULT_READ_LIMIT
}

#[async_trait]
impl Tool for ReadFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "read_file",
            "Read a file with line numbers, optionally starting at a line offset",
            ToolParameterSchema::object(
                "read_file parameters",
                properties([
                    ("file_path", ToolParameterSchema::string("Absolute path of the file")),
                    (
                        "offset",
                        ToolParameterSchema::integer("Line number to start from (default: 0)"),
                    ),
                    (
                        "limit",
                        ToolParameterSchema::integer("Maximum number of lines (default: 2000)"),
                    ),
                ]),
                vec!["file_path".to_string()],
            ),
        )
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> anyhow::Result<ToolOutput> {
        let args: ReadFileArgs = serde_json::from_value(args)?;
        let contents = ctx.backend.read_to_string(&args.file_path).await?;

        if contents.trim().is_empty() {
            return Ok(ToolOutput::text(
                "System reminder: File exists but has empty contents",
            ));
        }

        let lines: Vec<&str> = contents.lines().collect();
        if args.offset >= lines.len() {
            anyhow::bail!(
                "Error: Line offset {} exceeds file length ({} lines)",
                args.offset,
                lines.len()
            );
        }

        let end = args.offset.saturating_add(args.limit).min(lines.len());
        let numbered: Vec<String> = lines[args.offset..end]
            .iter()
            .enumerate()
            .map(|(idx, line)| {
                let shown: String = line.chars().take(MAX_LINE_LENGTH).collect();
                format!("{:6}\t{}", args.offset + idx + 1, shown)
            })
            .collect();
        Ok(ToolOutput::text(numbered.join("\n")))
    }
}

pub struct WriteFileTool;

#[derive(Deserialize)]
struct WriteFileArgs {
    file_path: String,
    content: String,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "write_file",
            "Create a new file. Fails if the file already exists; use edit_file to change it",
            ToolParameterSchema::object(
                "write_file parameters",
                properties([
                    ("file_path", ToolParameterSchema::string("Absolute path of the new file")),
                    ("content", ToolParameterSchema::string("Full file content")),
                ]),
                vec!["file_path".to_string(), "content".to_string()],
            ),
        )
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> anyhow::Result<ToolOutput> {
        let args: WriteFileArgs = serde_json::from_value(args)?;
        ctx.backend
            .create(&args.file_path, args.content.as_bytes())
            .await?;
        Ok(ToolOutput::text(format!("Updated file {}", args.file_path)))
    }
}

pub struct EditFileTool;

#[derive(Deserialize)]
struct EditFileArgs {
    file_path: String,
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

#[async_trait]
impl Tool for EditFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "edit_file",
            "Replace an exact string in a file. The string must be unique unless replace_all is set",
            ToolParameterSchema::object(
                "edit_file parameters",
                properties([
                    ("file_path", ToolParameterSchema::string("Absolute path of the file")),
                    ("old_string", ToolParameterSchema::string("Exact text to replace")),
                    ("new_string", ToolParameterSchema::string("Replacement text")),
                    (
                        "replace_all",
                        ToolParameterSchema::boolean("Replace every occurrence (default: false)"),
                    ),
                ]),
                vec![
                    "file_path".to_string(),
                    "old_string".to_string(),
                    "new_string".to_string(),
                ],
            ),
        )
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> anyhow::Result<ToolOutput> {
        let args: EditFileArgs = serde_json::from_value(args)?;
        let count = ctx
            .backend
            .edit(
                &args.file_path,
                &args.old_string,
                &args.new_string,
                args.replace_all,
            )
            .await?;
        Ok(ToolOutput::text(format!(
            "Successfully replaced {count} instance(s) of the string in '{}'",
            args.file_path
        )))
    }
}

pub struct ExecuteTool;

#[derive(Deserialize)]
struct ExecuteArgs {
    command: String,
}

#[async_trait]
impl Tool for ExecuteTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "execute",
            "Run a shell command in the workspace and return its combined output",
            ToolParameterSchema::object(
                "execute parameters",
                properties([("command", ToolParameterSchema::string("Shell command to run"))]),
                vec!["command".to_string()],
            ),
        )
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> anyhow::Result<ToolOutput> {
        let args: ExecuteArgs = serde_json::from_value(args)?;
        let response = ctx.backend.execute(&args.command).await?;

        let mut parts = vec![response.output.trim_end().to_string()];
        match response.exit_code {
            Some(0) => parts.push("[Command succeeded with exit code 0]".to_string()),
            Some(code) => parts.push(format!("[Command failed with exit code {code}]")),
            None => parts.push("[Command failed without an exit code]".to_string()),
        }
        if response.truncated {
            parts.push("[Output was truncated due to size limits]".to_string());
        }
        parts.retain(|p| !p.is_empty());
        Ok(ToolOutput::text(parts.join("\n")))
    }
}

/// `ls`, `read_file`, `write_file`, `edit_file`, plus `execute` when the
/// backend can run commands.
pub fn create_filesystem_tools(include_execute: bool) -> Vec<ToolBox> {
    let mut tools: Vec<ToolBox> = vec![
        Arc::new(LsTool),
        Arc::new(ReadFileTool),
        Arc::new(WriteFileTool),
        Arc::new(EditFileTool),
    ];
    if include_execute {
        tools.push(Arc::new(ExecuteTool));
    }
    tools
}
