//! Built-in tools for the agent command
//!
//! Paths are resolved against the working directory the tool was created
//! with; absolute paths are used as given.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use studio_core::{ParameterProperty, ParameterSchema, ToolDefinition, ToolHandler, ToolRegistry};

/// Largest file content returned by `read_file`
const MAX_READ_BYTES: usize = 64 * 1024;

/// Create a registry with every built-in tool rooted at `working_dir`
pub fn builtin_registry(working_dir: PathBuf) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(
        ToolDefinition::from_schema(
            "get_current_time",
            "Get the current local date and time",
            &ParameterSchema::new(),
        ),
        CurrentTimeTool,
    );
    registry.register(
        ToolDefinition::from_schema(
            "list_directory",
            "List the entries of a directory. Directories are shown with a trailing slash.",
            &ParameterSchema::new().with_property(
                "path",
                ParameterProperty::string("Directory to list (default: working directory)")
                    .with_default(".".into()),
            ),
        ),
        ListDirectoryTool::new(working_dir.clone()),
    );
    registry.register(
        ToolDefinition::from_schema(
            "read_file",
            "Read the contents of a text file",
            &ParameterSchema::new()
                .with_required("path", ParameterProperty::string("The path to the file to read")),
        ),
        ReadFileTool::new(working_dir.clone()),
    );
    registry.register(
        ToolDefinition::from_schema(
            "write_file",
            "Write text to a file, creating parent directories and replacing existing content",
            &ParameterSchema::new()
                .with_required("path", ParameterProperty::string("The path to the file to write"))
                .with_required("content", ParameterProperty::string("The text to write")),
        ),
        WriteFileTool::new(working_dir),
    );

    registry
}

/// Decode tool arguments; an empty string counts as `{}`
fn parse_args<T: DeserializeOwned>(arguments: &str) -> Result<T> {
    let arguments = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };
    serde_json::from_str(arguments).context("Invalid tool arguments")
}

fn resolve(working_dir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path)
    }
}

fn default_path() -> String {
    ".".to_string()
}

#[derive(Debug, Deserialize)]
struct PathArgs {
    #[serde(default = "default_path")]
    path: String,
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    path: String,
    #[serde(default)]
    content: String,
}

/// Tool reporting the local time
pub struct CurrentTimeTool;

#[async_trait]
impl ToolHandler for CurrentTimeTool {
    async fn call(&self, _arguments: &str) -> Result<String> {
        let now = chrono::Local::now();
        Ok(format!(
            "{} ({})",
            now.format("%A, %B %-d, %Y %H:%M:%S"),
            now.to_rfc3339()
        ))
    }
}

/// Tool listing a directory
pub struct ListDirectoryTool {
    working_dir: PathBuf,
}

impl ListDirectoryTool {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }
}

#[async_trait]
impl ToolHandler for ListDirectoryTool {
    async fn call(&self, arguments: &str) -> Result<String> {
        let args: PathArgs = parse_args(arguments)?;
        let dir = resolve(&self.working_dir, &args.path);

        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to list {}", dir.display()))?;

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();

        if entries.is_empty() {
            return Ok(format!("{} is empty", dir.display()));
        }
        Ok(entries.join("\n"))
    }
}

/// Tool reading a text file
pub struct ReadFileTool {
    working_dir: PathBuf,
}

impl ReadFileTool {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }
}

#[async_trait]
impl ToolHandler for ReadFileTool {
    async fn call(&self, arguments: &str) -> Result<String> {
        let args: PathArgs = parse_args(arguments)?;
        let path = resolve(&self.working_dir, &args.path);

        if !path.is_file() {
            anyhow::bail!("Not a file: {}", path.display());
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        if content.len() <= MAX_READ_BYTES {
            return Ok(content);
        }

        // Cut at a char boundary
        let end = content
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= MAX_READ_BYTES)
            .last()
            .unwrap_or(0);
        Ok(format!(
            "{}\n\n[Output truncated at {} bytes]",
            &content[..end],
            end
        ))
    }
}

/// Tool writing a text file
pub struct WriteFileTool {
    working_dir: PathBuf,
}

impl WriteFileTool {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }
}

#[async_trait]
impl ToolHandler for WriteFileTool {
    async fn call(&self, arguments: &str) -> Result<String> {
        let args: WriteArgs = parse_args(arguments)?;
        let path = resolve(&self.working_dir, &args.path);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, &args.content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(format!("Wrote {} bytes to {}", args.content.len(), path.display()))
    }
}
