//! CLI commands implementation

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use futures::StreamExt;
use serde_json::Value;
use studio_core::{
    Agent, CompletionRequest, Config, Conversation, FallbackParser, Message, ServerStatus,
    StreamAccumulator, StudioClient, StudioError, Usage,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::tools::builtin_registry;

// ANSI color codes
pub const GREEN: &str = "\x1b[92m";
pub const RED: &str = "\x1b[91m";
pub const YELLOW: &str = "\x1b[93m";
pub const BLUE: &str = "\x1b[94m";
pub const CYAN: &str = "\x1b[96m";
pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const RESET: &str = "\x1b[0m";

fn print_status(ok: bool, msg: &str) {
    let icon = if ok {
        format!("{}✓{}", GREEN, RESET)
    } else {
        format!("{}✗{}", RED, RESET)
    };
    println!("  {} {}", icon, msg);
}

fn print_usage(usage: &Usage) {
    if usage.total_tokens > 0 {
        eprintln!(
            "{}tokens: {} prompt + {} completion = {}{}",
            DIM, usage.prompt_tokens, usage.completion_tokens, usage.total_tokens, RESET
        );
    }
}

/// Cancels its token on Ctrl-C until dropped
pub struct CtrlC {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl CtrlC {
    pub fn install() -> Self {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let task = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("Ctrl-C received, cancelling request");
                trigger.cancel();
            }
        });
        Self { token, task }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for CtrlC {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Show server status and loaded models
pub async fn status(config: &Config) -> Result<()> {
    let client = StudioClient::new(&config.server)?;

    println!("{}Server Status{}", BOLD, RESET);
    println!("  Endpoint: {}", client.base_url());

    match client.status().await {
        ServerStatus::Running => print_status(true, "Server is running"),
        ServerStatus::Stopped => {
            print_status(false, "Server is not reachable");
            println!(
                "\n  Start the local server and load a model, or set {}--base-url{}",
                BLUE, RESET
            );
            return Ok(());
        }
    }

    match client.list_models().await {
        Ok(models) => {
            println!("\n{}Loaded Models ({}){}", BOLD, models.len(), RESET);
            if models.is_empty() {
                println!("  {}No models loaded{}", YELLOW, RESET);
            }
            for m in &models {
                let marker = if config.server.default_model.as_deref() == Some(m.as_str()) {
                    format!(" {}(default){}", DIM, RESET)
                } else {
                    String::new()
                };
                println!("  - {}{}", m, marker);
            }
        }
        Err(e) => println!("  {}Error listing models: {}{}", RED, e, RESET),
    }

    println!("\n{}Client{}", BOLD, RESET);
    println!("  Request timeout: {}s", client.request_timeout().as_secs());
    match Config::find_config_path() {
        Some(path) => println!("  Config: {}", path.display()),
        None => println!("  Config: {}defaults{}", DIM, RESET),
    }

    Ok(())
}

/// List loaded models
pub async fn models(config: &Config, json: bool) -> Result<()> {
    let client = StudioClient::new(&config.server)?;
    let models = client.list_models().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    }

    if models.is_empty() {
        println!("{}No models loaded{}", YELLOW, RESET);
        return Ok(());
    }
    for m in models {
        println!("{}", m);
    }
    Ok(())
}

/// One-shot query
pub async fn ask(
    config: &Config,
    prompt: &str,
    json_schema: Option<PathBuf>,
    stream: bool,
    system: Option<String>,
) -> Result<()> {
    let client = StudioClient::new(&config.server)?;
    let model = client.resolve_model(None).await?;

    let mut conversation = Conversation::new(system.or_else(|| config.chat.system_prompt.clone()));
    conversation.append_user(prompt);
    let request = conversation.to_request(
        model,
        config.chat.temperature,
        config.chat.max_tokens,
        stream,
    );

    let ctrl_c = CtrlC::install();

    if let Some(path) = json_schema {
        let schema = read_schema(&path)?;
        let name = schema_name(&path);
        let value: Value = tokio::select! {
            _ = ctrl_c.token().cancelled() => return Err(StudioError::Cancelled.into()),
            result = client.complete_json(request, &name, schema) => result?,
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    if stream {
        let message = stream_answer(&client, &request, ctrl_c.token()).await?;
        debug!(chars = message.text().len(), "Streamed answer complete");
        return Ok(());
    }

    let response = client.complete_chat_until(&request, ctrl_c.token()).await?;
    println!("{}", response.content());
    print_usage(&response.usage());
    Ok(())
}

/// Print a streamed answer as it arrives and return the assembled message
pub async fn stream_answer(
    client: &StudioClient,
    request: &CompletionRequest,
    cancel: &CancellationToken,
) -> Result<Message> {
    let mut stream = client.stream_chat_until(request, cancel.clone()).await?;
    let mut acc = StreamAccumulator::new();
    let mut stdout = io::stdout();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if let Some(text) = chunk.content() {
            print!("{}", text);
            stdout.flush()?;
        }
        acc.push(&chunk);
    }
    println!();

    if cancel.is_cancelled() {
        eprintln!("{}[cancelled]{}", DIM, RESET);
    }
    if let Some(usage) = acc.usage() {
        print_usage(&usage);
    }
    Ok(acc.into_message())
}

fn read_schema(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {}", path.display()))
}

/// Schema name derived from the file name, limited to `[A-Za-z0-9_-]`
fn schema_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if name.is_empty() {
        "response".to_string()
    } else {
        name
    }
}

/// Default recovery rules minus the file-write guess, whose placeholder
/// arguments would overwrite `output.txt` with nothing
fn agent_fallback() -> FallbackParser {
    FallbackParser::new()
        .rules()
        .iter()
        .filter(|rule| rule.tool != "write_file")
        .cloned()
        .fold(FallbackParser::without_heuristics(), FallbackParser::with_rule)
}

/// Run a task with the built-in tools
pub async fn agent(config: &Config, task: &str, fallback: bool, json: bool) -> Result<()> {
    let working_dir = std::env::current_dir().context("Failed to resolve working directory")?;
    let mut agent = Agent::connect(config, None)
        .await?
        .with_registry(builtin_registry(working_dir));
    agent = agent.with_fallback(fallback.then(agent_fallback));

    if !json {
        eprintln!(
            "{}Agent:{} {} ({} tools)",
            CYAN,
            RESET,
            agent.model(),
            agent.registry().len()
        );
    }

    let ctrl_c = CtrlC::install();
    let result = agent.send(task, ctrl_c.token()).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for call in &result.executed_tool_calls {
            print_status(
                call.success,
                &format!("{}({})", call.tool_call.name(), call.tool_call.arguments()),
            );
            if let Some(ref message) = call.error_message {
                println!("    {}{}{}", DIM, message, RESET);
            }
        }
        if !result.executed_tool_calls.is_empty() {
            println!();
        }
        if result.success {
            println!("{}", result.final_response);
        }
        print_usage(&result.total_usage);
    }

    if !result.success {
        let kind = result
            .error_kind
            .map(|k| k.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        anyhow::bail!(
            "Agent run failed ({}): {}",
            kind,
            result.error_message.unwrap_or_default()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_name_sanitized() {
        assert_eq!(schema_name(Path::new("schemas/weather.v2.json")), "weather_v2");
        assert_eq!(schema_name(Path::new("answer-format.json")), "answer-format");
        assert_eq!(schema_name(Path::new("")), "response");
    }

    #[test]
    fn test_agent_fallback_never_guesses_writes() {
        let fallback = agent_fallback();
        let tools: Vec<&str> = fallback
            .rules()
            .iter()
            .map(|r| r.tool.as_str())
            .collect();
        assert!(!tools.contains(&"write_file"));
        assert!(tools.contains(&"list_directory"));
        assert!(tools.contains(&"get_current_time"));
    }

    #[test]
    fn test_read_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, r#"{"type": "object"}"#).unwrap();
        assert_eq!(read_schema(&path).unwrap()["type"], "object");

        std::fs::write(&path, "not json").unwrap();
        assert!(read_schema(&path).is_err());
    }
}
