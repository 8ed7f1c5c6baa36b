//! Interactive REPL for chat interface
//!
//! Streams replies, keeps the conversation across turns and supports
//! slash commands for switching models and saving or loading sessions.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use studio_core::{Config, Conversation, Message, Role, StudioClient};

use crate::commands::{stream_answer, CtrlC, BLUE, BOLD, CYAN, DIM, GREEN, RESET, YELLOW};

/// REPL state
struct ReplState {
    client: StudioClient,
    model: String,
    conversation: Conversation,
    temperature: f32,
    max_tokens: Option<u32>,
}

impl ReplState {
    async fn new(config: &Config, system: Option<String>) -> Result<Self> {
        let client = StudioClient::new(&config.server)?;

        if !client.health_check().await {
            anyhow::bail!(
                "Server is not reachable at {}{}{}",
                BLUE,
                client.base_url(),
                RESET
            );
        }

        let model = client.resolve_model(None).await?;
        let system = system.or_else(|| config.chat.system_prompt.clone());

        Ok(Self {
            client,
            model,
            conversation: Conversation::new(system),
            temperature: config.chat.temperature,
            max_tokens: config.chat.max_tokens,
        })
    }

    fn load_conversation(&mut self, name: &str) -> Result<()> {
        let path = conversation_path(name)?;
        self.conversation = Conversation::load_from(&path)?;
        println!(
            "{}Loaded:{} {} ({} messages)",
            GREEN,
            RESET,
            self.conversation.title().unwrap_or_else(|| "untitled".to_string()),
            self.conversation.len()
        );
        Ok(())
    }
}

fn data_dir() -> Result<PathBuf> {
    Ok(dirs::data_dir()
        .context("Could not determine data directory")?
        .join("studio"))
}

fn conversations_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("conversations"))
}

/// A path as given if it exists, otherwise a saved conversation name
fn conversation_path(name: &str) -> Result<PathBuf> {
    let direct = Path::new(name);
    if direct.exists() {
        return Ok(direct.to_path_buf());
    }
    let file = if name.ends_with(".json") {
        name.to_string()
    } else {
        format!("{}.json", name)
    };
    Ok(conversations_dir()?.join(file))
}

/// Run the interactive REPL
pub async fn run(config: &Config, system: Option<String>, load: Option<String>) -> Result<()> {
    let mut state = ReplState::new(config, system).await?;

    if let Some(name) = load {
        state.load_conversation(&name)?;
    }

    let history_path = data_dir()?.join("history.txt");
    let mut rl = DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    print_welcome(&state);

    loop {
        let prompt = format!("{}studio>{} ", CYAN, RESET);

        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);

                if line.starts_with('/') {
                    match handle_slash_command(&mut state, line).await {
                        Ok(true) => break,
                        Ok(false) => continue,
                        Err(e) => {
                            eprintln!("{}Error:{} {:#}", YELLOW, RESET, e);
                            continue;
                        }
                    }
                }

                if let Err(e) = send_message(&mut state, line).await {
                    eprintln!("{}Error:{} {:#}", YELLOW, RESET, e);
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("{}^C{}", DIM, RESET);
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("{}Goodbye!{}", DIM, RESET);
                break;
            }
            Err(e) => {
                eprintln!("{}Error:{} {}", YELLOW, RESET, e);
                break;
            }
        }
    }

    if let Some(parent) = history_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = rl.save_history(&history_path);

    Ok(())
}

fn print_welcome(state: &ReplState) {
    println!();
    println!("{}studio{} - local model chat", BOLD, RESET);
    println!("  Model: {}{}{}", BLUE, state.model, RESET);
    println!("  Server: {}{}{}", DIM, state.client.base_url(), RESET);
    println!("  Type {}/help{} for commands", CYAN, RESET);
    println!();
}

/// Stream one reply; the conversation only changes if it arrives in full
async fn send_message(state: &mut ReplState, input: &str) -> Result<()> {
    let mut next = state.conversation.clone();
    next.append_user(input);

    let request = next.to_request(state.model.clone(), state.temperature, state.max_tokens, true);
    let ctrl_c = CtrlC::install();
    let reply = stream_answer(&state.client, &request, ctrl_c.token()).await?;

    match finish_turn(next, reply, ctrl_c.token().is_cancelled())? {
        Some(conversation) => state.conversation = conversation,
        None => println!("{}Reply interrupted; turn not kept{}", DIM, RESET),
    }
    Ok(())
}

/// The conversation with the reply appended, or `None` if the reply was cut short
fn finish_turn(
    mut next: Conversation,
    reply: Message,
    cancelled: bool,
) -> Result<Option<Conversation>> {
    if cancelled {
        return Ok(None);
    }
    next.append_assistant_message(reply)?;
    Ok(Some(next))
}

/// Handle slash commands; returns true when the REPL should exit
async fn handle_slash_command(state: &mut ReplState, input: &str) -> Result<bool> {
    let parts: Vec<&str> = input.splitn(2, ' ').collect();
    let cmd = parts[0].to_lowercase();
    let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

    match cmd.as_str() {
        "/help" | "/h" | "/?" => print_help(),
        "/exit" | "/quit" | "/q" => {
            println!("{}Goodbye!{}", DIM, RESET);
            return Ok(true);
        }
        "/clear" => {
            state.conversation.clear();
            println!("{}Conversation cleared{}", DIM, RESET);
        }
        "/model" | "/m" => {
            if args.is_empty() {
                println!("Current model: {}{}{}", BLUE, state.model, RESET);
            } else {
                let available = state.client.list_models().await?;
                if !available.iter().any(|m| m == args) {
                    println!("{}Warning:{} {} is not loaded on the server", YELLOW, RESET, args);
                }
                state.model = args.to_string();
                println!("{}Model:{} {}", GREEN, RESET, state.model);
            }
        }
        "/models" => {
            for m in state.client.list_models().await? {
                let marker = if m == state.model { "*" } else { " " };
                println!(" {} {}", marker, m);
            }
        }
        "/save" => {
            let name = if args.is_empty() {
                chrono::Local::now().format("%Y%m%d-%H%M%S").to_string()
            } else {
                args.to_string()
            };
            let path = conversation_path(&name)?;
            state.conversation.save_to(&path)?;
            println!("{}Saved:{} {}", GREEN, RESET, path.display());
        }
        "/load" => {
            if args.is_empty() {
                list_saved()?;
            } else {
                state.load_conversation(args)?;
            }
        }
        "/history" | "/hist" => print_history(&state.conversation),
        _ => {
            println!("{}Unknown command:{} {}", YELLOW, RESET, cmd);
            println!("Type {}/help{} for available commands", CYAN, RESET);
        }
    }
    Ok(false)
}

fn list_saved() -> Result<()> {
    let dir = conversations_dir()?;
    let mut names: Vec<String> = match std::fs::read_dir(&dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".json").map(str::to_string)
            })
            .collect(),
        Err(_) => Vec::new(),
    };

    if names.is_empty() {
        println!("No saved conversations");
        return Ok(());
    }
    names.sort();
    println!("{}Saved Conversations:{}", BOLD, RESET);
    for name in names.iter().rev().take(10) {
        println!("  {}", name);
    }
    println!("\nUse: /load <name>");
    Ok(())
}

fn print_history(conversation: &Conversation) {
    if conversation.is_empty() {
        println!("No messages in conversation");
        return;
    }
    println!("{}Conversation History:{}", BOLD, RESET);
    for (i, msg) in conversation.messages().iter().enumerate() {
        let role_color = match msg.role {
            Role::User => CYAN,
            Role::Assistant => GREEN,
            Role::System => YELLOW,
            Role::Tool => BLUE,
        };
        let text = msg.text().replace('\n', " ");
        let preview = if text.chars().count() > 60 {
            format!("{}...", text.chars().take(60).collect::<String>())
        } else {
            text
        };
        println!(
            "  {}[{}]{} {}{}:{} {}",
            DIM,
            i + 1,
            RESET,
            role_color,
            msg.role,
            RESET,
            preview
        );
    }
}

fn print_help() {
    println!();
    println!("{}Commands:{}", BOLD, RESET);
    println!("  {}/help{}, /h, /?      Show this help", CYAN, RESET);
    println!("  {}/model{} [name]     Show or switch the model", CYAN, RESET);
    println!("  {}/models{}           List loaded models", CYAN, RESET);
    println!("  {}/clear{}            Clear the conversation", CYAN, RESET);
    println!("  {}/save{} [name]      Save the conversation", CYAN, RESET);
    println!("  {}/load{} [name]      Load a saved conversation", CYAN, RESET);
    println!("  {}/history{}          Show conversation history", CYAN, RESET);
    println!("  {}/exit{}, /quit, /q  Exit", CYAN, RESET);
    println!();
    println!("{}Ctrl-C during a reply stops it; Ctrl-D exits.{}", DIM, RESET);
    println!();
}
