use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use rustyline::completion::{Candidate, Completer};
use rustyline::error::ReadlineError;
use rustyline::hint::Hinter;
use rustyline::{CompletionType, Editor, Helper, Highlighter, Validator};
use utter_core::{Conversation, config::Config};

use crate::cli::speak::stream_reply;
use crate::cli::ux::{ChatMessageType, format_footer, style_chat_text};

// -------------
// REPL commands
// -------------
#[derive(Parser, Debug)]
#[command(multicall = true)]
struct CliCommand {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Clear chat history
    Clear,
    /// Show the persona of this chat
    Persona,
    /// Exit the chat session
    #[command(alias = "q", alias = "quit")]
    Exit,
}

impl Command {
    /// Executes a REPL command.
    ///
    /// Returns `false` if the REPL should exit.
    async fn execute(self, chat: &mut Conversation) -> bool {
        match self {
            Command::Clear => {
                chat.clear_history().await;
                println!("Chat history cleared");
            }
            Command::Persona => {
                if chat.persona().is_empty() {
                    println!("No persona is set.");
                } else {
                    println!("{}", chat.persona());
                }
            }
            Command::Exit => {
                println!("Bye!");
                return false;
            }
        }
        true
    }
}

/// Parses a line starting with `/` into a REPL command.
fn parse_command(line: &str) -> Result<Command, clap::Error> {
    let args = shlex::split(line.trim_start_matches('/')).unwrap_or_default();
    CliCommand::try_parse_from(args).map(|c| c.command)
}

// -------------
// REPL completion
// -------------
#[derive(Helper, Validator, Highlighter)]
struct Repl {
    command_names: Vec<String>,
}

#[derive(Debug)]
struct CompletionCandidate {
    text: String,
    display_string: String,
}

impl CompletionCandidate {
    fn new(text: &str) -> Self {
        let display_string = style_chat_text(text, ChatMessageType::Footer).to_string();
        Self {
            text: text.to_owned(),
            display_string,
        }
    }
}

impl Candidate for CompletionCandidate {
    fn display(&self) -> &str {
        &self.display_string
    }

    fn replacement(&self) -> &str {
        &self.text
    }
}

impl Completer for Repl {
    type Candidate = CompletionCandidate;

    fn complete(
        &self,
        line: &str,
        _pos: usize,
        _ctx: &rustyline::Context<'_>,
    ) -> Result<(usize, Vec<Self::Candidate>), ReadlineError> {
        if !line.starts_with('/') {
            return Ok((0, Vec::new()));
        }

        let candidates = self
            .command_names
            .iter()
            .filter(|name| name.starts_with(line))
            .map(|name| CompletionCandidate::new(name))
            .collect();
        Ok((0, candidates))
    }
}

impl Hinter for Repl {
    type Hint = String;

    fn hint(&self, line: &str, pos: usize, _ctx: &rustyline::Context<'_>) -> Option<Self::Hint> {
        if !line.starts_with('/') || pos < line.len() {
            return None;
        }
        self.command_names
            .iter()
            .find(|name| name.starts_with(line))
            .map(|name| name[line.len()..].into())
    }
}

fn command_names() -> Vec<String> {
    CliCommand::command()
        .get_subcommands()
        .flat_map(|c| c.get_name_and_visible_aliases())
        .map(|s| format!("/{s}"))
        .collect()
}

/// Runs the interactive chat loop.
pub async fn execute(config: &Config) -> Result<()> {
    let mut chat = Conversation::from_config(config)?;
    let backend_name = config.chat.backend.key.clone();
    let persona_name = config.chat.persona_name.clone();

    println!("Welcome to utter chat! Type '/clear' to forget the chat, '/q' to exit.");

    let rl_config = rustyline::Config::builder()
        .history_ignore_dups(true)?
        .history_ignore_space(true)
        .completion_type(CompletionType::List)
        .build();
    let mut rl = Editor::with_config(rl_config)?;
    rl.set_helper(Some(Repl {
        command_names: command_names(),
    }));

    let prompt_meta = match &persona_name {
        Some(persona) => format!("[backend: {backend_name} | persona: {persona}]"),
        None => format!("[backend: {backend_name}]"),
    };
    let prompt = format!(
        "\n{}\n{}",
        style_chat_text(&prompt_meta, ChatMessageType::Prompt),
        style_chat_text("> ", ChatMessageType::Prompt)
    );

    loop {
        match rl.readline(&prompt) {
            Ok(line) => {
                rl.add_history_entry(&line)?;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                if line.starts_with('/') {
                    match parse_command(line) {
                        Ok(command) => {
                            if !command.execute(&mut chat).await {
                                return Ok(());
                            }
                        }
                        Err(e) => e.print()?,
                    }
                    continue;
                }

                let mut stdout = std::io::stdout();
                let (summary, cancelled) = stream_reply(&mut chat, line, &mut stdout).await?;
                println!(
                    "{}",
                    style_chat_text(&format_footer(&summary, cancelled), ChatMessageType::Footer)
                );
            }
            Err(ReadlineError::Interrupted) => {
                println!("Type /quit to exit.");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("\nBye!");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
    }
}
