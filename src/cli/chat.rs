use std::io::{self, Write};
use std::time::Duration;

use anyhow::{Result, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use crate::ai::chat::{Credential, Session, SessionBuilder, SessionError, TOKEN_HINT};
use crate::core::config::APP_NAME;
use crate::core::{AppConfig, ModelInfo};
use crate::replicate::ReplicateClient;

const HELP: &str = "\
Commands:
  /system          Show the system prompt
  /system <text>   Replace the system prompt
  /clear           Clear the chat history
  /history         Show the chat history
  /model           Show information about the model
  /help            Show this message
  /quit            Exit (or Ctrl-D)";

/// A line of input from the REPL.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Message(String),
    ShowSystemPrompt,
    SetSystemPrompt(String),
    Clear,
    History,
    Model,
    Help,
    Quit,
    Unknown(String),
    Empty,
}

pub fn parse_input(line: &str) -> Input {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Empty;
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return Input::Message(line.to_string());
    };
    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    match name {
        "system" if rest.is_empty() => Input::ShowSystemPrompt,
        "system" => Input::SetSystemPrompt(rest.to_string()),
        "clear" => Input::Clear,
        "history" => Input::History,
        "model" => Input::Model,
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => Input::Unknown(other.to_string()),
    }
}

fn print_model_info(info: &ModelInfo) {
    println!("Using {}", info.name);
    println!("Learn more about this model: {}", info.doc_link);
}

fn print_transcript(session: &Session) {
    for msg in session.transcript().iter() {
        println!("{}: {}\n", msg.role(), msg.content());
    }
}

fn thinking_spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message("Thinking...");
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Ask for a token until a well formed one is entered. Returns `false`
/// if the user gave up.
fn prompt_for_credential(rl: &mut DefaultEditor, session: &mut Session) -> Result<bool> {
    loop {
        match rl.readline("Enter Replicate API token: ") {
            Ok(line) => {
                let credential = Credential::interactive(line.trim());
                match credential.check_format() {
                    Ok(()) => {
                        session.set_credential(credential);
                        println!("Proceed to chat!");
                        return Ok(true);
                    }
                    Err(e) => {
                        tracing::debug!("Rejected API token: {}", e);
                        println!("Please enter a valid Replicate API token!");
                        if !line.trim().is_empty() {
                            println!("{}", TOKEN_HINT);
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return Ok(false),
            Err(err) => return Err(anyhow!("Failed to read API token: {:?}", err)),
        }
    }
}

/// Runs a turn, showing a spinner until the first fragment arrives and
/// then printing fragments as they stream in.
pub async fn respond(session: &mut Session) {
    let mut spinner = Some(thinking_spinner());
    let mut stdout = io::stdout();

    let outcome = session
        .run_turn(|fragment| {
            if let Some(spinner) = spinner.take() {
                spinner.finish_and_clear();
            }
            let _ = write!(stdout, "{}", fragment);
            let _ = stdout.flush();
        })
        .await;

    if let Some(spinner) = spinner.take() {
        spinner.finish_and_clear();
    }
    println!("\n");

    match outcome {
        Some(outcome) if outcome.is_error() => {
            tracing::warn!("Turn failed: {:?}", outcome.error);
        }
        Some(outcome) => {
            tracing::debug!("Turn finished with {} bytes", outcome.message.content().len());
        }
        None => {}
    }
}

pub async fn run(config: AppConfig, system_prompt: Option<String>) -> Result<()> {
    let mut rl =
        DefaultEditor::new().map_err(|e| anyhow!("Failed to start line editor: {:?}", e))?;

    let info = config.model_info();
    let client = ReplicateClient::new(&config.api_hostname, &config.model)?;
    let mut session = SessionBuilder::new(client)
        .system_prompt(system_prompt.as_deref().unwrap_or(&config.system_prompt))
        .max_messages(config.max_messages)
        .build();
    tracing::debug!("Started session {}", session.id);

    println!("{}", APP_NAME);
    print_model_info(&info);
    println!("Type /help for commands.\n");

    if let Some(credential) = config.credential() {
        session.set_credential(credential);
        println!("API token already provided!");
    } else if !prompt_for_credential(&mut rl, &mut session)? {
        return Ok(());
    }
    println!();

    print_transcript(&session);

    loop {
        let readline = rl.readline(">>> ");
        match readline {
            Ok(line) => {
                let _ = rl.add_history_entry(line.as_str());
                match parse_input(&line) {
                    Input::Message(text) => match session.submit_user_message(&text) {
                        Ok(()) => respond(&mut session).await,
                        Err(SessionError::Credential(e)) => {
                            println!("{}. {}", e, TOKEN_HINT);
                        }
                        Err(e) => println!("{}", e),
                    },
                    Input::ShowSystemPrompt => println!("{}\n", session.system_prompt().as_str()),
                    Input::SetSystemPrompt(text) => {
                        session.edit_system_prompt(&text);
                        println!("System prompt updated.\n");
                    }
                    Input::Clear => {
                        session.clear_history();
                        print_transcript(&session);
                    }
                    Input::History => print_transcript(&session),
                    Input::Model => print_model_info(&info),
                    Input::Help => println!("{}\n", HELP),
                    Input::Quit => break,
                    Input::Unknown(name) => println!("Unknown command /{}. Try /help.", name),
                    Input::Empty => {}
                }
            }
            Err(ReadlineError::Interrupted) => break,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_message() {
        assert_eq!(
            parse_input("Hello there"),
            Input::Message("Hello there".to_string())
        );
    }

    #[test]
    fn test_parse_message_keeps_original_text() {
        assert_eq!(
            parse_input("  indented  "),
            Input::Message("  indented  ".to_string())
        );
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(parse_input(""), Input::Empty);
        assert_eq!(parse_input("   "), Input::Empty);
    }

    #[test]
    fn test_parse_system_commands() {
        assert_eq!(parse_input("/system"), Input::ShowSystemPrompt);
        assert_eq!(parse_input("/system   "), Input::ShowSystemPrompt);
        assert_eq!(
            parse_input("/system Be terse."),
            Input::SetSystemPrompt("Be terse.".to_string())
        );
    }

    #[test]
    fn test_parse_other_commands() {
        assert_eq!(parse_input("/clear"), Input::Clear);
        assert_eq!(parse_input("/history"), Input::History);
        assert_eq!(parse_input("/model"), Input::Model);
        assert_eq!(parse_input("/help"), Input::Help);
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert_eq!(parse_input("/exit"), Input::Quit);
        assert_eq!(parse_input("/nope"), Input::Unknown("nope".to_string()));
    }
}
