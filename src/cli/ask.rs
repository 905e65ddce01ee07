use std::io::{self, Write};

use anyhow::{Result, anyhow};

use crate::ai::chat::SessionBuilder;
use crate::core::AppConfig;
use crate::replicate::ReplicateClient;

/// Run a single turn and print the response as it streams in.
pub async fn run(config: AppConfig, message: &str, system_prompt: Option<String>) -> Result<()> {
    let credential = config
        .credential()
        .ok_or_else(|| anyhow!("Set REPLICATE_API_TOKEN to use `ask`"))?;

    let client = ReplicateClient::new(&config.api_hostname, &config.model)?;
    let mut session = SessionBuilder::new(client)
        .system_prompt(system_prompt.as_deref().unwrap_or(&config.system_prompt))
        .credential(credential)
        .build();

    session.submit_user_message(message)?;

    let mut stdout = io::stdout();
    let outcome = session
        .run_turn(|fragment| {
            let _ = write!(stdout, "{}", fragment);
            let _ = stdout.flush();
        })
        .await;
    println!();

    if let Some(outcome) = outcome.filter(|o| o.is_error()) {
        tracing::warn!("Turn failed: {:?}", outcome.error);
    }

    Ok(())
}
