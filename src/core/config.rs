use std::env;

use anyhow::{Context, Result, bail};

use crate::ai::chat::{Credential, DEFAULT_SYSTEM_PROMPT};
use crate::replicate::{DEFAULT_API_HOSTNAME, DEFAULT_MODEL};

pub const APP_NAME: &str = "My First Chatbot";
const DEFAULT_MODEL_NAME: &str = "Meta Llama 3 8B Instruct";

/// Static information about the model shown to the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub endpoint: String,
    pub doc_link: String,
}

impl ModelInfo {
    pub fn for_endpoint(endpoint: &str) -> Self {
        let name = if endpoint == DEFAULT_MODEL {
            DEFAULT_MODEL_NAME.to_string()
        } else {
            endpoint.to_string()
        };
        Self {
            name,
            endpoint: endpoint.to_string(),
            doc_link: format!("https://replicate.com/{}", endpoint),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_token: Option<String>,
    pub api_hostname: String,
    pub model: String,
    pub system_prompt: String,
    pub max_messages: Option<usize>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            api_hostname: DEFAULT_API_HOSTNAME.to_string(),
            model: DEFAULT_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_messages: None,
        }
    }
}

impl AppConfig {
    /// Read settings from the environment, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let api_token = env::var("REPLICATE_API_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());
        let api_hostname = env::var("REPLICHAT_API_HOSTNAME").unwrap_or(defaults.api_hostname);
        let model = env::var("REPLICHAT_MODEL").unwrap_or(defaults.model);
        let system_prompt = env::var("REPLICHAT_SYSTEM_PROMPT").unwrap_or(defaults.system_prompt);
        let max_messages = match env::var("REPLICHAT_MAX_MESSAGES") {
            Ok(val) => Some(parse_max_messages(&val)?),
            Err(_) => None,
        };

        Ok(Self {
            api_token,
            api_hostname,
            model,
            system_prompt,
            max_messages,
        })
    }

    /// The credential from configuration, if any. It is trusted and
    /// skips the interactive prompt.
    pub fn credential(&self) -> Option<Credential> {
        self.api_token.as_deref().map(Credential::from_config)
    }

    pub fn model_info(&self) -> ModelInfo {
        ModelInfo::for_endpoint(&self.model)
    }
}

fn parse_max_messages(val: &str) -> Result<usize> {
    let limit: usize = val
        .trim()
        .parse()
        .with_context(|| format!("REPLICHAT_MAX_MESSAGES must be a number, got {:?}", val))?;
    if limit == 0 {
        bail!("REPLICHAT_MAX_MESSAGES must be at least 1");
    }
    Ok(limit)
}
