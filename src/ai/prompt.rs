//! Serializes a transcript into the flat text prompt the completion
//! model expects, using Handlebars for templating. Handlebars adds
//! additional security controls since it can't do much out of the box
//! without registering your own helpers, which matters here because
//! the transcript includes untrusted model output.
//!
//! HTML escaping is turned off: the output is model input, not markup.

use handlebars::{Handlebars, RenderError, no_escape};
use serde_json::json;

use crate::ai::chat::{Message, SystemPrompt, Transcript};

// Each message becomes "<Role>: <content>" followed by a blank line
// and the trailing "Assistant: " cues the model to respond.
const CHAT_PROMPT: &str =
    "System: {{system_prompt}}\n\n{{#each messages}}{{role}}: {{content}}\n\n{{/each}}Assistant: ";

pub fn templates<'a>() -> Handlebars<'a> {
    let mut registry = Handlebars::new();
    registry.set_strict_mode(true);
    registry.register_escape_fn(no_escape);
    registry
}

/// Builds prompts from a transcript. The full history is resent every
/// turn unless `max_messages` is set, in which case only the most
/// recent messages are kept. The system prompt is always included.
pub struct PromptBuilder {
    registry: Handlebars<'static>,
    max_messages: Option<usize>,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self {
            registry: templates(),
            max_messages: None,
        }
    }

    pub fn max_messages(mut self, limit: Option<usize>) -> Self {
        self.max_messages = limit;
        self
    }

    pub fn limit(&self) -> Option<usize> {
        self.max_messages
    }

    pub fn build(
        &self,
        system_prompt: &SystemPrompt,
        transcript: &Transcript,
    ) -> Result<String, RenderError> {
        let all = transcript.messages();
        let window = match self.max_messages {
            Some(limit) => &all[all.len().saturating_sub(limit)..],
            None => all,
        };
        let messages: Vec<_> = window
            .iter()
            .map(|m: &Message| json!({"role": m.role().label(), "content": m.content()}))
            .collect();

        self.registry.render_template(
            CHAT_PROMPT,
            &json!({
                "system_prompt": system_prompt.as_str(),
                "messages": messages,
            }),
        )
    }
}

/// Serialize the whole transcript with no truncation.
pub fn build_prompt(
    system_prompt: &SystemPrompt,
    transcript: &Transcript,
) -> Result<String, RenderError> {
    PromptBuilder::new().build(system_prompt, transcript)
}
