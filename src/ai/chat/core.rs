use futures_util::StreamExt;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use super::credential::{Credential, CredentialError};
use super::models::{Message, Role, SystemPrompt, Transcript};
use crate::ai::prompt::PromptBuilder;
use crate::replicate::{ReplicateError, ResponseStreamer};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("Message is empty")]
    EmptyMessage,
    #[error("Still waiting on a response to the previous message")]
    TurnPending,
}

/// The result of one turn. `message` is what was appended to the
/// transcript; when the stream ended in an error its text is the tail
/// of `message` and the tagged error is kept in `error`.
#[derive(Debug)]
pub struct TurnOutcome {
    pub message: Message,
    pub error: Option<ReplicateError>,
}

impl TurnOutcome {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// One interactive chat session with a remote completion model.
///
/// Everything a turn needs lives here: the transcript, the system
/// prompt, and the credential. Nothing is shared between sessions.
///
/// Use `SessionBuilder` to construct a `Session`.
pub struct Session {
    pub id: Uuid,
    transcript: Transcript,
    system_prompt: SystemPrompt,
    credential: Option<Credential>,
    prompt_builder: PromptBuilder,
    streamer: Box<dyn ResponseStreamer>,
}

impl Session {
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn system_prompt(&self) -> &SystemPrompt {
        &self.system_prompt
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn set_credential(&mut self, credential: Credential) {
        self.credential = Some(credential);
    }

    /// Chat input is only enabled with a usable credential.
    pub fn check_credential(&self) -> Result<(), CredentialError> {
        match &self.credential {
            Some(credential) => credential.ensure_usable(),
            None => Err(CredentialError::Missing),
        }
    }

    /// Add a user message to the transcript. Nothing changes when the
    /// message is rejected.
    pub fn submit_user_message(&mut self, text: &str) -> Result<(), SessionError> {
        self.check_credential()?;
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        if self.transcript.awaiting_response() {
            return Err(SessionError::TurnPending);
        }
        self.transcript.push(Message::new(Role::User, text));
        Ok(())
    }

    /// Takes effect on the next turn.
    pub fn edit_system_prompt(&mut self, text: &str) {
        self.system_prompt.set(text);
    }

    pub fn clear_history(&mut self) {
        self.transcript.clear();
    }

    /// Runs the next turn if the last message is from the user,
    /// otherwise returns `None`.
    ///
    /// Each fragment is passed to `on_fragment` as soon as it arrives,
    /// and the concatenation of all of them is appended to the
    /// transcript as the assistant's response. Errors never escape:
    /// their text is shown and stored like any other response so the
    /// session stays usable.
    pub async fn run_turn<F>(&mut self, mut on_fragment: F) -> Option<TurnOutcome>
    where
        F: FnMut(&str),
    {
        if !self.transcript.awaiting_response() {
            return None;
        }

        let span = tracing::debug_span!(
            "turn",
            session_id = %self.id,
            messages = self.transcript.len()
        );
        let (content, error) = self
            .stream_response(&mut on_fragment)
            .instrument(span)
            .await;

        if let Some(err) = &error {
            tracing::debug!("Turn ended with error: {:?}", err);
        }

        let message = Message::new(Role::Assistant, &content);
        self.transcript.push(message.clone());

        Some(TurnOutcome { message, error })
    }

    async fn stream_response<F>(&self, on_fragment: &mut F) -> (String, Option<ReplicateError>)
    where
        F: FnMut(&str),
    {
        let prompt = match self
            .prompt_builder
            .build(&self.system_prompt, &self.transcript)
        {
            Ok(prompt) => prompt,
            Err(e) => {
                let err = ReplicateError::Unexpected(e.to_string());
                let text = err.user_message();
                on_fragment(&text);
                return (text, Some(err));
            }
        };
        tracing::debug!("Sending prompt of {} bytes", prompt.len());

        // A missing token goes through anyway and comes back as an
        // error from the service
        let credential = self
            .credential
            .clone()
            .unwrap_or_else(|| Credential::interactive(""));

        let mut stream = self.streamer.stream(&prompt, &credential);
        let mut content = String::new();

        while let Some(next) = stream.next().await {
            match next {
                Ok(fragment) => {
                    on_fragment(&fragment);
                    content.push_str(&fragment);
                }
                Err(err) => {
                    let text = err.user_message();
                    on_fragment(&text);
                    content.push_str(&text);
                    return (content, Some(err));
                }
            }
        }

        (content, None)
    }
}

pub struct SessionBuilder {
    streamer: Box<dyn ResponseStreamer>,
    transcript: Transcript,
    system_prompt: SystemPrompt,
    credential: Option<Credential>,
    max_messages: Option<usize>,
}

impl SessionBuilder {
    pub fn new<S>(streamer: S) -> Self
    where
        S: ResponseStreamer + 'static,
    {
        Self {
            streamer: Box::new(streamer),
            transcript: Transcript::new(),
            system_prompt: SystemPrompt::default(),
            credential: None,
            max_messages: None,
        }
    }

    pub fn build(self) -> Session {
        Session {
            id: Uuid::new_v4(),
            transcript: self.transcript,
            system_prompt: self.system_prompt,
            credential: self.credential,
            prompt_builder: PromptBuilder::new().max_messages(self.max_messages),
            streamer: self.streamer,
        }
    }

    /// Earlier messages to resume from. They always follow the greeting.
    pub fn transcript(mut self, messages: Vec<Message>) -> Self {
        self.transcript = Transcript::with_history(messages);
        self
    }

    pub fn system_prompt(mut self, text: &str) -> Self {
        self.system_prompt = SystemPrompt::new(text);
        self
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn max_messages(mut self, limit: Option<usize>) -> Self {
        self.max_messages = limit;
        self
    }
}
