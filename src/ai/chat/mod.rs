pub mod core;
pub mod credential;
pub mod models;

pub use self::core::{Session, SessionBuilder, SessionError, TurnOutcome};
pub use credential::{Credential, CredentialError, CredentialSource, TOKEN_HINT};
pub use models::{DEFAULT_GREETING, DEFAULT_SYSTEM_PROMPT, Message, Role, SystemPrompt, Transcript};
