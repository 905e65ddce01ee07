//! API token handling. The format check is purely advisory: Replicate
//! is the only authority on whether a token actually works.
use std::fmt;

use thiserror::Error;

pub const TOKEN_PREFIX: &str = "r8_";
pub const TOKEN_LENGTH: usize = 40;
pub const TOKEN_HINT: &str = "Replicate tokens start with 'r8_' and are 40 characters long";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("No API token provided")]
    Missing,
    #[error("API token is empty")]
    Empty,
    #[error("API token must start with 'r8_'")]
    InvalidPrefix,
    #[error("API token must be 40 characters long, got {0}")]
    InvalidLength(usize),
}

/// Where the token came from. Tokens from configuration are trusted
/// and skip the format check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    Config,
    Interactive,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    source: CredentialSource,
}

impl Credential {
    pub fn new(token: &str, source: CredentialSource) -> Self {
        Self {
            token: token.to_string(),
            source,
        }
    }

    pub fn from_config(token: &str) -> Self {
        Self::new(token, CredentialSource::Config)
    }

    pub fn interactive(token: &str) -> Self {
        Self::new(token, CredentialSource::Interactive)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn check_format(&self) -> Result<(), CredentialError> {
        if self.token.is_empty() {
            return Err(CredentialError::Empty);
        }
        if !self.token.starts_with(TOKEN_PREFIX) {
            return Err(CredentialError::InvalidPrefix);
        }
        let len = self.token.chars().count();
        if len != TOKEN_LENGTH {
            return Err(CredentialError::InvalidLength(len));
        }
        Ok(())
    }

    /// Whether chat input should be enabled with this token.
    pub fn ensure_usable(&self) -> Result<(), CredentialError> {
        if self.token.is_empty() {
            return Err(CredentialError::Empty);
        }
        match self.source {
            CredentialSource::Config => Ok(()),
            CredentialSource::Interactive => self.check_format(),
        }
    }
}

// Never print the token itself
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}
