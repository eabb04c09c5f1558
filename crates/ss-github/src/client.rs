use std::time::Duration;

use octocrab::Octocrab;
use thiserror::Error;

/// Error surface of the code-host adapter.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("not found")]
    NotFound,

    #[error("rate limited by host (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authentication failed")]
    AuthFailed,

    #[error("host unavailable: {0}")]
    Unavailable(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("missing GitHub token — set the configured token env var")]
    MissingToken,
}

impl From<octocrab::Error> for HostError {
    fn from(err: octocrab::Error) -> Self {
        match err {
            octocrab::Error::GitHub { source, .. } => {
                let status = source.status_code.as_u16();
                let message = source.message.clone();
                match status {
                    404 => HostError::NotFound,
                    401 => HostError::AuthFailed,
                    403 if message.to_lowercase().contains("rate limit") => {
                        HostError::RateLimited { retry_after: None }
                    }
                    403 => HostError::AuthFailed,
                    429 => HostError::RateLimited { retry_after: None },
                    s if s >= 500 => HostError::Unavailable(message),
                    _ => HostError::InvalidResponse(format!("status {status}: {message}")),
                }
            }
            other => HostError::Unavailable(other.to_string()),
        }
    }
}

impl ss_harness::retry::Transient for HostError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            HostError::RateLimited { .. } | HostError::Unavailable(_)
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            HostError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, HostError>;

/// Authenticated GitHub REST client.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    pub(crate) octocrab: Octocrab,
}

impl GitHubClient {
    /// Create a client from an explicit personal access token.
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let octocrab = Octocrab::builder()
            .personal_token(token.into())
            .build()
            .map_err(HostError::from)?;
        Ok(Self { octocrab })
    }

    /// Create a client by reading the token from the given environment
    /// variable (usually `GITHUB_TOKEN`).
    pub fn new_from_env(token_env: &str) -> Result<Self> {
        let token = std::env::var(token_env).map_err(|_| HostError::MissingToken)?;
        if token.is_empty() {
            return Err(HostError::MissingToken);
        }
        Self::new(token)
    }

    /// Returns a reference to the inner `Octocrab` instance.
    pub fn inner(&self) -> &Octocrab {
        &self.octocrab
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
