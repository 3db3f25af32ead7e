use crate::errors::{AppError, AppResult};
use std::sync::Arc;
use tokio::sync::Mutex;

const KEYRING_SERVICE: &str = "focus-board";
const KEYRING_ACCOUNT: &str = "completion-api-token";
const TOKEN_ENV: &str = "FOCUS_BOARD_API_KEY";

/// Completion endpoint token kept in the OS keyring, with an environment
/// variable fallback for headless runs.
#[derive(Clone, Default)]
pub struct CredentialStore {
    keyring_lock: Arc<Mutex<()>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn save_token(&self, token: &str) -> AppResult<()> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AppError::Validation("Token cannot be empty".to_string()));
        }
        let _guard = self.keyring_lock.lock().await;
        entry()?.set_password(token)?;
        tracing::info!(service = KEYRING_SERVICE, "saved completion token");
        Ok(())
    }

    pub async fn clear_token(&self) -> AppResult<()> {
        let _guard = self.keyring_lock.lock().await;
        match entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(AppError::Io(error.to_string())),
        }
    }

    pub async fn has_token(&self) -> AppResult<bool> {
        Ok(self.token().await?.is_some())
    }

    /// Keyring first, then `FOCUS_BOARD_API_KEY`. An unreachable keyring
    /// falls through to the environment.
    pub async fn token(&self) -> AppResult<Option<String>> {
        let stored = {
            let _guard = self.keyring_lock.lock().await;
            match entry().and_then(|entry| entry.get_password().map_err(AppError::from)) {
                Ok(value) if !value.trim().is_empty() => Some(value),
                Ok(_) => None,
                Err(error) => {
                    tracing::debug!(error = %error, "keyring lookup failed, checking environment");
                    None
                }
            }
        };
        if stored.is_some() {
            return Ok(stored);
        }
        Ok(env_token())
    }
}

fn entry() -> AppResult<keyring::Entry> {
    keyring::Entry::new(KEYRING_SERVICE, KEYRING_ACCOUNT).map_err(|error| AppError::Io(error.to_string()))
}

fn env_token() -> Option<String> {
    std::env::var(TOKEN_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
