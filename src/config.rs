use crate::error::ChatError;
use crate::models::Provider;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const DEFAULT_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DB_FILE_NAME: &str = "arcchat.sqlite";

// --- API Key Retrieval ---

/// Provider credentials read once at start-up.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    pub openai: Option<String>,
    pub google: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self {
            openai: read_non_empty(Provider::OpenAI.credential_var()),
            google: read_non_empty(Provider::Google.credential_var()),
        }
    }

    /// Returns the credential for `provider`, or a configuration error naming
    /// the variable that has to be set.
    pub fn api_key(&self, provider: Provider) -> Result<&str, ChatError> {
        let key = match provider {
            Provider::OpenAI => self.openai.as_deref(),
            Provider::Google => self.google.as_deref(),
        };
        key.ok_or_else(|| {
            ChatError::Configuration(format!(
                "{} API key is not configured. Please add {} to your environment variables.",
                provider.display_name(),
                provider.credential_var()
            ))
        })
    }

    pub fn configured_providers(&self) -> Vec<Provider> {
        [Provider::OpenAI, Provider::Google]
            .into_iter()
            .filter(|p| self.api_key(*p).is_ok())
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct Endpoints {
    pub openai_base_url: String,
    pub google_base_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            google_base_url: DEFAULT_GOOGLE_BASE_URL.to_string(),
        }
    }
}

/// Everything the service needs, passed down from `run()`.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub credentials: Credentials,
    pub endpoints: Endpoints,
}

impl AppConfig {
    /// Loads `.env.local` / `.env` (without overriding the process
    /// environment), then reads the configuration variables.
    pub fn load(bind: Option<SocketAddr>, data_dir: Option<PathBuf>) -> Result<Self> {
        load_dotenv();

        let bind = match bind {
            Some(addr) => addr,
            None => std::env::var("ARCCHAT_BIND")
                .unwrap_or_else(|_| DEFAULT_BIND.to_string())
                .parse()
                .context("ARCCHAT_BIND is not a valid socket address")?,
        };

        let data_dir = match data_dir.or_else(|| read_non_empty("ARCCHAT_DATA_DIR").map(PathBuf::from)) {
            Some(dir) => dir,
            None => dirs::data_local_dir()
                .context("Failed to resolve local data directory")?
                .join("arcchat"),
        };

        let endpoints = Endpoints {
            openai_base_url: read_non_empty("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            google_base_url: read_non_empty("GOOGLE_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GOOGLE_BASE_URL.to_string()),
        };

        Ok(Self {
            bind,
            data_dir,
            credentials: Credentials::from_env(),
            endpoints,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }
}

pub fn load_dotenv() {
    for file in [".env.local", ".env"] {
        if Path::new(file).exists() {
            match dotenvy::from_filename(file) {
                Ok(_) => log::debug!("Loaded environment from {}", file),
                Err(e) => log::warn!("Failed to load {}: {}", file, e),
            }
        }
    }
}

// Presence, not validity: an empty value counts as unset.
fn read_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credential_names_the_variable() {
        let creds = Credentials::default();
        let err = creds.api_key(Provider::OpenAI).unwrap_err();
        assert_eq!(
            err.to_string(),
            "OpenAI API key is not configured. Please add OPENAI_API_KEY to your environment variables."
        );
        let err = creds.api_key(Provider::Google).unwrap_err();
        assert!(err.to_string().contains("GOOGLE_GENERATIVE_AI_API_KEY"));
    }

    #[test]
    fn lists_only_configured_providers() {
        let creds = Credentials {
            openai: None,
            google: Some("g-key".into()),
        };
        assert_eq!(creds.configured_providers(), vec![Provider::Google]);
        assert_eq!(creds.api_key(Provider::Google).unwrap(), "g-key");
    }
}
