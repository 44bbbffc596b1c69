//! Environment Configuration
//!
//! All runtime configuration comes from environment variables (a `.env`
//! file is honoured in development). Missing or invalid keys fail startup
//! with a structured error; nothing here is defaulted silently in
//! production.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Minimum length for the access-token secret
const MIN_TOKEN_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            "test" => Ok(Environment::Test),
            other => Err(ConfigError::Invalid {
                key: "APP_ENV",
                reason: format!("unknown environment '{}'", other),
            }),
        }
    }
}

/// Where the wallet key comes from
#[derive(Debug, Clone)]
pub enum WalletKeySource {
    File(String),
    Base64Secret(String),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub environment: Environment,
    pub network: String,
    pub rpc_url: String,
    pub safe_wallet_program_id: String,
    pub access_token_secret: String,
    pub token_issuer: String,
    pub access_token_ttl: String,
    pub refresh_token_ttl: String,
    pub log_level: String,
    pub database_path: PathBuf,
    pub cors_origins: Vec<String>,
    pub ml_service_url: Option<String>,
    pub ml_api_key: Option<String>,
    pub wallet_key: Option<WalletKeySource>,
    pub pool_api_url: String,
    pub swap_api_url: String,
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl AppConfig {
    /// Read and validate the full configuration from the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = required("PORT")?
            .parse::<u16>()
            .map_err(|e| ConfigError::Invalid {
                key: "PORT",
                reason: e.to_string(),
            })?;

        let environment = Environment::parse(&required("APP_ENV")?)?;

        let wallet_key = match (
            optional("WALLET_KEYPAIR_PATH"),
            optional("WALLET_SECRET_BASE64"),
        ) {
            (Some(path), _) => {
                let expanded = shellexpand::tilde(&path).to_string();
                Some(WalletKeySource::File(expanded))
            }
            (None, Some(secret)) => Some(WalletKeySource::Base64Secret(secret)),
            (None, None) => None,
        };

        let config = Self {
            port,
            environment,
            network: required("SOLANA_NETWORK")?,
            rpc_url: required("SOLANA_RPC_URL")?,
            safe_wallet_program_id: required("SAFE_WALLET_PROGRAM_ID")?,
            access_token_secret: required("ACCESS_TOKEN_SECRET")?,
            token_issuer: required("TOKEN_ISSUER")?,
            access_token_ttl: optional("ACCESS_TOKEN_TTL").unwrap_or_else(|| "15m".to_string()),
            refresh_token_ttl: optional("REFRESH_TOKEN_TTL").unwrap_or_else(|| "7d".to_string()),
            log_level: optional("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            database_path: PathBuf::from(
                optional("DATABASE_PATH").unwrap_or_else(|| "data/bots.db".to_string()),
            ),
            cors_origins: optional("CORS_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            ml_service_url: optional("ML_SERVICE_URL"),
            ml_api_key: optional("ML_API_KEY"),
            wallet_key,
            pool_api_url: required("POOL_API_URL")?,
            swap_api_url: optional("SWAP_API_URL")
                .unwrap_or_else(|| "https://quote-api.jup.ag/v6".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access_token_secret.len() < MIN_TOKEN_SECRET_LEN {
            return Err(ConfigError::Invalid {
                key: "ACCESS_TOKEN_SECRET",
                reason: format!("must be at least {} characters", MIN_TOKEN_SECRET_LEN),
            });
        }

        if self.rpc_url.is_empty() {
            return Err(ConfigError::Invalid {
                key: "SOLANA_RPC_URL",
                reason: "cannot be empty".to_string(),
            });
        }

        if self.pool_api_url.is_empty() {
            return Err(ConfigError::Invalid {
                key: "POOL_API_URL",
                reason: "cannot be empty".to_string(),
            });
        }

        // Production must name its CORS origins explicitly
        if self.environment == Environment::Production && self.cors_origins.is_empty() {
            return Err(ConfigError::Invalid {
                key: "CORS_ORIGINS",
                reason: "production requires an explicit origin list".to_string(),
            });
        }

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}
