use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::{Confirm, Input, Password, Select};
use std::io::Write;
use std::path::PathBuf;

use crate::auth::SessionSettings;
use crate::clock::MAX_SPAN_SECS;
use crate::identity::{DEFAULT_IDENTITY_URL, DEFAULT_SECURE_TOKEN_URL};

/// SoCap session agent
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "SERVER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT", default_value = "8420")]
    pub port: u16,

    /// API key local clients must present to the agent
    #[arg(short = 'k', long, env = "AGENT_API_KEY")]
    pub api_key: Option<String>,

    /// Firebase web API key
    #[arg(long, env = "FIREBASE_API_KEY")]
    pub firebase_api_key: Option<String>,

    /// Base URL of the SoCap backend API
    #[arg(short = 'b', long, env = "BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Credential storage backend (keyring, sqlite, memory)
    #[arg(short = 's', long, env = "SESSION_STORE", default_value = "keyring")]
    pub store: String,

    /// SQLite database used by the sqlite store
    #[arg(short = 'd', long, env = "SESSION_DB_FILE", default_value = "~/.socap/session.sqlite3")]
    pub db_file: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Idle timeout in seconds
    #[arg(long, env = "IDLE_TIMEOUT", default_value = "1800")]
    pub idle_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// HTTP max retries
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "3")]
    pub http_retries: u32,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Authentication
    pub agent_api_key: String,
    pub firebase_api_key: String,

    // Upstream endpoints
    pub backend_url: String,
    pub identity_url: String,
    pub secure_token_url: String,

    // Storage
    pub store_backend: StoreBackend,
    pub sqlite_path: PathBuf,

    // Session timing (seconds)
    pub token_refresh_threshold: u64,
    pub token_refresh_interval: u64,
    pub default_token_ttl: u64,
    pub idle_timeout: u64,
    pub idle_check_interval: u64,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Keyring, // OS keychain
    Sqlite,  // File fallback for hosts without a keychain
    Memory,  // Nothing survives a restart
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Config {
            server_host: args.host,
            server_port: args.port,

            // Required: CLI > ENV
            agent_api_key: args
                .api_key
                .context("AGENT_API_KEY is required (use -k or set AGENT_API_KEY env var)")?,
            firebase_api_key: args.firebase_api_key.context(
                "FIREBASE_API_KEY is required (use --firebase-api-key or set FIREBASE_API_KEY env var)",
            )?,
            backend_url: args
                .backend_url
                .map(|url| url.trim_end_matches('/').to_string())
                .context("BACKEND_URL is required (use -b or set BACKEND_URL env var)")?,

            identity_url: std::env::var("FIREBASE_IDENTITY_URL")
                .unwrap_or_else(|_| DEFAULT_IDENTITY_URL.to_string()),
            secure_token_url: std::env::var("FIREBASE_SECURE_TOKEN_URL")
                .unwrap_or_else(|_| DEFAULT_SECURE_TOKEN_URL.to_string()),

            store_backend: parse_store_backend(&args.store),
            sqlite_path: expand_tilde(&args.db_file),

            token_refresh_threshold: env_or("TOKEN_REFRESH_THRESHOLD", 300),
            token_refresh_interval: env_or("TOKEN_REFRESH_INTERVAL", 60),
            default_token_ttl: env_or("DEFAULT_TOKEN_TTL", 3600),
            idle_timeout: args.idle_timeout,
            idle_check_interval: env_or("IDLE_CHECK_INTERVAL", 60),

            http_connect_timeout: env_or("HTTP_CONNECT_TIMEOUT", 10),
            http_request_timeout: args.http_timeout,
            http_max_retries: args.http_retries,

            log_level: args.log_level,
            log_format: parse_log_format(&args.log_format),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("BACKEND_URL", &self.backend_url),
            ("FIREBASE_IDENTITY_URL", &self.identity_url),
            ("FIREBASE_SECURE_TOKEN_URL", &self.secure_token_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("{} must be an http(s) URL: {}", name, url);
            }
        }

        if self.idle_timeout == 0 {
            anyhow::bail!("IDLE_TIMEOUT must be greater than zero");
        }

        for (name, secs) in [
            ("TOKEN_REFRESH_THRESHOLD", self.token_refresh_threshold),
            ("TOKEN_REFRESH_INTERVAL", self.token_refresh_interval),
            ("DEFAULT_TOKEN_TTL", self.default_token_ttl),
            ("IDLE_TIMEOUT", self.idle_timeout),
            ("IDLE_CHECK_INTERVAL", self.idle_check_interval),
        ] {
            if secs > MAX_SPAN_SECS {
                anyhow::bail!("{} must be at most {} seconds, got {}", name, MAX_SPAN_SECS, secs);
            }
        }

        if self.token_refresh_threshold >= self.default_token_ttl {
            tracing::warn!(
                "TOKEN_REFRESH_THRESHOLD ({}s) is not below DEFAULT_TOKEN_TTL ({}s), every token will be refreshed before use",
                self.token_refresh_threshold,
                self.default_token_ttl
            );
        }

        Ok(())
    }

    /// Timing knobs for the session components
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            token_refresh_threshold: self.token_refresh_threshold,
            token_refresh_interval: self.token_refresh_interval,
            default_token_ttl: self.default_token_ttl,
            idle_timeout: self.idle_timeout,
            idle_check_interval: self.idle_check_interval,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse store backend from string
fn parse_store_backend(s: &str) -> StoreBackend {
    match s.to_lowercase().as_str() {
        "sqlite" => StoreBackend::Sqlite,
        "memory" => StoreBackend::Memory,
        _ => StoreBackend::Keyring,
    }
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}


// === Interactive Setup ===

/// Check if interactive setup is needed (no .env file and missing required values)
pub fn needs_interactive_setup() -> bool {
    let env_file_exists = std::path::Path::new(".env").exists();

    let missing_required = ["AGENT_API_KEY", "FIREBASE_API_KEY", "BACKEND_URL"]
        .iter()
        .any(|name| std::env::var(name).is_err());

    !env_file_exists && missing_required
}

/// Run interactive setup to collect required configuration
pub fn run_interactive_setup() -> Result<InteractiveConfig> {
    println!();
    println!("SoCap session agent - first time setup");
    println!();
    println!("No configuration found. Let's set up the agent.");
    println!();

    let agent_api_key: String = Password::new()
        .with_prompt("Enter a key local clients must present (AGENT_API_KEY)")
        .interact()
        .context("Failed to read AGENT_API_KEY")?;

    if agent_api_key.is_empty() {
        anyhow::bail!("AGENT_API_KEY cannot be empty");
    }

    let firebase_api_key: String = Password::new()
        .with_prompt("Firebase web API key (FIREBASE_API_KEY)")
        .interact()
        .context("Failed to read FIREBASE_API_KEY")?;

    if firebase_api_key.is_empty() {
        anyhow::bail!("FIREBASE_API_KEY cannot be empty");
    }

    println!();
    let backend_url: String = Input::new()
        .with_prompt("SoCap backend URL (BACKEND_URL)")
        .interact_text()
        .context("Failed to read BACKEND_URL")?;

    println!();
    let stores = ["keyring", "sqlite", "memory"];
    let store_idx = Select::new()
        .with_prompt("Where should credentials be stored?")
        .items(&stores)
        .default(0)
        .interact()
        .context("Failed to read store selection")?;
    let session_store = stores[store_idx].to_string();

    println!();
    let server_port: String = Input::new()
        .with_prompt("Server port")
        .default("8420".to_string())
        .interact_text()
        .context("Failed to read server port")?;

    let config = InteractiveConfig {
        agent_api_key,
        firebase_api_key,
        backend_url,
        session_store,
        server_port,
    };

    println!();
    let save_to_env = Confirm::new()
        .with_prompt("Save configuration to .env file?")
        .default(true)
        .interact()
        .context("Failed to read save confirmation")?;

    if save_to_env {
        save_env_file(&config)?;
        println!();
        println!("Configuration saved to .env file");
    }

    println!();
    println!("Setup complete! Starting agent...");
    println!();

    Ok(config)
}

/// Configuration collected from interactive setup
#[derive(Debug, Clone)]
pub struct InteractiveConfig {
    pub agent_api_key: String,
    pub firebase_api_key: String,
    pub backend_url: String,
    pub session_store: String,
    pub server_port: String,
}

/// Save configuration to .env file
fn save_env_file(config: &InteractiveConfig) -> Result<()> {
    let env_content = format!(
        r#"# SoCap session agent configuration
# Generated by interactive setup

# Key local clients present to the agent (required)
AGENT_API_KEY={}

# Firebase web API key (required)
FIREBASE_API_KEY={}

# SoCap backend (required)
BACKEND_URL={}

# Credential storage (keyring, sqlite, memory)
SESSION_STORE={}

# Server settings
SERVER_HOST=127.0.0.1
SERVER_PORT={}

# Logging (trace, debug, info, warn, error) and format (text, json)
LOG_LEVEL=info
LOG_FORMAT=text
"#,
        config.agent_api_key,
        config.firebase_api_key,
        config.backend_url,
        config.session_store,
        config.server_port,
    );

    let mut file = std::fs::File::create(".env").context("Failed to create .env file")?;
    file.write_all(env_content.as_bytes())
        .context("Failed to write .env file")?;

    Ok(())
}
