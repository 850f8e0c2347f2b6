use crate::llm::LlmSettings;
use crate::llm::orchestrator::ChatConfig;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4-0125-preview";

const DEFAULT_SYSTEM_PROMPT: &str = "You are ChatHN, a helpful assistant for browsing Hacker News. \
Use the available functions to look up stories and comments instead of guessing. \
Keep answers concise and include story links when you mention a story.";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Enable rate limiting
    #[arg(long, env = "RATE_LIMIT_ENABLED")]
    pub rate_limit_enabled: Option<bool>,

    /// Deployment environment (`production` or `development`)
    #[arg(long, env = "APP_ENV")]
    pub environment: Option<String>,

    /// Rate-limit store URL (`redis://...` or `memory://`)
    #[arg(long, env = "KV_URL")]
    pub kv_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AppEnvironment {
    Development,
    #[default]
    Production,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub rate_limit: RateLimitConfig,
    pub chat: ChatConfig,
    pub hacker_news: HackerNewsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Requests allowed per window.
    pub limit: u64,
    pub window_secs: u64,
    /// Key prefix; keys are `<prefix>_<client>`.
    pub prefix: String,
    /// Store URL. Without one the limiter is disabled.
    #[serde(default)]
    pub store_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HackerNewsConfig {
    pub base_url: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder();

        // 1. Defaults
        builder = builder
            .set_default("environment", "production")?
            .set_default("server.port", 3000)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("rate_limit.enabled", true)?
            .set_default("rate_limit.limit", 50)?
            .set_default("rate_limit.window_secs", 86_400)?
            .set_default("rate_limit.prefix", "chathn_ratelimit")?
            .set_default("chat.system_prompt", DEFAULT_SYSTEM_PROMPT)?
            .set_default("chat.max_function_rounds", 5)?
            .set_default("chat.typing.max_length", 200)?
            .set_default("chat.typing.min_delay_ms", 30)?
            .set_default("chat.typing.max_delay_ms", 100)?
            .set_default("hacker_news.base_url", "https://hacker-news.firebaseio.com")?;

        // 2. Config file: explicit path, else ./config.yaml when present
        if let Some(path) = &cli.config {
            builder = builder.add_source(File::with_name(path));
        } else if Path::new("config.yaml").exists() {
            builder = builder.add_source(File::with_name("config.yaml"));
        }

        // 3. Environment variables, e.g. CHATHN_SERVER__PORT=8000
        builder = builder.add_source(
            Environment::with_prefix("CHATHN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // 4. CLI flags and their env aliases win
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(rl) = cli.rate_limit_enabled {
            builder = builder.set_override("rate_limit.enabled", rl)?;
        }
        if let Some(environment) = cli.environment {
            builder = builder.set_override("environment", environment.to_lowercase())?;
        }
        if let Some(url) = cli.kv_url.filter(|u| !u.trim().is_empty()) {
            builder = builder.set_override("rate_limit.store_url", url)?;
        }

        let cfg = builder.build()?;
        cfg.try_deserialize()
    }
}

pub fn load_llm_settings() -> Result<LlmSettings, String> {
    let base_url = non_empty_var("LLM_BASE_URL").unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string());
    let model = non_empty_var("LLM_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string());

    let api_key = non_empty_var("LLM_API_KEY").or_else(|| non_empty_var("OPENAI_API_KEY"));
    if api_key.is_none() {
        tracing::warn!("No LLM_API_KEY or OPENAI_API_KEY set; upstream requests are unauthenticated");
    }

    url::Url::parse(&base_url).map_err(|e| format!("Invalid LLM_BASE_URL '{base_url}': {e}"))?;

    Ok(LlmSettings {
        base_url,
        api_key,
        model,
    })
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}
