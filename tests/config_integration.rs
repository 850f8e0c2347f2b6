use chathn::config::{AppConfig, AppEnvironment, load_llm_settings};
use chathn::rate_limit::RateLimiter;
use serial_test::serial;
use std::env;
use std::fs;
use std::io::Write;

// Helper to clear environment variables that might interfere with tests
fn clear_env_vars() {
    unsafe {
        for key in [
            "CHATHN_SERVER__PORT",
            "CHATHN_RATE_LIMIT__LIMIT",
            "CHATHN_CHAT__TYPING__MAX_LENGTH",
            "CONFIG_FILE",
            "PORT",
            "RATE_LIMIT_ENABLED",
            "APP_ENV",
            "KV_URL",
            "LLM_BASE_URL",
            "LLM_API_KEY",
            "OPENAI_API_KEY",
            "LLM_MODEL",
        ] {
            env::remove_var(key);
        }
    }
}

fn load(args: &[&str]) -> AppConfig {
    let mut argv = vec!["chathn"];
    argv.extend_from_slice(args);
    AppConfig::load_from_args(argv).expect("Failed to load config")
}

#[test]
#[serial]
fn test_default_config() {
    clear_env_vars();

    let config = load(&[]);
    assert_eq!(config.server.port, 3000);
    assert_eq!(config.environment, AppEnvironment::Production);
    assert!(config.rate_limit.enabled);
    assert_eq!(config.rate_limit.limit, 50);
    assert_eq!(config.rate_limit.window_secs, 86_400);
    assert_eq!(config.rate_limit.prefix, "chathn_ratelimit");
    assert!(config.rate_limit.store_url.is_none());
    assert_eq!(config.chat.max_function_rounds, 5);
    assert_eq!(config.chat.typing.max_length, 200);
    assert_eq!(config.chat.typing.min_delay_ms, 30);
    assert_eq!(config.chat.typing.max_delay_ms, 100);
}

#[test]
#[serial]
fn test_env_override() {
    clear_env_vars();
    unsafe {
        env::set_var("CHATHN_SERVER__PORT", "9090");
        env::set_var("CHATHN_RATE_LIMIT__LIMIT", "5");
        env::set_var("CHATHN_CHAT__TYPING__MAX_LENGTH", "80");
    }

    let config = load(&[]);
    assert_eq!(config.server.port, 9090);
    assert_eq!(config.rate_limit.limit, 5);
    assert_eq!(config.chat.typing.max_length, 80);

    clear_env_vars();
}

#[test]
#[serial]
fn test_file_load() {
    clear_env_vars();

    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("Failed to create temp config");
    write!(
        file,
        r"
server:
  port: 7070
rate_limit:
  limit: 10
chat:
  system_prompt: Be terse.
"
    )
    .expect("Failed to write temp config");

    let path = file.path().to_str().unwrap().to_string();
    let config = load(&["--config", &path]);
    assert_eq!(config.server.port, 7070);
    assert_eq!(config.rate_limit.limit, 10);
    assert_eq!(config.chat.system_prompt, "Be terse.");
    // Untouched keys keep their defaults.
    assert_eq!(config.rate_limit.window_secs, 86_400);
}

#[test]
#[serial]
fn test_cli_beats_env_and_file() {
    clear_env_vars();

    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("Failed to create temp config");
    writeln!(file, "server:\n  port: 7070").expect("Failed to write temp config");
    unsafe {
        env::set_var("CHATHN_SERVER__PORT", "9090");
    }

    let path = file.path().to_str().unwrap().to_string();
    let config = load(&["--config", &path, "--port", "8181"]);
    assert_eq!(config.server.port, 8181);

    clear_env_vars();
}

#[test]
#[serial]
fn test_cwd_config_fallback() {
    clear_env_vars();

    let cwd_path = "config.yaml";
    fs::write(cwd_path, "server:\n  port: 6060\n").expect("Failed to write ./config.yaml");

    let config = AppConfig::load_from_args(["chathn"]);

    fs::remove_file(cwd_path).unwrap();

    assert_eq!(config.expect("Failed to load config").server.port, 6060);
}

#[tokio::test]
#[serial]
async fn test_rate_limiter_selection() {
    clear_env_vars();

    // No store configured: disabled.
    let config = load(&[]);
    assert!(matches!(
        RateLimiter::from_config(&config).unwrap(),
        RateLimiter::Disabled
    ));

    // Store configured: enforced.
    let config = load(&["--kv-url", "memory://"]);
    assert!(matches!(
        RateLimiter::from_config(&config).unwrap(),
        RateLimiter::Enforced { .. }
    ));

    // Development never limits.
    let config = load(&["--kv-url", "memory://", "--environment", "development"]);
    assert_eq!(config.environment, AppEnvironment::Development);
    assert!(matches!(
        RateLimiter::from_config(&config).unwrap(),
        RateLimiter::Disabled
    ));

    // Explicitly switched off.
    let config = load(&["--kv-url", "memory://", "--rate-limit-enabled", "false"]);
    assert!(matches!(
        RateLimiter::from_config(&config).unwrap(),
        RateLimiter::Disabled
    ));

    // Redis URLs are accepted without connecting.
    let config = load(&["--kv-url", "redis://127.0.0.1:6379"]);
    assert!(matches!(
        RateLimiter::from_config(&config).unwrap(),
        RateLimiter::Enforced { .. }
    ));
}

#[test]
#[serial]
fn test_llm_settings() {
    clear_env_vars();

    let settings = load_llm_settings().unwrap();
    assert_eq!(settings.base_url, "https://api.openai.com");
    assert_eq!(settings.model, "gpt-4-0125-preview");
    assert!(settings.api_key.is_none());

    unsafe {
        env::set_var("OPENAI_API_KEY", "sk-openai");
    }
    assert_eq!(load_llm_settings().unwrap().api_key.as_deref(), Some("sk-openai"));

    unsafe {
        env::set_var("LLM_API_KEY", "sk-llm");
        env::set_var("LLM_MODEL", "gpt-4o-mini");
    }
    let settings = load_llm_settings().unwrap();
    assert_eq!(settings.api_key.as_deref(), Some("sk-llm"));
    assert_eq!(settings.model, "gpt-4o-mini");

    unsafe {
        env::set_var("LLM_BASE_URL", "not a url");
    }
    assert!(load_llm_settings().is_err());

    clear_env_vars();
}
