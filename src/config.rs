//! Process-wide configuration (C1), loaded once from environment variables.
//!
//! The core never reads provider API keys from the environment -- those
//! arrive per-request via [`crate::models::ProviderSelector`]. Config only
//! supplies defaults and service-level settings (cache sizing, timeouts,
//! the Sigma catalog path, logging).

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 100,
            default_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Default timeout for long generation stages (summary, IoC extraction,
    /// AI Sigma, SIEM refinement, atomic tests).
    pub generation: Duration,
    /// Default timeout for the smaller structural stages (YARA/MITRE/Sigma/SIEM).
    pub small_task: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            generation: Duration::from_secs(300),
            small_task: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub cors_origins: Vec<String>,
    pub rate_limit_per_minute: u32,
    pub max_upload_size_mb: u64,
    pub session_expiry_hours: u64,
    pub session_secret: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            cors_origins: vec!["http://localhost:3000".to_string()],
            rate_limit_per_minute: 60,
            max_upload_size_mb: 20,
            session_expiry_hours: 24,
            session_secret: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub default_provider: String,
    pub default_model: Option<String>,
    pub sigma_rules_dir: String,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
    pub logging: LoggingConfig,
    pub security: SecurityConfig,
    pub sigma_catalog_threshold: f64,
    pub sigma_catalog_top_k: usize,
    pub sigmahq_base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_provider: "openai".to_string(),
            default_model: None,
            sigma_rules_dir: "Global_Sigma_Rules".to_string(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            logging: LoggingConfig::default(),
            security: SecurityConfig::default(),
            sigma_catalog_threshold: 25.0,
            sigma_catalog_top_k: 15,
            sigmahq_base_url: "https://github.com/SigmaHQ/sigma/blob/master".to_string(),
        }
    }
}

impl Config {
    /// Read configuration from environment variables, falling back to
    /// [`Config::default`] for anything unset.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Ok(v) = env::var("PERSEPTOR_DEFAULT_PROVIDER") {
            cfg.default_provider = v;
        }
        if let Ok(v) = env::var("PERSEPTOR_DEFAULT_MODEL") {
            cfg.default_model = Some(v);
        }
        if let Ok(v) = env::var("PERSEPTOR_SIGMA_RULES_DIR") {
            cfg.sigma_rules_dir = v;
        }
        if let Ok(v) = env::var("SIGMAHQ_BASE_URL") {
            cfg.sigmahq_base_url = v;
        }
        if let Ok(v) = env::var("PERSEPTOR_CACHE_ENABLED") {
            cfg.cache.enabled = parse_bool(&v, cfg.cache.enabled);
        }
        if let Ok(v) = env::var("PERSEPTOR_CACHE_MAX_SIZE") {
            if let Ok(n) = v.parse() {
                cfg.cache.max_size = n;
            }
        }
        if let Ok(v) = env::var("PERSEPTOR_CACHE_TTL_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.cache.default_ttl = Duration::from_secs(n);
            }
        }
        if let Ok(v) = env::var("PERSEPTOR_RETRY_MAX_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                cfg.retry.max_retries = n;
            }
        }
        if let Ok(v) = env::var("PERSEPTOR_LOG_LEVEL") {
            cfg.logging.level = v;
        }
        if let Ok(v) = env::var("PERSEPTOR_LOG_FORMAT") {
            cfg.logging.format = if v.eq_ignore_ascii_case("text") {
                LogFormat::Text
            } else {
                LogFormat::Json
            };
        }
        if let Ok(v) = env::var("PERSEPTOR_CORS_ORIGINS") {
            cfg.security.cors_origins = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = env::var("PERSEPTOR_SESSION_SECRET") {
            cfg.security.session_secret = v;
        }
        if let Ok(v) = env::var("PERSEPTOR_SESSION_EXPIRY_HOURS") {
            if let Ok(n) = v.parse() {
                cfg.security.session_expiry_hours = n;
            }
        }

        cfg
    }
}

fn parse_bool(raw: &str, default: bool) -> bool {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.default_provider, "openai");
        assert_eq!(cfg.retry.max_retries, 3);
        assert!(cfg.cache.enabled);
    }

    #[test]
    fn parse_bool_falls_back_on_garbage() {
        assert!(parse_bool("garbage", true));
        assert!(!parse_bool("off", true));
    }
}
