use std::time::Duration;

/// Runtime configuration, resolved once at startup from the environment.
/// Policy knobs (fuzzy threshold, provider timeout) live here so resolution
/// itself stays a pure function of its inputs.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: Option<String>,
    pub fuzzy_threshold: f64,
    pub provider_timeout: Duration,
    pub provider_base_url: String,
    pub default_ai_model: String,
    pub rule_cache_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 4000,
            database_url: None,
            fuzzy_threshold: 0.8,
            provider_timeout: Duration::from_millis(8_000),
            provider_base_url: "https://api.openai.com/v1".to_string(),
            default_ai_model: "gpt-4.1-mini".to_string(),
            rule_cache_ttl: Duration::from_millis(30_000),
        }
    }
}

impl Config {
    pub fn from_env() -> Config {
        let defaults = Config::default();
        Config {
            port: env_parse("PORT", defaults.port),
            database_url: resolve_database_url(),
            fuzzy_threshold: env_parse("FUZZY_MATCH_THRESHOLD", defaults.fuzzy_threshold)
                .clamp(0.0, 1.0),
            provider_timeout: Duration::from_millis(env_parse(
                "AI_PROVIDER_TIMEOUT_MS",
                defaults.provider_timeout.as_millis() as u64,
            )),
            provider_base_url: env_string("AI_PROVIDER_BASE_URL", &defaults.provider_base_url),
            default_ai_model: env_string("AI_DEFAULT_MODEL", &defaults.default_ai_model),
            rule_cache_ttl: Duration::from_millis(env_parse(
                "RULE_CACHE_TTL_MS",
                defaults.rule_cache_ttl.as_millis() as u64,
            )),
        }
    }
}

fn env_string(key: &str, fallback: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(fallback)
}

fn resolve_database_url() -> Option<String> {
    for key in ["DATABASE_URL", "POSTGRES_URL"] {
        if let Ok(value) = std::env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.fuzzy_threshold, 0.8);
        assert!(cfg.provider_timeout >= Duration::from_millis(1_000));
        assert!(cfg.database_url.is_none());
    }
}
