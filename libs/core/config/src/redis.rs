use crate::{ConfigError, FromEnv, env_optional, env_or_default, env_parse_or};

/// Redis configuration
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Build a URL from discrete host settings.
    pub fn from_parts(host: &str, port: u16, password: Option<&str>) -> Self {
        let url = match password {
            Some(password) => format!("redis://:{}@{}:{}", password, host, port),
            None => format!("redis://{}:{}", host, port),
        };
        Self { url }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::new("redis://localhost:6379")
    }
}

impl FromEnv for RedisConfig {
    /// `REDIS_URL` wins; otherwise the URL is assembled from
    /// `REDIS_HOST` (localhost), `REDIS_PORT` (6379) and `REDIS_PASSWORD`.
    fn from_env() -> Result<Self, ConfigError> {
        if let Some(url) = env_optional("REDIS_URL") {
            if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
                return Err(ConfigError::invalid(
                    "REDIS_URL",
                    "expected a redis:// or rediss:// URL",
                ));
            }
            return Ok(Self::new(url));
        }

        let host = env_or_default("REDIS_HOST", "localhost");
        let port: u16 = env_parse_or("REDIS_PORT", 6379)?;
        let password = env_optional("REDIS_PASSWORD");

        Ok(Self::from_parts(&host, port, password.as_deref()))
    }
}
