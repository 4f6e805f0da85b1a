use serde::Deserialize;

fn env_u64(name: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer", name)),
        Err(_) => Ok(default),
    }
}

fn env_u32(name: &str, default: u32) -> anyhow::Result<u32> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer", name)),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Base URL of the upstream plan pricing API.
    pub pricing_api_base_url: String,
    pub pricing_api_key: String,
    /// Base URL of the address resolution sub-service.
    pub resolution_api_base_url: String,
    /// Distributed cache tier; unset runs memory-only.
    pub redis_url: Option<String>,
    /// TTL for per-territory plan sets.
    pub plans_cache_ttl_secs: u64,
    /// TTL for reference/resolution data, much longer than plan pricing.
    pub reference_cache_ttl_secs: u64,
    pub cache_capacity: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
    /// Outbound pricing-API budget per window.
    pub upstream_rate_limit: u32,
    pub upstream_rate_window_secs: u64,
    /// Per-client budget on the ZIP validation endpoint.
    pub client_rate_limit: u32,
    pub client_rate_window_secs: u64,
    /// Attempt cap for retryable upstream failures (including the first try).
    pub retry_max_attempts: u32,
    pub http_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable required"))
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DATABASE_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DATABASE_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            pricing_api_base_url: std::env::var("PRICING_API_BASE_URL")
                .map_err(|_| anyhow::anyhow!("PRICING_API_BASE_URL environment variable required"))
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("PRICING_API_BASE_URL cannot be empty");
                    }
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        anyhow::bail!("PRICING_API_BASE_URL must start with http:// or https://");
                    }
                    Ok(url)
                })?,
            pricing_api_key: std::env::var("PRICING_API_KEY")
                .map_err(|_| anyhow::anyhow!("PRICING_API_KEY environment variable required"))
                .and_then(|key| {
                    if key.trim().is_empty() {
                        anyhow::bail!("PRICING_API_KEY cannot be empty");
                    }
                    Ok(key)
                })?,
            resolution_api_base_url: std::env::var("RESOLUTION_API_BASE_URL")
                .map_err(|_| {
                    anyhow::anyhow!("RESOLUTION_API_BASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("RESOLUTION_API_BASE_URL cannot be empty");
                    }
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        anyhow::bail!(
                            "RESOLUTION_API_BASE_URL must start with http:// or https://"
                        );
                    }
                    Ok(url)
                })?,
            redis_url: std::env::var("REDIS_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            plans_cache_ttl_secs: env_u64("PLANS_CACHE_TTL_SECS", 300)?,
            reference_cache_ttl_secs: env_u64("REFERENCE_CACHE_TTL_SECS", 86_400)?,
            cache_capacity: env_u64("CACHE_CAPACITY", 10_000)?,
            breaker_failure_threshold: env_u32("BREAKER_FAILURE_THRESHOLD", 5)?,
            breaker_cooldown_secs: env_u64("BREAKER_COOLDOWN_SECS", 30)?,
            upstream_rate_limit: env_u32("UPSTREAM_RATE_LIMIT", 60)?,
            upstream_rate_window_secs: env_u64("UPSTREAM_RATE_WINDOW_SECS", 60)?,
            client_rate_limit: env_u32("CLIENT_RATE_LIMIT", 10)?,
            client_rate_window_secs: env_u64("CLIENT_RATE_WINDOW_SECS", 60)?,
            retry_max_attempts: env_u32("RETRY_MAX_ATTEMPTS", 3)?,
            http_timeout_secs: env_u64("HTTP_TIMEOUT_SECS", 10)?,
        };

        if config.retry_max_attempts == 0 {
            anyhow::bail!("RETRY_MAX_ATTEMPTS must be at least 1");
        }

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            config.database_url.chars().take(20).collect::<String>()
        );
        tracing::debug!("Pricing API base URL: {}", config.pricing_api_base_url);
        tracing::debug!(
            "Resolution API base URL: {}",
            config.resolution_api_base_url
        );
        if config.redis_url.is_some() {
            tracing::info!("Distributed cache tier configured");
        } else {
            tracing::info!("No REDIS_URL set, running memory cache tier only");
        }
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }
}
