//! Server configuration.

/// Configuration for the API server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address for the HTTP listener
    pub bind_addr: String,
    /// Bucket receiving uploads and rendered output
    pub media_bucket: String,
    /// Subscription minutes granted when an account is first seen
    pub default_subscription_minutes: f64,
    /// TTL in seconds for presigned output download URLs
    pub presign_ttl_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            media_bucket: "recap-media".to_string(),
            default_subscription_minutes: 60.0,
            presign_ttl_seconds: 3600,
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            media_bucket: std::env::var("MEDIA_BUCKET").unwrap_or(defaults.media_bucket),
            default_subscription_minutes: std::env::var("DEFAULT_SUBSCRIPTION_MINUTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.default_subscription_minutes),
            presign_ttl_seconds: std::env::var("PRESIGN_TTL_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.presign_ttl_seconds),
        }
    }
}
