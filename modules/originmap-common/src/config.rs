use std::env;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Cosmos DB
    pub cosmos_endpoint: String,
    pub cosmos_key: String,
    pub cosmos_database: String,
    pub cosmos_companies_container: String,

    // Upstream LLM (xAI/Grok)
    pub grok_url: String,
    pub grok_api_key: String,

    // Geocoding
    pub geocode_url: String,
    pub geocode_api_key: String,

    // Resume worker auth. Both optional — when neither is set, resume jobs
    // are marked stalled instead of queued.
    pub internal_job_secret: Option<String>,
    pub gateway_key: Option<String>,

    // Web server
    pub web_host: String,
    pub web_port: u16,

    /// Absolute request ceiling imposed by the hosting gateway.
    pub hard_cap_ms: u64,

    pub quality: QualityConfig,
}

/// Empirically tuned quality thresholds. These are configuration, not fixed
/// business rules — the defaults mirror observed production values.
#[derive(Debug, Clone)]
pub struct QualityConfig {
    /// Raw candidates required before a generated keyword set is accepted.
    pub min_raw_keywords: usize,
    /// Sanitized survivors required for keywords to count as present.
    pub min_sanitized_keywords: usize,
    /// Distinct-request attempts before low_quality/not_found terminalize.
    pub low_quality_max_attempts: u32,
    /// Verified reviews below this stay retryable even when exhausted.
    pub reviews_min_viable: usize,
    /// Expansion triggers when saved count falls below this percent of limit.
    pub expand_threshold_pct: u32,
    /// Persisted reviews per company.
    pub max_reviews_per_company: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_raw_keywords: 20,
            min_sanitized_keywords: 1,
            low_quality_max_attempts: 3,
            reviews_min_viable: 2,
            expand_threshold_pct: 60,
            max_reviews_per_company: 2,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            cosmos_endpoint: required_env("COSMOS_DB_ENDPOINT"),
            cosmos_key: required_env("COSMOS_DB_KEY"),
            cosmos_database: env::var("COSMOS_DB_DATABASE")
                .unwrap_or_else(|_| "originmap-db".to_string()),
            cosmos_companies_container: env::var("COSMOS_DB_COMPANIES_CONTAINER")
                .unwrap_or_else(|_| "companies".to_string()),
            grok_url: required_env("GROK_URL"),
            grok_api_key: required_env("GROK_API_KEY"),
            geocode_url: env::var("GEOCODE_URL").unwrap_or_else(|_| {
                "https://maps.googleapis.com/maps/api/geocode/json".to_string()
            }),
            geocode_api_key: env::var("GEOCODE_API_KEY").unwrap_or_default(),
            internal_job_secret: optional_env("INTERNAL_JOB_SECRET"),
            gateway_key: optional_env("GATEWAY_FUNCTION_KEY"),
            web_host: env::var("WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            web_port: env::var("WEB_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .expect("WEB_PORT must be a number"),
            hard_cap_ms: env::var("IMPORT_HARD_CAP_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(25_000),
            quality: QualityConfig::default(),
        }
    }

    pub fn resume_auth_configured(&self) -> bool {
        self.internal_job_secret.is_some() || self.gateway_key.is_some()
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
