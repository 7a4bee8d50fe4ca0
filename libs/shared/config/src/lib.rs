use std::env;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_service_token: Option<String>,
    pub ml_service_url: String,
    pub ml_min_confidence: f64,
    pub recalculation_debounce_ms: u64,
    pub sweep_interval_seconds: u64,
    pub estimation_cache_ttl_seconds: u64,
    pub recalculation_batch_size: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_service_token: env::var("SUPABASE_SERVICE_TOKEN").ok(),
            ml_service_url: env::var("ML_PREDICTION_SERVICE_URL")
                .unwrap_or_else(|_| {
                    warn!("ML_PREDICTION_SERVICE_URL not set, ML estimation disabled");
                    String::new()
                }),
            ml_min_confidence: parse_env("ML_MIN_CONFIDENCE", 0.6),
            recalculation_debounce_ms: parse_env("RECALCULATION_DEBOUNCE_MS", 2_000),
            sweep_interval_seconds: parse_env("SWEEP_INTERVAL_SECONDS", 60),
            estimation_cache_ttl_seconds: parse_env("ESTIMATION_CACHE_TTL_SECONDS", 30),
            recalculation_batch_size: parse_env("RECALCULATION_BATCH_SIZE", 5),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty() && !self.supabase_anon_key.is_empty()
    }

    pub fn is_ml_configured(&self) -> bool {
        !self.ml_service_url.is_empty()
    }
}

fn parse_env<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} is not a valid value, using default", name);
            default
        }),
        Err(_) => default,
    }
}
