use std::env;
use std::time::Duration;

use url::Url;

use crate::contracts::{JobError, JobResult};
use crate::invariants::ensure_non_empty_trimmed;

pub const PINTEREST_API_BASE_DEFAULT: &str = "https://api.pinterest.com/v5";
pub const OPENAI_API_BASE_DEFAULT: &str = "https://api.openai.com/v1";
pub const GENAI_API_BASE_DEFAULT: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Process-level configuration for the scheduled jobs.
///
/// Every secret comes from the environment at startup. API base URLs are
/// overridable so tests can point the clients at a local server.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub supabase_url: String,
    pub supabase_service_key: String,
    pub pinterest_app_id: Option<String>,
    pub pinterest_app_secret: Option<String>,
    pub openai_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub creative_bucket: String,
    pub pinterest_api_base: String,
    pub openai_api_base: String,
    pub genai_api_base: String,
    pub run_budget: Duration,
    pub settle_delay: Duration,
}

impl JobConfig {
    pub fn from_env() -> JobResult<Self> {
        let supabase_url = env::var("SUPABASE_URL")
            .map_err(|_| JobError::validation("SUPABASE_URL not set in environment variables"))?;
        let supabase_service_key = env::var("SUPABASE_SERVICE_KEY").map_err(|_| {
            JobError::validation("SUPABASE_SERVICE_KEY not set in environment variables")
        })?;
        ensure_non_empty_trimmed(&supabase_url, "SUPABASE_URL")?;
        ensure_non_empty_trimmed(&supabase_service_key, "SUPABASE_SERVICE_KEY")?;
        Url::parse(&supabase_url)
            .map_err(|e| JobError::validation(format!("SUPABASE_URL is not a valid URL: {}", e)))?;

        Ok(Self {
            supabase_url: supabase_url.trim_end_matches('/').to_string(),
            supabase_service_key,
            pinterest_app_id: optional_env("PINTEREST_APP_ID"),
            pinterest_app_secret: optional_env("PINTEREST_APP_SECRET"),
            openai_api_key: optional_env("OPENAI_API_KEY"),
            google_api_key: optional_env("GOOGLE_API_KEY"),
            creative_bucket: env::var("CREATIVE_BUCKET")
                .unwrap_or_else(|_| "winner-creatives".to_string()),
            pinterest_api_base: base_env("PINTEREST_API_BASE", PINTEREST_API_BASE_DEFAULT),
            openai_api_base: base_env("OPENAI_API_BASE", OPENAI_API_BASE_DEFAULT),
            genai_api_base: base_env("GENAI_API_BASE", GENAI_API_BASE_DEFAULT),
            run_budget: duration_env("JOB_RUN_BUDGET_SECS", 1800),
            settle_delay: duration_env("REPLACE_SETTLE_DELAY_SECS", 300),
        })
    }
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn base_env(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.trim_end_matches('/').to_string())
        .unwrap_or_else(|| default.to_string())
}

fn duration_env(key: &str, default_secs: u64) -> Duration {
    let secs = env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard};

    static TEST_ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn test_guard() -> MutexGuard<'static, ()> {
        let guard = TEST_ENV_MUTEX.lock().expect("test lock poisoned");
        for key in [
            "SUPABASE_URL",
            "SUPABASE_SERVICE_KEY",
            "PINTEREST_API_BASE",
            "CREATIVE_BUCKET",
            "JOB_RUN_BUDGET_SECS",
        ] {
            std::env::remove_var(key);
        }
        guard
    }

    #[test]
    fn test_from_env_requires_store_credentials() {
        let _guard = test_guard();
        let err = JobConfig::from_env().expect_err("must fail without store credentials");
        assert!(err.message.contains("SUPABASE_URL"));
    }

    #[test]
    fn test_from_env_applies_defaults_and_trims_base_urls() {
        let _guard = test_guard();
        std::env::set_var("SUPABASE_URL", "https://store.example.com/");
        std::env::set_var("SUPABASE_SERVICE_KEY", "service-key");
        std::env::set_var("PINTEREST_API_BASE", "http://127.0.0.1:9999/");

        let config = JobConfig::from_env().unwrap();
        assert_eq!(config.supabase_url, "https://store.example.com");
        assert_eq!(config.pinterest_api_base, "http://127.0.0.1:9999");
        assert_eq!(config.creative_bucket, "winner-creatives");
        assert_eq!(config.run_budget, Duration::from_secs(1800));
        assert_eq!(config.settle_delay, Duration::from_secs(300));

        std::env::remove_var("SUPABASE_URL");
        std::env::remove_var("SUPABASE_SERVICE_KEY");
        std::env::remove_var("PINTEREST_API_BASE");
    }
}
