//! Settings and user profile loaded from `pursuit.toml`.
//!
//! Values missing from the file fall back to defaults. The environment
//! variables `PURSUIT_SCORER_URL` and `PURSUIT_WEBDRIVER_URL` take
//! precedence over the file. The profile section is owned by this
//! configuration layer and is read-only to the rest of the pipeline.

use anyhow::{bail, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub profile: UserProfile,

    /// Endpoint of the external match-scoring service.
    #[serde(default)]
    pub scorer_url: Option<String>,

    /// Timeout for one scoring request, in seconds.
    #[serde(default = "default_scorer_timeout_secs")]
    pub scorer_timeout_secs: u64,

    /// WebDriver endpoint (chromedriver or a Selenium hub).
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,

    /// Timeout for browser navigation and element waits, in seconds.
    #[serde(default = "default_browser_timeout_secs")]
    pub browser_timeout_secs: u64,

    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Maximum retries for a retryable step before the attempt fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single backoff delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Postings scoring below this are never planned.
    #[serde(default = "default_min_match_score")]
    pub min_match_score: f64,

    /// Consecutive failures on one site before it is suspended for the
    /// rest of the session.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    /// Parallel browser contexts during a session.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_target_rate")]
    pub target_rate: f64,

    #[serde(default = "default_min_weight")]
    pub min_weight: f64,

    #[serde(default = "default_max_weight")]
    pub max_weight: f64,

    /// Trailing window for success-rate computation: most recent N
    /// attempts ...
    #[serde(default = "default_window_attempts")]
    pub window_attempts: usize,

    /// ... within the last D days. Both bounds apply.
    #[serde(default = "default_window_days")]
    pub window_days: i64,

    #[serde(default = "default_screenshot_dir")]
    pub screenshot_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserProfile {
    #[serde(default = "default_profile_name")]
    pub name: String,

    /// Bump after editing the profile; cached match scores keyed on an
    /// older version become stale and are re-scored.
    #[serde(default = "default_profile_version")]
    pub profile_version: i64,

    #[serde(default)]
    pub first_name: String,

    #[serde(default)]
    pub last_name: String,

    #[serde(default)]
    pub email: String,

    #[serde(default)]
    pub phone: Option<String>,

    #[serde(default)]
    pub location: Option<String>,

    #[serde(default)]
    pub skills: Vec<String>,

    #[serde(default)]
    pub experience_years: u32,

    /// Names of environment variables holding per-site credentials;
    /// never the secrets themselves.
    #[serde(default)]
    pub credential_env: HashMap<String, String>,

    #[serde(default = "default_max_applications_per_day")]
    pub max_applications_per_day: u32,

    /// Minimum spacing between attempts on the same site, in seconds.
    #[serde(default = "default_application_delay_seconds")]
    pub application_delay_seconds: u64,

    /// When non-empty, only these sites are planned, in preference order.
    #[serde(default)]
    pub preferred_sites: Vec<String>,
}

fn default_scorer_timeout_secs() -> u64 {
    10
}

fn default_webdriver_url() -> String {
    "http://localhost:9515".to_string()
}

fn default_browser_timeout_secs() -> u64 {
    30
}

fn default_headless() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_min_match_score() -> f64 {
    0.5
}

fn default_breaker_threshold() -> u32 {
    3
}

fn default_concurrency() -> usize {
    2
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_target_rate() -> f64 {
    0.5
}

fn default_min_weight() -> f64 {
    0.25
}

fn default_max_weight() -> f64 {
    4.0
}

fn default_window_attempts() -> usize {
    200
}

fn default_window_days() -> i64 {
    30
}

fn default_screenshot_dir() -> String {
    "data/screenshots".to_string()
}

fn default_profile_name() -> String {
    "default".to_string()
}

fn default_profile_version() -> i64 {
    1
}

fn default_max_applications_per_day() -> u32 {
    50
}

fn default_application_delay_seconds() -> u64 {
    3
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            name: default_profile_name(),
            profile_version: default_profile_version(),
            first_name: String::new(),
            last_name: String::new(),
            email: String::new(),
            phone: None,
            location: None,
            skills: Vec::new(),
            experience_years: 0,
            credential_env: HashMap::new(),
            max_applications_per_day: default_max_applications_per_day(),
            application_delay_seconds: default_application_delay_seconds(),
            preferred_sites: Vec::new(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            profile: UserProfile::default(),
            scorer_url: None,
            scorer_timeout_secs: default_scorer_timeout_secs(),
            webdriver_url: default_webdriver_url(),
            browser_timeout_secs: default_browser_timeout_secs(),
            headless: default_headless(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            min_match_score: default_min_match_score(),
            breaker_threshold: default_breaker_threshold(),
            concurrency: default_concurrency(),
            learning_rate: default_learning_rate(),
            target_rate: default_target_rate(),
            min_weight: default_min_weight(),
            max_weight: default_max_weight(),
            window_attempts: default_window_attempts(),
            window_days: default_window_days(),
            screenshot_dir: default_screenshot_dir(),
        }
    }
}

impl Settings {
    /// Load from `pursuit.toml` in the current directory, falling back
    /// to defaults when the file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("pursuit.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<Settings>(&contents)?
        } else {
            Self::default()
        };

        if let Ok(url) = std::env::var("PURSUIT_SCORER_URL")
            && !url.is_empty()
        {
            settings.scorer_url = Some(url);
        }
        if let Ok(url) = std::env::var("PURSUIT_WEBDRIVER_URL")
            && !url.is_empty()
        {
            settings.webdriver_url = url;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(5..=120).contains(&self.browser_timeout_secs) {
            bail!("browser_timeout_secs must be between 5 and 120");
        }
        if self.scorer_timeout_secs == 0 {
            bail!("scorer_timeout_secs must be greater than zero");
        }
        if !(1..=200).contains(&self.profile.max_applications_per_day) {
            bail!("max_applications_per_day must be between 1 and 200");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.breaker_threshold == 0 {
            bail!("breaker_threshold must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.min_match_score) {
            bail!("min_match_score must be within [0, 1]");
        }
        if self.min_weight <= 0.0 || self.max_weight < self.min_weight {
            bail!("weight bounds must satisfy 0 < min_weight <= max_weight");
        }
        if self.max_delay_ms < self.base_delay_ms {
            bail!("max_delay_ms must be at least base_delay_ms");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.profile.max_applications_per_day, 50);
        assert_eq!(settings.webdriver_url, "http://localhost:9515");
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            max_retries = 5
            min_match_score = 0.7

            [profile]
            name = "sam"
            skills = ["rust", "sql"]
            max_applications_per_day = 10
        "#;
        let settings: Settings = toml::from_str(toml_str).unwrap();
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.min_match_score, 0.7);
        assert_eq!(settings.profile.name, "sam");
        assert_eq!(settings.profile.skills, vec!["rust", "sql"]);
        assert_eq!(settings.profile.max_applications_per_day, 10);
        // Untouched fields keep their defaults.
        assert_eq!(settings.base_delay_ms, 1000);
        assert_eq!(settings.profile.application_delay_seconds, 3);
    }

    #[test]
    fn out_of_range_values_rejected() {
        let mut settings = Settings::default();
        settings.browser_timeout_secs = 2;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.profile.max_applications_per_day = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.max_delay_ms = 10;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.min_weight = 2.0;
        settings.max_weight = 1.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let settings = Settings::load_from(Path::new("/nonexistent/pursuit.toml")).unwrap();
        assert_eq!(settings.concurrency, 2);
    }
}
