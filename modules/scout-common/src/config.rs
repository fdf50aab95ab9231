//! Configuration: tuning knobs from a settings file, secrets from the
//! environment.

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

/// Tuning configuration loaded from `--settings <path>`.
/// JSON or YAML, dispatched by file extension.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub claude: ClaudeSettings,
    pub task_processor: TaskProcessorSettings,
    pub task_reclaimer: TaskReclaimerSettings,
    pub api: ApiSettings,
    pub reddit: RedditSettings,
}

impl Settings {
    pub fn load(path: &Path) -> anyhow::Result<Settings> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read settings file {}", path.display()))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let settings = match ext {
            "json" => serde_json::from_str(&content).context("parse settings json")?,
            "yaml" | "yml" => serde_yaml::from_str(&content).context("parse settings yaml")?,
            other => bail!("unsupported settings file extension: {other:?}"),
        };

        Ok(settings)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClaudeSettings {
    pub model: String,
    pub temperature: f32,
    /// Comments kept per analyzed item, highest score first.
    pub max_comments: usize,
}

impl Default for ClaudeSettings {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5-20250929".to_string(),
            temperature: 0.0,
            max_comments: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskProcessorSettings {
    pub workers: usize,
    /// A task with this many recorded errors is failed instead of retried.
    pub max_attempts: usize,
    /// Applied to `claim_available_at` whenever an attempt errors.
    pub error_backoff_seconds: u64,
    pub timeout_seconds: u64,
    pub error_timeout_seconds: u64,
    pub no_tasks_timeout_seconds: u64,
    pub disabled: bool,
}

impl Default for TaskProcessorSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            error_backoff_seconds: 60,
            timeout_seconds: 1,
            error_timeout_seconds: 30,
            no_tasks_timeout_seconds: 10,
            disabled: false,
        }
    }
}

impl TaskProcessorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn error_timeout(&self) -> Duration {
        Duration::from_secs(self.error_timeout_seconds)
    }

    pub fn no_tasks_timeout(&self) -> Duration {
        Duration::from_secs(self.no_tasks_timeout_seconds)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskReclaimerSettings {
    pub interval_seconds: u64,
    /// Claims older than this are considered abandoned and released.
    pub claim_timeout_seconds: u64,
}

impl Default for TaskReclaimerSettings {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            claim_timeout_seconds: 300,
        }
    }
}

impl TaskReclaimerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub port: u16,
    pub disabled: bool,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            disabled: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RedditSettings {
    pub scraper: ScraperSettings,
    pub enricher: EnricherSettings,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScraperSettings {
    pub timeout_seconds: u64,
    pub error_timeout_seconds: u64,
    /// Cooldown once a board has been walked to its end.
    pub timeout_after_full_scan_seconds: u64,
    /// Walk each board to the very end once before dedup short-circuits.
    pub at_least_one_exhausting_scan: bool,
    pub disabled: bool,
}

impl Default for ScraperSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: 10,
            error_timeout_seconds: 60,
            timeout_after_full_scan_seconds: 3600,
            at_least_one_exhausting_scan: false,
            disabled: false,
        }
    }
}

impl ScraperSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn error_timeout(&self) -> Duration {
        Duration::from_secs(self.error_timeout_seconds)
    }

    pub fn timeout_after_full_scan(&self) -> Duration {
        Duration::from_secs(self.timeout_after_full_scan_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnricherSettings {
    pub batch_size: i64,
    /// Threads are fetched only once a post is at least this old, so the
    /// comment section has had time to settle.
    pub min_post_age_seconds: u64,
    pub workers: usize,
    pub retries: usize,
    pub timeout_seconds: u64,
    pub error_timeout_seconds: u64,
    pub disabled: bool,
}

impl Default for EnricherSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            min_post_age_seconds: 24 * 3600,
            workers: 4,
            retries: 3,
            timeout_seconds: 60,
            error_timeout_seconds: 60,
            disabled: false,
        }
    }
}

impl EnricherSettings {
    pub fn min_post_age(&self) -> Duration {
        Duration::from_secs(self.min_post_age_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn error_timeout(&self) -> Duration {
        Duration::from_secs(self.error_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub batch_size: i64,
    /// Posts below this score are never scheduled for analysis.
    pub min_score: i32,
    pub timeout_seconds: u64,
    pub error_timeout_seconds: u64,
    pub disabled: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            min_score: 0,
            timeout_seconds: 60,
            error_timeout_seconds: 60,
            disabled: false,
        }
    }
}

impl SchedulerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn error_timeout(&self) -> Duration {
        Duration::from_secs(self.error_timeout_seconds)
    }
}

/// Secrets and connection strings, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub database_url: String,
    pub anthropic_api_key: String,
    pub reddit_base_url: String,
    pub reddit_user_agent: String,
}

impl Credentials {
    pub fn from_env() -> anyhow::Result<Credentials> {
        Ok(Credentials {
            database_url: required_env("DATABASE_URL")?,
            anthropic_api_key: required_env("ANTHROPIC_API_KEY")?,
            reddit_base_url: env::var("REDDIT_BASE_URL")
                .unwrap_or_else(|_| "https://www.reddit.com".to_string()),
            reddit_user_agent: env::var("REDDIT_USER_AGENT")
                .unwrap_or_else(|_| "scout/0.3 (content analysis pipeline)".to_string()),
        })
    }
}

fn required_env(name: &str) -> anyhow::Result<String> {
    env::var(name).with_context(|| format!("{name} environment variable is required"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_settings_parse_with_partial_keys() {
        let yaml = r#"
task_processor:
  workers: 8
  max_attempts: 5
reddit:
  scraper:
    at_least_one_exhausting_scan: true
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.task_processor.workers, 8);
        assert_eq!(settings.task_processor.max_attempts, 5);
        // Untouched sections keep their defaults.
        assert_eq!(settings.reddit.enricher.retries, 3);
        assert!(settings.reddit.scraper.at_least_one_exhausting_scan);
    }

    #[test]
    fn json_settings_parse() {
        let json = r#"{"api": {"port": 9000, "disabled": true}}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.api.port, 9000);
        assert!(settings.api.disabled);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = std::env::temp_dir().join("scout-settings-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.toml");
        std::fs::write(&path, "x = 1").unwrap();
        assert!(Settings::load(&path).is_err());
    }
}
