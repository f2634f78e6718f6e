//! Layered configuration for slotflow.
//!
//! Settings come from `<state_dir>/slotflow.toml`, then `SLOTFLOW_*`
//! environment variables, then CLI flags. Every field is optional.
//!
//! # Configuration File Format
//!
//! ```toml
//! [orchestrator]
//! worker_cmd = "slotflow-worker"
//! poll_interval_ms = 200
//! terminate_grace_secs = 10
//! subscriber_max_backlog = 10000
//! retention_days = 30
//! interactive = false
//!
//! [retry]
//! retries = 2
//! backoff_ms = 5000
//!
//! [cache]
//! freshness_days = 14
//!
//! [stages.research]
//! command = "python -m workers.research"
//! timeout_secs = 900
//! gated = true
//!
//! [stages.art_audio]
//! retries = 1
//! gated = true
//! ```

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use slotflow_common::StageId;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "slotflow.toml";
pub const DEFAULT_STATE_DIR: &str = ".slotflow";

pub const ENV_STATE_DIR: &str = "SLOTFLOW_STATE_DIR";
pub const ENV_WORKER_CMD: &str = "SLOTFLOW_WORKER_CMD";
pub const ENV_FRESHNESS_DAYS: &str = "SLOTFLOW_FRESHNESS_DAYS";
pub const ENV_RETRY_BACKOFF_MS: &str = "SLOTFLOW_RETRY_BACKOFF_MS";

/// Orchestrator-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    /// Shell command run for every stage unless the stage overrides it
    #[serde(default)]
    pub worker_cmd: Option<String>,
    /// How often workers are polled for exit and new log output
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Time between SIGTERM and SIGKILL when terminating a worker group
    #[serde(default = "default_terminate_grace_secs")]
    pub terminate_grace_secs: u64,
    /// Unread live events after which an event subscriber is dropped
    #[serde(default = "default_subscriber_max_backlog")]
    pub subscriber_max_backlog: usize,
    /// Age after which finished runs may be purged
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    /// Whether new runs wait for a human at review gates
    #[serde(default)]
    pub interactive: bool,
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_terminate_grace_secs() -> u64 {
    10
}

fn default_subscriber_max_backlog() -> usize {
    10_000
}

fn default_retention_days() -> u64 {
    30
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            worker_cmd: None,
            poll_interval_ms: default_poll_interval_ms(),
            terminate_grace_secs: default_terminate_grace_secs(),
            subscriber_max_backlog: default_subscriber_max_backlog(),
            retention_days: default_retention_days(),
            interactive: false,
        }
    }
}

/// Retry policy shared by all stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    /// Retries after the first failed attempt
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Fixed delay between attempts
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    5_000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// Knowledge cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    /// Entries older than this trigger a fresh recon run
    #[serde(default = "default_freshness_days")]
    pub freshness_days: u64,
}

fn default_freshness_days() -> u64 {
    14
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            freshness_days: default_freshness_days(),
        }
    }
}

/// Per-stage overrides under `[stages.<stage>]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageOverride {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub gated: Option<bool>,
}

/// Contents of `slotflow.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotflowToml {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub stages: BTreeMap<String, StageOverride>,
}

/// Resolved settings for one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSettings {
    pub command: String,
    pub timeout: Duration,
    pub retries: u32,
    pub gated: bool,
}

/// Default stage timeouts in seconds.
pub fn default_timeout_secs(stage: StageId) -> u64 {
    match stage {
        StageId::PreFlight => 600,
        StageId::Research => 900,
        StageId::DesignMath => 1200,
        StageId::ArtAudio => 1800,
        StageId::Assembly => 900,
        StageId::Recon => 600,
    }
}

/// Stages that pause for review unless configured otherwise.
pub fn default_gated(stage: StageId) -> bool {
    matches!(stage, StageId::Research | StageId::DesignMath)
}

impl SlotflowToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse slotflow.toml")
    }

    /// Load `<state_dir>/slotflow.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize slotflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Worker command (env → file → default).
    pub fn worker_cmd(&self) -> String {
        std::env::var(ENV_WORKER_CMD)
            .ok()
            .filter(|cmd| !cmd.trim().is_empty())
            .or_else(|| self.orchestrator.worker_cmd.clone())
            .unwrap_or_else(|| "slotflow-worker".to_string())
    }

    pub fn freshness(&self) -> Result<chrono::Duration> {
        let days = env_u64(ENV_FRESHNESS_DAYS).unwrap_or(self.cache.freshness_days);
        days_window(days).context("Invalid freshness_days")
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(env_u64(ENV_RETRY_BACKOFF_MS).unwrap_or(self.retry.backoff_ms))
    }

    /// Effective settings for a stage, applying its `[stages.<id>]` override.
    pub fn stage_settings(&self, stage: StageId) -> StageSettings {
        let mut settings = StageSettings {
            command: self.worker_cmd(),
            timeout: Duration::from_secs(default_timeout_secs(stage)),
            retries: self.retry.retries,
            gated: default_gated(stage),
        };

        if let Some(override_cfg) = self.stages.get(stage.as_str()) {
            if let Some(ref command) = override_cfg.command {
                settings.command = command.clone();
            }
            if let Some(secs) = override_cfg.timeout_secs {
                settings.timeout = Duration::from_secs(secs);
            }
            if let Some(retries) = override_cfg.retries {
                settings.retries = retries;
            }
            if let Some(gated) = override_cfg.gated {
                settings.gated = gated;
            }
        }

        // Recon runs are never gated; their result feeds another run's review.
        if stage == StageId::Recon {
            settings.gated = false;
        }

        settings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.orchestrator.poll_interval_ms == 0 {
            warnings.push("poll_interval_ms is 0; workers would be polled in a busy loop".into());
        }
        if days_window(self.orchestrator.retention_days).is_err() {
            warnings.push(format!(
                "retention_days = {} is out of range",
                self.orchestrator.retention_days
            ));
        }
        if days_window(self.cache.freshness_days).is_err() {
            warnings.push(format!(
                "freshness_days = {} is out of range",
                self.cache.freshness_days
            ));
        }
        if self.orchestrator.subscriber_max_backlog == 0 {
            warnings.push("subscriber_max_backlog is 0; every live subscriber would be dropped".into());
        }

        for (name, override_cfg) in &self.stages {
            match name.parse::<StageId>() {
                Ok(stage) if stage.as_str() == name => {}
                Ok(stage) => warnings.push(format!(
                    "Stage override '{}' should be spelled '{}'",
                    name, stage
                )),
                Err(_) => warnings.push(format!("Unknown stage '{}' in [stages]", name)),
            }
            if override_cfg.timeout_secs == Some(0) {
                warnings.push(format!("Stage '{}' has a zero timeout", name));
            }
            if let Some(ref command) = override_cfg.command
                && command.trim().is_empty()
            {
                warnings.push(format!("Stage '{}' has an empty command", name));
            }
        }

        warnings
    }
}

/// A window of `days` days, or an error when chrono cannot represent it.
pub fn days_window(days: u64) -> Result<chrono::Duration> {
    i64::try_from(days)
        .ok()
        .and_then(chrono::TimeDelta::try_days)
        .ok_or_else(|| anyhow!("{} days is out of range", days))
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Unified configuration: `slotflow.toml`, environment, and CLI flags.
#[derive(Debug, Clone)]
pub struct SlotflowConfig {
    /// Root of all persisted orchestrator state
    pub state_dir: PathBuf,
    /// Parsed slotflow.toml
    pub toml: SlotflowToml,
    /// CLI override: verbose output
    pub verbose: bool,
    /// CLI override: approve every review gate automatically
    pub yes: bool,
}

impl SlotflowConfig {
    /// Load configuration rooted at `state_dir`.
    pub fn new(state_dir: PathBuf) -> Result<Self> {
        let toml = SlotflowToml::load_or_default(&state_dir)?;
        Ok(Self {
            state_dir,
            toml,
            verbose: false,
            yes: false,
        })
    }

    /// Resolve the state directory (CLI → env → `./.slotflow`) and load from it.
    pub fn with_cli_args(state_dir: Option<PathBuf>, verbose: bool, yes: bool) -> Result<Self> {
        let state_dir = match state_dir {
            Some(dir) => dir,
            None => match std::env::var(ENV_STATE_DIR) {
                Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
                _ => std::env::current_dir()
                    .context("Failed to get current directory")?
                    .join(DEFAULT_STATE_DIR),
            },
        };
        let mut config = Self::new(state_dir)?;
        config.verbose = verbose;
        config.yes = yes;
        Ok(config)
    }

    /// Create the state directory layout.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.runs_dir(),
            self.artifacts_dir(),
            self.cache_dir(),
            self.log_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.state_dir.join("artifacts")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join("cache")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join("orchestrator.lock")
    }

    pub fn stage_settings(&self, stage: StageId) -> StageSettings {
        self.toml.stage_settings(stage)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.toml.orchestrator.poll_interval_ms.max(1))
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.toml.orchestrator.terminate_grace_secs)
    }

    pub fn subscriber_max_backlog(&self) -> usize {
        self.toml.orchestrator.subscriber_max_backlog
    }

    pub fn retention(&self) -> Result<chrono::Duration> {
        days_window(self.toml.orchestrator.retention_days).context("Invalid retention_days")
    }

    pub fn freshness(&self) -> Result<chrono::Duration> {
        self.toml.freshness()
    }

    pub fn retry_backoff(&self) -> Duration {
        self.toml.retry_backoff()
    }

    /// Whether new runs wait for a human at review gates. `--yes` wins.
    pub fn interactive(&self) -> bool {
        self.toml.orchestrator.interactive && !self.yes
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let toml = SlotflowToml::default();
        assert_eq!(toml.retry.retries, 2);
        assert_eq!(toml.retry.backoff_ms, 5_000);
        assert_eq!(toml.cache.freshness_days, 14);
        assert_eq!(toml.orchestrator.retention_days, 30);
        assert!(!toml.orchestrator.interactive);
    }

    #[test]
    fn test_default_stage_settings() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let toml = SlotflowToml::default();

        let research = toml.stage_settings(StageId::Research);
        assert_eq!(research.timeout, Duration::from_secs(900));
        assert!(research.gated);

        let art = toml.stage_settings(StageId::ArtAudio);
        assert_eq!(art.timeout, Duration::from_secs(1800));
        assert!(!art.gated);

        assert!(toml.stage_settings(StageId::DesignMath).gated);
        assert!(!toml.stage_settings(StageId::PreFlight).gated);
    }

    #[test]
    fn test_stage_override_applies() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let content = r#"
[orchestrator]
worker_cmd = "./worker.sh"

[retry]
retries = 4

[stages.art_audio]
command = "./art.sh"
timeout_secs = 30
gated = true

[stages.research]
gated = false
retries = 0
"#;
        let toml = SlotflowToml::parse(content).unwrap();

        let art = toml.stage_settings(StageId::ArtAudio);
        assert_eq!(art.command, "./art.sh");
        assert_eq!(art.timeout, Duration::from_secs(30));
        assert_eq!(art.retries, 4);
        assert!(art.gated);

        let research = toml.stage_settings(StageId::Research);
        assert_eq!(research.retries, 0);
        assert!(!research.gated);

        let assembly = toml.stage_settings(StageId::Assembly);
        if std::env::var(ENV_WORKER_CMD).is_err() {
            assert_eq!(assembly.command, "./worker.sh");
        }
    }

    #[test]
    fn test_recon_is_never_gated() {
        let toml = SlotflowToml::parse("[stages.recon]\ngated = true\n").unwrap();
        assert!(!toml.stage_settings(StageId::Recon).gated);
    }

    #[test]
    fn test_worker_cmd_env_overrides_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var(ENV_WORKER_CMD).ok();

        let toml = SlotflowToml::parse("[orchestrator]\nworker_cmd = \"file-worker\"\n").unwrap();

        unsafe { std::env::remove_var(ENV_WORKER_CMD) };
        assert_eq!(toml.worker_cmd(), "file-worker");

        unsafe { std::env::set_var(ENV_WORKER_CMD, "env-worker") };
        assert_eq!(toml.worker_cmd(), "env-worker");

        unsafe { std::env::remove_var(ENV_WORKER_CMD) };
        assert_eq!(SlotflowToml::default().worker_cmd(), "slotflow-worker");

        if let Some(value) = saved {
            unsafe { std::env::set_var(ENV_WORKER_CMD, value) };
        }
    }

    #[test]
    fn test_validate_flags_unknown_stage_and_zero_timeout() {
        let content = r#"
[stages.mood_board]
timeout_secs = 10

[stages.research]
timeout_secs = 0
"#;
        let toml = SlotflowToml::parse(content).unwrap();
        let warnings = toml.validate();
        assert!(warnings.iter().any(|w| w.contains("Unknown stage 'mood_board'")));
        assert!(warnings.iter().any(|w| w.contains("zero timeout")));
    }

    #[test]
    fn test_validate_default_is_clean() {
        assert!(SlotflowToml::default().validate().is_empty());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = SlotflowToml::default();
        toml.retry.retries = 7;
        toml.stages.insert(
            "assembly".to_string(),
            StageOverride {
                timeout_secs: Some(42),
                ..Default::default()
            },
        );
        toml.save(&path).unwrap();

        let loaded = SlotflowToml::load(&path).unwrap();
        assert_eq!(loaded.retry.retries, 7);
        assert_eq!(loaded.stages["assembly"].timeout_secs, Some(42));
    }

    #[test]
    fn test_config_paths_live_under_state_dir() {
        let dir = tempdir().unwrap();
        let config = SlotflowConfig::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(config.runs_dir(), dir.path().join("runs"));
        assert_eq!(config.cache_dir(), dir.path().join("cache"));
        assert_eq!(config.lock_file(), dir.path().join("orchestrator.lock"));

        config.ensure_directories().unwrap();
        assert!(config.artifacts_dir().is_dir());
        assert!(config.log_dir().is_dir());
    }

    #[test]
    fn test_yes_disables_interactive() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[orchestrator]\ninteractive = true\n",
        )
        .unwrap();
        let mut config = SlotflowConfig::new(dir.path().to_path_buf()).unwrap();
        assert!(config.interactive());
        config.yes = true;
        assert!(!config.interactive());
    }

    #[test]
    fn test_days_window_rejects_out_of_range() {
        assert_eq!(days_window(14).unwrap(), chrono::Duration::days(14));
        assert_eq!(days_window(0).unwrap(), chrono::Duration::zero());
        assert!(days_window(1_000_000_000_000).is_err());
        assert!(days_window(u64::MAX).is_err());
    }

    #[test]
    fn test_huge_windows_are_errors_not_panics() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var(ENV_FRESHNESS_DAYS).ok();
        unsafe { std::env::remove_var(ENV_FRESHNESS_DAYS) };

        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[orchestrator]\nretention_days = 9223372036854775807\n\n[cache]\nfreshness_days = 1000000000000\n",
        )
        .unwrap();
        let config = SlotflowConfig::new(dir.path().to_path_buf()).unwrap();
        assert!(config.retention().is_err());
        assert!(config.freshness().is_err());

        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("retention_days")));
        assert!(warnings.iter().any(|w| w.contains("freshness_days")));

        if let Some(value) = saved {
            unsafe { std::env::set_var(ENV_FRESHNESS_DAYS, value) };
        }
    }
}
