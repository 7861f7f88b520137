use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::action::ActionKind;
use crate::error::{Result, TripwireError};
use crate::policy::GatePolicy;

/// Top-level Tripwire configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    /// Default gate policy for flows that carry none.
    #[serde(default)]
    pub gate: GatePolicy,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    #[serde(default)]
    pub executors: ExecutorsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Worker pool size; runs waiting for a permit stay pending.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    #[serde(default = "default_action_timeout")]
    pub default_action_timeout_secs: u64,
    /// Time an in-flight action gets to finish after cancellation.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,
    #[serde(default = "default_metric_retention")]
    pub metric_retention_secs: u64,
    #[serde(default = "default_max_samples")]
    pub max_samples_per_source: usize,
    /// Directory of flow JSON files loaded at startup. Default: <workspace>/flows
    #[serde(default)]
    pub flows_dir: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            max_concurrent_runs: default_max_concurrent_runs(),
            default_action_timeout_secs: default_action_timeout(),
            cancel_grace_secs: default_cancel_grace(),
            metric_retention_secs: default_metric_retention(),
            max_samples_per_source: default_max_samples(),
            flows_dir: None,
        }
    }
}

fn default_workspace() -> String { "~/.tripwire".to_string() }
fn default_max_concurrent_runs() -> usize { 8 }
fn default_action_timeout() -> u64 { 30 }
fn default_cancel_grace() -> u64 { 10 }
fn default_metric_retention() -> u64 { 3600 }
fn default_max_samples() -> usize { 1024 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. Default: <workspace>/tripwire.db
    #[serde(default)]
    pub path: Option<String>,
}

/// JSONL audit logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable audit logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summaries, 2 = + gate and approval decisions, 3 = + every node.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: None,
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Allowed CORS origins. Empty = any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_origins: vec![],
        }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

/// Built-in action executor settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorsConfig {
    #[serde(default)]
    pub script: ScriptExecutorConfig,
    #[serde(default)]
    pub api_call: ApiCallExecutorConfig,
    #[serde(default)]
    pub notification: NotificationExecutorConfig,
    /// Forward other capabilities (restart, scale, failover...) to HTTP endpoints.
    #[serde(default)]
    pub webhooks: Vec<WebhookExecutorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptExecutorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Working directory for scripts. Default: workspace.
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default = "default_script_timeout")]
    pub timeout_secs: u64,
    /// Bytes of combined output kept in the node detail.
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,
}

impl Default for ScriptExecutorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            working_dir: None,
            timeout_secs: default_script_timeout(),
            max_output_bytes: default_max_output(),
        }
    }
}

fn default_true() -> bool { true }
fn default_script_timeout() -> u64 { 120 }
fn default_max_output() -> usize { 4096 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCallExecutorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
}

impl Default for ApiCallExecutorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_api_timeout(),
        }
    }
}

fn default_api_timeout() -> u64 { 30 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationExecutorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Notifications are appended here as JSONL. Default: <workspace>/notifications.jsonl
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for NotificationExecutorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file: None,
        }
    }
}

/// POSTs the action payload as JSON to `url` for each listed kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookExecutorConfig {
    pub url: String,
    pub kinds: Vec<ActionKind>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TripwireError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| TripwireError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn check(&self) -> Result<()> {
        if self.engine.max_concurrent_runs == 0 {
            return Err(TripwireError::Config(
                "engine.max_concurrent_runs must be at least 1".into(),
            ));
        }
        if self.engine.max_samples_per_source == 0 {
            return Err(TripwireError::Config(
                "engine.max_samples_per_source must be at least 1".into(),
            ));
        }
        for hook in &self.executors.webhooks {
            if !(hook.url.starts_with("http://") || hook.url.starts_with("https://")) {
                return Err(TripwireError::Config(format!(
                    "executors.webhooks: '{}' is not an http(s) URL",
                    hook.url
                )));
            }
        }
        let problems = self.gate.check();
        if !problems.is_empty() {
            return Err(TripwireError::Config(format!("gate: {}", problems.join("; "))));
        }
        Ok(())
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    pub fn db_path(&self) -> PathBuf {
        match &self.store.path {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("tripwire.db"),
        }
    }

    pub fn flows_dir(&self) -> PathBuf {
        match &self.engine.flows_dir {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("flows"),
        }
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match &log.log_dir {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("logs"),
        })
    }
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_TRIPWIRE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_TRIPWIRE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_TRIPWIRE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_TRIPWIRE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_TRIPWIRE_VAR}\"");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_concurrent_runs, 8);
        assert_eq!(config.engine.default_action_timeout_secs, 30);
        assert_eq!(config.engine.cancel_grace_secs, 10);
        assert_eq!(config.gate.minimum_confidence_required, 60);
        assert!(config.gateway.is_none());
        assert!(config.log.is_none());
        assert!(config.executors.script.enabled);
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_gate_section_overrides_policy() {
        let toml_str = r#"
[gate]
minimum_confidence_required = 50
confidence_level = 90
require_admin_approval = true

[[gate.priority_rules]]
name = "core"
source = "^10\\."
priority = "high"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.gate.minimum_confidence_required, 50);
        assert_eq!(config.gate.confidence_level, 90);
        assert!(config.gate.require_admin_approval);
        assert_eq!(config.gate.priority_rules.len(), 1);
        assert_eq!(config.gate.learning_weight, 0.3);
    }

    #[test]
    fn test_check_rejects_inconsistent_gate() {
        let toml_str = r#"
[gate]
minimum_confidence_required = 95
confidence_level = 80
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert!(matches!(config.check(), Err(TripwireError::Config(_))));
    }

    #[test]
    fn test_webhook_executors() {
        let toml_str = r#"
[[executors.webhooks]]
url = "https://ops.example.com/hooks/tripwire"
kinds = ["restart-service", "switch-region"]

[executors.webhooks.headers]
Authorization = "Bearer ${TRIPWIRE_HOOK_TOKEN}"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let hook = &config.executors.webhooks[0];
        assert_eq!(hook.kinds, vec![ActionKind::RestartService, ActionKind::SwitchRegion]);
        assert_eq!(hook.timeout_secs, 30);
        assert!(config.check().is_ok());

        let bad: AppConfig =
            toml::from_str("[[executors.webhooks]]\nurl = \"ops\"\nkinds = []\n").unwrap();
        assert!(bad.check().is_err());
    }

    #[test]
    fn test_check_rejects_zero_workers() {
        let config: AppConfig = toml::from_str("[engine]\nmax_concurrent_runs = 0\n").unwrap();
        assert!(config.check().is_err());
    }

    #[test]
    fn test_paths_derive_from_workspace() {
        let config: AppConfig = toml::from_str(
            "[engine]\nworkspace = \"/srv/tw\"\n\n[log]\nlevel = 3\n",
        )
        .unwrap();
        assert_eq!(config.db_path(), PathBuf::from("/srv/tw/tripwire.db"));
        assert_eq!(config.flows_dir(), PathBuf::from("/srv/tw/flows"));
        assert_eq!(config.log_dir(), Some(PathBuf::from("/srv/tw/logs")));
    }

    #[test]
    fn test_disabled_log_has_no_dir() {
        let config: AppConfig = toml::from_str("[log]\nenabled = false\n").unwrap();
        assert!(config.log_dir().is_none());
    }
}
