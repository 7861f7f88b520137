use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{FlowId, RunId};

/// Capability an action executor provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Script,
    ApiCall,
    Notification,
    RestartService,
    ScaleResources,
    SwitchRegion,
    EnableFailover,
    UpdatePolicy,
}

impl ActionKind {
    pub const ALL: [ActionKind; 8] = [
        Self::Script,
        Self::ApiCall,
        Self::Notification,
        Self::RestartService,
        Self::ScaleResources,
        Self::SwitchRegion,
        Self::EnableFailover,
        Self::UpdatePolicy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::ApiCall => "api-call",
            Self::Notification => "notification",
            Self::RestartService => "restart-service",
            Self::ScaleResources => "scale-resources",
            Self::SwitchRegion => "switch-region",
            Self::EnableFailover => "enable-failover",
            Self::UpdatePolicy => "update-policy",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.to_lowercase().replace('_', "-");
        Self::ALL
            .iter()
            .find(|k| k.as_str() == normalized)
            .copied()
            .ok_or_else(|| format!("unknown action kind: {}", s))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Typed parameter payload, one variant per action capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ActionSpec {
    Script {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    ApiCall {
        url: String,
        #[serde(default)]
        method: HttpMethod,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<serde_json::Value>,
    },
    Notification {
        channel: String,
        message: String,
    },
    RestartService {
        service: String,
        #[serde(default)]
        region: Option<String>,
    },
    ScaleResources {
        resource: String,
        replicas: u32,
    },
    SwitchRegion {
        from: String,
        to: String,
    },
    EnableFailover {
        target: String,
        #[serde(default)]
        backup: Option<String>,
    },
    UpdatePolicy {
        policy_id: String,
        #[serde(default)]
        changes: BTreeMap<String, serde_json::Value>,
    },
}

impl ActionSpec {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Script { .. } => ActionKind::Script,
            Self::ApiCall { .. } => ActionKind::ApiCall,
            Self::Notification { .. } => ActionKind::Notification,
            Self::RestartService { .. } => ActionKind::RestartService,
            Self::ScaleResources { .. } => ActionKind::ScaleResources,
            Self::SwitchRegion { .. } => ActionKind::SwitchRegion,
            Self::EnableFailover { .. } => ActionKind::EnableFailover,
            Self::UpdatePolicy { .. } => ActionKind::UpdatePolicy,
        }
    }

    /// One-line description for approval prompts and logs.
    pub fn summary(&self) -> String {
        match self {
            Self::Script { command, args, .. } => {
                let line = if args.is_empty() {
                    command.clone()
                } else {
                    format!("{} {}", command, args.join(" "))
                };
                truncate(&line, 120)
            }
            Self::ApiCall { url, method, .. } => format!("{} {}", method, url),
            Self::Notification { channel, message } => {
                format!("notify {}: {}", channel, truncate(message, 80))
            }
            Self::RestartService { service, region } => match region {
                Some(r) => format!("restart {} in {}", service, r),
                None => format!("restart {}", service),
            },
            Self::ScaleResources { resource, replicas } => {
                format!("scale {} to {} replicas", resource, replicas)
            }
            Self::SwitchRegion { from, to } => format!("switch traffic {} -> {}", from, to),
            Self::EnableFailover { target, backup } => match backup {
                Some(b) => format!("enable failover for {} onto {}", target, b),
                None => format!("enable failover for {}", target),
            },
            Self::UpdatePolicy { policy_id, changes } => {
                format!("update policy {} ({} change(s))", policy_id, changes.len())
            }
        }
    }

    /// Check payload fields an executor cannot work without.
    pub fn check(&self) -> std::result::Result<(), String> {
        let missing = |field: &str| Err(format!("'{}' must not be empty", field));
        match self {
            Self::Script { command, .. } if command.trim().is_empty() => missing("command"),
            Self::ApiCall { url, .. } if !(url.starts_with("http://") || url.starts_with("https://")) => {
                Err(format!("'url' must be an http(s) URL, got '{}'", url))
            }
            Self::Notification { message, .. } if message.trim().is_empty() => missing("message"),
            Self::RestartService { service, .. } if service.trim().is_empty() => missing("service"),
            Self::ScaleResources { resource, .. } if resource.trim().is_empty() => missing("resource"),
            Self::SwitchRegion { from, to } if from == to => {
                Err(format!("'from' and 'to' are both '{}'", from))
            }
            Self::EnableFailover { target, .. } if target.trim().is_empty() => missing("target"),
            Self::UpdatePolicy { policy_id, .. } if policy_id.trim().is_empty() => {
                missing("policy_id")
            }
            _ => Ok(()),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}

/// What an executor reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub succeeded: bool,
    pub detail: String,
}

impl ActionOutcome {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            detail: detail.into(),
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            detail: detail.into(),
        }
    }
}

/// Context passed to executors.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub run_id: RunId,
    pub flow_id: FlowId,
    pub node_id: String,
    pub simulated: bool,
}
