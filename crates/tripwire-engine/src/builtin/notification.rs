use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;

use tripwire_core::action::{ActionContext, ActionKind, ActionOutcome, ActionSpec};
use tripwire_core::config::{expand_home, NotificationExecutorConfig};
use tripwire_core::error::{Result, TripwireError};
use tripwire_core::traits::ActionExecutor;

/// Delivers notifications to a JSONL outbox that channel adapters tail.
pub struct NotificationExecutor {
    file: PathBuf,
}

impl NotificationExecutor {
    pub fn new(config: &NotificationExecutorConfig, workspace: &Path) -> Self {
        let file = match &config.file {
            Some(f) => expand_home(f),
            None => workspace.join("notifications.jsonl"),
        };
        Self { file }
    }

    pub fn outbox(&self) -> &Path {
        &self.file
    }
}

impl ActionExecutor for NotificationExecutor {
    fn kind(&self) -> ActionKind {
        ActionKind::Notification
    }

    fn execute(&self, spec: &ActionSpec, ctx: ActionContext) -> BoxFuture<'_, Result<ActionOutcome>> {
        let spec = spec.clone();
        Box::pin(async move {
            let (channel, message) = match spec {
                ActionSpec::Notification { channel, message } => (channel, message),
                other => {
                    return Err(TripwireError::ActionExecution {
                        action: "notification".into(),
                        message: format!("cannot run '{}' payload", other.kind()),
                    })
                }
            };

            let entry = serde_json::json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "channel": channel,
                "message": message,
                "run_id": ctx.run_id,
                "flow_id": ctx.flow_id,
                "node_id": ctx.node_id,
            });
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');

            if let Some(parent) = self.file.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;

            tracing::info!(channel = %channel, run_id = %ctx.run_id, "Notification sent: {}", message);
            Ok(ActionOutcome::success(format!(
                "notification sent via {}",
                channel
            )))
        })
    }

    fn timeout_secs(&self) -> Option<u64> {
        Some(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tripwire_core::types::{FlowId, RunId};

    #[tokio::test]
    async fn appends_jsonl_entries() {
        let dir = tempfile::tempdir().unwrap();
        let exec = NotificationExecutor::new(
            &NotificationExecutorConfig {
                enabled: true,
                file: Some(dir.path().join("out/notify.jsonl").display().to_string()),
            },
            dir.path(),
        );
        for msg in ["failover started", "failover done"] {
            let spec = ActionSpec::Notification {
                channel: "oncall".into(),
                message: msg.into(),
            };
            let ctx = ActionContext {
                run_id: RunId::new(),
                flow_id: FlowId::from_string("f"),
                node_id: "notify".into(),
                simulated: false,
            };
            let out = exec.execute(&spec, ctx).await.unwrap();
            assert!(out.succeeded);
            assert_eq!(out.detail, "notification sent via oncall");
        }

        let content = std::fs::read_to_string(exec.outbox()).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["message"], "failover done");
        assert_eq!(lines[0]["channel"], "oncall");
    }
}
