use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::BoxFuture;
use tracing::debug;

use tripwire_core::action::{ActionContext, ActionKind, ActionOutcome, ActionSpec};
use tripwire_core::config::{expand_home, ScriptExecutorConfig};
use tripwire_core::error::{Result, TripwireError};
use tripwire_core::traits::ActionExecutor;

/// Runs a local command. The child is killed if the run times out or is cancelled.
pub struct ScriptExecutor {
    working_dir: PathBuf,
    timeout_secs: u64,
    max_output_bytes: usize,
}

impl ScriptExecutor {
    pub fn new(config: &ScriptExecutorConfig, workspace: &Path) -> Self {
        let working_dir = match &config.working_dir {
            Some(dir) => expand_home(dir),
            None => workspace.to_path_buf(),
        };
        Self {
            working_dir,
            timeout_secs: config.timeout_secs,
            max_output_bytes: config.max_output_bytes,
        }
    }
}

fn wrong_spec(spec: &ActionSpec) -> TripwireError {
    TripwireError::ActionExecution {
        action: "script".into(),
        message: format!("cannot run '{}' payload", spec.kind()),
    }
}

impl ActionExecutor for ScriptExecutor {
    fn kind(&self) -> ActionKind {
        ActionKind::Script
    }

    fn execute(&self, spec: &ActionSpec, ctx: ActionContext) -> BoxFuture<'_, Result<ActionOutcome>> {
        let spec = spec.clone();
        Box::pin(async move {
            let (command, args, env) = match spec {
                ActionSpec::Script { command, args, env } => (command, args, env),
                other => return Err(wrong_spec(&other)),
            };

            debug!(run_id = %ctx.run_id, node = %ctx.node_id, command = %command, "Executing script");

            tokio::fs::create_dir_all(&self.working_dir).await?;
            let output = tokio::process::Command::new(&command)
                .args(&args)
                .envs(&env)
                .env("TRIPWIRE_RUN_ID", ctx.run_id.as_str())
                .env("TRIPWIRE_FLOW_ID", ctx.flow_id.as_str())
                .env("TRIPWIRE_NODE_ID", &ctx.node_id)
                .current_dir(&self.working_dir)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| TripwireError::ActionExecution {
                    action: "script".into(),
                    message: format!("{}: {}", command, e),
                })?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);

            let mut content = String::new();
            if !stdout.is_empty() {
                content.push_str(stdout.trim_end());
            }
            if !stderr.is_empty() {
                if !content.is_empty() {
                    content.push('\n');
                }
                content.push_str("STDERR:\n");
                content.push_str(stderr.trim_end());
            }

            // Truncate if too long
            if content.len() > self.max_output_bytes {
                let mut cut = self.max_output_bytes;
                while !content.is_char_boundary(cut) {
                    cut -= 1;
                }
                content.truncate(cut);
                content.push_str("\n... (output truncated)");
            }

            if content.is_empty() {
                content = "(no output)".to_string();
            }

            if output.status.success() {
                Ok(ActionOutcome::success(content))
            } else {
                let code = output.status.code().unwrap_or(-1);
                Ok(ActionOutcome::failure(format!("exit code {}\n{}", code, content)))
            }
        })
    }

    fn dry_run(&self, spec: &ActionSpec, _ctx: ActionContext) -> BoxFuture<'_, Result<ActionOutcome>> {
        let detail = format!(
            "dry run: would execute `{}` in {}",
            spec.summary(),
            self.working_dir.display()
        );
        Box::pin(async move { Ok(ActionOutcome::success(detail)) })
    }

    fn timeout_secs(&self) -> Option<u64> {
        Some(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tripwire_core::types::{FlowId, RunId};

    fn ctx() -> ActionContext {
        ActionContext {
            run_id: RunId::new(),
            flow_id: FlowId::from_string("f"),
            node_id: "script".into(),
            simulated: false,
        }
    }

    fn executor(dir: &Path) -> ScriptExecutor {
        ScriptExecutor::new(&ScriptExecutorConfig::default(), dir)
    }

    fn script(command: &str, args: &[&str]) -> ActionSpec {
        ActionSpec::Script {
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let out = executor(dir.path())
            .execute(&script("sh", &["-c", "echo failing over"]), ctx())
            .await
            .unwrap();
        assert!(out.succeeded);
        assert_eq!(out.detail, "failing over");
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure_with_detail() {
        let dir = tempfile::tempdir().unwrap();
        let out = executor(dir.path())
            .execute(&script("sh", &["-c", "echo nope >&2; exit 3"]), ctx())
            .await
            .unwrap();
        assert!(!out.succeeded);
        assert!(out.detail.starts_with("exit code 3"));
        assert!(out.detail.contains("STDERR:\nnope"));
    }

    #[tokio::test]
    async fn passes_run_context_in_env() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx();
        let run_id = c.run_id.clone();
        let out = executor(dir.path())
            .execute(&script("sh", &["-c", "echo $TRIPWIRE_RUN_ID"]), c)
            .await
            .unwrap();
        assert_eq!(out.detail, run_id.as_str());
    }

    #[tokio::test]
    async fn missing_command_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = executor(dir.path())
            .execute(&script("/definitely/not/here", &[]), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, TripwireError::ActionExecution { .. }));
    }

    #[tokio::test]
    async fn dry_run_does_not_execute() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let cmd = format!("touch {}", marker.display());
        let out = executor(dir.path())
            .dry_run(&script("sh", &["-c", &cmd]), ctx())
            .await
            .unwrap();
        assert!(out.succeeded);
        assert!(out.detail.starts_with("dry run: would execute"));
        assert!(!marker.exists());
    }
}
