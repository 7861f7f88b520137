use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use tripwire_core::action::{ActionContext, ActionKind, ActionOutcome, ActionSpec, HttpMethod};
use tripwire_core::config::{ApiCallExecutorConfig, WebhookExecutorConfig};
use tripwire_core::error::{Result, TripwireError};
use tripwire_core::traits::ActionExecutor;

const MAX_BODY: usize = 2_000;

fn exec_err(action: ActionKind, e: impl std::fmt::Display) -> TripwireError {
    TripwireError::ActionExecution {
        action: action.to_string(),
        message: e.to_string(),
    }
}

fn to_method(m: HttpMethod) -> reqwest::Method {
    match m {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

/// Send a request and turn the response into an outcome. 2xx is success.
async fn send(
    action: ActionKind,
    req: reqwest::RequestBuilder,
) -> Result<ActionOutcome> {
    let resp = req.send().await.map_err(|e| exec_err(action, e))?;
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let mut cut = body.len().min(MAX_BODY);
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    let detail = if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, &body[..cut])
    };
    if status.is_success() {
        Ok(ActionOutcome::success(detail))
    } else {
        Ok(ActionOutcome::failure(detail))
    }
}

/// Calls an arbitrary HTTP endpoint described by the action payload.
pub struct ApiCallExecutor {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl ApiCallExecutor {
    pub fn new(config: &ApiCallExecutorConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout_secs: config.timeout_secs,
        }
    }
}

impl ActionExecutor for ApiCallExecutor {
    fn kind(&self) -> ActionKind {
        ActionKind::ApiCall
    }

    fn execute(&self, spec: &ActionSpec, ctx: ActionContext) -> BoxFuture<'_, Result<ActionOutcome>> {
        let spec = spec.clone();
        Box::pin(async move {
            let (url, method, headers, body) = match spec {
                ActionSpec::ApiCall {
                    url,
                    method,
                    headers,
                    body,
                } => (url, method, headers, body),
                other => {
                    return Err(exec_err(
                        ActionKind::ApiCall,
                        format!("cannot run '{}' payload", other.kind()),
                    ))
                }
            };

            debug!(run_id = %ctx.run_id, node = %ctx.node_id, %method, url = %url, "Calling API");

            let mut req = self
                .client
                .request(to_method(method), &url)
                .timeout(Duration::from_secs(self.timeout_secs))
                .header("X-Tripwire-Run", ctx.run_id.as_str());
            for (k, v) in &headers {
                req = req.header(k.as_str(), v.as_str());
            }
            if let Some(body) = body {
                req = req.json(&body);
            }
            send(ActionKind::ApiCall, req).await
        })
    }

    fn timeout_secs(&self) -> Option<u64> {
        Some(self.timeout_secs)
    }
}

/// Forwards an infrastructure action to an operator-provided HTTP endpoint.
/// The body is `{run_id, flow_id, node_id, action: <payload>}`.
pub struct WebhookExecutor {
    kind: ActionKind,
    url: String,
    headers: BTreeMap<String, String>,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl WebhookExecutor {
    pub fn new(kind: ActionKind, config: &WebhookExecutorConfig) -> Self {
        Self {
            kind,
            url: config.url.clone(),
            headers: config.headers.clone(),
            timeout_secs: config.timeout_secs,
            client: reqwest::Client::new(),
        }
    }
}

impl ActionExecutor for WebhookExecutor {
    fn kind(&self) -> ActionKind {
        self.kind
    }

    fn execute(&self, spec: &ActionSpec, ctx: ActionContext) -> BoxFuture<'_, Result<ActionOutcome>> {
        let payload = serde_json::json!({
            "run_id": ctx.run_id,
            "flow_id": ctx.flow_id,
            "node_id": ctx.node_id,
            "action": spec,
        });
        Box::pin(async move {
            debug!(run_id = %ctx.run_id, action = %self.kind, url = %self.url, "Forwarding action to webhook");
            let mut req = self
                .client
                .post(&self.url)
                .timeout(Duration::from_secs(self.timeout_secs))
                .json(&payload);
            for (k, v) in &self.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            send(self.kind, req).await
        })
    }

    fn timeout_secs(&self) -> Option<u64> {
        Some(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tripwire_core::types::{FlowId, RunId};

    /// Accept one connection, reply with `status` and `body`, return the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut request = Vec::new();
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let len = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + len {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let reply = format!(
                "HTTP/1.1 {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            sock.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    fn ctx() -> ActionContext {
        ActionContext {
            run_id: RunId::from_string("run-1"),
            flow_id: FlowId::from_string("f"),
            node_id: "call".into(),
            simulated: false,
        }
    }

    #[tokio::test]
    async fn api_call_success() {
        let (base, server) = serve_once("200 OK", "switched").await;
        let exec = ApiCallExecutor::new(&ApiCallExecutorConfig::default());
        let spec = ActionSpec::ApiCall {
            url: format!("{}/failover", base),
            method: HttpMethod::Post,
            headers: BTreeMap::from([("X-Team".to_string(), "netops".to_string())]),
            body: Some(serde_json::json!({"region": "eu-central-1"})),
        };
        let out = exec.execute(&spec, ctx()).await.unwrap();
        assert!(out.succeeded);
        assert_eq!(out.detail, "HTTP 200 OK: switched");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /failover"));
        assert!(request.to_lowercase().contains("x-team: netops"));
        assert!(request.contains("eu-central-1"));
    }

    #[tokio::test]
    async fn api_call_error_status_is_failure() {
        let (base, _server) = serve_once("503 Service Unavailable", "").await;
        let exec = ApiCallExecutor::new(&ApiCallExecutorConfig::default());
        let spec = ActionSpec::ApiCall {
            url: base,
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            body: None,
        };
        let out = exec.execute(&spec, ctx()).await.unwrap();
        assert!(!out.succeeded);
        assert_eq!(out.detail, "HTTP 503 Service Unavailable");
    }

    #[tokio::test]
    async fn webhook_posts_payload() {
        let (base, server) = serve_once("202 Accepted", "").await;
        let exec = WebhookExecutor::new(
            ActionKind::SwitchRegion,
            &WebhookExecutorConfig {
                url: format!("{}/hooks", base),
                kinds: vec![ActionKind::SwitchRegion],
                headers: BTreeMap::new(),
                timeout_secs: 5,
            },
        );
        let spec = ActionSpec::SwitchRegion {
            from: "eu-west-1".into(),
            to: "eu-central-1".into(),
        };
        let out = exec.execute(&spec, ctx()).await.unwrap();
        assert!(out.succeeded);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hooks"));
        assert!(request.contains("\"action\":\"switch-region\""));
        assert!(request.contains("\"run_id\":\"run-1\""));
    }
}
