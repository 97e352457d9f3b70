use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::query::DecisionQuery;

/// ポリシーエンジンが返した判定。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyEngineError {
    #[error("policy engine request timed out")]
    Timeout,

    #[error("policy engine transport error: {0}")]
    Transport(String),

    #[error("policy engine returned status {0}")]
    Status(u16),

    #[error("invalid policy engine response: {0}")]
    InvalidResponse(String),
}

impl PolicyEngineError {
    /// 再試行で回復し得る失敗か（タイムアウト・通信エラー・5xx）。
    pub fn is_retryable(&self) -> bool {
        match self {
            PolicyEngineError::Timeout | PolicyEngineError::Transport(_) => true,
            PolicyEngineError::Status(code) => *code >= 500,
            PolicyEngineError::InvalidResponse(_) => false,
        }
    }
}

/// PolicyEngine は外部の判定オラクルを抽象化するトレイト。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn evaluate(&self, query: &DecisionQuery) -> Result<EngineDecision, PolicyEngineError>;
}

/// OPA (Open Policy Agent) Data API クライアント。
pub struct OpaPolicyEngine {
    client: reqwest::Client,
    endpoint: String,
}

impl OpaPolicyEngine {
    /// `package_path` はドット区切り（例: "authz.allow"）で指定し、Data API のパスに変換する。
    pub fn new(url: &str, package_path: &str, timeout: Duration) -> Result<Self, PolicyEngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PolicyEngineError::Transport(e.to_string()))?;
        let endpoint = format!(
            "{}/v1/data/{}",
            url.trim_end_matches('/'),
            package_path.replace('.', "/")
        );
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn input(query: &DecisionQuery) -> Value {
        let user = query
            .context
            .get("username")
            .map_or(query.subject.as_str(), String::as_str);
        json!({
            "input": {
                "subject": query.subject,
                "user": user,
                "method": query.action,
                "path": query.resource,
                "action": query.action,
                "resource": query.resource,
                "context": query.context,
            }
        })
    }
}

/// OPA の応答を判定に変換する。result が無い（未定義）場合は拒否とする。
fn parse_result(body: &Value) -> Result<EngineDecision, PolicyEngineError> {
    match body.get("result") {
        None | Some(Value::Null) => Ok(EngineDecision {
            allowed: false,
            reason: Some("policy_undefined".to_string()),
        }),
        Some(Value::Bool(allowed)) => Ok(EngineDecision {
            allowed: *allowed,
            reason: None,
        }),
        Some(Value::Object(obj)) => {
            let allowed = obj.get("allow").and_then(Value::as_bool).ok_or_else(|| {
                PolicyEngineError::InvalidResponse("result object without boolean allow".into())
            })?;
            Ok(EngineDecision {
                allowed,
                reason: obj.get("reason").and_then(Value::as_str).map(str::to_string),
            })
        }
        Some(other) => Err(PolicyEngineError::InvalidResponse(format!(
            "unexpected result type: {other}"
        ))),
    }
}

#[async_trait]
impl PolicyEngine for OpaPolicyEngine {
    async fn evaluate(&self, query: &DecisionQuery) -> Result<EngineDecision, PolicyEngineError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&Self::input(query))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PolicyEngineError::Timeout
                } else {
                    PolicyEngineError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PolicyEngineError::Status(status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| PolicyEngineError::InvalidResponse(e.to_string()))?;
        parse_result(&body)
    }
}
