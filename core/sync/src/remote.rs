//! Remote execution of pending actions.

use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use fieldsync_common::{Error, Result};

use crate::queue::{ActionKind, PendingAction};

/// Performs the network mutation described by a pending action.
///
/// Any error counts as a failed attempt and goes through the retry policy.
/// Timeouts are the implementation's responsibility.
#[async_trait]
pub trait RemoteEntityService: Send + Sync {
    /// Execute one action against the remote service.
    async fn execute_action(&self, action: &PendingAction) -> Result<()>;
}

/// Routes each action to the executor registered for its kind.
#[derive(Default, Clone)]
pub struct RemoteDispatcher {
    executors: HashMap<ActionKind, Arc<dyn RemoteEntityService>>,
}

impl RemoteDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the executor for one kind.
    ///
    /// # Errors
    /// - `AlreadyExists` if the kind already has an executor
    pub fn register(
        &mut self,
        kind: ActionKind,
        executor: Arc<dyn RemoteEntityService>,
    ) -> Result<()> {
        if self.executors.contains_key(&kind) {
            return Err(Error::AlreadyExists(format!(
                "Executor for {} is already registered",
                kind
            )));
        }
        self.executors.insert(kind, executor);
        Ok(())
    }

    /// Register one executor for every kind.
    pub fn register_all(&mut self, executor: Arc<dyn RemoteEntityService>) -> Result<()> {
        for kind in ActionKind::ALL {
            self.register(kind, executor.clone())?;
        }
        Ok(())
    }

    /// Whether `kind` has an executor.
    pub fn handles(&self, kind: ActionKind) -> bool {
        self.executors.contains_key(&kind)
    }
}

#[async_trait]
impl RemoteEntityService for RemoteDispatcher {
    async fn execute_action(&self, action: &PendingAction) -> Result<()> {
        let executor = self.executors.get(&action.kind).ok_or_else(|| {
            Error::Remote(format!("No executor registered for {}", action.kind))
        })?;
        executor.execute_action(action).await
    }
}

/// Settings for the HTTP executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the entity API.
    pub base_url: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// User agent sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Optional bearer token.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("FieldSync/{}", env!("CARGO_PKG_VERSION"))
}

impl RemoteConfig {
    /// Config for `base_url` with default timeout and user agent.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            bearer_token: None,
        }
    }
}

/// HTTP request derived from a pending action.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    /// HTTP method.
    pub method: Method,
    /// Target URL.
    pub url: Url,
    /// JSON body, if any.
    pub body: Option<Value>,
}

/// Executes actions as JSON requests against a REST-style entity API.
///
/// Payload conventions:
/// - `resource`: collection name, required for entity actions
/// - `id`: entity id, required for update and delete
/// - `operation`: operation name, required for remote operations
///
/// Every request carries the action id as `Idempotency-Key` so a redelivered
/// action can be recognized by the server.
pub struct HttpActionExecutor {
    http: Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl HttpActionExecutor {
    /// Create an executor.
    ///
    /// # Errors
    /// - `InvalidInput` if the base URL does not parse or cannot have a path
    /// - `Network` if the HTTP client cannot be built
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidInput(format!(
                "Base URL cannot have a path: {}",
                base_url
            )));
        }

        let http = Client::builder()
            .user_agent(config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            bearer_token: config.bearer_token,
        })
    }

    /// Map an action to its HTTP request.
    ///
    /// # Errors
    /// - `InvalidInput` if the payload lacks a required field
    pub fn endpoint(&self, action: &PendingAction) -> Result<Endpoint> {
        let body = Some(Value::Object(action.payload.clone()));

        let (method, segments, body) = match action.kind {
            ActionKind::CreateEntity => (Method::POST, vec![resource(action)?], body),
            ActionKind::UpdateEntity => (
                Method::PUT,
                vec![resource(action)?, entity_id(action)?],
                body,
            ),
            ActionKind::DeleteEntity => (
                Method::DELETE,
                vec![resource(action)?, entity_id(action)?],
                None,
            ),
            ActionKind::InitiateRemoteOp => (
                Method::POST,
                vec!["ops".to_string(), field(action, "operation")?],
                body,
            ),
        };

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidInput("Base URL cannot have a path".to_string()))?
            .pop_if_empty()
            .extend(segments);

        Ok(Endpoint { method, url, body })
    }
}

fn field(action: &PendingAction, name: &str) -> Result<String> {
    match action.payload.get(name) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(Error::InvalidInput(format!(
            "{} action {} has no '{}' in its payload",
            action.kind, action.id, name
        ))),
    }
}

fn resource(action: &PendingAction) -> Result<String> {
    field(action, "resource")
}

fn entity_id(action: &PendingAction) -> Result<String> {
    field(action, "id")
}

#[async_trait]
impl RemoteEntityService for HttpActionExecutor {
    async fn execute_action(&self, action: &PendingAction) -> Result<()> {
        let endpoint = self.endpoint(action)?;
        debug!("{} {} for action {}", endpoint.method, endpoint.url, action.id);

        let mut request = self
            .http
            .request(endpoint.method, endpoint.url)
            .header("Idempotency-Key", action.id.as_str())
            .header(header::ACCEPT, "application/json");
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = &endpoint.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| {
                Error::Network(format!("Request for action {} failed: {}", action.id, e))
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Remote(format!(
                "{} action {} rejected: {} - {}",
                action.kind, action.id, status, body
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Payload;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn action(kind: ActionKind, payload: Value) -> PendingAction {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Payload::new(),
        };
        PendingAction {
            id: "a-1".to_string(),
            kind,
            payload,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }

    fn executor() -> HttpActionExecutor {
        HttpActionExecutor::new(RemoteConfig::new("https://api.example.com/v1")).unwrap()
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl RemoteEntityService for Counting {
        async fn execute_action(&self, _action: &PendingAction) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_endpoint_mapping() {
        let exec = executor();

        let create = exec
            .endpoint(&action(ActionKind::CreateEntity, json!({"resource": "jobs", "title": "x"})))
            .unwrap();
        assert_eq!(create.method, Method::POST);
        assert_eq!(create.url.as_str(), "https://api.example.com/v1/jobs");
        assert_eq!(create.body.unwrap()["title"], json!("x"));

        let update = exec
            .endpoint(&action(ActionKind::UpdateEntity, json!({"resource": "jobs", "id": 7})))
            .unwrap();
        assert_eq!(update.method, Method::PUT);
        assert_eq!(update.url.as_str(), "https://api.example.com/v1/jobs/7");

        let delete = exec
            .endpoint(&action(ActionKind::DeleteEntity, json!({"resource": "jobs", "id": "a b"})))
            .unwrap();
        assert_eq!(delete.method, Method::DELETE);
        assert_eq!(delete.url.as_str(), "https://api.example.com/v1/jobs/a%20b");
        assert!(delete.body.is_none());

        let op = exec
            .endpoint(&action(ActionKind::InitiateRemoteOp, json!({"operation": "reindex"})))
            .unwrap();
        assert_eq!(op.method, Method::POST);
        assert_eq!(op.url.as_str(), "https://api.example.com/v1/ops/reindex");
    }

    #[test]
    fn test_endpoint_requires_fields() {
        let exec = executor();
        assert!(exec
            .endpoint(&action(ActionKind::UpdateEntity, json!({"resource": "jobs"})))
            .is_err());
        assert!(exec
            .endpoint(&action(ActionKind::InitiateRemoteOp, json!({})))
            .is_err());
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(HttpActionExecutor::new(RemoteConfig::new("not a url")).is_err());
        assert!(HttpActionExecutor::new(RemoteConfig::new("mailto:ops@example.com")).is_err());
    }

    #[tokio::test]
    async fn test_dispatcher_routes_by_kind() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let mut dispatcher = RemoteDispatcher::new();
        dispatcher
            .register(ActionKind::UpdateEntity, counting.clone())
            .unwrap();

        dispatcher
            .execute_action(&action(ActionKind::UpdateEntity, json!({})))
            .await
            .unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);

        let missing = dispatcher
            .execute_action(&action(ActionKind::DeleteEntity, json!({})))
            .await;
        assert!(matches!(missing, Err(Error::Remote(_))));
    }

    #[test]
    fn test_dispatcher_rejects_duplicates() {
        let mut dispatcher = RemoteDispatcher::new();
        let counting = Arc::new(Counting(AtomicUsize::new(0)));

        dispatcher.register_all(counting.clone()).unwrap();
        assert!(ActionKind::ALL.iter().all(|k| dispatcher.handles(*k)));
        assert!(dispatcher
            .register(ActionKind::CreateEntity, counting)
            .is_err());
    }
}
