//! Outbound dispatch to guard services
//!
//! The orchestrator talks to backends through the [`GuardDispatcher`] trait;
//! [`HttpDispatcher`] is the production implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::DispatchConfig;
use crate::error::{DispatchError, OrchestratorError, Result};
use crate::models::ServiceConfig;

/// Longest error body kept from a failing service
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Per-call dispatch parameters
#[derive(Debug, Clone, Copy)]
pub struct DispatchCall<'a> {
    pub request_id: &'a str,
    pub payload: &'a serde_json::Map<String, Value>,
    /// Credential for this call only
    pub auth_token: Option<&'a str>,
    pub user_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub timeout: Duration,
}

/// Sends one request to one guard service
#[async_trait]
pub trait GuardDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        service: &ServiceConfig,
        call: DispatchCall<'_>,
    ) -> std::result::Result<Value, DispatchError>;
}

/// JSON-over-HTTP dispatcher
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: Client,
}

impl HttpDispatcher {
    pub fn new(config: &DispatchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| {
                OrchestratorError::internal(format!("failed to build dispatch client: {}", e))
            })?;

        Ok(Self { client })
    }
}

#[async_trait]
impl GuardDispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        service: &ServiceConfig,
        call: DispatchCall<'_>,
    ) -> std::result::Result<Value, DispatchError> {
        let url = service.dispatch_url();
        debug!(
            service = %service.name,
            request_id = %call.request_id,
            url = %url,
            "Dispatching request"
        );

        let mut request = self
            .client
            .post(&url)
            .timeout(call.timeout)
            .header("X-Request-ID", call.request_id)
            .json(call.payload);

        if let Some(token) = call.auth_token {
            request = request.bearer_auth(token);
        }
        if let Some(user_id) = call.user_id {
            request = request.header("X-User-ID", user_id);
        }
        if let Some(session_id) = call.session_id {
            request = request.header("X-Session-ID", session_id);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DispatchError::Timeout(call.timeout)
            } else {
                DispatchError::from(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                DispatchError::Timeout(call.timeout)
            } else {
                DispatchError::from(e)
            }
        })?;

        let body: Value = serde_json::from_slice(&bytes)
            .map_err(|e| DispatchError::InvalidResponse(e.to_string()))?;

        check_reported_failure(body)
    }
}

/// A 2xx body of the shape `{"success": false, "error": ...}` is a failure
/// reported by the service itself.
fn check_reported_failure(body: Value) -> std::result::Result<Value, DispatchError> {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        let message = match body.get("error") {
            Some(Value::String(s)) => s.clone(),
            Some(other) if !other.is_null() => other.to_string(),
            _ => "service reported failure".to_string(),
        };
        return Err(DispatchError::ServiceReported(message));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GuardServiceType;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dispatcher() -> HttpDispatcher {
        HttpDispatcher::new(&DispatchConfig::default()).unwrap()
    }

    fn payload() -> serde_json::Map<String, Value> {
        let mut payload = serde_json::Map::new();
        payload.insert("text".to_string(), json!("hello"));
        payload
    }

    fn call<'a>(payload: &'a serde_json::Map<String, Value>, token: Option<&'a str>) -> DispatchCall<'a> {
        DispatchCall {
            request_id: "req-1",
            payload,
            auth_token: token,
            user_id: None,
            session_id: None,
            timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_dispatch_posts_payload_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/validate"))
            .and(header("X-Request-ID", "req-1"))
            .and(header("Authorization", "Bearer per-call"))
            .and(body_json(json!({"text": "hello"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"valid": true})))
            .expect(1)
            .mount(&server)
            .await;

        let service = ServiceConfig::new("svc-a", server.uri(), GuardServiceType::Token)
            .with_dispatch_path("/v1/validate");
        let payload = payload();

        let result = dispatcher()
            .dispatch(&service, call(&payload, Some("per-call")))
            .await
            .unwrap();
        assert_eq!(result, json!({"valid": true}));
    }

    #[tokio::test]
    async fn test_dispatch_forwards_caller_identity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .and(header("X-User-ID", "user-7"))
            .and(header("X-Session-ID", "sess-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"trusted": true})))
            .expect(1)
            .mount(&server)
            .await;

        let service = ServiceConfig::new("trust-a", server.uri(), GuardServiceType::Trust)
            .with_dispatch_path("/analyze");
        let payload = payload();
        let identified = DispatchCall {
            user_id: Some("user-7"),
            session_id: Some("sess-9"),
            ..call(&payload, None)
        };

        let result = dispatcher().dispatch(&service, identified).await.unwrap();
        assert_eq!(result, json!({"trusted": true}));
    }

    #[tokio::test]
    async fn test_dispatch_classifies_failures() {
        let server = MockServer::start().await;
        Mock::given(path("/status"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        Mock::given(path("/reported"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": false, "error": "model offline"})),
            )
            .mount(&server)
            .await;
        Mock::given(path("/garbage"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;
        Mock::given(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let payload = payload();
        let dispatch = |route: &'static str| {
            let service = ServiceConfig::new("svc-a", server.uri(), GuardServiceType::Bias)
                .with_dispatch_path(route);
            let payload = &payload;
            async move { dispatcher().dispatch(&service, call(payload, None)).await }
        };

        assert_eq!(
            dispatch("/status").await.unwrap_err(),
            DispatchError::Status {
                status: 500,
                body: "boom".to_string()
            }
        );
        assert_eq!(
            dispatch("/reported").await.unwrap_err(),
            DispatchError::ServiceReported("model offline".to_string())
        );
        assert!(matches!(
            dispatch("/garbage").await.unwrap_err(),
            DispatchError::InvalidResponse(_)
        ));
        assert_eq!(
            dispatch("/slow").await.unwrap_err(),
            DispatchError::Timeout(Duration::from_millis(500))
        );
    }

    #[tokio::test]
    async fn test_dispatch_connection_refused() {
        let service = ServiceConfig::new("svc-a", "http://127.0.0.1:1", GuardServiceType::Trust);
        let payload = payload();
        let err = dispatcher()
            .dispatch(&service, call(&payload, None))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Connection(_)));
    }

    #[test]
    fn test_success_flag_true_passes_through() {
        let body = json!({"success": true, "data": {"score": 0.9}});
        assert_eq!(check_reported_failure(body.clone()).unwrap(), body);
        assert_eq!(
            check_reported_failure(json!({"success": false})).unwrap_err(),
            DispatchError::ServiceReported("service reported failure".to_string())
        );
    }
}
