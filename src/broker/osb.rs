//! # OSB REST Client
//!
//! Open Service Broker API v2.13 client over reqwest.
//!
//! Paths:
//! - `PUT/PATCH/DELETE /v2/service_instances/{instance_id}`
//! - `GET /v2/service_instances/{instance_id}/last_operation`
//! - `PUT/GET/DELETE /v2/service_instances/{instance_id}/service_bindings/{binding_id}`
//! - `GET /v2/service_instances/{instance_id}/service_bindings/{binding_id}/last_operation`
//!
//! A `202 Accepted` marks the operation asynchronous; the optional `operation`
//! field in its body is handed back on every last-operation poll.

use crate::broker::{
    BindRequest, BindResponse, BindingLastOperationRequest, BrokerClient, BrokerError,
    BrokerOperation, DeprovisionRequest, DeprovisionResponse, GetBindingRequest,
    GetBindingResponse, LastOperationRequest, LastOperationResponse, LastOperationState,
    ProvisionRequest, ProvisionResponse, UnbindRequest, UnbindResponse, UpdateInstanceRequest,
    UpdateInstanceResponse, BROKER_API_VERSION,
};
use crate::observability::metrics;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info_span, warn, Instrument};

/// Credentials presented to the broker
#[derive(Clone, PartialEq, Eq)]
pub enum BrokerAuth {
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl std::fmt::Debug for BrokerAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerAuth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            BrokerAuth::Bearer { .. } => f.debug_struct("Bearer").field("token", &"***").finish(),
        }
    }
}

/// OSB REST client bound to one broker
#[derive(Clone)]
pub struct OsbClient {
    name: String,
    http_client: Client,
    base_url: String,
    auth: Option<BrokerAuth>,
}

impl std::fmt::Debug for OsbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsbClient")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Wire bodies
// ============================================================================

#[derive(Debug, Serialize)]
struct ProvisionBody<'a> {
    service_id: &'a str,
    plan_id: &'a str,
    organization_guid: &'a str,
    space_guid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<&'a Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a Value>,
}

#[derive(Debug, Serialize)]
struct PreviousValuesBody<'a> {
    service_id: &'a str,
    plan_id: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdateBody<'a> {
    service_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<&'a Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_values: Option<PreviousValuesBody<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a Value>,
}

#[derive(Debug, Serialize)]
struct BindResource<'a> {
    app_guid: &'a str,
}

#[derive(Debug, Serialize)]
struct BindBody<'a> {
    service_id: &'a str,
    plan_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    bind_resource: Option<BindResource<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<&'a Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a Value>,
}

/// Body of provision/update responses
#[derive(Debug, Default, Deserialize)]
struct InstanceResponseBody {
    #[serde(default)]
    dashboard_url: Option<String>,
    #[serde(default)]
    operation: Option<String>,
}

/// Body of deprovision/unbind responses
#[derive(Debug, Default, Deserialize)]
struct AsyncResponseBody {
    #[serde(default)]
    operation: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BindResponseBody {
    #[serde(default)]
    credentials: Option<Map<String, Value>>,
    #[serde(default)]
    operation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LastOperationBody {
    state: LastOperationState,
    #[serde(default)]
    description: Option<String>,
}

/// Error body returned by brokers on failure
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl OsbClient {
    #[must_use]
    pub fn new(name: &str, base_url: &str, auth: Option<BrokerAuth>, http_client: Client) -> Self {
        Self {
            name: name.to_string(),
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        }
    }

    /// Build the shared HTTP client used for every broker
    ///
    /// # Errors
    /// Returns `BrokerError::Config` when the TLS backend cannot be initialized
    pub fn http_client(timeout: Duration, insecure_skip_tls_verify: bool) -> Result<Client, BrokerError> {
        Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(insecure_skip_tls_verify)
            .build()
            .map_err(|e| BrokerError::Config(format!("failed to create HTTP client: {e}")))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn instance_path(instance_id: &str) -> String {
        format!("/v2/service_instances/{instance_id}")
    }

    fn binding_path(instance_id: &str, binding_id: &str) -> String {
        format!("/v2/service_instances/{instance_id}/service_bindings/{binding_id}")
    }

    /// Build a request with the API version and authentication headers
    fn make_request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let request = self
            .http_client
            .request(method, url)
            .header("X-Broker-API-Version", BROKER_API_VERSION);

        match &self.auth {
            Some(BrokerAuth::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            Some(BrokerAuth::Bearer { token }) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a request, recording metrics and mapping transport failures
    async fn send(
        &self,
        operation: BrokerOperation,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, BrokerError> {
        let start = Instant::now();
        let result = request.send().await;
        let elapsed = start.elapsed().as_secs_f64();

        match result {
            Ok(response) => {
                let status = response.status();
                let outcome = if status.is_success() { "success" } else { "error" };
                metrics::record_broker_request(operation.as_str(), outcome, elapsed);
                debug!(
                    broker.name = self.name.as_str(),
                    operation = operation.as_str(),
                    status = status.as_u16(),
                    "broker.request.completed"
                );
                Ok(response)
            }
            Err(e) => {
                metrics::record_broker_request(operation.as_str(), "transport_error", elapsed);
                warn!(
                    broker.name = self.name.as_str(),
                    operation = operation.as_str(),
                    error = %e,
                    "broker.request.failed"
                );
                if e.is_timeout() {
                    Err(BrokerError::Timeout(e.to_string()))
                } else {
                    Err(BrokerError::Transport(e.to_string()))
                }
            }
        }
    }

    /// Map a non-success response to `BrokerError::Http`
    async fn error_from_response(response: reqwest::Response) -> BrokerError {
        let status = response.status().as_u16();
        let body = response.bytes().await.unwrap_or_default();
        let parsed: ErrorBody = serde_json::from_slice(&body).unwrap_or_default();
        BrokerError::Http {
            status,
            error: parsed.error,
            description: parsed.description,
        }
    }

    /// Decode a JSON body, treating an empty body as the default value
    async fn read_json<T: DeserializeOwned + Default>(
        response: reqwest::Response,
    ) -> Result<T, BrokerError> {
        let body = response
            .bytes()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        serde_json::from_slice(&body).map_err(|e| BrokerError::Decode(e.to_string()))
    }

    async fn read_last_operation(
        response: reqwest::Response,
    ) -> Result<LastOperationResponse, BrokerError> {
        match response.status() {
            StatusCode::OK => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| BrokerError::Transport(e.to_string()))?;
                let parsed: LastOperationBody = serde_json::from_slice(&body)
                    .map_err(|e| BrokerError::Decode(e.to_string()))?;
                Ok(LastOperationResponse {
                    state: parsed.state,
                    description: parsed.description,
                })
            }
            _ => Err(Self::error_from_response(response).await),
        }
    }
}

fn accepts_incomplete_query(accepts_incomplete: bool) -> Vec<(&'static str, String)> {
    if accepts_incomplete {
        vec![("accepts_incomplete", "true".to_string())]
    } else {
        Vec::new()
    }
}

fn last_operation_query(
    service_id: Option<&str>,
    plan_id: Option<&str>,
    operation_key: Option<&str>,
) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(service_id) = service_id {
        query.push(("service_id", service_id.to_string()));
    }
    if let Some(plan_id) = plan_id {
        query.push(("plan_id", plan_id.to_string()));
    }
    if let Some(operation) = operation_key {
        query.push(("operation", operation.to_string()));
    }
    query
}

#[async_trait]
impl BrokerClient for OsbClient {
    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse, BrokerError> {
        let span = info_span!(
            "broker.provision",
            broker.name = self.name.as_str(),
            instance.id = request.instance_id.as_str(),
            plan.id = request.plan_id.as_str()
        );
        async move {
            let body = ProvisionBody {
                service_id: &request.service_id,
                plan_id: &request.plan_id,
                organization_guid: &request.organization_guid,
                space_guid: &request.space_guid,
                parameters: request.parameters.as_ref(),
                context: request.context.as_ref(),
            };
            let http = self
                .make_request(Method::PUT, &Self::instance_path(&request.instance_id))
                .query(&accepts_incomplete_query(request.accepts_incomplete))
                .json(&body);
            let response = self.send(BrokerOperation::Provision, http).await?;

            match response.status() {
                StatusCode::OK | StatusCode::CREATED => {
                    let parsed: InstanceResponseBody = Self::read_json(response).await?;
                    Ok(ProvisionResponse {
                        is_async: false,
                        dashboard_url: parsed.dashboard_url,
                        operation_key: None,
                    })
                }
                StatusCode::ACCEPTED => {
                    let parsed: InstanceResponseBody = Self::read_json(response).await?;
                    Ok(ProvisionResponse {
                        is_async: true,
                        dashboard_url: parsed.dashboard_url,
                        operation_key: parsed.operation,
                    })
                }
                _ => Err(Self::error_from_response(response).await),
            }
        }
        .instrument(span)
        .await
    }

    async fn update_instance(
        &self,
        request: &UpdateInstanceRequest,
    ) -> Result<UpdateInstanceResponse, BrokerError> {
        let span = info_span!(
            "broker.update_instance",
            broker.name = self.name.as_str(),
            instance.id = request.instance_id.as_str()
        );
        async move {
            let body = UpdateBody {
                service_id: &request.service_id,
                plan_id: request.plan_id.as_deref(),
                parameters: request.parameters.as_ref(),
                previous_values: request.previous_values.as_ref().map(|p| PreviousValuesBody {
                    service_id: &p.service_id,
                    plan_id: &p.plan_id,
                }),
                context: request.context.as_ref(),
            };
            let http = self
                .make_request(Method::PATCH, &Self::instance_path(&request.instance_id))
                .query(&accepts_incomplete_query(request.accepts_incomplete))
                .json(&body);
            let response = self.send(BrokerOperation::UpdateInstance, http).await?;

            match response.status() {
                StatusCode::OK => {
                    let parsed: InstanceResponseBody = Self::read_json(response).await?;
                    Ok(UpdateInstanceResponse {
                        is_async: false,
                        dashboard_url: parsed.dashboard_url,
                        operation_key: None,
                    })
                }
                StatusCode::ACCEPTED => {
                    let parsed: InstanceResponseBody = Self::read_json(response).await?;
                    Ok(UpdateInstanceResponse {
                        is_async: true,
                        dashboard_url: parsed.dashboard_url,
                        operation_key: parsed.operation,
                    })
                }
                _ => Err(Self::error_from_response(response).await),
            }
        }
        .instrument(span)
        .await
    }

    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, BrokerError> {
        let span = info_span!(
            "broker.deprovision",
            broker.name = self.name.as_str(),
            instance.id = request.instance_id.as_str()
        );
        async move {
            let mut query = vec![
                ("service_id", request.service_id.clone()),
                ("plan_id", request.plan_id.clone()),
            ];
            query.extend(accepts_incomplete_query(request.accepts_incomplete));
            let http = self
                .make_request(Method::DELETE, &Self::instance_path(&request.instance_id))
                .query(&query);
            let response = self.send(BrokerOperation::Deprovision, http).await?;

            match response.status() {
                StatusCode::OK => Ok(DeprovisionResponse::default()),
                StatusCode::ACCEPTED => {
                    let parsed: AsyncResponseBody = Self::read_json(response).await?;
                    Ok(DeprovisionResponse {
                        is_async: true,
                        operation_key: parsed.operation,
                    })
                }
                _ => Err(Self::error_from_response(response).await),
            }
        }
        .instrument(span)
        .await
    }

    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError> {
        let span = info_span!(
            "broker.poll_last_operation",
            broker.name = self.name.as_str(),
            instance.id = request.instance_id.as_str()
        );
        async move {
            let path = format!("{}/last_operation", Self::instance_path(&request.instance_id));
            let http = self.make_request(Method::GET, &path).query(&last_operation_query(
                request.service_id.as_deref(),
                request.plan_id.as_deref(),
                request.operation_key.as_deref(),
            ));
            let response = self.send(BrokerOperation::PollLastOperation, http).await?;
            Self::read_last_operation(response).await
        }
        .instrument(span)
        .await
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, BrokerError> {
        let span = info_span!(
            "broker.bind",
            broker.name = self.name.as_str(),
            instance.id = request.instance_id.as_str(),
            binding.id = request.binding_id.as_str()
        );
        async move {
            let body = BindBody {
                service_id: &request.service_id,
                plan_id: &request.plan_id,
                bind_resource: request
                    .app_guid
                    .as_deref()
                    .map(|app_guid| BindResource { app_guid }),
                parameters: request.parameters.as_ref(),
                context: request.context.as_ref(),
            };
            let http = self
                .make_request(
                    Method::PUT,
                    &Self::binding_path(&request.instance_id, &request.binding_id),
                )
                .query(&accepts_incomplete_query(request.accepts_incomplete))
                .json(&body);
            let response = self.send(BrokerOperation::Bind, http).await?;

            match response.status() {
                StatusCode::OK | StatusCode::CREATED => {
                    let parsed: BindResponseBody = Self::read_json(response).await?;
                    Ok(BindResponse {
                        is_async: false,
                        credentials: parsed.credentials,
                        operation_key: None,
                    })
                }
                StatusCode::ACCEPTED => {
                    let parsed: BindResponseBody = Self::read_json(response).await?;
                    Ok(BindResponse {
                        is_async: true,
                        credentials: None,
                        operation_key: parsed.operation,
                    })
                }
                _ => Err(Self::error_from_response(response).await),
            }
        }
        .instrument(span)
        .await
    }

    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, BrokerError> {
        let span = info_span!(
            "broker.unbind",
            broker.name = self.name.as_str(),
            instance.id = request.instance_id.as_str(),
            binding.id = request.binding_id.as_str()
        );
        async move {
            let mut query = vec![
                ("service_id", request.service_id.clone()),
                ("plan_id", request.plan_id.clone()),
            ];
            query.extend(accepts_incomplete_query(request.accepts_incomplete));
            let http = self
                .make_request(
                    Method::DELETE,
                    &Self::binding_path(&request.instance_id, &request.binding_id),
                )
                .query(&query);
            let response = self.send(BrokerOperation::Unbind, http).await?;

            match response.status() {
                StatusCode::OK => Ok(UnbindResponse::default()),
                StatusCode::ACCEPTED => {
                    let parsed: AsyncResponseBody = Self::read_json(response).await?;
                    Ok(UnbindResponse {
                        is_async: true,
                        operation_key: parsed.operation,
                    })
                }
                _ => Err(Self::error_from_response(response).await),
            }
        }
        .instrument(span)
        .await
    }

    async fn get_binding(
        &self,
        request: &GetBindingRequest,
    ) -> Result<GetBindingResponse, BrokerError> {
        let span = info_span!(
            "broker.get_binding",
            broker.name = self.name.as_str(),
            binding.id = request.binding_id.as_str()
        );
        async move {
            let http = self.make_request(
                Method::GET,
                &Self::binding_path(&request.instance_id, &request.binding_id),
            );
            let response = self.send(BrokerOperation::GetBinding, http).await?;

            match response.status() {
                StatusCode::OK => {
                    let parsed: BindResponseBody = Self::read_json(response).await?;
                    Ok(GetBindingResponse {
                        credentials: parsed.credentials,
                    })
                }
                _ => Err(Self::error_from_response(response).await),
            }
        }
        .instrument(span)
        .await
    }

    async fn poll_binding_last_operation(
        &self,
        request: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError> {
        let span = info_span!(
            "broker.poll_binding_last_operation",
            broker.name = self.name.as_str(),
            binding.id = request.binding_id.as_str()
        );
        async move {
            let path = format!(
                "{}/last_operation",
                Self::binding_path(&request.instance_id, &request.binding_id)
            );
            let http = self.make_request(Method::GET, &path).query(&last_operation_query(
                request.service_id.as_deref(),
                request.plan_id.as_deref(),
                request.operation_key.as_deref(),
            ));
            let response = self
                .send(BrokerOperation::PollBindingLastOperation, http)
                .await?;
            Self::read_last_operation(response).await
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_debug_redacts_secrets() {
        let basic = BrokerAuth::Basic {
            username: "admin".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{basic:?}");
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));

        let bearer = BrokerAuth::Bearer {
            token: "abc.def".into(),
        };
        assert!(!format!("{bearer:?}").contains("abc.def"));
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = OsbClient::new("ups", "http://broker.local/", None, Client::new());
        assert_eq!(client.base_url, "http://broker.local");
        assert_eq!(client.name(), "ups");
    }

    #[test]
    fn test_last_operation_query_includes_only_present_fields() {
        let query = last_operation_query(Some("svc"), None, Some("op-1"));
        assert_eq!(
            query,
            vec![
                ("service_id", "svc".to_string()),
                ("operation", "op-1".to_string())
            ]
        );
        assert!(accepts_incomplete_query(false).is_empty());
    }

    #[test]
    fn test_last_operation_state_wire_format() {
        let body: LastOperationBody =
            serde_json::from_str(r#"{"state":"in progress","description":"creating"}"#)
                .expect("valid body");
        assert_eq!(body.state, LastOperationState::InProgress);
        assert_eq!(body.description.as_deref(), Some("creating"));

        let failed: LastOperationBody =
            serde_json::from_str(r#"{"state":"failed"}"#).expect("valid body");
        assert_eq!(failed.state, LastOperationState::Failed);
    }
}
