//! # Broker Client
//!
//! Transport abstraction over the Open Service Broker protocol. Implementations
//! hold no reconciliation state: every call is a single request/response.
//!
//! - `error`: `BrokerError` and its outcome classification
//! - `osb`: REST implementation (`OsbClient`)
//! - `fake`: scripted implementation for tests
//! - `registry`: resolves a catalog broker reference to a client

pub mod error;
pub mod fake;
pub mod osb;
pub mod registry;

pub use error::{BrokerError, BrokerErrorClass};
pub use fake::{BrokerAction, FakeBrokerClient};
pub use osb::{BrokerAuth, OsbClient};
pub use registry::{BrokerRef, BrokerRegistry, KubeBrokerRegistry, StaticBrokerRegistry};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// OSB API version sent in `X-Broker-API-Version`
pub const BROKER_API_VERSION: &str = "2.13";

/// Broker operations, used for metrics labels and the fake's action log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOperation {
    Provision,
    UpdateInstance,
    Deprovision,
    PollLastOperation,
    Bind,
    Unbind,
    GetBinding,
    PollBindingLastOperation,
}

impl BrokerOperation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerOperation::Provision => "provision",
            BrokerOperation::UpdateInstance => "update_instance",
            BrokerOperation::Deprovision => "deprovision",
            BrokerOperation::PollLastOperation => "poll_last_operation",
            BrokerOperation::Bind => "bind",
            BrokerOperation::Unbind => "unbind",
            BrokerOperation::GetBinding => "get_binding",
            BrokerOperation::PollBindingLastOperation => "poll_binding_last_operation",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionRequest {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
    pub parameters: Option<Map<String, Value>>,
    pub context: Option<Value>,
    pub accepts_incomplete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionResponse {
    pub is_async: bool,
    pub dashboard_url: Option<String>,
    pub operation_key: Option<String>,
}

/// Plan and service the instance had before an update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousValues {
    pub service_id: String,
    pub plan_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateInstanceRequest {
    pub instance_id: String,
    pub service_id: String,
    /// Only set when the plan changes
    pub plan_id: Option<String>,
    pub parameters: Option<Map<String, Value>>,
    pub previous_values: Option<PreviousValues>,
    pub context: Option<Value>,
    pub accepts_incomplete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateInstanceResponse {
    pub is_async: bool,
    pub dashboard_url: Option<String>,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeprovisionRequest {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub accepts_incomplete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeprovisionResponse {
    pub is_async: bool,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastOperationRequest {
    pub instance_id: String,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    pub operation_key: Option<String>,
}

/// State reported by a last-operation poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum LastOperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastOperationResponse {
    pub state: LastOperationState,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindRequest {
    pub binding_id: String,
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub app_guid: Option<String>,
    pub parameters: Option<Map<String, Value>>,
    pub context: Option<Value>,
    pub accepts_incomplete: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindResponse {
    pub is_async: bool,
    pub credentials: Option<Map<String, Value>>,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnbindRequest {
    pub binding_id: String,
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub accepts_incomplete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnbindResponse {
    pub is_async: bool,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBindingRequest {
    pub instance_id: String,
    pub binding_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetBindingResponse {
    pub credentials: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingLastOperationRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    pub operation_key: Option<String>,
}

/// Broker protocol client
///
/// `410 Gone` and every other non-success status surface as `BrokerError`;
/// callers decide what "gone" means for the operation at hand.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse, BrokerError>;

    async fn update_instance(
        &self,
        request: &UpdateInstanceRequest,
    ) -> Result<UpdateInstanceResponse, BrokerError>;

    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, BrokerError>;

    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError>;

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, BrokerError>;

    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, BrokerError>;

    async fn get_binding(
        &self,
        request: &GetBindingRequest,
    ) -> Result<GetBindingResponse, BrokerError>;

    async fn poll_binding_last_operation(
        &self,
        request: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError>;
}
