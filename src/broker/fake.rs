//! # Fake Broker Client
//!
//! Scripted `BrokerClient` that records every call it receives. Each operation
//! answers with a configurable reaction; unscripted operations succeed
//! synchronously.
//!
//! ```rust
//! use service_catalog_controller::broker::{BrokerError, FakeBrokerClient};
//!
//! let broker = FakeBrokerClient::new();
//! broker.on_unbind(|_| Err(BrokerError::http(500)));
//! ```

use crate::broker::{
    BindRequest, BindResponse, BindingLastOperationRequest, BrokerClient, BrokerError,
    BrokerOperation, DeprovisionRequest, DeprovisionResponse, GetBindingRequest,
    GetBindingResponse, LastOperationRequest, LastOperationResponse, LastOperationState,
    ProvisionRequest, ProvisionResponse, UnbindRequest, UnbindResponse, UpdateInstanceRequest,
    UpdateInstanceResponse,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};

type Reaction<Req, Resp> = Arc<dyn Fn(&Req) -> Result<Resp, BrokerError> + Send + Sync>;

/// A call received by the fake, with its request
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerAction {
    Provision(ProvisionRequest),
    UpdateInstance(UpdateInstanceRequest),
    Deprovision(DeprovisionRequest),
    PollLastOperation(LastOperationRequest),
    Bind(BindRequest),
    Unbind(UnbindRequest),
    GetBinding(GetBindingRequest),
    PollBindingLastOperation(BindingLastOperationRequest),
}

impl BrokerAction {
    #[must_use]
    pub fn operation(&self) -> BrokerOperation {
        match self {
            BrokerAction::Provision(_) => BrokerOperation::Provision,
            BrokerAction::UpdateInstance(_) => BrokerOperation::UpdateInstance,
            BrokerAction::Deprovision(_) => BrokerOperation::Deprovision,
            BrokerAction::PollLastOperation(_) => BrokerOperation::PollLastOperation,
            BrokerAction::Bind(_) => BrokerOperation::Bind,
            BrokerAction::Unbind(_) => BrokerOperation::Unbind,
            BrokerAction::GetBinding(_) => BrokerOperation::GetBinding,
            BrokerAction::PollBindingLastOperation(_) => BrokerOperation::PollBindingLastOperation,
        }
    }
}

#[derive(Default)]
struct Reactions {
    provision: Option<Reaction<ProvisionRequest, ProvisionResponse>>,
    update: Option<Reaction<UpdateInstanceRequest, UpdateInstanceResponse>>,
    deprovision: Option<Reaction<DeprovisionRequest, DeprovisionResponse>>,
    poll: Option<Reaction<LastOperationRequest, LastOperationResponse>>,
    bind: Option<Reaction<BindRequest, BindResponse>>,
    unbind: Option<Reaction<UnbindRequest, UnbindResponse>>,
    get_binding: Option<Reaction<GetBindingRequest, GetBindingResponse>>,
    poll_binding: Option<Reaction<BindingLastOperationRequest, LastOperationResponse>>,
}

/// In-memory broker for tests
#[derive(Default)]
pub struct FakeBrokerClient {
    actions: Mutex<Vec<BrokerAction>>,
    reactions: Mutex<Reactions>,
}

impl std::fmt::Debug for FakeBrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeBrokerClient")
            .field("actions", &self.actions().len())
            .finish_non_exhaustive()
    }
}

fn succeeded() -> LastOperationResponse {
    LastOperationResponse {
        state: LastOperationState::Succeeded,
        description: None,
    }
}

impl FakeBrokerClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call received so far, in order
    #[must_use]
    pub fn actions(&self) -> Vec<BrokerAction> {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of calls received for one operation
    #[must_use]
    pub fn count(&self, operation: BrokerOperation) -> usize {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|action| action.operation() == operation)
            .count()
    }

    pub fn clear_actions(&self) {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn record(&self, action: BrokerAction) {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(action);
    }

    fn reactions(&self) -> std::sync::MutexGuard<'_, Reactions> {
        self.reactions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_provision(
        &self,
        f: impl Fn(&ProvisionRequest) -> Result<ProvisionResponse, BrokerError> + Send + Sync + 'static,
    ) {
        self.reactions().provision = Some(Arc::new(f));
    }

    pub fn on_update_instance(
        &self,
        f: impl Fn(&UpdateInstanceRequest) -> Result<UpdateInstanceResponse, BrokerError>
            + Send
            + Sync
            + 'static,
    ) {
        self.reactions().update = Some(Arc::new(f));
    }

    pub fn on_deprovision(
        &self,
        f: impl Fn(&DeprovisionRequest) -> Result<DeprovisionResponse, BrokerError>
            + Send
            + Sync
            + 'static,
    ) {
        self.reactions().deprovision = Some(Arc::new(f));
    }

    pub fn on_poll_last_operation(
        &self,
        f: impl Fn(&LastOperationRequest) -> Result<LastOperationResponse, BrokerError>
            + Send
            + Sync
            + 'static,
    ) {
        self.reactions().poll = Some(Arc::new(f));
    }

    pub fn on_bind(
        &self,
        f: impl Fn(&BindRequest) -> Result<BindResponse, BrokerError> + Send + Sync + 'static,
    ) {
        self.reactions().bind = Some(Arc::new(f));
    }

    pub fn on_unbind(
        &self,
        f: impl Fn(&UnbindRequest) -> Result<UnbindResponse, BrokerError> + Send + Sync + 'static,
    ) {
        self.reactions().unbind = Some(Arc::new(f));
    }

    pub fn on_get_binding(
        &self,
        f: impl Fn(&GetBindingRequest) -> Result<GetBindingResponse, BrokerError>
            + Send
            + Sync
            + 'static,
    ) {
        self.reactions().get_binding = Some(Arc::new(f));
    }

    pub fn on_poll_binding_last_operation(
        &self,
        f: impl Fn(&BindingLastOperationRequest) -> Result<LastOperationResponse, BrokerError>
            + Send
            + Sync
            + 'static,
    ) {
        self.reactions().poll_binding = Some(Arc::new(f));
    }
}

#[async_trait]
impl BrokerClient for FakeBrokerClient {
    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse, BrokerError> {
        self.record(BrokerAction::Provision(request.clone()));
        let reaction = self.reactions().provision.clone();
        match reaction {
            Some(f) => f(request),
            None => Ok(ProvisionResponse::default()),
        }
    }

    async fn update_instance(
        &self,
        request: &UpdateInstanceRequest,
    ) -> Result<UpdateInstanceResponse, BrokerError> {
        self.record(BrokerAction::UpdateInstance(request.clone()));
        let reaction = self.reactions().update.clone();
        match reaction {
            Some(f) => f(request),
            None => Ok(UpdateInstanceResponse::default()),
        }
    }

    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, BrokerError> {
        self.record(BrokerAction::Deprovision(request.clone()));
        let reaction = self.reactions().deprovision.clone();
        match reaction {
            Some(f) => f(request),
            None => Ok(DeprovisionResponse::default()),
        }
    }

    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError> {
        self.record(BrokerAction::PollLastOperation(request.clone()));
        let reaction = self.reactions().poll.clone();
        match reaction {
            Some(f) => f(request),
            None => Ok(succeeded()),
        }
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, BrokerError> {
        self.record(BrokerAction::Bind(request.clone()));
        let reaction = self.reactions().bind.clone();
        match reaction {
            Some(f) => f(request),
            None => Ok(BindResponse {
                is_async: false,
                credentials: Some(serde_json::Map::new()),
                operation_key: None,
            }),
        }
    }

    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, BrokerError> {
        self.record(BrokerAction::Unbind(request.clone()));
        let reaction = self.reactions().unbind.clone();
        match reaction {
            Some(f) => f(request),
            None => Ok(UnbindResponse::default()),
        }
    }

    async fn get_binding(
        &self,
        request: &GetBindingRequest,
    ) -> Result<GetBindingResponse, BrokerError> {
        self.record(BrokerAction::GetBinding(request.clone()));
        let reaction = self.reactions().get_binding.clone();
        match reaction {
            Some(f) => f(request),
            None => Ok(GetBindingResponse {
                credentials: Some(serde_json::Map::new()),
            }),
        }
    }

    async fn poll_binding_last_operation(
        &self,
        request: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError> {
        self.record(BrokerAction::PollBindingLastOperation(request.clone()));
        let reaction = self.reactions().poll_binding.clone();
        match reaction {
            Some(f) => f(request),
            None => Ok(succeeded()),
        }
    }
}
