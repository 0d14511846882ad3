//! End-to-end binding scenarios against an in-memory cluster and a scripted broker

mod common;

use common::{binding, mark_deleted, secret_strings, World, NAMESPACE};
use serde_json::{json, Map, Value};
use service_catalog_controller::broker::{
    BindResponse, BrokerError, BrokerOperation, GetBindingResponse, LastOperationResponse,
    LastOperationState, UnbindResponse,
};
use service_catalog_controller::catalog::CatalogSnapshot;
use service_catalog_controller::config::ControllerConfig;
use service_catalog_controller::controller::reconciler::conditions::{
    reasons, ConditionedStatus, LifecycleState,
};
use service_catalog_controller::controller::reconciler::{Requeue, TriggerSource};
use service_catalog_controller::crd::{
    AddKeyTransform, AddKeysFromTransform, DeleteStatus, ObjectReference, ParametersFromSource,
    RemoveKeyTransform, RenameKeyTransform, SecretKeyReference, SecretTransform, ServiceBinding,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn credentials(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("credentials must be an object, got {other}"),
    }
}

fn async_bind_world() -> World {
    let world = World::with_config(ControllerConfig {
        async_binding_operations: true,
        max_broker_retries: 3,
        ..ControllerConfig::default()
    });
    world.broker.on_bind(|request| {
        assert!(request.accepts_incomplete);
        Ok(BindResponse {
            is_async: true,
            credentials: None,
            operation_key: Some("bind-op".into()),
        })
    });
    world
}

/// Bind against a ready instance and return the bound binding
async fn bound(world: &World, name: &str) -> Option<ServiceBinding> {
    let _instance = world.ready_instance().await;
    let mut slot = Some(binding(name, "db"));
    world.converge_binding(&mut slot).await;
    world.broker.clear_actions();
    slot
}

#[tokio::test]
async fn test_binding_waits_for_instance_then_binds() {
    let world = World::new();
    let mut slot = Some(binding("app", "db"));

    let waiting = world.step_binding(&mut slot).await;
    assert!(matches!(
        waiting.requeue,
        Requeue::After(_, TriggerSource::WaitingForResource)
    ));
    let status = slot.as_ref().and_then(|b| b.status.clone()).expect("status");
    assert_eq!(
        status.last_condition_state.as_deref(),
        Some(reasons::ERROR_NONEXISTENT_INSTANCE)
    );
    assert_eq!(world.broker.count(BrokerOperation::Bind), 0);

    let _instance = world.ready_instance().await;
    world.converge_binding(&mut slot).await;

    assert_eq!(world.broker.count(BrokerOperation::Bind), 1);
    let status = slot.and_then(|b| b.status).expect("status");
    assert_eq!(status.lifecycle_state(), LifecycleState::Ready);
    assert_eq!(
        status.last_condition_state.as_deref(),
        Some(reasons::INJECTED_BIND_RESULT)
    );
    assert!(world.secrets.contains(NAMESPACE, "app"));
}

#[tokio::test]
async fn test_bound_binding_is_not_bound_again() {
    let world = World::new();
    let mut slot = bound(&world, "app").await;

    for _ in 0..3 {
        let outcome = world.step_binding(&mut slot).await;
        assert!(!outcome.status_changed());
    }
    assert!(world.broker.actions().is_empty());
}

#[tokio::test]
async fn test_non_bindable_class_fails_without_bind_call() {
    let world = World::new();
    let mut class = CatalogSnapshot::cluster_class("db-class", "db", "broker");
    class.bindable = false;
    world.catalog.insert_class(class);
    let _instance = world.ready_instance().await;
    let mut slot = Some(binding("app", "db"));

    let outcome = world.converge_binding(&mut slot).await;

    assert_eq!(outcome.requeue, Requeue::AwaitChange);
    assert_eq!(world.broker.count(BrokerOperation::Bind), 0);
    let status = slot.and_then(|b| b.status).expect("status");
    assert_eq!(status.lifecycle_state(), LifecycleState::Failed);
    assert_eq!(
        status.last_condition_state.as_deref(),
        Some(reasons::ERROR_NONBINDABLE_SERVICE_CLASS)
    );
}

#[tokio::test]
async fn test_plan_level_bindable_overrides_class() {
    let world = World::new();
    let mut class = CatalogSnapshot::cluster_class("db-class", "db", "broker");
    class.bindable = false;
    world.catalog.insert_class(class);
    let mut plan = CatalogSnapshot::cluster_plan("db-small", "db-class", "small", "broker");
    plan.bindable = Some(true);
    world.catalog.insert_plan(plan);
    let _instance = world.ready_instance().await;
    let mut slot = Some(binding("app", "db"));

    world.converge_binding(&mut slot).await;

    assert_eq!(world.broker.count(BrokerOperation::Bind), 1);
}

#[tokio::test]
async fn test_credentials_pass_through_transform_pipeline() {
    let world = World::new();
    world
        .secrets
        .insert_strings(NAMESPACE, "other-secret", &[("key-from-other-secret", "qux")]);
    world.broker.on_bind(|_| {
        Ok(BindResponse {
            is_async: false,
            credentials: Some(credentials(json!({"foo": "bar", "baz": "zap"}))),
            operation_key: None,
        })
    });
    let _instance = world.ready_instance().await;

    let mut app = binding("app", "db");
    app.spec.secret_transforms = vec![
        SecretTransform {
            add_key: Some(AddKeyTransform {
                key: "addedStringValue".into(),
                value: None,
                string_value: Some("stringValue".into()),
                json_path_expression: None,
            }),
            ..SecretTransform::default()
        },
        SecretTransform {
            add_key: Some(AddKeyTransform {
                key: "addedByteArray".into(),
                value: Some("Ynl0ZUFycmF5".into()),
                string_value: None,
                json_path_expression: None,
            }),
            ..SecretTransform::default()
        },
        SecretTransform {
            add_key: Some(AddKeyTransform {
                key: "valueFromJSONPath".into(),
                value: None,
                string_value: None,
                json_path_expression: Some("{.foo}".into()),
            }),
            ..SecretTransform::default()
        },
        SecretTransform {
            rename_key: Some(RenameKeyTransform {
                from: "foo".into(),
                to: "bar".into(),
            }),
            ..SecretTransform::default()
        },
        SecretTransform {
            add_keys_from: Some(AddKeysFromTransform {
                secret_ref: Some(ObjectReference {
                    name: "other-secret".into(),
                    namespace: None,
                }),
            }),
            ..SecretTransform::default()
        },
        SecretTransform {
            remove_key: Some(RemoveKeyTransform { key: "baz".into() }),
            ..SecretTransform::default()
        },
    ];
    let mut slot = Some(app);

    world.converge_binding(&mut slot).await;

    let expected: Vec<(String, String)> = [
        ("addedByteArray", "byteArray"),
        ("addedStringValue", "stringValue"),
        ("bar", "bar"),
        ("key-from-other-secret", "qux"),
        ("valueFromJSONPath", "bar"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    assert_eq!(secret_strings(&world, "app"), expected);

    let owner = world.secrets.owner(NAMESPACE, "app").expect("owner reference");
    assert_eq!(owner.kind, "ServiceBinding");
    assert_eq!(owner.name, "app");
    assert_eq!(owner.controller, Some(true));
}

#[tokio::test]
async fn test_unbind_retries_until_broker_succeeds() {
    let world = World::new();
    let mut slot = bound(&world, "app").await;
    assert!(world.secrets.contains(NAMESPACE, "app"));

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    world.broker.on_unbind(move |_| {
        if seen.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(BrokerError::http(500))
        } else {
            Ok(UnbindResponse::default())
        }
    });

    mark_deleted(&mut slot.as_mut().expect("binding").metadata);
    world.converge_binding(&mut slot).await;

    assert!(slot.is_none());
    assert_eq!(world.broker.count(BrokerOperation::Unbind), 3);
    assert!(!world.secrets.contains(NAMESPACE, "app"));
}

#[tokio::test]
async fn test_failed_async_unbind_is_reissued() {
    let mut config = service_catalog_controller::config::ControllerConfig::default();
    config.async_binding_operations = true;
    let world = World::with_config(config);
    let mut slot = bound(&world, "app").await;

    world.broker.on_unbind(|request| {
        assert!(request.accepts_incomplete);
        Ok(UnbindResponse {
            is_async: true,
            operation_key: Some("unbind-op".into()),
        })
    });
    let polls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&polls);
    world.broker.on_poll_binding_last_operation(move |_| {
        let state = if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            LastOperationState::Failed
        } else {
            LastOperationState::Succeeded
        };
        Ok(LastOperationResponse {
            state,
            description: None,
        })
    });

    mark_deleted(&mut slot.as_mut().expect("binding").metadata);
    world.converge_binding(&mut slot).await;

    assert!(slot.is_none());
    assert_eq!(world.broker.count(BrokerOperation::Unbind), 2);
    assert_eq!(polls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_ambiguous_bind_failure_unbinds_then_binds_again() {
    let world = World::new();
    let _instance = world.ready_instance().await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&attempts);
    world.broker.on_bind(move |_| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(BrokerError::http(500))
        } else {
            Ok(BindResponse::default())
        }
    });
    let mut slot = Some(binding("app", "db"));

    world.converge_binding(&mut slot).await;

    let operations: Vec<_> = world
        .broker
        .actions()
        .iter()
        .map(|action| action.operation())
        .collect();
    assert_eq!(
        operations,
        vec![
            BrokerOperation::Bind,
            BrokerOperation::Unbind,
            BrokerOperation::Bind
        ]
    );
    let status = slot.and_then(|b| b.status).expect("status");
    assert_eq!(status.lifecycle_state(), LifecycleState::Ready);
    assert!(!status.orphan_mitigation_in_progress);
}

#[tokio::test]
async fn test_rejected_bind_needs_no_unbind_on_delete() {
    let world = World::new();
    let _instance = world.ready_instance().await;
    world
        .broker
        .on_bind(|_| Err(BrokerError::http_with_description(400, "bad parameters")));
    let mut slot = Some(binding("app", "db"));

    let outcome = world.converge_binding(&mut slot).await;
    assert_eq!(outcome.requeue, Requeue::AwaitChange);
    let status = slot.as_ref().and_then(|b| b.status.clone()).expect("status");
    assert_eq!(status.lifecycle_state(), LifecycleState::Failed);
    assert_eq!(status.unbind_status, Some(DeleteStatus::NotRequired));

    mark_deleted(&mut slot.as_mut().expect("binding").metadata);
    world.converge_binding(&mut slot).await;

    assert!(slot.is_none());
    assert_eq!(world.broker.count(BrokerOperation::Unbind), 0);
}

#[tokio::test]
async fn test_transient_bind_failures_exhaust_retry_budget() {
    let world = World::with_config(ControllerConfig {
        max_broker_retries: 3,
        ..ControllerConfig::default()
    });
    let _instance = world.ready_instance().await;
    world.broker.on_bind(|_| Err(BrokerError::http(422)));
    let mut slot = Some(binding("app", "db"));

    let outcome = world.converge_binding(&mut slot).await;

    assert_eq!(outcome.requeue, Requeue::AwaitChange);
    assert_eq!(world.broker.count(BrokerOperation::Bind), 4);
    assert_eq!(world.broker.count(BrokerOperation::Unbind), 0);
    let status = slot.and_then(|b| b.status).expect("status");
    assert_eq!(status.lifecycle_state(), LifecycleState::Failed);
    assert_eq!(
        status.last_condition_state.as_deref(),
        Some(reasons::ERROR_RECONCILIATION_RETRY_TIMEOUT)
    );
    assert!(!world.secrets.contains(NAMESPACE, "app"));
}

#[tokio::test]
async fn test_async_bind_fetches_credentials_once_complete() {
    let world = async_bind_world();
    world.broker.on_get_binding(|request| {
        assert!(!request.binding_id.is_empty());
        Ok(GetBindingResponse {
            credentials: Some(credentials(json!({"username": "app-user"}))),
        })
    });
    let _instance = world.ready_instance().await;
    let mut slot = Some(binding("app", "db"));

    world.converge_binding(&mut slot).await;

    assert_eq!(world.broker.count(BrokerOperation::Bind), 1);
    assert_eq!(world.broker.count(BrokerOperation::PollBindingLastOperation), 1);
    assert_eq!(world.broker.count(BrokerOperation::GetBinding), 1);
    assert_eq!(
        secret_strings(&world, "app"),
        vec![("username".to_string(), "app-user".to_string())]
    );
    let status = slot.and_then(|b| b.status).expect("status");
    assert_eq!(status.lifecycle_state(), LifecycleState::Ready);
    assert!(!status.async_op_in_progress);
}

#[tokio::test]
async fn test_failed_async_bind_is_terminal() {
    let world = async_bind_world();
    world.broker.on_poll_binding_last_operation(|_| {
        Ok(LastOperationResponse {
            state: LastOperationState::Failed,
            description: Some("quota exceeded".into()),
        })
    });
    let _instance = world.ready_instance().await;
    let mut slot = Some(binding("app", "db"));

    let outcome = world.converge_binding(&mut slot).await;
    assert_eq!(outcome.requeue, Requeue::AwaitChange);

    world.broker.clear_actions();
    world.step_binding(&mut slot).await;
    assert!(world.broker.actions().is_empty());

    let status = slot.and_then(|b| b.status).expect("status");
    assert_eq!(status.lifecycle_state(), LifecycleState::Failed);
    assert_eq!(
        status.last_condition_state.as_deref(),
        Some(reasons::BIND_CALL_FAILED)
    );
    assert_eq!(status.unbind_status, Some(DeleteStatus::NotRequired));
}

#[tokio::test]
async fn test_lost_bind_operation_stops_polling_after_retry_budget() {
    let world = async_bind_world();
    world
        .broker
        .on_poll_binding_last_operation(|_| Err(BrokerError::http(410)));
    let _instance = world.ready_instance().await;
    let mut slot = Some(binding("app", "db"));

    let outcome = world.converge_binding(&mut slot).await;

    assert_eq!(outcome.requeue, Requeue::AwaitChange);
    assert_eq!(world.broker.count(BrokerOperation::PollBindingLastOperation), 4);
    let status = slot.and_then(|b| b.status).expect("status");
    assert_eq!(
        status.last_condition_state.as_deref(),
        Some(reasons::ERROR_RECONCILIATION_RETRY_TIMEOUT)
    );
    assert!(!status.async_op_in_progress);
    assert!(status.current_operation.is_none());
    // The broker may still hold the binding
    assert_eq!(status.unbind_status, Some(DeleteStatus::Required));
}

#[tokio::test]
async fn test_malformed_parameters_secret_fails_binding() {
    let world = World::new();
    world
        .secrets
        .insert_strings(NAMESPACE, "app-params", &[("parameters", "{not json")]);
    let _instance = world.ready_instance().await;
    let mut app = binding("app", "db");
    app.spec.parameters_from = vec![ParametersFromSource {
        secret_key_ref: Some(SecretKeyReference {
            name: "app-params".into(),
            key: "parameters".into(),
        }),
    }];
    let mut slot = Some(app);

    let outcome = world.converge_binding(&mut slot).await;

    assert_eq!(outcome.requeue, Requeue::AwaitChange);
    assert_eq!(world.broker.count(BrokerOperation::Bind), 0);
    let status = slot.and_then(|b| b.status).expect("status");
    assert_eq!(status.lifecycle_state(), LifecycleState::Failed);
    assert_eq!(
        status.last_condition_state.as_deref(),
        Some(reasons::ERROR_WITH_PARAMETERS)
    );
}
