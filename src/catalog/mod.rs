//! # Catalog
//!
//! Read-only view of broker-advertised classes and plans.
//!
//! The catalog is populated by an independent sync process and may be stale or
//! not yet populated. Lookups answer `Ok(None)` for a missing entry; callers
//! treat that as "maybe not synced yet" and retry within a bounded budget.
//!
//! - `kube`: lookups against the catalog CRDs
//! - `snapshot`: in-memory catalog for tests

mod kube;
mod snapshot;

pub use self::kube::KubeCatalog;
pub use snapshot::CatalogSnapshot;

use crate::broker::BrokerRef;
use crate::crd::{PlanReference, ReferenceScope};
use async_trait::async_trait;
use thiserror::Error;

/// Where a catalog lookup searches
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CatalogScope {
    Cluster,
    Namespaced(String),
}

impl CatalogScope {
    #[must_use]
    pub fn reference_scope(&self) -> ReferenceScope {
        match self {
            CatalogScope::Cluster => ReferenceScope::Cluster,
            CatalogScope::Namespaced(_) => ReferenceScope::Namespaced,
        }
    }

    /// Scope for a recorded reference, given the namespace of the consuming resource
    #[must_use]
    pub fn from_reference(scope: ReferenceScope, namespace: &str) -> Self {
        match scope {
            ReferenceScope::Cluster => CatalogScope::Cluster,
            ReferenceScope::Namespaced => CatalogScope::Namespaced(namespace.to_string()),
        }
    }

    /// Broker reference for a broker name in this scope
    #[must_use]
    pub fn broker(&self, broker_name: &str) -> BrokerRef {
        match self {
            CatalogScope::Cluster => BrokerRef::cluster(broker_name),
            CatalogScope::Namespaced(ns) => BrokerRef::namespaced(ns, broker_name),
        }
    }
}

/// A service class as the state machines need it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedClass {
    pub scope: CatalogScope,
    /// Kubernetes object name
    pub name: String,
    pub external_name: String,
    pub external_id: String,
    pub bindable: bool,
    pub plan_updatable: bool,
    pub binding_retrievable: bool,
    pub broker_name: String,
}

impl ResolvedClass {
    #[must_use]
    pub fn broker(&self) -> BrokerRef {
        self.scope.broker(&self.broker_name)
    }
}

/// A service plan as the state machines need it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPlan {
    pub scope: CatalogScope,
    /// Kubernetes object name
    pub name: String,
    /// Kubernetes name of the owning class
    pub class_name: String,
    pub external_name: String,
    pub external_id: String,
    /// Overrides the class-level flag when set
    pub bindable: Option<bool>,
    pub broker_name: String,
}

/// Class and plan a `PlanReference` resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPlanReference {
    pub class: ResolvedClass,
    pub plan: ResolvedPlan,
}

impl ResolvedPlanReference {
    /// Plan-level bindability wins over the class default
    #[must_use]
    pub fn is_bindable(&self) -> bool {
        self.plan.bindable.unwrap_or(self.class.bindable)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    /// The reference names zero or several forms, or mixes scopes
    #[error("invalid plan reference: {0}")]
    InvalidReference(String),
    #[error("references a non-existent service class {0}")]
    ClassNotFound(String),
    #[error("references a non-existent service plan {0}")]
    PlanNotFound(String),
    /// The catalog could not be read at all
    #[error("catalog lookup failed: {0}")]
    Lookup(String),
}

#[async_trait]
pub trait CatalogLookup: Send + Sync {
    async fn class_by_name(
        &self,
        scope: &CatalogScope,
        name: &str,
    ) -> Result<Option<ResolvedClass>, CatalogError>;

    async fn class_by_external_name(
        &self,
        scope: &CatalogScope,
        external_name: &str,
    ) -> Result<Option<ResolvedClass>, CatalogError>;

    async fn class_by_external_id(
        &self,
        scope: &CatalogScope,
        external_id: &str,
    ) -> Result<Option<ResolvedClass>, CatalogError>;

    async fn plan_by_name(
        &self,
        scope: &CatalogScope,
        name: &str,
    ) -> Result<Option<ResolvedPlan>, CatalogError>;

    /// Plan with the given external name that belongs to `class`
    async fn plan_by_external_name(
        &self,
        scope: &CatalogScope,
        class: &ResolvedClass,
        external_name: &str,
    ) -> Result<Option<ResolvedPlan>, CatalogError>;

    async fn plan_by_external_id(
        &self,
        scope: &CatalogScope,
        external_id: &str,
    ) -> Result<Option<ResolvedPlan>, CatalogError>;
}

/// The populated form of a plan reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReferenceForm<'a> {
    ExternalName { class: &'a str, plan: &'a str },
    ExternalId { class: &'a str, plan: &'a str },
    Name { class: &'a str, plan: &'a str },
}

type Pair<'a> = (&'a Option<String>, &'a Option<String>);

/// Pick the single populated form among external names, external ids and names
fn pick_form<'a>(
    external_names: Pair<'a>,
    external_ids: Pair<'a>,
    names: Pair<'a>,
    reference: &PlanReference,
) -> Result<ReferenceForm<'a>, CatalogError> {
    let mismatched = || {
        CatalogError::InvalidReference(format!(
            "class and plan must be referenced the same way: {}",
            reference.describe()
        ))
    };
    let pair = |(class, plan): Pair<'a>| match (class.as_deref(), plan.as_deref()) {
        (Some(class), Some(plan)) => Ok(Some((class, plan))),
        (None, None) => Ok(None),
        _ => Err(mismatched()),
    };

    let mut forms = Vec::new();
    if let Some((class, plan)) = pair(external_names)? {
        forms.push(ReferenceForm::ExternalName { class, plan });
    }
    if let Some((class, plan)) = pair(external_ids)? {
        forms.push(ReferenceForm::ExternalId { class, plan });
    }
    if let Some((class, plan)) = pair(names)? {
        forms.push(ReferenceForm::Name { class, plan });
    }

    match forms.as_slice() {
        [form] => Ok(*form),
        _ => Err(CatalogError::InvalidReference(format!(
            "exactly one reference form must be set: {}",
            reference.describe()
        ))),
    }
}

/// Resolve an instance's plan reference against the catalog
///
/// # Errors
/// `InvalidReference` for an empty or ambiguous reference (terminal),
/// `ClassNotFound`/`PlanNotFound` for entries the catalog does not have yet,
/// `Lookup` when the catalog itself cannot be read.
pub async fn resolve_plan_reference(
    catalog: &dyn CatalogLookup,
    reference: &PlanReference,
    namespace: &str,
) -> Result<ResolvedPlanReference, CatalogError> {
    let (scope, form) = match (has_cluster(reference), has_namespaced(reference)) {
        (true, true) => {
            return Err(CatalogError::InvalidReference(format!(
                "cluster and namespaced references cannot be mixed: {}",
                reference.describe()
            )))
        }
        (true, false) => (
            CatalogScope::Cluster,
            pick_form(
                (
                    &reference.cluster_service_class_external_name,
                    &reference.cluster_service_plan_external_name,
                ),
                (
                    &reference.cluster_service_class_external_id,
                    &reference.cluster_service_plan_external_id,
                ),
                (
                    &reference.cluster_service_class_name,
                    &reference.cluster_service_plan_name,
                ),
                reference,
            )?,
        ),
        (false, true) => (
            CatalogScope::Namespaced(namespace.to_string()),
            pick_form(
                (
                    &reference.service_class_external_name,
                    &reference.service_plan_external_name,
                ),
                (
                    &reference.service_class_external_id,
                    &reference.service_plan_external_id,
                ),
                (&reference.service_class_name, &reference.service_plan_name),
                reference,
            )?,
        ),
        (false, false) => {
            return Err(CatalogError::InvalidReference(
                "no class and plan reference is set".to_string(),
            ))
        }
    };

    match form {
        ReferenceForm::ExternalName { class, plan } => {
            let class = catalog
                .class_by_external_name(&scope, class)
                .await?
                .ok_or_else(|| CatalogError::ClassNotFound(format!("(externalName {class:?})")))?;
            let plan = catalog
                .plan_by_external_name(&scope, &class, plan)
                .await?
                .ok_or_else(|| CatalogError::PlanNotFound(format!("(externalName {plan:?})")))?;
            Ok(ResolvedPlanReference { class, plan })
        }
        ReferenceForm::ExternalId { class, plan } => {
            let class = catalog
                .class_by_external_id(&scope, class)
                .await?
                .ok_or_else(|| CatalogError::ClassNotFound(format!("(externalID {class:?})")))?;
            let plan = catalog
                .plan_by_external_id(&scope, plan)
                .await?
                .filter(|p| p.class_name == class.name)
                .ok_or_else(|| CatalogError::PlanNotFound(format!("(externalID {plan:?})")))?;
            Ok(ResolvedPlanReference { class, plan })
        }
        ReferenceForm::Name { class, plan } => {
            let class = catalog
                .class_by_name(&scope, class)
                .await?
                .ok_or_else(|| CatalogError::ClassNotFound(format!("(name {class:?})")))?;
            let plan = catalog
                .plan_by_name(&scope, plan)
                .await?
                .filter(|p| p.class_name == class.name)
                .ok_or_else(|| CatalogError::PlanNotFound(format!("(name {plan:?})")))?;
            Ok(ResolvedPlanReference { class, plan })
        }
    }
}

/// Re-resolve the class and plan recorded in status by Kubernetes name
///
/// # Errors
/// Same classes of error as `resolve_plan_reference`
pub async fn resolve_recorded(
    catalog: &dyn CatalogLookup,
    scope: &CatalogScope,
    class_name: &str,
    plan_name: &str,
) -> Result<ResolvedPlanReference, CatalogError> {
    let class = catalog
        .class_by_name(scope, class_name)
        .await?
        .ok_or_else(|| CatalogError::ClassNotFound(format!("(name {class_name:?})")))?;
    let plan = catalog
        .plan_by_name(scope, plan_name)
        .await?
        .ok_or_else(|| CatalogError::PlanNotFound(format!("(name {plan_name:?})")))?;
    Ok(ResolvedPlanReference { class, plan })
}

fn has_cluster(reference: &PlanReference) -> bool {
    [
        &reference.cluster_service_class_external_name,
        &reference.cluster_service_plan_external_name,
        &reference.cluster_service_class_external_id,
        &reference.cluster_service_plan_external_id,
        &reference.cluster_service_class_name,
        &reference.cluster_service_plan_name,
    ]
    .iter()
    .any(|field| field.is_some())
}

fn has_namespaced(reference: &PlanReference) -> bool {
    [
        &reference.service_class_external_name,
        &reference.service_plan_external_name,
        &reference.service_class_external_id,
        &reference.service_plan_external_id,
        &reference.service_class_name,
        &reference.service_plan_name,
    ]
    .iter()
    .any(|field| field.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> CatalogSnapshot {
        let snapshot = CatalogSnapshot::new();
        snapshot.insert_class(CatalogSnapshot::cluster_class("db-class", "postgres", "ups"));
        snapshot.insert_plan(CatalogSnapshot::cluster_plan("db-small", "db-class", "small", "ups"));
        snapshot.insert_plan(CatalogSnapshot::cluster_plan("db-large", "db-class", "large", "ups"));
        snapshot
    }

    #[tokio::test]
    async fn test_resolve_by_external_name() {
        let reference = PlanReference::cluster_external_names("postgres", "small");
        let resolved = resolve_plan_reference(&catalog(), &reference, "default")
            .await
            .expect("resolves");
        assert_eq!(resolved.class.name, "db-class");
        assert_eq!(resolved.plan.name, "db-small");
        assert_eq!(resolved.class.scope, CatalogScope::Cluster);
    }

    #[tokio::test]
    async fn test_resolve_by_external_id_and_name() {
        let by_id = PlanReference {
            cluster_service_class_external_id: Some("postgres-id".into()),
            cluster_service_plan_external_id: Some("large-id".into()),
            ..PlanReference::default()
        };
        let resolved = resolve_plan_reference(&catalog(), &by_id, "default")
            .await
            .expect("resolves by id");
        assert_eq!(resolved.plan.name, "db-large");

        let by_name = PlanReference {
            cluster_service_class_name: Some("db-class".into()),
            cluster_service_plan_name: Some("db-small".into()),
            ..PlanReference::default()
        };
        let resolved = resolve_plan_reference(&catalog(), &by_name, "default")
            .await
            .expect("resolves by name");
        assert_eq!(resolved.plan.external_name, "small");
    }

    #[tokio::test]
    async fn test_missing_entries_are_reported_separately() {
        let missing_class = PlanReference::cluster_external_names("mysql", "small");
        assert!(matches!(
            resolve_plan_reference(&catalog(), &missing_class, "default").await,
            Err(CatalogError::ClassNotFound(_))
        ));

        let missing_plan = PlanReference::cluster_external_names("postgres", "huge");
        assert!(matches!(
            resolve_plan_reference(&catalog(), &missing_plan, "default").await,
            Err(CatalogError::PlanNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_references() {
        let empty = PlanReference::default();
        assert!(matches!(
            resolve_plan_reference(&catalog(), &empty, "default").await,
            Err(CatalogError::InvalidReference(_))
        ));

        let half = PlanReference {
            cluster_service_class_external_name: Some("postgres".into()),
            ..PlanReference::default()
        };
        assert!(matches!(
            resolve_plan_reference(&catalog(), &half, "default").await,
            Err(CatalogError::InvalidReference(_))
        ));

        let mixed = PlanReference {
            service_class_external_name: Some("postgres".into()),
            service_plan_external_name: Some("small".into()),
            ..PlanReference::cluster_external_names("postgres", "small")
        };
        assert!(matches!(
            resolve_plan_reference(&catalog(), &mixed, "default").await,
            Err(CatalogError::InvalidReference(_))
        ));

        let two_forms = PlanReference {
            cluster_service_class_name: Some("db-class".into()),
            cluster_service_plan_name: Some("db-small".into()),
            ..PlanReference::cluster_external_names("postgres", "small")
        };
        assert!(matches!(
            resolve_plan_reference(&catalog(), &two_forms, "default").await,
            Err(CatalogError::InvalidReference(_))
        ));
    }

    #[tokio::test]
    async fn test_namespaced_reference_uses_instance_namespace() {
        let snapshot = CatalogSnapshot::new();
        let scope = CatalogScope::Namespaced("team-a".into());
        snapshot.insert_class(ResolvedClass {
            scope: scope.clone(),
            ..CatalogSnapshot::cluster_class("ns-class", "redis", "team-broker")
        });
        snapshot.insert_plan(ResolvedPlan {
            scope: scope.clone(),
            ..CatalogSnapshot::cluster_plan("ns-plan", "ns-class", "tiny", "team-broker")
        });

        let reference = PlanReference {
            service_class_external_name: Some("redis".into()),
            service_plan_external_name: Some("tiny".into()),
            ..PlanReference::default()
        };
        let resolved = resolve_plan_reference(&snapshot, &reference, "team-a")
            .await
            .expect("resolves in namespace");
        assert_eq!(resolved.class.broker(), BrokerRef::namespaced("team-a", "team-broker"));

        assert!(matches!(
            resolve_plan_reference(&snapshot, &reference, "team-b").await,
            Err(CatalogError::ClassNotFound(_))
        ));
    }

    #[test]
    fn test_plan_bindability_overrides_class() {
        let mut resolved = ResolvedPlanReference {
            class: CatalogSnapshot::cluster_class("c", "c", "b"),
            plan: CatalogSnapshot::cluster_plan("p", "c", "p", "b"),
        };
        assert!(resolved.is_bindable());
        resolved.plan.bindable = Some(false);
        assert!(!resolved.is_bindable());
        resolved.class.bindable = false;
        resolved.plan.bindable = Some(true);
        assert!(resolved.is_bindable());
    }
}
