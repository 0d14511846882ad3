//! # Kubernetes Catalog
//!
//! Catalog lookups against the class and plan CRDs. Lookups by Kubernetes name
//! are a single GET; lookups by external name or id list the scope and filter,
//! since catalogs are small and the API offers no field selector on spec fields.

use crate::catalog::{CatalogError, CatalogLookup, CatalogScope, ResolvedClass, ResolvedPlan};
use crate::crd::{ClusterServiceClass, ClusterServicePlan, ServiceClass, ServicePlan};
use async_trait::async_trait;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};

#[derive(Clone)]
pub struct KubeCatalog {
    client: Client,
}

impl std::fmt::Debug for KubeCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCatalog").finish_non_exhaustive()
    }
}

fn lookup_error(e: &kube::Error) -> CatalogError {
    CatalogError::Lookup(e.to_string())
}

fn from_cluster_class(class: &ClusterServiceClass) -> ResolvedClass {
    ResolvedClass {
        scope: CatalogScope::Cluster,
        name: class.name_any(),
        external_name: class.spec.common.external_name.clone(),
        external_id: class.spec.common.external_id.clone(),
        bindable: class.spec.common.bindable,
        plan_updatable: class.spec.common.plan_updatable,
        binding_retrievable: class.spec.common.binding_retrievable,
        broker_name: class.spec.cluster_service_broker_name.clone(),
    }
}

fn from_namespaced_class(class: &ServiceClass, namespace: &str) -> ResolvedClass {
    ResolvedClass {
        scope: CatalogScope::Namespaced(namespace.to_string()),
        name: class.name_any(),
        external_name: class.spec.common.external_name.clone(),
        external_id: class.spec.common.external_id.clone(),
        bindable: class.spec.common.bindable,
        plan_updatable: class.spec.common.plan_updatable,
        binding_retrievable: class.spec.common.binding_retrievable,
        broker_name: class.spec.service_broker_name.clone(),
    }
}

fn from_cluster_plan(plan: &ClusterServicePlan) -> ResolvedPlan {
    ResolvedPlan {
        scope: CatalogScope::Cluster,
        name: plan.name_any(),
        class_name: plan.spec.cluster_service_class_ref.name.clone(),
        external_name: plan.spec.common.external_name.clone(),
        external_id: plan.spec.common.external_id.clone(),
        bindable: plan.spec.common.bindable,
        broker_name: plan.spec.cluster_service_broker_name.clone(),
    }
}

fn from_namespaced_plan(plan: &ServicePlan, namespace: &str) -> ResolvedPlan {
    ResolvedPlan {
        scope: CatalogScope::Namespaced(namespace.to_string()),
        name: plan.name_any(),
        class_name: plan.spec.service_class_ref.name.clone(),
        external_name: plan.spec.common.external_name.clone(),
        external_id: plan.spec.common.external_id.clone(),
        bindable: plan.spec.common.bindable,
        broker_name: plan.spec.service_broker_name.clone(),
    }
}

impl KubeCatalog {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn classes(&self, scope: &CatalogScope) -> Result<Vec<ResolvedClass>, CatalogError> {
        match scope {
            CatalogScope::Cluster => {
                let api: Api<ClusterServiceClass> = Api::all(self.client.clone());
                let list = api
                    .list(&ListParams::default())
                    .await
                    .map_err(|e| lookup_error(&e))?;
                Ok(list.items.iter().map(from_cluster_class).collect())
            }
            CatalogScope::Namespaced(ns) => {
                let api: Api<ServiceClass> = Api::namespaced(self.client.clone(), ns);
                let list = api
                    .list(&ListParams::default())
                    .await
                    .map_err(|e| lookup_error(&e))?;
                Ok(list
                    .items
                    .iter()
                    .map(|c| from_namespaced_class(c, ns))
                    .collect())
            }
        }
    }

    async fn plans(&self, scope: &CatalogScope) -> Result<Vec<ResolvedPlan>, CatalogError> {
        match scope {
            CatalogScope::Cluster => {
                let api: Api<ClusterServicePlan> = Api::all(self.client.clone());
                let list = api
                    .list(&ListParams::default())
                    .await
                    .map_err(|e| lookup_error(&e))?;
                Ok(list.items.iter().map(from_cluster_plan).collect())
            }
            CatalogScope::Namespaced(ns) => {
                let api: Api<ServicePlan> = Api::namespaced(self.client.clone(), ns);
                let list = api
                    .list(&ListParams::default())
                    .await
                    .map_err(|e| lookup_error(&e))?;
                Ok(list
                    .items
                    .iter()
                    .map(|p| from_namespaced_plan(p, ns))
                    .collect())
            }
        }
    }
}

#[async_trait]
impl CatalogLookup for KubeCatalog {
    async fn class_by_name(
        &self,
        scope: &CatalogScope,
        name: &str,
    ) -> Result<Option<ResolvedClass>, CatalogError> {
        match scope {
            CatalogScope::Cluster => {
                let api: Api<ClusterServiceClass> = Api::all(self.client.clone());
                let found = api.get_opt(name).await.map_err(|e| lookup_error(&e))?;
                Ok(found.as_ref().map(from_cluster_class))
            }
            CatalogScope::Namespaced(ns) => {
                let api: Api<ServiceClass> = Api::namespaced(self.client.clone(), ns);
                let found = api.get_opt(name).await.map_err(|e| lookup_error(&e))?;
                Ok(found.as_ref().map(|c| from_namespaced_class(c, ns)))
            }
        }
    }

    async fn class_by_external_name(
        &self,
        scope: &CatalogScope,
        external_name: &str,
    ) -> Result<Option<ResolvedClass>, CatalogError> {
        Ok(self
            .classes(scope)
            .await?
            .into_iter()
            .find(|c| c.external_name == external_name))
    }

    async fn class_by_external_id(
        &self,
        scope: &CatalogScope,
        external_id: &str,
    ) -> Result<Option<ResolvedClass>, CatalogError> {
        Ok(self
            .classes(scope)
            .await?
            .into_iter()
            .find(|c| c.external_id == external_id))
    }

    async fn plan_by_name(
        &self,
        scope: &CatalogScope,
        name: &str,
    ) -> Result<Option<ResolvedPlan>, CatalogError> {
        match scope {
            CatalogScope::Cluster => {
                let api: Api<ClusterServicePlan> = Api::all(self.client.clone());
                let found = api.get_opt(name).await.map_err(|e| lookup_error(&e))?;
                Ok(found.as_ref().map(from_cluster_plan))
            }
            CatalogScope::Namespaced(ns) => {
                let api: Api<ServicePlan> = Api::namespaced(self.client.clone(), ns);
                let found = api.get_opt(name).await.map_err(|e| lookup_error(&e))?;
                Ok(found.as_ref().map(|p| from_namespaced_plan(p, ns)))
            }
        }
    }

    async fn plan_by_external_name(
        &self,
        scope: &CatalogScope,
        class: &ResolvedClass,
        external_name: &str,
    ) -> Result<Option<ResolvedPlan>, CatalogError> {
        Ok(self
            .plans(scope)
            .await?
            .into_iter()
            .find(|p| p.class_name == class.name && p.external_name == external_name))
    }

    async fn plan_by_external_id(
        &self,
        scope: &CatalogScope,
        external_id: &str,
    ) -> Result<Option<ResolvedPlan>, CatalogError> {
        Ok(self
            .plans(scope)
            .await?
            .into_iter()
            .find(|p| p.external_id == external_id))
    }
}
