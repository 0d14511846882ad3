//! In-memory catalog.

use crate::catalog::{CatalogError, CatalogLookup, CatalogScope, ResolvedClass, ResolvedPlan};
use async_trait::async_trait;
use std::sync::{PoisonError, RwLock};

/// Catalog held in memory; entries can be added and removed while in use
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    classes: RwLock<Vec<ResolvedClass>>,
    plans: RwLock<Vec<ResolvedPlan>>,
}

impl CatalogSnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cluster-scoped, bindable, non-updatable class with external id `{external_name}-id`
    #[must_use]
    pub fn cluster_class(name: &str, external_name: &str, broker_name: &str) -> ResolvedClass {
        ResolvedClass {
            scope: CatalogScope::Cluster,
            name: name.to_string(),
            external_name: external_name.to_string(),
            external_id: format!("{external_name}-id"),
            bindable: true,
            plan_updatable: false,
            binding_retrievable: true,
            broker_name: broker_name.to_string(),
        }
    }

    /// Cluster-scoped plan with external id `{external_name}-id`
    #[must_use]
    pub fn cluster_plan(
        name: &str,
        class_name: &str,
        external_name: &str,
        broker_name: &str,
    ) -> ResolvedPlan {
        ResolvedPlan {
            scope: CatalogScope::Cluster,
            name: name.to_string(),
            class_name: class_name.to_string(),
            external_name: external_name.to_string(),
            external_id: format!("{external_name}-id"),
            bindable: None,
            broker_name: broker_name.to_string(),
        }
    }

    /// Insert or replace a class (matched by scope and name)
    pub fn insert_class(&self, class: ResolvedClass) {
        let mut classes = self.classes.write().unwrap_or_else(PoisonError::into_inner);
        classes.retain(|c| !(c.scope == class.scope && c.name == class.name));
        classes.push(class);
    }

    /// Insert or replace a plan (matched by scope and name)
    pub fn insert_plan(&self, plan: ResolvedPlan) {
        let mut plans = self.plans.write().unwrap_or_else(PoisonError::into_inner);
        plans.retain(|p| !(p.scope == plan.scope && p.name == plan.name));
        plans.push(plan);
    }

    pub fn remove_class(&self, scope: &CatalogScope, name: &str) {
        self.classes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|c| !(&c.scope == scope && c.name == name));
    }

    pub fn remove_plan(&self, scope: &CatalogScope, name: &str) {
        self.plans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|p| !(&p.scope == scope && p.name == name));
    }

    fn find_class(&self, predicate: impl Fn(&ResolvedClass) -> bool) -> Option<ResolvedClass> {
        self.classes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|c| predicate(c))
            .cloned()
    }

    fn find_plan(&self, predicate: impl Fn(&ResolvedPlan) -> bool) -> Option<ResolvedPlan> {
        self.plans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|p| predicate(p))
            .cloned()
    }
}

#[async_trait]
impl CatalogLookup for CatalogSnapshot {
    async fn class_by_name(
        &self,
        scope: &CatalogScope,
        name: &str,
    ) -> Result<Option<ResolvedClass>, CatalogError> {
        Ok(self.find_class(|c| &c.scope == scope && c.name == name))
    }

    async fn class_by_external_name(
        &self,
        scope: &CatalogScope,
        external_name: &str,
    ) -> Result<Option<ResolvedClass>, CatalogError> {
        Ok(self.find_class(|c| &c.scope == scope && c.external_name == external_name))
    }

    async fn class_by_external_id(
        &self,
        scope: &CatalogScope,
        external_id: &str,
    ) -> Result<Option<ResolvedClass>, CatalogError> {
        Ok(self.find_class(|c| &c.scope == scope && c.external_id == external_id))
    }

    async fn plan_by_name(
        &self,
        scope: &CatalogScope,
        name: &str,
    ) -> Result<Option<ResolvedPlan>, CatalogError> {
        Ok(self.find_plan(|p| &p.scope == scope && p.name == name))
    }

    async fn plan_by_external_name(
        &self,
        scope: &CatalogScope,
        class: &ResolvedClass,
        external_name: &str,
    ) -> Result<Option<ResolvedPlan>, CatalogError> {
        Ok(self.find_plan(|p| {
            &p.scope == scope && p.class_name == class.name && p.external_name == external_name
        }))
    }

    async fn plan_by_external_id(
        &self,
        scope: &CatalogScope,
        external_id: &str,
    ) -> Result<Option<ResolvedPlan>, CatalogError> {
        Ok(self.find_plan(|p| &p.scope == scope && p.external_id == external_id))
    }
}
