//! # CRD Generator
//!
//! Prints the CustomResourceDefinitions for every resource the controller
//! reads or writes, as a multi-document YAML stream.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/service-catalog.yaml
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::CustomResourceExt;
use service_catalog_controller::crd::{
    ClusterServiceBroker, ClusterServiceClass, ClusterServicePlan, ServiceBinding, ServiceBroker,
    ServiceClass, ServiceInstance, ServicePlan,
};

fn main() -> anyhow::Result<()> {
    let crds: [CustomResourceDefinition; 8] = [
        ClusterServiceBroker::crd(),
        ServiceBroker::crd(),
        ClusterServiceClass::crd(),
        ServiceClass::crd(),
        ClusterServicePlan::crd(),
        ServicePlan::crd(),
        ServiceInstance::crd(),
        ServiceBinding::crd(),
    ];
    for crd in &crds {
        println!("---");
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
