//! Destination registry and kube integration: cluster secrets, the local
//! capability probe, and kube-backed application and project stores.

#![forbid(unsafe_code)]

use appset_core::{AppProject, StoreError};
use async_trait::async_trait;

mod kube_adapters;
mod registry;

pub use kube_adapters::{
    app_project_resource, application_resource, application_set_resource, from_dynamic, KubeApplicationStore,
    KubeProjectSource, KubeSecretSource, KubeServerProbe,
};
pub use registry::{
    secret_to_destination, ClusterRegistry, DestinationSnapshot, FixedProbe, SecretSource, ServerProbe,
    StaticSecrets,
};

/// Source of project policy records.
#[async_trait]
pub trait ProjectSource: Send + Sync {
    async fn projects(&self, namespace: &str) -> Result<Vec<AppProject>, StoreError>;
}

/// Fixed project list.
#[derive(Debug, Clone, Default)]
pub struct StaticProjects(pub Vec<AppProject>);

#[async_trait]
impl ProjectSource for StaticProjects {
    async fn projects(&self, _namespace: &str) -> Result<Vec<AppProject>, StoreError> {
        Ok(self.0.clone())
    }
}
