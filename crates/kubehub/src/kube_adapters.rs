use anyhow::{Context, Result};
use appset_core::{
    AppProject, Application, DestinationError, ObjectKey, StoreError, API_GROUP, API_VERSION, APPLICATION_KIND,
    APPLICATION_SET_KIND, APP_PROJECT_KIND, CLUSTER_SECRET_TYPE_LABEL, CLUSTER_SECRET_TYPE_VALUE,
};
use appset_store::ResourceStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use tracing::{debug, info};

use crate::{ProjectSource, SecretSource, ServerProbe};

fn resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(API_GROUP, API_VERSION, kind), plural)
}

pub fn application_resource() -> ApiResource {
    resource(APPLICATION_KIND, "applications")
}

pub fn application_set_resource() -> ApiResource {
    resource(APPLICATION_SET_KIND, "applicationsets")
}

pub fn app_project_resource() -> ApiResource {
    resource(APP_PROJECT_KIND, "appprojects")
}

fn store_error(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(ae.message),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message),
        kube::Error::Api(ae) if ae.code == 403 => StoreError::Forbidden(ae.message),
        other => StoreError::Other(other.to_string()),
    }
}

fn to_dynamic(app: &Application, ar: &ApiResource) -> Result<DynamicObject> {
    let mut raw = serde_json::to_value(app).context("serializing Application")?;
    if let Some(obj) = raw.as_object_mut() {
        obj.insert("apiVersion".into(), ar.api_version.clone().into());
        obj.insert("kind".into(), ar.kind.clone().into());
    }
    serde_json::from_value(raw).context("building DynamicObject")
}

/// Decode any argoproj.io object from its dynamic form.
pub fn from_dynamic<T: serde::de::DeserializeOwned>(obj: &DynamicObject) -> Result<T> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
    serde_json::from_value(raw).context("decoding typed object")
}

/// Cluster secrets read through the API server.
#[derive(Clone)]
pub struct KubeSecretSource {
    client: Client,
}

impl KubeSecretSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretSource for KubeSecretSource {
    async fn cluster_secrets(&self, namespace: &str) -> Result<Vec<Secret>, DestinationError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("{}={}", CLUSTER_SECRET_TYPE_LABEL, CLUSTER_SECRET_TYPE_VALUE));
        let list = api.list(&lp).await.map_err(|e| DestinationError::Source(e.to_string()))?;
        Ok(list.items)
    }
}

#[derive(Clone)]
pub struct KubeServerProbe {
    client: Client,
}

impl KubeServerProbe {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServerProbe for KubeServerProbe {
    async fn server_version(&self) -> Result<String, DestinationError> {
        let info = self.client.apiserver_version().await.map_err(|e| DestinationError::Source(e.to_string()))?;
        info!(major = %info.major, minor = %info.minor, "kube: local server version");
        Ok(format!("{}.{}", info.major, info.minor))
    }
}

/// Applications stored as argoproj.io custom resources.
#[derive(Clone)]
pub struct KubeApplicationStore {
    client: Client,
    ar: ApiResource,
}

impl KubeApplicationStore {
    pub fn new(client: Client) -> Self {
        Self { client, ar: application_resource() }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.ar)
    }

    fn encode(&self, app: &Application) -> Result<DynamicObject, StoreError> {
        to_dynamic(app, &self.ar).map_err(|e| StoreError::Other(format!("{e:#}")))
    }
}

fn decode(obj: &DynamicObject) -> Result<Application, StoreError> {
    from_dynamic(obj).map_err(|e| StoreError::Other(format!("{e:#}")))
}

#[async_trait]
impl ResourceStore for KubeApplicationStore {
    async fn get(&self, key: &ObjectKey) -> Result<Application, StoreError> {
        let obj = self.api(&key.namespace).get(&key.name).await.map_err(store_error)?;
        decode(&obj)
    }

    async fn list_owned(&self, namespace: &str, owner: &OwnerReference) -> Result<Vec<Application>, StoreError> {
        let list = self.api(namespace).list(&ListParams::default()).await.map_err(store_error)?;
        let mut out = Vec::new();
        for obj in list.items.iter() {
            let app = decode(obj)?;
            if app.is_controlled_by(owner) {
                out.push(app);
            }
        }
        debug!(ns = %namespace, owner = %owner.name, count = out.len(), "kube: listed owned applications");
        Ok(out)
    }

    async fn create(&self, app: &Application) -> Result<Application, StoreError> {
        let obj = self.encode(app)?;
        let created = self.api(app.namespace()).create(&PostParams::default(), &obj).await.map_err(store_error)?;
        decode(&created)
    }

    async fn update(&self, app: &Application) -> Result<Application, StoreError> {
        let obj = self.encode(app)?;
        let replaced =
            self.api(app.namespace()).replace(app.name(), &PostParams::default(), &obj).await.map_err(store_error)?;
        decode(&replaced)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.api(&key.namespace).delete(&key.name, &DeleteParams::default()).await.map_err(store_error)?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct KubeProjectSource {
    client: Client,
    ar: ApiResource,
}

impl KubeProjectSource {
    pub fn new(client: Client) -> Self {
        Self { client, ar: app_project_resource() }
    }
}

#[async_trait]
impl ProjectSource for KubeProjectSource {
    async fn projects(&self, namespace: &str) -> Result<Vec<AppProject>, StoreError> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &self.ar);
        let list = api.list(&ListParams::default()).await.map_err(store_error)?;
        list.items.iter().map(|o| from_dynamic(o).map_err(|e| StoreError::Other(format!("{e:#}")))).collect()
    }
}
