//! Resource store API for generated applications, plus an in-memory,
//! version-guarded implementation used by tests and offline rendering.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use appset_core::{Application, ObjectKey, ResourceOp, StoreError};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Persistence seam consumed by the merge engine. `update` is guarded by the
/// resource version carried in the object's metadata.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Application, StoreError>;
    /// Applications in `namespace` whose controller owner-link matches `owner`.
    async fn list_owned(&self, namespace: &str, owner: &OwnerReference) -> Result<Vec<Application>, StoreError>;
    async fn create(&self, app: &Application) -> Result<Application, StoreError>;
    async fn update(&self, app: &Application) -> Result<Application, StoreError>;
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: ResourceStore + ?Sized> ResourceStore for Arc<T> {
    async fn get(&self, key: &ObjectKey) -> Result<Application, StoreError> {
        (**self).get(key).await
    }
    async fn list_owned(&self, namespace: &str, owner: &OwnerReference) -> Result<Vec<Application>, StoreError> {
        (**self).list_owned(namespace, owner).await
    }
    async fn create(&self, app: &Application) -> Result<Application, StoreError> {
        (**self).create(app).await
    }
    async fn update(&self, app: &Application) -> Result<Application, StoreError> {
        (**self).update(app).await
    }
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        (**self).delete(key).await
    }
}

struct Entry {
    raw: serde_json::Value,
    version: u64,
}

struct Fault {
    key: ObjectKey,
    op: ResourceOp,
    error: StoreError,
}

#[derive(Default)]
struct Inner {
    objects: FxHashMap<ObjectKey, Entry>,
    faults: VecDeque<Fault>,
    journal: Vec<(ResourceOp, ObjectKey)>,
}

/// In-RAM store. Objects are kept in serialized form so that reads return the
/// persisted view; resource versions start at "1" and increase on update.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite an object without version checks and without
    /// journaling it. Returns the stored form.
    pub async fn seed(&self, app: Application) -> Result<Application, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = app.key();
        let version = app.resource_version().and_then(|v| v.parse().ok()).unwrap_or(1);
        let raw = to_raw(&stamp(app, version, true))?;
        let out = from_raw(&raw)?;
        inner.objects.insert(key, Entry { raw, version });
        Ok(out)
    }

    /// Queue a one-shot failure for the next `op` on `key`.
    pub async fn fail_next(&self, key: ObjectKey, op: ResourceOp, error: StoreError) {
        self.inner.lock().await.faults.push_back(Fault { key, op, error });
    }

    /// Mutations performed through the store API, in order.
    pub async fn journal(&self) -> Vec<(ResourceOp, ObjectKey)> {
        self.inner.lock().await.journal.clone()
    }

    pub async fn names(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut names: Vec<String> = inner.objects.keys().map(|k| k.name.clone()).collect();
        names.sort();
        names
    }

    /// Bump an object's version as if another writer had touched it.
    pub async fn touch(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = inner.objects.get_mut(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        entry.version += 1;
        if let Some(meta) = entry.raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("resourceVersion".into(), serde_json::Value::String(entry.version.to_string()));
        }
        Ok(())
    }
}

impl Inner {
    fn take_fault(&mut self, key: &ObjectKey, op: ResourceOp) -> Option<StoreError> {
        let idx = self.faults.iter().position(|f| &f.key == key && f.op == op)?;
        self.faults.remove(idx).map(|f| f.error)
    }
}

fn to_raw(app: &Application) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(app).map_err(|e| StoreError::Other(e.to_string()))
}

fn from_raw(raw: &serde_json::Value) -> Result<Application, StoreError> {
    serde_json::from_value(raw.clone()).map_err(|e| StoreError::Other(e.to_string()))
}

fn stamp(mut app: Application, version: u64, fresh: bool) -> Application {
    app.metadata.resource_version = Some(version.to_string());
    if fresh {
        if app.metadata.uid.as_deref().unwrap_or("").is_empty() {
            app.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        if app.metadata.creation_timestamp.is_none() {
            app.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        }
    }
    app
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Application, StoreError> {
        let inner = self.inner.lock().await;
        let entry = inner.objects.get(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        from_raw(&entry.raw)
    }

    async fn list_owned(&self, namespace: &str, owner: &OwnerReference) -> Result<Vec<Application>, StoreError> {
        let inner = self.inner.lock().await;
        let mut out = Vec::new();
        for (key, entry) in inner.objects.iter() {
            if key.namespace != namespace {
                continue;
            }
            let app = from_raw(&entry.raw)?;
            if app.is_controlled_by(owner) {
                out.push(app);
            }
        }
        out.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(out)
    }

    async fn create(&self, app: &Application) -> Result<Application, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = app.key();
        if let Some(err) = inner.take_fault(&key, ResourceOp::Create) {
            return Err(err);
        }
        if inner.objects.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{} already exists", key)));
        }
        let stored = stamp(app.clone(), 1, true);
        let raw = to_raw(&stored)?;
        let out = from_raw(&raw)?;
        inner.objects.insert(key.clone(), Entry { raw, version: 1 });
        inner.journal.push((ResourceOp::Create, key.clone()));
        debug!(app = %key, "store: created");
        Ok(out)
    }

    async fn update(&self, app: &Application) -> Result<Application, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = app.key();
        if let Some(err) = inner.take_fault(&key, ResourceOp::Update) {
            return Err(err);
        }
        let current = inner.objects.get(&key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if let Some(rv) = app.resource_version() {
            if rv != current.version.to_string() {
                return Err(StoreError::Conflict(format!(
                    "{}: resource version {} is stale (current {})",
                    key, rv, current.version
                )));
            }
        }
        let version = current.version + 1;
        let stored = stamp(app.clone(), version, false);
        let raw = to_raw(&stored)?;
        let out = from_raw(&raw)?;
        inner.objects.insert(key.clone(), Entry { raw, version });
        inner.journal.push((ResourceOp::Update, key.clone()));
        debug!(app = %key, version, "store: updated");
        Ok(out)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(err) = inner.take_fault(key, ResourceOp::Delete) {
            return Err(err);
        }
        inner.objects.remove(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        inner.journal.push((ResourceOp::Delete, key.clone()));
        debug!(app = %key, "store: deleted");
        Ok(())
    }
}
