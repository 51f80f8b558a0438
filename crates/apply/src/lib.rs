//! Merge engine: diffs desired applications against the live owned ones and
//! creates, updates (preserving fields it does not own) or deletes them.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use appset_core::{
    Application, ApplicationSet, ObjectKey, ReconcileError, ResourceFailure, ResourceOp, StoreError,
    NOTIFIED_ANNOTATION,
};
use appset_store::ResourceStore;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Annotation keys written by other controllers; carried over from the live
/// object whenever the desired one lacks them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StickyKeys(BTreeSet<String>);

impl Default for StickyKeys {
    fn default() -> Self {
        Self([NOTIFIED_ANNOTATION.to_string()].into_iter().collect())
    }
}

impl StickyKeys {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(keys.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Counters for one reconciliation plus the per-resource failures that did not
/// stop their siblings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub finalizers_released: usize,
    pub failures: Vec<ResourceFailure>,
}

impl ApplyReport {
    pub fn absorb(&mut self, other: ApplyReport) {
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.finalizers_released += other.finalizers_released;
        self.failures.extend(other.failures);
    }

    pub fn fail(&mut self, key: ObjectKey, op: ResourceOp, error: StoreError) {
        warn!(app = %key, op = %op, error = %error, "apply: resource operation failed");
        self.failures.push(ResourceFailure { key, op, error });
    }

    /// Fold failures into one error. A lone update conflict that survived its
    /// retry is reported as such.
    pub fn check(&self) -> Result<(), ReconcileError> {
        match self.failures.as_slice() {
            [] => Ok(()),
            [f] if f.op == ResourceOp::Update && f.error.is_conflict() => {
                Err(ReconcileError::StoreConflict(f.key.clone()))
            }
            many => Err(ReconcileError::Resources(many.to_vec())),
        }
    }
}

/// Desired form of `app` inside `set`: namespace pinned to the set's and the
/// controller owner-link installed.
pub fn bind_to_set(set: &ApplicationSet, mut app: Application) -> Application {
    app.metadata.namespace = Some(set.namespace().to_string());
    app.set_controller_owner(set.owner_reference());
    app
}

/// Live object updated with everything the engine owns from `desired`.
/// Identity, version, status, operation and sticky annotations survive.
pub fn merge(desired: &Application, live: &Application, sticky: &StickyKeys) -> Application {
    let mut out = live.clone();
    out.spec = desired.spec.clone();
    out.metadata.labels = desired.metadata.labels.clone();
    out.metadata.finalizers = desired.metadata.finalizers.clone();

    let mut annotations: BTreeMap<String, String> = desired.metadata.annotations.clone().unwrap_or_default();
    if let Some(live_ann) = live.annotations() {
        for key in sticky.iter() {
            if !annotations.contains_key(key) {
                if let Some(v) = live_ann.get(key) {
                    annotations.insert(key.to_string(), v.clone());
                }
            }
        }
    }
    out.metadata.annotations = (!annotations.is_empty()).then_some(annotations);

    let owner = desired.metadata.owner_references.as_deref().unwrap_or(&[]).iter().find(|r| r.controller == Some(true));
    if let Some(owner) = owner {
        if !out.metadata.owner_references.as_deref().unwrap_or(&[]).contains(owner) {
            out.set_controller_owner(owner.clone());
        }
    }
    out
}

fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
        obj.remove("operation");
    }
    v
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    if let Some(bv) = bo.get(k) {
                        if av == bv { continue; }
                        walk(av, bv, adds, ups, rems);
                    } else {
                        *adds += 1;
                    }
                }
                for (k, _bv) in bo.iter() {
                    if !ao.contains_key(k) { *rems += 1; }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len { if aa[i] != bb[i] { *ups += 1; } }
                if aa.len() > bb.len() { *adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { *rems += bb.len() - aa.len(); }
            }
            (av, bv) => { if av != bv { *ups += 1; } }
        }
    }
    let mut adds = 0usize; let mut ups = 0usize; let mut rems = 0usize;
    walk(target, base, &mut adds, &mut ups, &mut rems);
    DiffSummary { adds, updates: ups, removes: rems }
}

/// Field-level summary of what an update changes.
pub fn app_diff(next: &Application, live: &Application) -> DiffSummary {
    let a = serde_json::to_value(next).map(strip_noisy).unwrap_or(Json::Null);
    let b = serde_json::to_value(live).map(strip_noisy).unwrap_or(Json::Null);
    diff_summary(&a, &b)
}

enum UpdateOutcome {
    Updated,
    Unchanged,
}

enum UpdateError {
    Store(StoreError),
    Cancelled,
}

/// Applies desired state through a `ResourceStore`.
#[derive(Clone)]
pub struct MergeEngine {
    store: Arc<dyn ResourceStore>,
    sticky: StickyKeys,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn ResourceStore>, sticky: StickyKeys) -> Self {
        Self { store, sticky }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn sticky(&self) -> &StickyKeys {
        &self.sticky
    }

    /// Create missing applications and, when the set's policy allows it,
    /// update drifted ones. Per-resource failures land in the report.
    pub async fn create_or_update(
        &self,
        set: &ApplicationSet,
        desired: &[Application],
        live: &[Application],
        cancel: &CancellationToken,
    ) -> Result<ApplyReport, ReconcileError> {
        let policy = set.applications_sync();
        let live_by_key: BTreeMap<ObjectKey, &Application> = live.iter().map(|a| (a.key(), a)).collect();
        let mut report = ApplyReport::default();

        for app in desired.iter() {
            let app = bind_to_set(set, app.clone());
            let key = app.key();
            match live_by_key.get(&key) {
                None => {
                    if cancel.is_cancelled() {
                        return Err(ReconcileError::Cancelled);
                    }
                    match self.store.create(&app).await {
                        Ok(_) => {
                            counter!("appset_apps_created_total", 1u64);
                            info!(set = %set.name(), app = %key, "apply: created");
                            report.created += 1;
                        }
                        Err(e) => report.fail(key, ResourceOp::Create, e),
                    }
                }
                Some(_) if !policy.allows_update() => {
                    debug!(set = %set.name(), app = %key, policy = ?policy, "apply: update not permitted");
                    report.skipped += 1;
                }
                Some(current) => match self.update_with_retry(&app, current, cancel).await {
                    Ok(UpdateOutcome::Updated) => report.updated += 1,
                    Ok(UpdateOutcome::Unchanged) => report.unchanged += 1,
                    Err(UpdateError::Store(e)) => report.fail(key, ResourceOp::Update, e),
                    Err(UpdateError::Cancelled) => return Err(ReconcileError::Cancelled),
                },
            }
        }
        Ok(report)
    }

    /// Update once; on a conflict, re-fetch and merge again. A second
    /// conflict is returned as is.
    async fn update_with_retry(
        &self,
        desired: &Application,
        live: &Application,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome, UpdateError> {
        match self.try_update(desired, live, cancel).await {
            Err(UpdateError::Store(e)) if e.is_conflict() => {
                let key = desired.key();
                debug!(app = %key, error = %e, "apply: conflict, re-fetching");
                let fresh = self.store.get(&key).await.map_err(UpdateError::Store)?;
                self.try_update(desired, &fresh, cancel).await
            }
            other => other,
        }
    }

    async fn try_update(
        &self,
        desired: &Application,
        current: &Application,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome, UpdateError> {
        let next = merge(desired, current, &self.sticky);
        if &next == current {
            return Ok(UpdateOutcome::Unchanged);
        }
        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        let diff = app_diff(&next, current);
        self.store.update(&next).await.map_err(UpdateError::Store)?;
        counter!("appset_apps_updated_total", 1u64);
        info!(app = %desired.key(), adds = diff.adds, updates = diff.updates, removes = diff.removes, "apply: updated");
        Ok(UpdateOutcome::Updated)
    }

    /// Delete live owned applications that are no longer desired, when the
    /// set's policy allows pruning.
    pub async fn delete_orphans(
        &self,
        set: &ApplicationSet,
        desired: &[Application],
        live: &[Application],
        cancel: &CancellationToken,
    ) -> Result<ApplyReport, ReconcileError> {
        let mut report = ApplyReport::default();
        let policy = set.applications_sync();
        let keep: BTreeSet<ObjectKey> =
            desired.iter().map(|a| ObjectKey::new(set.namespace(), a.name())).collect();
        for app in live.iter() {
            let key = app.key();
            if keep.contains(&key) {
                continue;
            }
            if !policy.allows_delete() {
                debug!(set = %set.name(), app = %key, policy = ?policy, "apply: delete not permitted");
                report.skipped += 1;
                continue;
            }
            if cancel.is_cancelled() {
                return Err(ReconcileError::Cancelled);
            }
            match self.store.delete(&key).await {
                Ok(()) => {
                    counter!("appset_apps_deleted_total", 1u64);
                    info!(set = %set.name(), app = %key, "apply: deleted");
                    report.deleted += 1;
                }
                Err(e) if e.is_not_found() => debug!(app = %key, "apply: already gone"),
                Err(e) => report.fail(key, ResourceOp::Delete, e),
            }
        }
        Ok(report)
    }
}
