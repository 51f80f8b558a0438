use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use appset_core::{ApplicationSet, ObjectKey, ReconcileError, CLUSTER_SECRET_TYPE_LABEL, CLUSTER_SECRET_TYPE_VALUE};
use appset_kubehub::{application_resource, application_set_resource, from_dynamic};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
        watcher,
    },
    Client,
};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{schedule, ControllerConfig, Reconciler};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("decoding ApplicationSet: {0}")]
    Decode(String),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("reconciliation exceeded {0:?}")]
    Timeout(Duration),
}

/// Time a timed-out cycle gets to reach its next cancellation check.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Shared state of the controller loop.
pub struct Context {
    reconciler: Reconciler,
    config: ControllerConfig,
    shutdown: CancellationToken,
    failures: Mutex<FxHashMap<ObjectKey, u32>>,
}

impl Context {
    pub fn new(reconciler: Reconciler, config: ControllerConfig, shutdown: CancellationToken) -> Self {
        Self { reconciler, config, shutdown, failures: Mutex::new(FxHashMap::default()) }
    }

    fn record_failure(&self, key: &ObjectKey) -> u32 {
        let mut failures = match self.failures.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let n = failures.entry(key.clone()).or_insert(0);
        *n = n.saturating_add(1);
        *n
    }

    /// Forget the failure history of `key`.
    pub fn reset(&self, key: &ObjectKey) {
        let mut failures = match self.failures.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        failures.remove(key);
    }

    /// Delay before retrying `key` after another failure.
    pub fn next_backoff(&self, key: &ObjectKey) -> Duration {
        let n = self.record_failure(key);
        schedule::backoff(n, self.config.backoff_base, self.config.backoff_max)
    }

    /// Run one bounded cycle for `set` and translate the result into the next action.
    pub async fn cycle(&self, set: &ApplicationSet) -> Result<Action, RuntimeError> {
        let key = ObjectKey::new(set.namespace(), set.name());
        if set.metadata.deletion_timestamp.is_some() {
            // owned applications go through garbage collection
            self.reset(&key);
            return Ok(Action::await_change());
        }
        let cancel = self.shutdown.child_token();
        let work = self.reconciler.reconcile(set, &cancel);
        tokio::pin!(work);
        let res = tokio::select! {
            res = &mut work => res.map_err(RuntimeError::from),
            _ = tokio::time::sleep(self.config.cycle_timeout) => {
                cancel.cancel();
                // let the cycle stop at its next cancellation check
                let _ = tokio::time::timeout(CANCEL_GRACE, &mut work).await;
                Err(RuntimeError::Timeout(self.config.cycle_timeout))
            }
        };
        match res {
            Ok(out) => {
                self.reset(&key);
                Ok(out.requeue_after.map_or_else(Action::await_change, Action::requeue))
            }
            Err(RuntimeError::Reconcile(e)) if e.is_validation() => {
                self.reset(&key);
                debug!(set = %key, delay = ?self.config.validation_requeue, "runtime: requeue after validation error");
                Ok(Action::requeue(self.config.validation_requeue))
            }
            Err(e) => Err(e),
        }
    }
}

fn object_key(obj: &DynamicObject) -> ObjectKey {
    ObjectKey::new(obj.metadata.namespace.clone().unwrap_or_default(), obj.metadata.name.clone().unwrap_or_default())
}

async fn reconcile(obj: Arc<DynamicObject>, ctx: Arc<Context>) -> Result<Action, RuntimeError> {
    let set: ApplicationSet = from_dynamic(&obj).map_err(|e| RuntimeError::Decode(format!("{e:#}")))?;
    ctx.cycle(&set).await
}

fn error_policy(obj: Arc<DynamicObject>, err: &RuntimeError, ctx: Arc<Context>) -> Action {
    let key = object_key(&obj);
    let delay = ctx.next_backoff(&key);
    warn!(set = %key, error = %err, delay = ?delay, "runtime: requeue after error");
    Action::requeue(delay)
}

/// Watch ApplicationSets (and the applications and cluster secrets they
/// depend on) until a shutdown signal arrives.
pub async fn run(client: Client, reconciler: Reconciler, config: ControllerConfig) -> Result<()> {
    let set_ar = application_set_resource();
    let app_ar = application_resource();
    let (sets, apps, secrets): (Api<DynamicObject>, Api<DynamicObject>, Api<Secret>) = match config.namespace.as_deref() {
        Some(ns) => (
            Api::namespaced_with(client.clone(), ns, &set_ar),
            Api::namespaced_with(client.clone(), ns, &app_ar),
            Api::namespaced(client, ns),
        ),
        None => (Api::all_with(client.clone(), &set_ar), Api::all_with(client.clone(), &app_ar), Api::all(client)),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        }
    });

    info!(ns = ?config.namespace, timeout = ?config.cycle_timeout, "runtime: controller starting");
    let ctx = Arc::new(Context::new(reconciler, config, shutdown));
    let controller = Controller::new_with(sets, watcher::Config::default(), set_ar.clone());
    let known_sets = controller.store();
    let secret_selector = format!("{}={}", CLUSTER_SECRET_TYPE_LABEL, CLUSTER_SECRET_TYPE_VALUE);

    controller
        .owns_with(apps, app_ar, watcher::Config::default())
        .watches(secrets, watcher::Config::default().labels(&secret_selector), move |secret: Secret| {
            // a destination change may affect every set in the secret's namespace
            let ns = secret.metadata.namespace.unwrap_or_default();
            known_sets
                .state()
                .into_iter()
                .filter(|s| s.metadata.namespace.as_deref() == Some(ns.as_str()))
                .map(|s| ObjectRef::from_obj_with(s.as_ref(), set_ar.clone()))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|res| {
            let ctx = ctx.clone();
            async move {
                match res {
                    Ok((obj, _)) => debug!(set = %obj.name, ns = ?obj.namespace, "runtime: reconciled"),
                    Err(controller::Error::ObjectNotFound(obj)) => {
                        // the set is gone; drop its backoff state
                        ctx.reset(&ObjectKey::new(obj.namespace.clone().unwrap_or_default(), obj.name.clone()));
                    }
                    Err(e) => debug!(error = %e, "runtime: dispatch error"),
                }
            }
        })
        .await;
    info!("runtime: controller stopped");
    Ok(())
}
