use appset_apply::ApplyReport;
use appset_core::{Application, ReconcileError, ResourceOp, RESOURCES_FINALIZER};
use appset_kubehub::DestinationSnapshot;
use appset_policy::validate_destination;
use appset_store::ResourceStore;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Whether the destination of `app` still resolves to a registered server.
pub fn destination_reachable(app: &Application, snapshot: &DestinationSnapshot) -> bool {
    let mut probe = app.clone();
    validate_destination(&mut probe, snapshot).is_ok() && snapshot.has_server(&probe.spec.destination.server)
}

/// Drop the cleanup finalizer from live applications whose destination can no
/// longer be resolved, so that deleting them does not hang. Other finalizers
/// stay; the cleanup finalizer is never added here.
pub async fn release_unreachable(
    store: &dyn ResourceStore,
    live: &[Application],
    snapshot: &DestinationSnapshot,
    cancel: &CancellationToken,
) -> Result<ApplyReport, ReconcileError> {
    let mut report = ApplyReport::default();
    for app in live.iter() {
        if !app.has_finalizer(RESOURCES_FINALIZER) || destination_reachable(app, snapshot) {
            continue;
        }
        let key = app.key();
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }
        // the create/update phase may have moved the object on
        let mut fresh = match store.get(&key).await {
            Ok(fresh) => fresh,
            Err(e) if e.is_not_found() => continue,
            Err(e) => {
                report.fail(key, ResourceOp::ReleaseFinalizer, e);
                continue;
            }
        };
        if destination_reachable(&fresh, snapshot) || !fresh.remove_finalizer(RESOURCES_FINALIZER) {
            debug!(app = %key, "finalizer: nothing to release");
            continue;
        }
        match store.update(&fresh).await {
            Ok(_) => {
                counter!("appset_finalizers_released_total", 1u64);
                info!(app = %key, server = %fresh.spec.destination.server, "finalizer: released for unreachable destination");
                report.finalizers_released += 1;
            }
            Err(e) => report.fail(key, ResourceOp::ReleaseFinalizer, e),
        }
    }
    Ok(report)
}
