//! Pre-mutation validation of generated applications: destination
//! resolvability against a registry snapshot, then project policy.

#![forbid(unsafe_code)]

use appset_core::{trim_server, Application, ReconcileError};
use appset_kubehub::DestinationSnapshot;
use tracing::{debug, warn};

mod project;

pub use project::{PolicyStore, ProjectPolicy, Verdict};

fn unknown(app: &Application, reason: impl Into<String>) -> ReconcileError {
    ReconcileError::UnknownDestination { app: app.name().to_string(), reason: reason.into() }
}

/// Check the destination of `app` and, for name-only destinations, fill in
/// the resolved server as an inferred value.
pub fn validate_destination(app: &mut Application, snapshot: &DestinationSnapshot) -> Result<(), ReconcileError> {
    let dest = &app.spec.destination;
    let name = dest.name.clone();
    let server = if dest.is_server_inferred() { String::new() } else { dest.server.clone() };

    match (name.is_empty(), server.is_empty()) {
        (false, true) => {
            let resolved = snapshot.resolve(&name).map_err(|e| unknown(app, e.to_string()))?;
            app.spec.destination.set_inferred_server(resolved);
        }
        (false, false) => {
            let resolved = snapshot.resolve(&name).map_err(|e| unknown(app, e.to_string()))?;
            if resolved != trim_server(&server) {
                return Err(ReconcileError::ConflictingDestination {
                    app: app.name().to_string(),
                    name,
                    server,
                    resolved,
                });
            }
        }
        (true, false) => {
            if !snapshot.has_server(&server) {
                return Err(unknown(app, format!("there are no clusters with this server: {server}")));
            }
        }
        (true, true) => return Err(unknown(app, "destination has neither name nor server")),
    }
    Ok(())
}

/// Validate one application: destination first, then project policy.
pub async fn validate_application(
    app: &mut Application,
    snapshot: &DestinationSnapshot,
    policy: &dyn PolicyStore,
) -> Result<(), ReconcileError> {
    validate_destination(app, snapshot)?;
    let project = app.spec.project.clone();
    if !policy.project_exists(&project).await? {
        return Err(ReconcileError::PolicyViolation {
            app: app.name().to_string(),
            rule: format!("application references project {project} which does not exist"),
        });
    }
    let spec = &app.spec;
    match policy.project_allows(&project, &spec.source, &spec.destination, &spec.resource_kinds).await? {
        Verdict::Allowed => Ok(()),
        Verdict::Denied(rule) => Err(ReconcileError::PolicyViolation { app: app.name().to_string(), rule }),
    }
}

/// Validate the whole desired batch; the first invalid application aborts it.
pub async fn validate(
    desired: &mut [Application],
    snapshot: &DestinationSnapshot,
    policy: &dyn PolicyStore,
) -> Result<(), ReconcileError> {
    for app in desired.iter_mut() {
        if let Err(e) = validate_application(app, snapshot, policy).await {
            warn!(app = %app.name(), error = %e, "validate: rejected");
            return Err(e);
        }
    }
    debug!(count = desired.len(), "validate: batch ok");
    Ok(())
}
