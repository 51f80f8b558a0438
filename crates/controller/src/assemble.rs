use std::collections::BTreeSet;

use appset_core::{Application, ApplicationSet, ReconcileError, RESOURCES_FINALIZER};
use appset_generators::GeneratorRegistry;
use appset_kubehub::DestinationSnapshot;
use appset_render::{merge_template, Renderer};
use tracing::debug;

/// Desired applications of `set`, in generator declaration order. Any
/// generator or render failure aborts the whole list.
pub async fn assemble(
    set: &ApplicationSet,
    generators: &GeneratorRegistry,
    renderer: &dyn Renderer,
    snapshot: &DestinationSnapshot,
) -> Result<Vec<Application>, ReconcileError> {
    let mut desired = Vec::new();
    for spec in set.spec.generators.iter() {
        let generator = generators.get(spec.kind())?;
        let template = match generator.template(spec) {
            Some(over) if !over.is_empty() => merge_template(&set.spec.template, over)?,
            _ => set.spec.template.clone(),
        };
        let rows = generators.generate(spec, set, snapshot).await?;
        debug!(set = %set.name(), generator = %spec.kind(), rows = rows.len(), "assemble: generated");
        for row in rows.iter() {
            let mut app = renderer.render(&template, row)?;
            if !set.preserves_resources_on_deletion() {
                app.add_finalizer(RESOURCES_FINALIZER);
            }
            desired.push(app);
        }
    }
    check_unique_names(&desired)?;
    Ok(desired)
}

/// First repeated application name, if any.
pub fn check_unique_names(apps: &[Application]) -> Result<(), ReconcileError> {
    let mut seen = BTreeSet::new();
    for app in apps.iter() {
        if !seen.insert(app.name()) {
            return Err(ReconcileError::DuplicateName(app.name().to_string()));
        }
    }
    Ok(())
}
