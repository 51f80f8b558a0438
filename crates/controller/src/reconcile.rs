use std::sync::Arc;
use std::time::{Duration, Instant};

use appset_apply::{ApplyReport, MergeEngine};
use appset_core::{ApplicationSet, ReconcileError};
use appset_generators::GeneratorRegistry;
use appset_kubehub::{ClusterRegistry, ProjectSource};
use appset_policy::{validate, ProjectPolicy};
use appset_render::Renderer;
use appset_store::ResourceStore;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{assemble, finalizer, schedule};

/// Result of one successful cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub report: ApplyReport,
    /// Next wake-up requested by the generators.
    pub requeue_after: Option<Duration>,
}

/// One reconciliation pipeline: registry snapshot, assembly, validation,
/// create/update, finalizer valve, orphan deletion, scheduling.
pub struct Reconciler {
    registry: Arc<ClusterRegistry>,
    generators: GeneratorRegistry,
    renderer: Arc<dyn Renderer>,
    projects: Arc<dyn ProjectSource>,
    engine: MergeEngine,
}

impl Reconciler {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        generators: GeneratorRegistry,
        renderer: Arc<dyn Renderer>,
        projects: Arc<dyn ProjectSource>,
        engine: MergeEngine,
    ) -> Self {
        Self { registry, generators, renderer, projects, engine }
    }

    pub fn generators(&self) -> &GeneratorRegistry {
        &self.generators
    }

    pub async fn reconcile(&self, set: &ApplicationSet, cancel: &CancellationToken) -> Result<Outcome, ReconcileError> {
        let started = Instant::now();
        counter!("appset_reconcile_total", 1u64);
        let res = self.run(set, cancel).await;
        histogram!("appset_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(out) => info!(
                set = %set.name(),
                ns = %set.namespace(),
                created = out.report.created,
                updated = out.report.updated,
                deleted = out.report.deleted,
                released = out.report.finalizers_released,
                requeue = ?out.requeue_after,
                "reconcile: done"
            ),
            Err(e) => {
                counter!("appset_reconcile_errors_total", 1u64);
                warn!(set = %set.name(), ns = %set.namespace(), error = %e, "reconcile: failed");
            }
        }
        res
    }

    async fn run(&self, set: &ApplicationSet, cancel: &CancellationToken) -> Result<Outcome, ReconcileError> {
        let ns = set.namespace();
        let snapshot = self.registry.snapshot(ns).await?;
        let mut desired = assemble::assemble(set, &self.generators, self.renderer.as_ref(), &snapshot).await?;
        let live = self.engine.store().list_owned(ns, &set.owner_reference()).await?;
        debug!(set = %set.name(), desired = desired.len(), live = live.len(), "reconcile: state gathered");

        let policy = ProjectPolicy::load(self.projects.as_ref(), ns).await?;
        let validation = validate(&mut desired, &snapshot, &policy).await;

        let mut report = ApplyReport::default();
        if validation.is_ok() {
            report.absorb(self.engine.create_or_update(set, &desired, &live, cancel).await?);
        }
        report.absorb(finalizer::release_unreachable(self.engine.store().as_ref(), &live, &snapshot, cancel).await?);
        report.absorb(self.engine.delete_orphans(set, &desired, &live, cancel).await?);

        validation?;
        report.check()?;
        let requeue_after = schedule::min_requeue(set, &self.generators, &snapshot);
        Ok(Outcome { report, requeue_after })
    }
}
