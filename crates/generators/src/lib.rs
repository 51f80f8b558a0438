//! Parameter generators. Each variant of `GeneratorSpec` has one `Generator`
//! implementation; `GeneratorRegistry` dispatches on the variant.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use appset_core::{ApplicationSet, ApplicationSetTemplate, GeneratorError, GeneratorKind, GeneratorSpec, ParamRow};
use appset_kubehub::DestinationSnapshot;
use async_trait::async_trait;
use rustc_hash::FxHashMap;

mod clusters;
mod composite;
mod git;
mod list;

pub use clusters::ClusterGeneratorImpl;
pub use composite::{MatrixGeneratorImpl, MergeGeneratorImpl};
pub use git::{CheckoutRepoService, GitGeneratorImpl, RepoService, DEFAULT_GIT_REQUEUE};
pub use list::ListGeneratorImpl;

/// What a generator may consult while producing rows.
pub struct GenContext<'a> {
    pub generators: &'a GeneratorRegistry,
    pub destinations: &'a DestinationSnapshot,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Template override carried by the spec, if any.
    fn template<'s>(&self, spec: &'s GeneratorSpec) -> Option<&'s ApplicationSetTemplate> {
        spec.template()
    }

    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        set: &ApplicationSet,
        ctx: &GenContext<'_>,
    ) -> Result<Vec<ParamRow>, GeneratorError>;

    /// Preferred refresh cadence; `None` means no periodic requeue.
    fn requeue_after(&self, spec: &GeneratorSpec, ctx: &GenContext<'_>) -> Option<Duration>;
}

/// Variant dispatch table. Implementations can be swapped per kind.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    generators: FxHashMap<GeneratorKind, Arc<dyn Generator>>,
}

impl GeneratorRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// All built-in generators; git reads through `repos`.
    pub fn with_defaults(repos: Arc<dyn RepoService>) -> Self {
        let mut r = Self::empty();
        r.register(GeneratorKind::List, Arc::new(ListGeneratorImpl));
        r.register(GeneratorKind::Clusters, Arc::new(ClusterGeneratorImpl));
        r.register(GeneratorKind::Git, Arc::new(GitGeneratorImpl::new(repos)));
        r.register(GeneratorKind::Matrix, Arc::new(MatrixGeneratorImpl));
        r.register(GeneratorKind::Merge, Arc::new(MergeGeneratorImpl));
        r
    }

    /// Install `generator` for `kind`, returning the one it replaces.
    pub fn register(&mut self, kind: GeneratorKind, generator: Arc<dyn Generator>) -> Option<Arc<dyn Generator>> {
        self.generators.insert(kind, generator)
    }

    pub fn get(&self, kind: GeneratorKind) -> Result<&dyn Generator, GeneratorError> {
        self.generators.get(&kind).map(|g| g.as_ref()).ok_or(GeneratorError::Unavailable(kind))
    }

    pub async fn generate(
        &self,
        spec: &GeneratorSpec,
        set: &ApplicationSet,
        destinations: &DestinationSnapshot,
    ) -> Result<Vec<ParamRow>, GeneratorError> {
        let ctx = GenContext { generators: self, destinations };
        self.get(spec.kind())?.generate_params(spec, set, &ctx).await
    }

    pub fn requeue_after(&self, spec: &GeneratorSpec, destinations: &DestinationSnapshot) -> Option<Duration> {
        let ctx = GenContext { generators: self, destinations };
        self.get(spec.kind()).ok().and_then(|g| g.requeue_after(spec, &ctx))
    }
}

/// Lowercase DNS-style rendition of a name: anything outside `[a-z0-9.-]`
/// becomes `-`.
pub fn normalize_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.' { c } else { '-' }
        })
        .collect()
}

/// Minimum of the present durations.
pub fn min_duration(items: impl IntoIterator<Item = Option<Duration>>) -> Option<Duration> {
    items.into_iter().flatten().min()
}

pub(crate) fn wrong_variant(kind: GeneratorKind, spec: &GeneratorSpec) -> GeneratorError {
    GeneratorError::Invalid { kind, reason: format!("received a {} spec", spec.kind()) }
}

/// Scalar JSON values become their text; strings stay raw.
pub(crate) fn value_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
