use std::time::Duration;

use appset_core::{ApplicationSet, GeneratorError, GeneratorKind, GeneratorSpec, ParamRow};
use async_trait::async_trait;

use crate::{value_text, wrong_variant, GenContext, Generator};

/// Literal rows from `elements`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListGeneratorImpl;

#[async_trait]
impl Generator for ListGeneratorImpl {
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        _set: &ApplicationSet,
        _ctx: &GenContext<'_>,
    ) -> Result<Vec<ParamRow>, GeneratorError> {
        let GeneratorSpec::List(list) = spec else { return Err(wrong_variant(GeneratorKind::List, spec)) };
        Ok(list.elements.iter().map(|el| el.iter().map(|(k, v)| (k.clone(), value_text(v))).collect()).collect())
    }

    fn requeue_after(&self, _spec: &GeneratorSpec, _ctx: &GenContext<'_>) -> Option<Duration> {
        None
    }
}
