use std::collections::BTreeMap;
use std::time::Duration;

use appset_core::{
    ApplicationSet, Destination, GeneratorError, GeneratorKind, GeneratorSpec, LabelSelector, ParamRow,
    SelectorOperator, IN_CLUSTER_NAME,
};
use async_trait::async_trait;
use tracing::debug;

use crate::{normalize_name, wrong_variant, GenContext, Generator};

/// One row per registered destination matching the label selector.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterGeneratorImpl;

pub(crate) fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_ok = selector.match_labels.iter().all(|(k, v)| labels.get(k) == Some(v));
    labels_ok
        && selector.match_expressions.iter().all(|req| {
            let value = labels.get(&req.key);
            match req.operator {
                SelectorOperator::In => value.map(|v| req.values.contains(v)).unwrap_or(false),
                SelectorOperator::NotIn => value.map(|v| !req.values.contains(v)).unwrap_or(true),
                SelectorOperator::Exists => value.is_some(),
                SelectorOperator::DoesNotExist => value.is_none(),
            }
        })
}

fn is_synthesized_local(d: &Destination) -> bool {
    d.id == IN_CLUSTER_NAME && d.is_local()
}

fn cluster_row(d: &Destination, values: &BTreeMap<String, String>) -> Result<ParamRow, GeneratorError> {
    let mut row = ParamRow::new();
    row.insert("name".into(), d.name.clone());
    row.insert("nameNormalized".into(), normalize_name(&d.name));
    row.insert("server".into(), d.server.clone());
    for (k, v) in d.labels.iter() {
        row.insert(format!("metadata.labels.{k}"), v.clone());
    }
    for (k, v) in d.annotations.iter() {
        row.insert(format!("metadata.annotations.{k}"), v.clone());
    }
    let mut rendered = Vec::with_capacity(values.len());
    for (k, v) in values.iter() {
        let text = appset_render::render_str(v, &row)
            .map_err(|e| GeneratorError::Invalid { kind: GeneratorKind::Clusters, reason: e.to_string() })?;
        rendered.push((format!("values.{k}"), text));
    }
    row.extend(rendered);
    Ok(row)
}

#[async_trait]
impl Generator for ClusterGeneratorImpl {
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        _set: &ApplicationSet,
        ctx: &GenContext<'_>,
    ) -> Result<Vec<ParamRow>, GeneratorError> {
        let GeneratorSpec::Clusters(gen) = spec else { return Err(wrong_variant(GeneratorKind::Clusters, spec)) };
        let mut rows = Vec::new();
        for d in ctx.destinations.destinations() {
            if is_synthesized_local(d) {
                if !gen.selector.is_empty() {
                    continue;
                }
            } else if !selector_matches(&gen.selector, &d.labels) {
                continue;
            }
            rows.push(cluster_row(d, &gen.values)?);
        }
        debug!(count = rows.len(), "clusters: generated rows");
        Ok(rows)
    }

    fn requeue_after(&self, _spec: &GeneratorSpec, _ctx: &GenContext<'_>) -> Option<Duration> {
        None
    }
}
