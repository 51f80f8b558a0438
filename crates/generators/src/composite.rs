use std::time::Duration;

use appset_core::{ApplicationSet, GeneratorError, GeneratorKind, GeneratorSpec, ParamRow};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{min_duration, wrong_variant, GenContext, Generator};

fn children_requeue(children: &[GeneratorSpec], ctx: &GenContext<'_>) -> Option<Duration> {
    min_duration(
        children
            .iter()
            .map(|c| ctx.generators.get(c.kind()).ok().and_then(|g| g.requeue_after(c, ctx))),
    )
}

async fn child_rows(
    child: &GeneratorSpec,
    set: &ApplicationSet,
    ctx: &GenContext<'_>,
) -> Result<Vec<ParamRow>, GeneratorError> {
    ctx.generators.get(child.kind())?.generate_params(child, set, ctx).await
}

/// Cross product of exactly two child generators.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatrixGeneratorImpl;

fn combine(left: &ParamRow, right: &ParamRow) -> Result<ParamRow, GeneratorError> {
    let mut out = left.clone();
    for (k, v) in right.iter() {
        match out.get(k) {
            Some(existing) if existing != v => {
                return Err(GeneratorError::Conflict { key: k.clone(), left: existing.clone(), right: v.clone() })
            }
            Some(_) => {}
            None => {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    Ok(out)
}

#[async_trait]
impl Generator for MatrixGeneratorImpl {
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        set: &ApplicationSet,
        ctx: &GenContext<'_>,
    ) -> Result<Vec<ParamRow>, GeneratorError> {
        let GeneratorSpec::Matrix(gen) = spec else { return Err(wrong_variant(GeneratorKind::Matrix, spec)) };
        let [first, second] = gen.generators.as_slice() else {
            return Err(GeneratorError::Invalid {
                kind: GeneratorKind::Matrix,
                reason: format!("requires exactly 2 child generators, got {}", gen.generators.len()),
            });
        };
        let left = child_rows(first, set, ctx).await?;
        let right = child_rows(second, set, ctx).await?;
        let mut out = Vec::with_capacity(left.len() * right.len());
        for l in left.iter() {
            for r in right.iter() {
                out.push(combine(l, r)?);
            }
        }
        debug!(left = left.len(), right = right.len(), rows = out.len(), "matrix: combined");
        Ok(out)
    }

    fn requeue_after(&self, spec: &GeneratorSpec, ctx: &GenContext<'_>) -> Option<Duration> {
        match spec {
            GeneratorSpec::Matrix(gen) => children_requeue(&gen.generators, ctx),
            _ => None,
        }
    }
}

/// Left join of child rows on `merge_keys`; the first child is the base.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeGeneratorImpl;

fn merge_key(row: &ParamRow, keys: &[String]) -> Option<Vec<String>> {
    keys.iter().map(|k| row.get(k).cloned()).collect()
}

fn index_rows<'r>(
    rows: &'r [ParamRow],
    keys: &[String],
) -> Result<FxHashMap<Vec<String>, &'r ParamRow>, GeneratorError> {
    let mut index = FxHashMap::default();
    for row in rows.iter() {
        let Some(key) = merge_key(row, keys) else { continue };
        if index.insert(key.clone(), row).is_some() {
            return Err(GeneratorError::DuplicateMergeKey(key.join("/")));
        }
    }
    Ok(index)
}

#[async_trait]
impl Generator for MergeGeneratorImpl {
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        set: &ApplicationSet,
        ctx: &GenContext<'_>,
    ) -> Result<Vec<ParamRow>, GeneratorError> {
        let GeneratorSpec::Merge(gen) = spec else { return Err(wrong_variant(GeneratorKind::Merge, spec)) };
        if gen.merge_keys.is_empty() {
            return Err(GeneratorError::Invalid { kind: GeneratorKind::Merge, reason: "mergeKeys is empty".into() });
        }
        let Some((base_spec, rest)) = gen.generators.split_first() else {
            return Err(GeneratorError::Invalid { kind: GeneratorKind::Merge, reason: "no child generators".into() });
        };
        let mut base = child_rows(base_spec, set, ctx).await?;
        index_rows(&base, &gen.merge_keys)?;
        for child in rest.iter() {
            let rows = child_rows(child, set, ctx).await?;
            let index = index_rows(&rows, &gen.merge_keys)?;
            for row in base.iter_mut() {
                let Some(key) = merge_key(row, &gen.merge_keys) else { continue };
                if let Some(over) = index.get(&key) {
                    row.extend(over.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }
        Ok(base)
    }

    fn requeue_after(&self, spec: &GeneratorSpec, ctx: &GenContext<'_>) -> Option<Duration> {
        match spec {
            GeneratorSpec::Merge(gen) => children_requeue(&gen.generators, ctx),
            _ => None,
        }
    }
}
