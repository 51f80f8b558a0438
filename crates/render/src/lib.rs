//! Template rendering: `{{ key }}` substitution over an application template,
//! and composition of a base template with a generator override.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use appset_core::{Application, ApplicationSetTemplate, ParamRow, RenderError};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use tracing::trace;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}").unwrap());

/// Turns a template plus one parameter row into a concrete application.
pub trait Renderer: Send + Sync {
    fn render(&self, template: &ApplicationSetTemplate, row: &ParamRow) -> Result<Application, RenderError>;
}

/// Plain `{{ key }}` substitution; every placeholder must be present in the row.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderRenderer;

impl Renderer for PlaceholderRenderer {
    fn render(&self, template: &ApplicationSetTemplate, row: &ParamRow) -> Result<Application, RenderError> {
        render(template, row)
    }
}

pub fn render(template: &ApplicationSetTemplate, row: &ParamRow) -> Result<Application, RenderError> {
    let raw = serde_json::to_value(template).map_err(|e| RenderError::Malformed(e.to_string()))?;
    let rendered = render_value(raw, row)?;
    let t: ApplicationSetTemplate =
        serde_json::from_value(rendered).map_err(|e| RenderError::Malformed(e.to_string()))?;
    trace!(name = %t.metadata.name, "render: template rendered");
    Ok(into_application(t))
}

/// Substitute placeholders in one string.
pub fn render_str(input: &str, row: &ParamRow) -> Result<String, RenderError> {
    let mut missing: Option<String> = None;
    let out = PLACEHOLDER.replace_all(input, |caps: &Captures<'_>| {
        let key = &caps[1];
        match row.get(key) {
            Some(v) => v.clone(),
            None => {
                missing.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(key) => Err(RenderError::Unresolved { key }),
        None => Ok(out.into_owned()),
    }
}

fn render_value(v: Value, row: &ParamRow) -> Result<Value, RenderError> {
    Ok(match v {
        Value::String(s) => Value::String(render_str(&s, row)?),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|i| render_value(i, row)).collect::<Result<_, _>>()?)
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(render_str(&k, row)?, render_value(v, row)?);
            }
            Value::Object(out)
        }
        other => other,
    })
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

fn non_empty_map(m: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!m.is_empty()).then_some(m)
}

fn into_application(t: ApplicationSetTemplate) -> Application {
    let meta = t.metadata;
    Application {
        metadata: ObjectMeta {
            name: non_empty(meta.name),
            namespace: non_empty(meta.namespace),
            labels: non_empty_map(meta.labels),
            annotations: non_empty_map(meta.annotations),
            finalizers: (!meta.finalizers.is_empty()).then_some(meta.finalizers),
            ..Default::default()
        },
        spec: t.spec,
        status: None,
        operation: None,
    }
}

/// Deep-merge `over` onto `base`: non-empty override values win and maps are
/// unioned with override keys winning.
pub fn merge_template(
    base: &ApplicationSetTemplate,
    over: &ApplicationSetTemplate,
) -> Result<ApplicationSetTemplate, RenderError> {
    let mut b = serde_json::to_value(base).map_err(|e| RenderError::Malformed(e.to_string()))?;
    let o = serde_json::to_value(over).map_err(|e| RenderError::Malformed(e.to_string()))?;
    merge_value(&mut b, o);
    serde_json::from_value(b).map_err(|e| RenderError::Malformed(e.to_string()))
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
    }
}

fn merge_value(base: &mut Value, over: Value) {
    match (base, over) {
        (Value::Object(b), Value::Object(o)) => {
            for (k, v) in o {
                match b.get_mut(&k) {
                    Some(slot) => merge_value(slot, v),
                    None if !is_empty(&v) => {
                        b.insert(k, v);
                    }
                    None => {}
                }
            }
        }
        (slot, v) => {
            if !is_empty(&v) {
                *slot = v;
            }
        }
    }
}
