use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use appset_core::{ApplicationSet, GeneratorError, GeneratorKind, GeneratorSpec, GitGenerator, ParamRow};
use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use tracing::{debug, warn};

use crate::{normalize_name, value_text, wrong_variant, GenContext, Generator};

pub const DEFAULT_GIT_REQUEUE: Duration = Duration::from_secs(180);

/// Repository listing used by the git generator.
#[async_trait]
pub trait RepoService: Send + Sync {
    /// Every directory of the repository at `revision`, as repo-relative paths.
    async fn get_directories(&self, repo_url: &str, revision: &str) -> Result<Vec<String>, GeneratorError>;
    /// Contents of every file matching `pattern`, keyed by repo-relative path.
    async fn get_files(
        &self,
        repo_url: &str,
        revision: &str,
        pattern: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, GeneratorError>;
}

fn external(message: impl std::fmt::Display) -> GeneratorError {
    GeneratorError::External { kind: GeneratorKind::Git, message: message.to_string() }
}

/// Reads already checked-out repositories under `root`. A repository URL maps
/// to `root/<last path segment without .git>`; the revision is whatever is
/// checked out.
#[derive(Debug, Clone)]
pub struct CheckoutRepoService {
    root: PathBuf,
}

impl CheckoutRepoService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn checkout(&self, repo_url: &str) -> Result<PathBuf, GeneratorError> {
        let name = repo_url.trim_end_matches('/').rsplit('/').next().unwrap_or("").trim_end_matches(".git");
        if name.is_empty() {
            return Err(external(format!("cannot derive checkout name from {repo_url}")));
        }
        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Err(external(format!("no checkout for {} at {}", repo_url, dir.display())));
        }
        Ok(dir)
    }
}

fn relative(base: &Path, p: &Path) -> Option<String> {
    let rel = p.strip_prefix(base).ok()?;
    if rel.components().any(|c| c.as_os_str().to_string_lossy().starts_with('.')) {
        return None;
    }
    let s = rel.to_string_lossy().replace('\\', "/");
    (!s.is_empty()).then_some(s)
}

#[async_trait]
impl RepoService for CheckoutRepoService {
    async fn get_directories(&self, repo_url: &str, revision: &str) -> Result<Vec<String>, GeneratorError> {
        let base = self.checkout(repo_url)?;
        debug!(repo = %repo_url, revision = %revision, "git: listing checkout directories");
        let pattern = format!("{}/**/*", base.display());
        let mut out = Vec::new();
        for entry in glob::glob(&pattern).map_err(external)? {
            let path = entry.map_err(external)?;
            if path.is_dir() {
                if let Some(rel) = relative(&base, &path) {
                    out.push(rel);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn get_files(
        &self,
        repo_url: &str,
        revision: &str,
        pattern: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, GeneratorError> {
        let base = self.checkout(repo_url)?;
        debug!(repo = %repo_url, revision = %revision, pattern = %pattern, "git: reading checkout files");
        let full = format!("{}/{}", base.display(), pattern.trim_start_matches('/'));
        let mut out = BTreeMap::new();
        for entry in glob::glob(&full).map_err(external)? {
            let path = entry.map_err(external)?;
            if !path.is_file() {
                continue;
            }
            if let Some(rel) = relative(&base, &path) {
                let bytes = tokio::fs::read(&path).await.map_err(external)?;
                out.insert(rel, bytes);
            }
        }
        Ok(out)
    }
}

/// Rows from repository directories or from JSON/YAML files.
#[derive(Clone)]
pub struct GitGeneratorImpl {
    repos: Arc<dyn RepoService>,
}

impl GitGeneratorImpl {
    pub fn new(repos: Arc<dyn RepoService>) -> Self {
        Self { repos }
    }

    async fn directory_rows(&self, gen: &GitGenerator) -> Result<Vec<ParamRow>, GeneratorError> {
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for item in gen.directories.iter() {
            let p = Pattern::new(&item.path).map_err(|e| GeneratorError::Invalid {
                kind: GeneratorKind::Git,
                reason: format!("bad directory pattern {:?}: {}", item.path, e),
            })?;
            if item.exclude { exclude.push(p) } else { include.push(p) }
        }
        let opts = MatchOptions { require_literal_separator: true, ..MatchOptions::new() };
        let dirs = self.repos.get_directories(&gen.repo_url, &gen.revision).await?;
        Ok(dirs
            .iter()
            .filter(|d| {
                include.iter().any(|p| p.matches_with(d, opts)) && !exclude.iter().any(|p| p.matches_with(d, opts))
            })
            .map(|d| path_params(d))
            .collect())
    }

    async fn file_rows(&self, gen: &GitGenerator) -> Result<Vec<ParamRow>, GeneratorError> {
        let mut rows = Vec::new();
        for item in gen.files.iter() {
            let files = self.repos.get_files(&gen.repo_url, &gen.revision, &item.path).await?;
            for (path, bytes) in files.iter() {
                let doc: serde_json::Value = serde_yaml::from_slice(bytes).map_err(|e| {
                    warn!(file = %path, error = %e, "git: unable to parse file");
                    external(format!("unable to parse {path}: {e}"))
                })?;
                let docs = match doc {
                    serde_json::Value::Array(items) => items,
                    other => vec![other],
                };
                for d in docs.iter() {
                    let mut row = ParamRow::new();
                    flatten_into(&mut row, "", d);
                    row.extend(file_path_params(path));
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn basename(path: &str) -> &str {
    segments(path).last().unwrap_or("")
}

fn path_params(dir: &str) -> ParamRow {
    let mut row = ParamRow::new();
    let base = basename(dir);
    row.insert("path".into(), dir.to_string());
    row.insert("path.basename".into(), base.to_string());
    row.insert("path.basenameNormalized".into(), normalize_name(base));
    for (i, seg) in segments(dir).enumerate() {
        row.insert(format!("path[{i}]"), seg.to_string());
    }
    row
}

fn file_path_params(file: &str) -> ParamRow {
    let (dir, filename) = match file.rsplit_once('/') {
        Some((d, f)) => (d, f),
        None => ("", file),
    };
    let mut row = path_params(dir);
    row.insert("path.filename".into(), filename.to_string());
    row
}

/// `{"a": {"b": 1}, "c": [x]}` becomes `a.b = 1`, `c.0 = x`.
fn flatten_into(row: &mut ParamRow, prefix: &str, v: &serde_json::Value) {
    let join = |k: &str| if prefix.is_empty() { k.to_string() } else { format!("{prefix}.{k}") };
    match v {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                flatten_into(row, &join(k), v);
            }
        }
        serde_json::Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(row, &join(&i.to_string()), v);
            }
        }
        scalar => {
            if !prefix.is_empty() {
                row.insert(prefix.to_string(), value_text(scalar));
            }
        }
    }
}

#[async_trait]
impl Generator for GitGeneratorImpl {
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        _set: &ApplicationSet,
        _ctx: &GenContext<'_>,
    ) -> Result<Vec<ParamRow>, GeneratorError> {
        let GeneratorSpec::Git(gen) = spec else { return Err(wrong_variant(GeneratorKind::Git, spec)) };
        match (gen.directories.is_empty(), gen.files.is_empty()) {
            (false, true) => self.directory_rows(gen).await,
            (true, false) => self.file_rows(gen).await,
            _ => Err(GeneratorError::Invalid {
                kind: GeneratorKind::Git,
                reason: "exactly one of directories or files must be set".into(),
            }),
        }
    }

    fn requeue_after(&self, spec: &GeneratorSpec, _ctx: &GenContext<'_>) -> Option<Duration> {
        match spec {
            GeneratorSpec::Git(gen) => {
                Some(gen.requeue_after_seconds.map(Duration::from_secs).unwrap_or(DEFAULT_GIT_REQUEUE))
            }
            _ => None,
        }
    }
}
