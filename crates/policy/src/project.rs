use appset_core::{AppProject, ApplicationDestination, ApplicationSource, GroupKind, StoreError};
use appset_kubehub::ProjectSource;
use async_trait::async_trait;
use glob::Pattern;
use tracing::debug;

/// Outcome of a project policy check. `Denied` names the rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied(String),
}

/// Policy collaborator consulted before any mutation.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn project_exists(&self, name: &str) -> Result<bool, StoreError>;
    async fn project_allows(
        &self,
        name: &str,
        source: &ApplicationSource,
        destination: &ApplicationDestination,
        kinds: &[GroupKind],
    ) -> Result<Verdict, StoreError>;
}

/// Kinds that only exist at cluster scope; these need the project's cluster
/// resource whitelist.
const CLUSTER_SCOPED: &[(&str, &str)] = &[
    ("", "Namespace"),
    ("", "Node"),
    ("", "PersistentVolume"),
    ("rbac.authorization.k8s.io", "ClusterRole"),
    ("rbac.authorization.k8s.io", "ClusterRoleBinding"),
    ("apiextensions.k8s.io", "CustomResourceDefinition"),
    ("storage.k8s.io", "StorageClass"),
    ("admissionregistration.k8s.io", "MutatingWebhookConfiguration"),
    ("admissionregistration.k8s.io", "ValidatingWebhookConfiguration"),
];

fn is_cluster_scoped(gk: &GroupKind) -> bool {
    CLUSTER_SCOPED.iter().any(|(g, k)| *g == gk.group && *k == gk.kind)
}

/// Glob match; an unparsable pattern only matches itself.
fn glob_match(pattern: &str, value: &str) -> bool {
    Pattern::new(pattern).map(|p| p.matches(value)).unwrap_or(pattern == value)
}

/// `true` when some positive pattern matches and no negated one does.
fn permitted<'a>(patterns: impl IntoIterator<Item = &'a str> + Clone, value: &str) -> bool {
    let denied = patterns.clone().into_iter().filter_map(|p| p.strip_prefix('!')).any(|p| glob_match(p, value));
    !denied && patterns.into_iter().filter(|p| !p.starts_with('!')).any(|p| glob_match(p, value))
}

fn kind_listed(list: &[GroupKind], gk: &GroupKind) -> bool {
    list.iter().any(|e| glob_match(&e.group, &gk.group) && glob_match(&e.kind, &gk.kind))
}

/// Evaluates `AppProject` records.
#[derive(Debug, Clone, Default)]
pub struct ProjectPolicy {
    projects: Vec<AppProject>,
}

impl ProjectPolicy {
    pub fn new(projects: Vec<AppProject>) -> Self {
        Self { projects }
    }

    pub async fn load(source: &dyn ProjectSource, namespace: &str) -> Result<Self, StoreError> {
        let projects = source.projects(namespace).await?;
        debug!(ns = %namespace, count = projects.len(), "policy: loaded projects");
        Ok(Self::new(projects))
    }

    fn project(&self, name: &str) -> Option<&AppProject> {
        self.projects.iter().find(|p| p.name() == name)
    }

    /// Rule check against one project record.
    pub fn check(
        project: &AppProject,
        source: &ApplicationSource,
        destination: &ApplicationDestination,
        kinds: &[GroupKind],
    ) -> Verdict {
        let spec = &project.spec;
        if !permitted(spec.source_repos.iter().map(String::as_str), &source.repo_url) {
            return Verdict::Denied(format!(
                "application repo {} is not permitted in project '{}'",
                source.repo_url,
                project.name()
            ));
        }

        let dest_ok = {
            let matches = |d: &ApplicationDestination, strip: bool| {
                let pat = |p: &str| if strip { p.trim_start_matches('!').to_string() } else { p.to_string() };
                let server_ok = !d.server.is_empty() && glob_match(&pat(&d.server), &destination.server);
                let name_ok = !d.name.is_empty() && glob_match(&pat(&d.name), &destination.name);
                (server_ok || name_ok) && glob_match(&pat(&d.namespace), &destination.namespace)
            };
            let negated = |d: &ApplicationDestination| {
                d.server.starts_with('!') || d.name.starts_with('!') || d.namespace.starts_with('!')
            };
            let denied = spec.destinations.iter().filter(|&d| negated(d)).any(|d| matches(d, true));
            !denied && spec.destinations.iter().filter(|&d| !negated(d)).any(|d| matches(d, false))
        };
        if !dest_ok {
            let target = if destination.name.is_empty() { &destination.server } else { &destination.name };
            return Verdict::Denied(format!(
                "application destination {{{} {}}} is not permitted in project '{}'",
                target,
                destination.namespace,
                project.name()
            ));
        }

        for gk in kinds.iter() {
            let denied = if is_cluster_scoped(gk) {
                !kind_listed(&spec.cluster_resource_whitelist, gk)
            } else {
                kind_listed(&spec.namespace_resource_blacklist, gk)
            };
            if denied {
                return Verdict::Denied(format!("resource {} is not permitted in project '{}'", gk, project.name()));
            }
        }
        Verdict::Allowed
    }
}

#[async_trait]
impl PolicyStore for ProjectPolicy {
    async fn project_exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.project(name).is_some())
    }

    async fn project_allows(
        &self,
        name: &str,
        source: &ApplicationSource,
        destination: &ApplicationDestination,
        kinds: &[GroupKind],
    ) -> Result<Verdict, StoreError> {
        match self.project(name) {
            Some(p) => Ok(Self::check(p, source, destination, kinds)),
            None => Ok(Verdict::Denied(format!("project '{name}' does not exist"))),
        }
    }
}
