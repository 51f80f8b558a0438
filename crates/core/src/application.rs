use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::{Deserialize, Serialize, Serializer};

/// Identity of a namespaced object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A generated deployment target. Used both for the desired (rendered) and the
/// live (persisted) form; only the live form carries status and operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Application {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ApplicationSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<serde_json::Value>,
    /// In-flight sync operation written by the downstream controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<serde_json::Value>,
}

impl Application {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("")
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace(), self.name())
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    pub fn finalizers(&self) -> &[String] {
        self.metadata.finalizers.as_deref().unwrap_or(&[])
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    pub fn add_finalizer(&mut self, finalizer: &str) {
        if self.has_finalizer(finalizer) {
            return;
        }
        self.metadata.finalizers.get_or_insert_with(Vec::new).push(finalizer.to_string());
    }

    /// Remove one finalizer, leaving all others in place. Returns whether it was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let Some(list) = self.metadata.finalizers.as_mut() else { return false };
        let before = list.len();
        list.retain(|f| f != finalizer);
        let removed = list.len() != before;
        if list.is_empty() {
            self.metadata.finalizers = None;
        }
        removed
    }

    pub fn annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata.annotations.as_ref()
    }

    /// True when `owner` is the controller owner of this object. An empty uid on
    /// either side falls back to a kind+name match.
    pub fn is_controlled_by(&self, owner: &OwnerReference) -> bool {
        self.metadata.owner_references.as_deref().unwrap_or(&[]).iter().any(|r| {
            r.controller == Some(true)
                && r.kind == owner.kind
                && r.name == owner.name
                && (r.uid.is_empty() || owner.uid.is_empty() || r.uid == owner.uid)
        })
    }

    /// Install `owner` as the controller reference, replacing any previous controller.
    pub fn set_controller_owner(&mut self, owner: OwnerReference) {
        let refs = self.metadata.owner_references.get_or_insert_with(Vec::new);
        refs.retain(|r| r.controller != Some(true) && !(r.kind == owner.kind && r.name == owner.name));
        refs.push(owner);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project: String,
    #[serde(default)]
    pub source: ApplicationSource,
    #[serde(default)]
    pub destination: ApplicationDestination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<serde_json::Value>,
    /// Kinds the source is declared to render; empty when undeclared.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_kinds: Vec<GroupKind>,
    /// Fields not modelled here (`ignoreDifferences`, `info`, ...), carried verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSource {
    #[serde(rename = "repoURL", default, skip_serializing_if = "String::is_empty")]
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
    /// Tool-specific blocks (`helm`, `kustomize`, `directory`, ...).
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Where an application deploys to. A server filled in from `name` is marked
/// inferred and is not persisted, so the stored form keeps only the name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDestination {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(skip)]
    server_inferred: bool,
}

impl ApplicationDestination {
    pub fn new(server: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { server: server.into(), namespace: namespace.into(), name: name.into(), server_inferred: false }
    }

    pub fn set_inferred_server(&mut self, server: impl Into<String>) {
        self.server = server.into();
        self.server_inferred = true;
    }

    pub fn is_server_inferred(&self) -> bool {
        self.server_inferred
    }

    /// Server as it is written to the store.
    pub fn persisted_server(&self) -> &str {
        if self.server_inferred { "" } else { &self.server }
    }
}

impl PartialEq for ApplicationDestination {
    fn eq(&self, other: &Self) -> bool {
        self.persisted_server() == other.persisted_server()
            && self.namespace == other.namespace
            && self.name == other.name
    }
}

impl Serialize for ApplicationDestination {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        fn blank(s: &&str) -> bool {
            s.is_empty()
        }
        #[derive(Serialize)]
        struct Wire<'a> {
            #[serde(skip_serializing_if = "blank")]
            server: &'a str,
            #[serde(skip_serializing_if = "blank")]
            namespace: &'a str,
            #[serde(skip_serializing_if = "blank")]
            name: &'a str,
        }
        Wire { server: self.persisted_server(), namespace: &self.namespace, name: &self.name }.serialize(serializer)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), kind: kind.into() }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() { write!(f, "{}", self.kind) } else { write!(f, "{}/{}", self.group, self.kind) }
    }
}

/// Project policy record scoping which sources, destinations and kinds an
/// application may use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppProject {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: AppProjectSpec,
}

impl AppProject {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppProjectSpec {
    #[serde(default)]
    pub source_repos: Vec<String>,
    #[serde(default)]
    pub destinations: Vec<ApplicationDestination>,
    #[serde(default)]
    pub cluster_resource_whitelist: Vec<GroupKind>,
    #[serde(default)]
    pub namespace_resource_blacklist: Vec<GroupKind>,
}
