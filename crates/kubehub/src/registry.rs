use std::collections::BTreeMap;
use std::sync::Arc;

use appset_core::{
    trim_server, ConnectionState, ConnectionStatus, Destination, DestinationConfig, DestinationError,
    IN_CLUSTER_NAME, IN_CLUSTER_SERVER, REFRESH_ANNOTATION,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Lists the cluster secrets of a namespace (already filtered by the
/// cluster secret-type label).
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn cluster_secrets(&self, namespace: &str) -> Result<Vec<Secret>, DestinationError>;
}

/// Capability probe of the local API server; returns `major.minor`.
#[async_trait]
pub trait ServerProbe: Send + Sync {
    async fn server_version(&self) -> Result<String, DestinationError>;
}

/// Fixed secret list.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets(pub Vec<Secret>);

#[async_trait]
impl SecretSource for StaticSecrets {
    async fn cluster_secrets(&self, namespace: &str) -> Result<Vec<Secret>, DestinationError> {
        Ok(self
            .0
            .iter()
            .filter(|s| s.metadata.namespace.as_deref().map(|ns| ns == namespace).unwrap_or(true))
            .cloned()
            .collect())
    }
}

/// Probe with a canned answer; counts how often it is asked.
#[derive(Debug, Default)]
pub struct FixedProbe {
    answer: Option<String>,
    calls: std::sync::atomic::AtomicUsize,
}

impl FixedProbe {
    pub fn version(v: impl Into<String>) -> Self {
        Self { answer: Some(v.into()), calls: Default::default() }
    }

    pub fn failing() -> Self {
        Self { answer: None, calls: Default::default() }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ServerProbe for FixedProbe {
    async fn server_version(&self) -> Result<String, DestinationError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.answer.clone().ok_or_else(|| DestinationError::Source("server version unavailable".into()))
    }
}

/// Live destination registry backed by cluster secrets plus the local cluster.
pub struct ClusterRegistry {
    secrets: Arc<dyn SecretSource>,
    probe: Arc<dyn ServerProbe>,
    local: OnceCell<Destination>,
}

impl ClusterRegistry {
    pub fn new(secrets: Arc<dyn SecretSource>, probe: Arc<dyn ServerProbe>) -> Self {
        Self { secrets, probe, local: OnceCell::new() }
    }

    /// All destinations of `namespace`. The local cluster is appended unless a
    /// secret already registers its server.
    pub async fn list(&self, namespace: &str) -> Result<Vec<Destination>, DestinationError> {
        let secrets = self.secrets.cluster_secrets(namespace).await?;
        let mut out: Vec<Destination> = secrets.iter().map(secret_to_destination).collect();
        if !out.iter().any(|d| d.server == IN_CLUSTER_SERVER) {
            out.push(self.local_destination().await);
        }
        debug!(ns = %namespace, count = out.len(), "registry: listed destinations");
        Ok(out)
    }

    pub async fn snapshot(&self, namespace: &str) -> Result<DestinationSnapshot, DestinationError> {
        Ok(DestinationSnapshot::new(self.list(namespace).await?))
    }

    pub async fn resolve(&self, namespace: &str, name: &str) -> Result<String, DestinationError> {
        self.snapshot(namespace).await?.resolve(name)
    }

    async fn local_destination(&self) -> Destination {
        let base = self
            .local
            .get_or_init(|| async {
                let mut d = Destination::new(IN_CLUSTER_NAME, IN_CLUSTER_SERVER);
                match self.probe.server_version().await {
                    Ok(v) => {
                        d.server_version = Some(v);
                        d.connection_state.status = ConnectionStatus::Successful;
                    }
                    Err(e) => {
                        warn!(error = %e, "registry: local server probe failed");
                        d.connection_state = ConnectionState {
                            status: ConnectionStatus::Failed,
                            message: e.to_string(),
                            modified_at: None,
                        };
                    }
                }
                d
            })
            .await;
        let mut d = base.clone();
        d.connection_state.modified_at = Some(Utc::now());
        d
    }
}

/// Destinations captured once per cycle; all lookups of a cycle see the same view.
#[derive(Debug, Clone, Default)]
pub struct DestinationSnapshot {
    destinations: Vec<Destination>,
}

impl DestinationSnapshot {
    pub fn new(destinations: Vec<Destination>) -> Self {
        Self { destinations }
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    /// Server of the single destination named `name`.
    pub fn resolve(&self, name: &str) -> Result<String, DestinationError> {
        let servers: Vec<&str> =
            self.destinations.iter().filter(|d| d.name == name).map(|d| d.server.as_str()).collect();
        match servers.as_slice() {
            [] => Err(DestinationError::NotFound(name.to_string())),
            [one] => Ok(trim_server(one).to_string()),
            many => Err(DestinationError::Ambiguous {
                name: name.to_string(),
                servers: many.iter().map(|s| s.to_string()).collect(),
            }),
        }
    }

    pub fn has_server(&self, server: &str) -> bool {
        let server = trim_server(server);
        self.destinations.iter().any(|d| d.server == server)
    }

    pub fn by_server(&self, server: &str) -> Option<&Destination> {
        let server = trim_server(server);
        self.destinations.iter().find(|d| d.server == server)
    }
}

fn data_str(secret: &Secret, key: &str) -> Option<String> {
    if let Some(v) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return Some(String::from_utf8_lossy(&v.0).into_owned());
    }
    secret.string_data.as_ref().and_then(|d| d.get(key)).cloned()
}

/// Map one cluster secret to a destination. Malformed optional fields are
/// logged and dropped.
pub fn secret_to_destination(secret: &Secret) -> Destination {
    let secret_name = secret.metadata.name.as_deref().unwrap_or("");

    let config = match data_str(secret, "config").filter(|c| !c.trim().is_empty()) {
        Some(raw) => serde_json::from_str::<DestinationConfig>(&raw).unwrap_or_else(|e| {
            warn!(secret = %secret_name, error = %e, "registry: invalid config in cluster secret");
            DestinationConfig::default()
        }),
        None => DestinationConfig::default(),
    };

    let namespaces = data_str(secret, "namespaces")
        .map(|raw| raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
        .unwrap_or_default();

    let annotations: BTreeMap<String, String> = secret.metadata.annotations.clone().unwrap_or_default();
    let refresh_requested_at = annotations.get(REFRESH_ANNOTATION).and_then(|v| {
        match DateTime::parse_from_rfc3339(v) {
            Ok(t) => Some(t.with_timezone(&Utc)),
            Err(e) => {
                warn!(secret = %secret_name, error = %e, "registry: invalid refresh timestamp in cluster secret");
                None
            }
        }
    });

    let shard = data_str(secret, "shard").and_then(|raw| match raw.trim().parse::<i64>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(secret = %secret_name, error = %e, "registry: invalid shard in cluster secret");
            None
        }
    });

    Destination {
        id: secret.metadata.uid.clone().unwrap_or_default(),
        server: trim_server(&data_str(secret, "server").unwrap_or_default()).to_string(),
        name: data_str(secret, "name").unwrap_or_default(),
        namespaces,
        config,
        shard,
        refresh_requested_at,
        connection_state: ConnectionState::default(),
        server_version: None,
        labels: secret.metadata.labels.clone().unwrap_or_default(),
        annotations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;

    fn secret(name: &str, data: &[(&str, &str)], annotations: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.into()),
                uid: Some(format!("uid-{name}")),
                annotations: Some(annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..Default::default()
            },
            data: Some(data.iter().map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec()))).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn secret_fields_map_to_destination() {
        let s = secret(
            "prod",
            &[
                ("name", "prod"),
                ("server", "https://prod.example.com/"),
                ("namespaces", " a, ,b "),
                ("shard", "2"),
                ("config", r#"{"bearerToken":"t"}"#),
            ],
            &[(REFRESH_ANNOTATION, "2024-01-02T03:04:05Z")],
        );
        let d = secret_to_destination(&s);
        assert_eq!(d.id, "uid-prod");
        assert_eq!(d.server, "https://prod.example.com");
        assert_eq!(d.namespaces, vec!["a", "b"]);
        assert_eq!(d.shard, Some(2));
        assert_eq!(d.config.bearer_token.as_deref(), Some("t"));
        assert!(d.refresh_requested_at.is_some());
    }

    #[test]
    fn malformed_optional_fields_are_dropped() {
        let s = secret(
            "bad",
            &[("name", "bad"), ("server", "https://bad"), ("shard", "two"), ("config", "{not json")],
            &[(REFRESH_ANNOTATION, "yesterday")],
        );
        let d = secret_to_destination(&s);
        assert_eq!(d.server, "https://bad");
        assert_eq!(d.shard, None);
        assert_eq!(d.refresh_requested_at, None);
        assert_eq!(d.config, DestinationConfig::default());
    }

    #[test]
    fn snapshot_resolution() {
        let snap = DestinationSnapshot::new(vec![
            Destination::new("prod", "https://prod"),
            Destination::new("dup", "https://d1"),
            Destination::new("dup", "https://d2"),
        ]);
        assert_eq!(snap.resolve("prod").unwrap(), "https://prod");
        assert_eq!(snap.resolve("none").unwrap_err(), DestinationError::NotFound("none".into()));
        match snap.resolve("dup").unwrap_err() {
            DestinationError::Ambiguous { servers, .. } => assert_eq!(servers, vec!["https://d1", "https://d2"]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(snap.has_server("https://prod/"));
        assert!(!snap.has_server("https://other"));
    }
}
