use std::sync::Arc;
use std::time::Duration;

use appset_apply::{bind_to_set, MergeEngine, StickyKeys};
use appset_controller::{min_requeue, ControllerConfig, Context, Reconciler, RuntimeError};
use appset_core::{
    AppProject, Application, ApplicationDestination, ApplicationSet, ApplicationsSyncPolicy, ObjectKey,
    ReconcileError, SetSyncPolicy, StoreError, RESOURCES_FINALIZER,
};
use appset_generators::{CheckoutRepoService, GeneratorRegistry};
use appset_kubehub::{ClusterRegistry, DestinationSnapshot, FixedProbe, ProjectSource, StaticProjects, StaticSecrets};
use async_trait::async_trait;
use appset_render::PlaceholderRenderer;
use appset_store::{InMemoryStore, ResourceStore};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;
use kube::runtime::controller::Action;
use tokio_util::sync::CancellationToken;

const PROJECTS: &str = r#"
- metadata: { name: default }
  spec:
    sourceRepos: ['*']
    destinations: [{ server: '*', namespace: '*' }]
- metadata: { name: project }
  spec:
    sourceRepos: ['*']
    destinations: [{ server: '*', namespace: '*' }]
"#;

fn set_with(elements: &str) -> ApplicationSet {
    let yaml = format!(
        r#"
metadata: {{ name: guestbook, namespace: argocd, uid: set-uid }}
spec:
  generators:
    - list:
        elements: {elements}
  template:
    metadata: {{ name: '{{{{name}}}}' }}
    spec:
      project: '{{{{project}}}}'
      source: {{ repoURL: 'https://github.com/example/apps', path: guestbook }}
      destination: {{ name: '{{{{cluster}}}}', namespace: guestbook }}
"#
    );
    serde_yaml::from_str(&yaml).unwrap()
}

fn cluster_secret(name: &str, server: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(format!("cluster-{name}")),
            namespace: Some("argocd".into()),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        },
        data: Some(
            [("name", name), ("server", server)]
                .iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    reconciler: Reconciler,
}

/// Project lookup that answers only after `delay`.
struct SlowProjects {
    delay: Duration,
    inner: StaticProjects,
}

#[async_trait]
impl ProjectSource for SlowProjects {
    async fn projects(&self, namespace: &str) -> Result<Vec<AppProject>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.projects(namespace).await
    }
}

fn harness() -> Harness {
    let projects: Vec<AppProject> = serde_yaml::from_str(PROJECTS).unwrap();
    harness_with(Arc::new(StaticProjects(projects)))
}

fn harness_with(projects: Arc<dyn ProjectSource>) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let registry = Arc::new(ClusterRegistry::new(
        Arc::new(StaticSecrets(vec![cluster_secret("prod", "https://prod.example.com")])),
        Arc::new(FixedProbe::version("1.29")),
    ));
    let reconciler = Reconciler::new(
        registry,
        GeneratorRegistry::with_defaults(Arc::new(CheckoutRepoService::new("/nonexistent"))),
        Arc::new(PlaceholderRenderer),
        projects,
        MergeEngine::new(store.clone(), StickyKeys::default()),
    );
    Harness { store, reconciler }
}

fn owned(set: &ApplicationSet, name: &str, project: &str, dest: ApplicationDestination) -> Application {
    let mut a = Application {
        metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
        ..Default::default()
    };
    a.spec.project = project.into();
    a.spec.destination = dest;
    bind_to_set(set, a)
}

fn key(name: &str) -> ObjectKey {
    ObjectKey::new("argocd", name)
}

#[tokio::test]
async fn first_pass_creates_and_second_pass_converges() {
    let h = harness();
    let set = set_with("[{ name: app1, cluster: prod, project: default }, { name: app2, cluster: in-cluster, project: default }]");

    let out = h.reconciler.reconcile(&set, &CancellationToken::new()).await.unwrap();
    assert_eq!(out.report.created, 2);
    assert_eq!(out.requeue_after, None);

    let app1 = h.store.get(&key("app1")).await.unwrap();
    assert!(app1.has_finalizer(RESOURCES_FINALIZER));
    assert_eq!(app1.spec.destination.name, "prod");
    // the resolved server is not written back
    assert_eq!(app1.spec.destination.server, "");

    let again = h.reconciler.reconcile(&set, &CancellationToken::new()).await.unwrap();
    assert_eq!((again.report.created, again.report.updated, again.report.unchanged), (0, 0, 2));
    assert_eq!(h.store.journal().await.len(), 2);
}

#[tokio::test]
async fn duplicate_names_abort_before_any_mutation() {
    let h = harness();
    let set = set_with("[{ name: app1, cluster: prod, project: default }, { name: app1, cluster: in-cluster, project: default }]");
    h.store.seed(owned(&set, "stale", "default", ApplicationDestination::new("", "g", "prod"))).await.unwrap();

    let err = h.reconciler.reconcile(&set, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err, ReconcileError::DuplicateName("app1".into()));
    assert!(h.store.journal().await.is_empty());
    assert_eq!(h.store.names().await, vec!["stale"]);
}

#[tokio::test]
async fn existing_app_takes_the_new_project() {
    let h = harness();
    let set = set_with("[{ name: app1, cluster: prod, project: project }]");
    h.store.seed(owned(&set, "app1", "test", ApplicationDestination::new("", "guestbook", "prod"))).await.unwrap();

    let out = h.reconciler.reconcile(&set, &CancellationToken::new()).await.unwrap();
    assert_eq!(out.report.updated, 1);
    let app1 = h.store.get(&key("app1")).await.unwrap();
    assert_eq!(app1.spec.project, "project");
    assert_eq!(app1.resource_version(), Some("2"));
}

#[tokio::test]
async fn orphan_is_deleted_and_kept_app_untouched() {
    let h = harness();
    let set = set_with("[{ name: keep, cluster: prod, project: default }]");
    h.reconciler.reconcile(&set, &CancellationToken::new()).await.unwrap();
    h.store.seed(owned(&set, "delete", "default", ApplicationDestination::new("", "g", "prod"))).await.unwrap();
    let before = h.store.get(&key("keep")).await.unwrap();

    let out = h.reconciler.reconcile(&set, &CancellationToken::new()).await.unwrap();
    assert_eq!((out.report.unchanged, out.report.deleted), (1, 1));
    assert_eq!(h.store.names().await, vec!["keep"]);
    assert_eq!(h.store.get(&key("keep")).await.unwrap(), before);
}

#[tokio::test]
async fn validation_failure_skips_creation_but_still_prunes() {
    let h = harness();
    let set = set_with("[{ name: app1, cluster: missing, project: default }]");
    h.store.seed(owned(&set, "stale", "default", ApplicationDestination::new("", "g", "prod"))).await.unwrap();

    let err = h.reconciler.reconcile(&set, &CancellationToken::new()).await.unwrap_err();
    assert!(err.is_validation(), "{err}");
    assert!(h.store.names().await.is_empty());
}

#[tokio::test]
async fn unknown_project_is_a_policy_violation() {
    let h = harness();
    let set = set_with("[{ name: app1, cluster: prod, project: nope }]");
    let err = h.reconciler.reconcile(&set, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::PolicyViolation { ref app, .. } if app == "app1"));
    assert!(h.store.journal().await.is_empty());
}

#[tokio::test]
async fn unreachable_destination_loses_only_the_cleanup_finalizer() {
    let h = harness();
    let mut set = set_with("[{ name: app1, cluster: prod, project: default }]");
    set.spec.sync_policy =
        Some(SetSyncPolicy { applications_sync: Some(ApplicationsSyncPolicy::CreateUpdate), ..Default::default() });

    let mut gone = owned(&set, "gone", "default", ApplicationDestination::new("https://gone.example.com", "g", ""));
    gone.metadata.finalizers = Some(vec![RESOURCES_FINALIZER.into(), "example.com/other".into()]);
    h.store.seed(gone).await.unwrap();

    let out = h.reconciler.reconcile(&set, &CancellationToken::new()).await.unwrap();
    assert_eq!(out.report.finalizers_released, 1);
    assert_eq!(out.report.skipped, 1);

    let gone = h.store.get(&key("gone")).await.unwrap();
    assert_eq!(gone.finalizers(), &["example.com/other".to_string()]);
    let app1 = h.store.get(&key("app1")).await.unwrap();
    assert!(app1.has_finalizer(RESOURCES_FINALIZER));
}

#[tokio::test]
async fn preserved_resources_get_no_cleanup_finalizer() {
    let h = harness();
    let mut set = set_with("[{ name: app1, cluster: prod, project: default }]");
    set.spec.sync_policy = Some(SetSyncPolicy { preserve_resources_on_deletion: true, ..Default::default() });
    h.reconciler.reconcile(&set, &CancellationToken::new()).await.unwrap();
    assert!(h.store.get(&key("app1")).await.unwrap().finalizers().is_empty());
}

#[tokio::test]
async fn cancelled_cycle_mutates_nothing() {
    let h = harness();
    let set = set_with("[{ name: app1, cluster: prod, project: default }]");
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert_eq!(h.reconciler.reconcile(&set, &cancel).await.unwrap_err(), ReconcileError::Cancelled);
    assert!(h.store.journal().await.is_empty());
}

#[test]
fn requeue_is_the_minimum_generator_preference() {
    let set: ApplicationSet = serde_yaml::from_str(
        r#"
metadata: { name: s, namespace: argocd }
spec:
  generators:
    - list: { elements: [] }
    - git: { repoURL: 'https://github.com/example/apps', revision: HEAD, requeueAfterSeconds: 1 }
    - git: { repoURL: 'https://github.com/example/apps', revision: HEAD }
  template: {}
"#,
    )
    .unwrap();
    let registry = GeneratorRegistry::with_defaults(Arc::new(CheckoutRepoService::new("/nonexistent")));
    assert_eq!(min_requeue(&set, &registry, &DestinationSnapshot::default()), Some(Duration::from_secs(1)));
}

#[tokio::test]
async fn runtime_maps_outcomes_to_actions() {
    let h = harness();
    let config = ControllerConfig { validation_requeue: Duration::from_secs(42), ..Default::default() };
    let ctx = Context::new(h.reconciler, config, CancellationToken::new());

    let ok = set_with("[{ name: app1, cluster: prod, project: default }]");
    assert_eq!(ctx.cycle(&ok).await.unwrap(), Action::await_change());

    let invalid = set_with("[{ name: app1, cluster: missing, project: default }]");
    assert_eq!(ctx.cycle(&invalid).await.unwrap(), Action::requeue(Duration::from_secs(42)));

    let dup = set_with("[{ name: a, cluster: prod, project: default }, { name: a, cluster: prod, project: default }]");
    assert!(ctx.cycle(&dup).await.is_err());
    let k = ObjectKey::new("argocd", "guestbook");
    assert_eq!(ctx.next_backoff(&k), Duration::from_secs(5));
    assert_eq!(ctx.next_backoff(&k), Duration::from_secs(10));
}

#[tokio::test]
async fn timed_out_cycle_is_cancelled_before_mutating() {
    let projects: Vec<AppProject> = serde_yaml::from_str(PROJECTS).unwrap();
    let h = harness_with(Arc::new(SlowProjects { delay: Duration::from_millis(200), inner: StaticProjects(projects) }));
    let config = ControllerConfig { cycle_timeout: Duration::from_millis(20), ..Default::default() };
    let ctx = Context::new(h.reconciler, config, CancellationToken::new());

    let set = set_with("[{ name: app1, cluster: prod, project: default }]");
    match ctx.cycle(&set).await {
        Err(RuntimeError::Timeout(d)) => assert_eq!(d, Duration::from_millis(20)),
        other => panic!("unexpected {other:?}"),
    }
    // the stalled cycle resumed with its token cancelled and stopped short of the create
    assert!(h.store.journal().await.is_empty());
}

#[tokio::test]
async fn deleted_set_clears_its_backoff() {
    let h = harness();
    let ctx = Context::new(h.reconciler, ControllerConfig::default(), CancellationToken::new());
    let k = ObjectKey::new("argocd", "guestbook");
    assert_eq!(ctx.next_backoff(&k), Duration::from_secs(5));
    assert_eq!(ctx.next_backoff(&k), Duration::from_secs(10));

    let mut set = set_with("[{ name: app1, cluster: prod, project: default }]");
    set.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
    assert_eq!(ctx.cycle(&set).await.unwrap(), Action::await_change());
    assert!(h.store.journal().await.is_empty());
    assert_eq!(ctx.next_backoff(&k), Duration::from_secs(5));
}
