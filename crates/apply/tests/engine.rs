use std::sync::Arc;

use appset_apply::{bind_to_set, ApplyReport, MergeEngine, StickyKeys};
use appset_core::{
    Application, ApplicationSet, ApplicationsSyncPolicy, ObjectKey, ReconcileError, ResourceOp, SetSyncPolicy,
    StoreError, NOTIFIED_ANNOTATION,
};
use appset_store::{InMemoryStore, ResourceStore};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;

fn set(policy: Option<ApplicationsSyncPolicy>) -> ApplicationSet {
    let mut s = ApplicationSet {
        metadata: ObjectMeta {
            name: Some("name".into()),
            namespace: Some("namespace".into()),
            uid: Some("set-uid".into()),
            ..Default::default()
        },
        ..Default::default()
    };
    s.spec.sync_policy = policy.map(|p| SetSyncPolicy { applications_sync: Some(p), ..Default::default() });
    s
}

fn desired(name: &str, project: &str) -> Application {
    let mut a = Application {
        metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
        ..Default::default()
    };
    a.spec.project = project.into();
    a
}

async fn seed_owned(store: &InMemoryStore, set: &ApplicationSet, name: &str, project: &str) -> Application {
    store.seed(bind_to_set(set, desired(name, project))).await.unwrap()
}

fn engine(store: &Arc<InMemoryStore>) -> MergeEngine {
    MergeEngine::new(store.clone(), StickyKeys::default())
}

async fn live(store: &InMemoryStore, set: &ApplicationSet) -> Vec<Application> {
    store.list_owned(set.namespace(), &set.owner_reference()).await.unwrap()
}

#[tokio::test]
async fn existing_app_is_updated_in_place() {
    let store = Arc::new(InMemoryStore::new());
    let s = set(None);
    let mut existing = bind_to_set(&s, desired("app1", "test"));
    existing.metadata.resource_version = Some("2".into());
    store.seed(existing).await.unwrap();

    let report = engine(&store)
        .create_or_update(&s, &[desired("app1", "project")], &live(&store, &s).await, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.updated, 1);
    let app = store.get(&ObjectKey::new("namespace", "app1")).await.unwrap();
    assert_eq!(app.spec.project, "project");
    assert_eq!(app.resource_version(), Some("3"));
}

#[tokio::test]
async fn second_pass_is_a_no_op() {
    let store = Arc::new(InMemoryStore::new());
    let s = set(None);
    let want = vec![desired("a", "p"), desired("b", "p")];
    let eng = engine(&store);
    let first = eng.create_or_update(&s, &want, &live(&store, &s).await, &CancellationToken::new()).await.unwrap();
    assert_eq!(first.created, 2);
    let second = eng.create_or_update(&s, &want, &live(&store, &s).await, &CancellationToken::new()).await.unwrap();
    assert_eq!(second, ApplyReport { unchanged: 2, ..Default::default() });
    assert_eq!(store.journal().await.len(), 2);
}

#[tokio::test]
async fn created_apps_carry_owner_and_namespace() {
    let store = Arc::new(InMemoryStore::new());
    let s = set(None);
    let mut d = desired("a", "p");
    d.metadata.namespace = Some("elsewhere".into());
    engine(&store).create_or_update(&s, &[d], &[], &CancellationToken::new()).await.unwrap();
    let app = store.get(&ObjectKey::new("namespace", "a")).await.unwrap();
    assert_eq!(app.resource_version(), Some("1"));
    assert!(app.is_controlled_by(&s.owner_reference()));
    let owner = &app.metadata.owner_references.as_ref().unwrap()[0];
    assert_eq!(owner.block_owner_deletion, Some(true));
}

#[tokio::test]
async fn status_operation_and_sticky_annotation_survive() {
    let store = Arc::new(InMemoryStore::new());
    let s = set(None);
    let mut existing = bind_to_set(&s, desired("app1", "test"));
    existing.metadata.annotations = Some([(NOTIFIED_ANNOTATION.to_string(), "state=X".to_string())].into());
    existing.status = Some(serde_json::json!({ "sync": { "status": "Synced" } }));
    existing.operation = Some(serde_json::json!({ "sync": { "revision": "abc" } }));
    store.seed(existing.clone()).await.unwrap();

    engine(&store)
        .create_or_update(&s, &[desired("app1", "project")], &live(&store, &s).await, &CancellationToken::new())
        .await
        .unwrap();
    let app = store.get(&ObjectKey::new("namespace", "app1")).await.unwrap();
    assert_eq!(app.spec.project, "project");
    assert_eq!(app.status, existing.status);
    assert_eq!(app.operation, existing.operation);
    assert_eq!(app.annotations().and_then(|a| a.get(NOTIFIED_ANNOTATION)).map(String::as_str), Some("state=X"));
}

#[tokio::test]
async fn orphans_are_deleted_and_kept_apps_untouched() {
    let store = Arc::new(InMemoryStore::new());
    let s = set(None);
    let keep = seed_owned(&store, &s, "keep", "p").await;
    seed_owned(&store, &s, "delete", "p").await;
    let want = vec![desired("keep", "p")];
    let eng = engine(&store);
    let current = live(&store, &s).await;
    let mut report = eng.create_or_update(&s, &want, &current, &CancellationToken::new()).await.unwrap();
    report.absorb(eng.delete_orphans(&s, &want, &current, &CancellationToken::new()).await.unwrap());
    assert_eq!((report.unchanged, report.deleted), (1, 1));
    assert_eq!(store.names().await, vec!["keep"]);
    let kept = store.get(&keep.key()).await.unwrap();
    assert_eq!(kept.resource_version(), keep.resource_version());
}

#[tokio::test]
async fn create_only_policy_never_updates_or_deletes() {
    let store = Arc::new(InMemoryStore::new());
    let s = set(Some(ApplicationsSyncPolicy::CreateOnly));
    seed_owned(&store, &s, "app1", "old").await;
    seed_owned(&store, &s, "orphan", "old").await;
    let want = vec![desired("app1", "new"), desired("fresh", "new")];
    let eng = engine(&store);
    let current = live(&store, &s).await;
    let mut report = eng.create_or_update(&s, &want, &current, &CancellationToken::new()).await.unwrap();
    report.absorb(eng.delete_orphans(&s, &want, &current, &CancellationToken::new()).await.unwrap());
    assert_eq!((report.created, report.updated, report.deleted, report.skipped), (1, 0, 0, 2));
    assert_eq!(store.get(&ObjectKey::new("namespace", "app1")).await.unwrap().spec.project, "old");
    assert_eq!(store.names().await, vec!["app1", "fresh", "orphan"]);
}

#[tokio::test]
async fn conflict_is_retried_once_against_fresh_state() {
    let store = Arc::new(InMemoryStore::new());
    let s = set(None);
    seed_owned(&store, &s, "app1", "old").await;
    let current = live(&store, &s).await;
    // another writer bumps the version after we listed
    store.touch(&ObjectKey::new("namespace", "app1")).await.unwrap();

    let report = engine(&store)
        .create_or_update(&s, &[desired("app1", "new")], &current, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.updated, 1);
    assert!(report.check().is_ok());
    assert_eq!(store.get(&ObjectKey::new("namespace", "app1")).await.unwrap().spec.project, "new");
}

#[tokio::test]
async fn persistent_conflict_surfaces_after_one_retry() {
    let store = Arc::new(InMemoryStore::new());
    let s = set(None);
    seed_owned(&store, &s, "app1", "old").await;
    let key = ObjectKey::new("namespace", "app1");
    for _ in 0..2 {
        store.fail_next(key.clone(), ResourceOp::Update, StoreError::Conflict("busy".into())).await;
    }
    let report = engine(&store)
        .create_or_update(&s, &[desired("app1", "new")], &live(&store, &s).await, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.failures[0].error, StoreError::Conflict("busy".into()));
    assert_eq!(report.check().unwrap_err(), ReconcileError::StoreConflict(key));
}

#[tokio::test]
async fn update_makes_exactly_two_attempts() {
    let store = Arc::new(InMemoryStore::new());
    let s = set(None);
    seed_owned(&store, &s, "app1", "old").await;
    let key = ObjectKey::new("namespace", "app1");
    for _ in 0..3 {
        store.fail_next(key.clone(), ResourceOp::Update, StoreError::Conflict("busy".into())).await;
    }
    let eng = engine(&store);
    let first = eng.create_or_update(&s, &[desired("app1", "new")], &live(&store, &s).await, &CancellationToken::new()).await.unwrap();
    assert_eq!((first.updated, first.failures.len()), (0, 1));
    // one queued conflict is left for the next cycle, which then succeeds on its retry
    let second = eng.create_or_update(&s, &[desired("app1", "new")], &live(&store, &s).await, &CancellationToken::new()).await.unwrap();
    assert_eq!(second.updated, 1);
    assert!(second.check().is_ok());
}

#[tokio::test]
async fn failures_are_aggregated_and_siblings_continue() {
    let store = Arc::new(InMemoryStore::new());
    let s = set(None);
    store.fail_next(ObjectKey::new("namespace", "a"), ResourceOp::Create, StoreError::Forbidden("no".into())).await;
    store.fail_next(ObjectKey::new("namespace", "b"), ResourceOp::Create, StoreError::Other("boom".into())).await;
    let want = vec![desired("a", "p"), desired("b", "p"), desired("c", "p")];
    let report = engine(&store).create_or_update(&s, &want, &[], &CancellationToken::new()).await.unwrap();
    assert_eq!(report.created, 1);
    match report.check() {
        Err(ReconcileError::Resources(failures)) => {
            assert_eq!(failures.len(), 2);
            assert_eq!(failures[0].key.name, "a");
            assert_eq!(failures[1].error, StoreError::Other("boom".into()));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn cancellation_stops_before_mutating() {
    let store = Arc::new(InMemoryStore::new());
    let s = set(None);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = engine(&store).create_or_update(&s, &[desired("a", "p")], &[], &cancel).await.unwrap_err();
    assert_eq!(err, ReconcileError::Cancelled);
    assert!(store.journal().await.is_empty());
}

#[tokio::test]
async fn update_carries_the_whole_desired_spec_body() {
    let store = Arc::new(InMemoryStore::new());
    let s = set(None);
    let mut existing = bind_to_set(&s, desired("app1", "test"));
    existing.spec.source.extra.insert("helm".into(), serde_json::json!({ "valueFiles": ["values-old.yaml"] }));
    existing.spec.extra.insert("revisionHistoryLimit".into(), serde_json::json!(3));
    store.seed(existing).await.unwrap();

    let mut want = desired("app1", "project");
    want.spec.source.extra.insert("helm".into(), serde_json::json!({ "valueFiles": ["values-prod.yaml"] }));
    want.spec.extra.insert(
        "ignoreDifferences".into(),
        serde_json::json!([{ "group": "apps", "kind": "Deployment", "jsonPointers": ["/spec/replicas"] }]),
    );
    let eng = engine(&store);
    let report = eng.create_or_update(&s, &[want.clone()], &live(&store, &s).await, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.updated, 1);

    let app = store.get(&ObjectKey::new("namespace", "app1")).await.unwrap();
    assert_eq!(app.spec.project, "project");
    assert_eq!(app.spec.source.extra, want.spec.source.extra);
    assert_eq!(app.spec.extra, want.spec.extra);

    let again = eng.create_or_update(&s, &[want], &live(&store, &s).await, &CancellationToken::new()).await.unwrap();
    assert_eq!(again.unchanged, 1);
}
