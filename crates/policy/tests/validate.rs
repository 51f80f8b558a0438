use appset_core::{AppProject, Application, ApplicationDestination, Destination, GroupKind, ReconcileError};
use appset_kubehub::{DestinationSnapshot, StaticProjects};
use appset_policy::{validate, validate_destination, ProjectPolicy};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

const PROJECTS: &str = r#"
- metadata: { name: default }
  spec:
    sourceRepos: ['*']
    destinations:
      - { server: '*', namespace: '*' }
- metadata: { name: restricted }
  spec:
    sourceRepos: ['https://github.com/example/*', '!https://github.com/example/private']
    destinations:
      - { name: prod, namespace: 'team-*' }
      - { server: '*', namespace: '!kube-system' }
    namespaceResourceBlacklist:
      - { group: '', kind: ResourceQuota }
"#;

fn snapshot() -> DestinationSnapshot {
    DestinationSnapshot::new(vec![
        Destination::new("prod", "https://prod.example.com"),
        Destination::new("dup", "https://a"),
        Destination::new("dup", "https://b"),
    ])
}

fn app(name: &str, project: &str, dest: ApplicationDestination) -> Application {
    let mut a = Application {
        metadata: ObjectMeta { name: Some(name.into()), namespace: Some("argocd".into()), ..Default::default() },
        ..Default::default()
    };
    a.spec.project = project.into();
    a.spec.source.repo_url = "https://github.com/example/apps".into();
    a.spec.destination = dest;
    a
}

fn policy() -> ProjectPolicy {
    let projects: Vec<AppProject> = serde_yaml::from_str(PROJECTS).unwrap();
    ProjectPolicy::new(projects)
}

#[test]
fn name_only_destination_gets_inferred_server() {
    let mut a = app("a", "default", ApplicationDestination::new("", "guestbook", "prod"));
    validate_destination(&mut a, &snapshot()).unwrap();
    assert_eq!(a.spec.destination.server, "https://prod.example.com");
    assert!(a.spec.destination.is_server_inferred());
    // a second pass over an already inferred destination is a no-op
    validate_destination(&mut a, &snapshot()).unwrap();
}

#[test]
fn destination_rules() {
    let snap = snapshot();
    let mut a = app("a", "default", ApplicationDestination::new("https://prod.example.com/", "g", "prod"));
    validate_destination(&mut a, &snap).unwrap();

    let mut a = app("a", "default", ApplicationDestination::new("https://other", "g", "prod"));
    assert!(matches!(validate_destination(&mut a, &snap), Err(ReconcileError::ConflictingDestination { .. })));

    let mut a = app("a", "default", ApplicationDestination::new("", "g", "missing"));
    assert!(matches!(validate_destination(&mut a, &snap), Err(ReconcileError::UnknownDestination { .. })));

    let mut a = app("a", "default", ApplicationDestination::new("", "g", "dup"));
    match validate_destination(&mut a, &snap) {
        Err(ReconcileError::UnknownDestination { reason, .. }) => assert!(reason.contains("multiple clusters")),
        other => panic!("unexpected {other:?}"),
    }

    let mut a = app("a", "default", ApplicationDestination::new("https://unregistered", "g", ""));
    assert!(matches!(validate_destination(&mut a, &snap), Err(ReconcileError::UnknownDestination { .. })));

    let mut a = app("a", "default", ApplicationDestination::new("", "g", ""));
    assert!(matches!(validate_destination(&mut a, &snap), Err(ReconcileError::UnknownDestination { .. })));
}

#[tokio::test]
async fn project_policy_is_enforced() {
    let p = policy();
    let snap = snapshot();

    let mut ok = vec![
        app("a", "default", ApplicationDestination::new("", "anything", "prod")),
        app("b", "restricted", ApplicationDestination::new("", "team-web", "prod")),
    ];
    validate(&mut ok, &snap, &p).await.unwrap();

    let mut missing = vec![app("a", "nope", ApplicationDestination::new("", "g", "prod"))];
    match validate(&mut missing, &snap, &p).await {
        Err(ReconcileError::PolicyViolation { rule, .. }) => assert!(rule.contains("does not exist")),
        other => panic!("unexpected {other:?}"),
    }

    let mut private = app("a", "restricted", ApplicationDestination::new("", "team-web", "prod"));
    private.spec.source.repo_url = "https://github.com/example/private".into();
    assert!(matches!(validate(&mut [private], &snap, &p).await, Err(ReconcileError::PolicyViolation { .. })));

    let system = app("a", "restricted", ApplicationDestination::new("https://prod.example.com", "kube-system", ""));
    assert!(matches!(validate(&mut [system], &snap, &p).await, Err(ReconcileError::PolicyViolation { .. })));

    let mut quota = app("a", "restricted", ApplicationDestination::new("", "team-web", "prod"));
    quota.spec.resource_kinds = vec![GroupKind::new("", "ResourceQuota")];
    assert!(matches!(validate(&mut [quota], &snap, &p).await, Err(ReconcileError::PolicyViolation { .. })));
}

#[tokio::test]
async fn first_failure_aborts_the_batch() {
    let p = policy();
    let mut batch = vec![
        app("bad", "default", ApplicationDestination::new("", "g", "missing")),
        app("good", "default", ApplicationDestination::new("", "g", "prod")),
    ];
    let err = validate(&mut batch, &snapshot(), &p).await.unwrap_err();
    assert!(matches!(err, ReconcileError::UnknownDestination { ref app, .. } if app == "bad"));
    assert!(!batch[1].spec.destination.is_server_inferred());
}

#[tokio::test]
async fn projects_load_from_a_source() {
    let projects: Vec<AppProject> = serde_yaml::from_str(PROJECTS).unwrap();
    let p = ProjectPolicy::load(&StaticProjects(projects), "argocd").await.unwrap();
    let mut ok = vec![app("a", "default", ApplicationDestination::new("", "x", "prod"))];
    validate(&mut ok, &snapshot(), &p).await.unwrap();
}
