use super::*;
use crate::{Event, Outcome, WorkloadFiles};
use pretty_assertions::assert_eq;

fn files(workload: &Arc<FakeWorkload>) -> WorkloadFiles {
    WorkloadFiles::new(workload.clone(), format!("{RULES_DIR}/"))
}

#[tokio::test]
async fn pushes_lists_and_removes_files() {
    let test = TestConfig::new();
    let store = files(&test.workload);

    store.write("a.json", "[]").await.unwrap();
    store.write("b.json", "[{}]").await.unwrap();
    assert_eq!(
        test.workload.files.lock().get(&format!("{RULES_DIR}/b.json")),
        Some(&"[{}]".to_string())
    );
    assert_eq!(
        store.list_keys().await.unwrap(),
        ["a.json", "b.json"]
            .map(String::from)
            .into_iter()
            .collect::<BTreeSet<_>>()
    );

    store
        .delete(&["a.json".to_string(), "missing.json".to_string()])
        .await
        .unwrap();
    assert_eq!(
        store.list_keys().await.unwrap(),
        ["b.json"].map(String::from).into_iter().collect::<BTreeSet<_>>()
    );
    assert_eq!(store.location("b.json"), format!("{RULES_DIR}/b.json"));
}

#[tokio::test]
async fn rejects_path_traversal() {
    let test = TestConfig::new();
    let store = files(&test.workload);
    for name in ["", "..", "../escape.json", "nested/a.json"] {
        assert!(
            matches!(store.write(name, "{}").await, Err(StoreError::Failed(_))),
            "{name:?} must be rejected"
        );
    }
    assert!(test.workload.files.lock().is_empty());
}

#[tokio::test]
async fn unreachable_workloads_are_transient() {
    let test = TestConfig::new();
    test.workload.set_connected(false);
    let store = files(&test.workload);

    assert!(matches!(
        store.write("a.json", "[]").await,
        Err(StoreError::Unavailable(_))
    ));
    // Nothing is left behind in a container that is already gone.
    store.teardown().await.unwrap();
}

#[tokio::test]
async fn teardown_removes_the_directory() {
    let test = TestConfig::new();
    let store = files(&test.workload);
    store.write("a.json", "[]").await.unwrap();

    store.ensure().await.unwrap();
    store.teardown().await.unwrap();
    assert!(store.list_keys().await.unwrap().is_empty());
    assert!(test.ops().contains(&format!("workload:remove:{RULES_DIR}")));
}

#[tokio::test]
async fn delivers_rules_and_config_to_the_workload() {
    let test = TestConfig::new();
    test.set_leader(false);
    test.set_upstream(1, "requirer", &["https://example.com"], &["welcome"]);
    let reconciler = Reconciler::new(
        settings(),
        test.model.clone(),
        test.workload.clone(),
        test.peers.clone(),
        Arc::new(files(&test.workload)),
        Arc::new(WorkloadFiles::new(test.workload.clone(), CONFIG_DIR)),
    );

    let outcome = reconciler
        .handle(&Event::UpstreamChanged { relation_id: 1 })
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Applied);

    let files = test.workload.files.lock().clone();
    assert_eq!(
        files.keys().cloned().collect::<Vec<_>>(),
        vec![
            format!("{CONFIG_DIR}/oathkeeper.yaml"),
            format!("{RULES_DIR}/access-rules-requirer-allow.json"),
            format!("{RULES_DIR}/access-rules-requirer-deny.json"),
        ]
    );
    let config: ServiceConfig =
        serde_yaml::from_str(&files[&format!("{CONFIG_DIR}/oathkeeper.yaml")]).unwrap();
    assert_eq!(
        config.access_rules.repositories,
        vec![
            repository("access-rules-requirer-allow.json"),
            repository("access-rules-requirer-deny.json"),
        ]
    );

    let ops = test.ops();
    let config_push = ops
        .iter()
        .position(|op| op == &format!("workload:push:{CONFIG_DIR}/oathkeeper.yaml"))
        .unwrap();
    let restart = ops.iter().position(|op| op == "workload:restart").unwrap();
    assert!(config_push < restart, "{ops:?}");
}
