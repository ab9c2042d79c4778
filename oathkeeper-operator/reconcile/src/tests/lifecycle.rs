use super::*;
use crate::{Event, Outcome};
use maplit::btreemap;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn workload_ready_defers_until_reachable() {
    let test = TestConfig::new();
    test.workload.set_connected(false);

    let outcome = test.reconciler.handle(&Event::WorkloadReady).await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Deferred("Waiting to connect to Oathkeeper container")
    );
    assert_eq!(
        test.last_status(),
        Some(UnitStatus::Waiting(
            "Waiting to connect to Oathkeeper container".to_string()
        ))
    );
    assert!(test.ops().is_empty());
}

#[tokio::test]
async fn workload_ready_configures_service() {
    let test = TestConfig::new();

    let outcome = test.reconciler.handle(&Event::WorkloadReady).await.unwrap();
    assert_eq!(outcome, Outcome::Applied);

    let layers = test.workload.layers.lock().clone();
    assert_eq!(layers.len(), 1);
    assert_eq!(
        layers[0].services["oathkeeper"].command,
        "oathkeeper serve -c /etc/config/oathkeeper.yaml"
    );
    assert_eq!(
        test.ops(),
        vec![
            "workload:add-layer",
            "config:write:oathkeeper.yaml",
            "workload:restart"
        ]
    );
    assert_eq!(
        test.model.state.lock().statuses,
        vec![
            UnitStatus::Maintenance("Configuring the container".to_string()),
            UnitStatus::Active,
        ]
    );

    let config = test.service_config().unwrap();
    assert!(config.access_rules.repositories.is_empty());
    assert_eq!(
        config.errors.handlers.redirect.config.unwrap().to,
        None,
        "no identity provider is related"
    );
}

#[tokio::test]
async fn identity_changes_render_endpoints() {
    let test = TestConfig::new();
    test.set_upstream(1, "requirer", &["https://example.com"], &[]);
    test.reconciler
        .handle(&Event::UpstreamChanged { relation_id: 1 })
        .await
        .unwrap();

    test.model.state.lock().identity = IdentityEndpoints {
        login_url: Some("http://kratos/self-service/login/browser".to_string()),
        session_check_url: Some("http://kratos/sessions/whoami".to_string()),
    };
    let outcome = test
        .reconciler
        .handle(&Event::IdentityChanged)
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Applied);

    let config = test.service_config().unwrap();
    assert_eq!(
        config.errors.handlers.redirect.config.unwrap().to.as_deref(),
        Some("http://kratos/self-service/login/browser")
    );
    assert_eq!(
        config
            .authenticators
            .cookie_session
            .config
            .unwrap()
            .check_session_url
            .as_deref(),
        Some("http://kratos/sessions/whoami")
    );
    assert_eq!(
        config.access_rules.repositories,
        vec![repository("access-rules-requirer-deny.json")]
    );
}

#[tokio::test]
async fn followers_leave_shared_config_alone() {
    let test = TestConfig::new();
    test.set_leader(false);

    let outcome = test.reconciler.handle(&Event::WorkloadReady).await.unwrap();
    assert_eq!(outcome, Outcome::Applied);
    assert_eq!(test.ops(), vec!["workload:add-layer", "workload:restart"]);
}

#[tokio::test]
async fn install_and_remove_manage_stores() {
    let test = TestConfig::new();

    let outcome = test.reconciler.handle(&Event::Install).await.unwrap();
    assert_eq!(outcome, Outcome::Applied);
    assert!(*test.rules.ensured.lock());
    assert!(*test.config.ensured.lock());

    let outcome = test.reconciler.handle(&Event::Remove).await.unwrap();
    assert_eq!(outcome, Outcome::Applied);
    assert!(!*test.rules.ensured.lock());
    assert!(!*test.config.ensured.lock());
    assert_eq!(
        test.ops(),
        vec![
            "rules:ensure:rules",
            "config:ensure:config",
            "rules:teardown:rules",
            "config:teardown:config",
        ]
    );
}

#[tokio::test]
async fn followers_do_not_manage_shared_stores() {
    let test = TestConfig::new();
    test.set_leader(false);

    for event in [Event::Install, Event::Remove] {
        let outcome = test.reconciler.handle(&event).await.unwrap();
        assert_eq!(outcome, Outcome::Skipped);
    }
    assert!(test.ops().is_empty());
}

#[tokio::test]
async fn publishes_info_from_leader() {
    let test = TestConfig::new();

    let outcome = test
        .reconciler
        .handle(&Event::InfoRequested { relation_id: 5 })
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Applied);
    assert_eq!(
        test.model.state.lock().published[&5],
        btreemap! {
            "public_endpoint".to_string() =>
                "http://oathkeeper.testing.svc.cluster.local:4456".to_string(),
            "rules_configmap_name".to_string() => "access-rules".to_string(),
            "configmaps_namespace".to_string() => "testing".to_string(),
        }
    );

    test.set_leader(false);
    let outcome = test
        .reconciler
        .handle(&Event::InfoRequested { relation_id: 6 })
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Skipped);
    assert!(!test.model.state.lock().published.contains_key(&6));
}

#[tokio::test]
async fn followers_recompose_unit_local_config_from_peers() {
    let test = TestConfig::with_shared_store(false);
    test.set_upstream(1, "requirer", &["https://example.com"], &["welcome"]);
    test.reconciler
        .handle(&Event::UpstreamChanged { relation_id: 1 })
        .await
        .unwrap();
    test.config.data.lock().clear();

    // The leader handles peer changes through the events that caused them.
    let outcome = test.reconciler.handle(&Event::PeersChanged).await.unwrap();
    assert_eq!(outcome, Outcome::Skipped);

    test.set_leader(false);
    let outcome = test.reconciler.handle(&Event::PeersChanged).await.unwrap();
    assert_eq!(outcome, Outcome::Applied);
    assert_eq!(
        test.repositories(),
        vec![
            repository("access-rules-requirer-allow.json"),
            repository("access-rules-requirer-deny.json"),
        ]
    );
}

#[tokio::test]
async fn peer_changes_are_ignored_with_shared_stores() {
    let test = TestConfig::new();
    test.set_leader(false);

    let outcome = test.reconciler.handle(&Event::PeersChanged).await.unwrap();
    assert_eq!(outcome, Outcome::Skipped);
    assert!(test.ops().is_empty());
}

#[test]
fn events_round_trip_through_json() {
    let events = vec![
        Event::Install,
        Event::UpstreamChanged { relation_id: 3 },
        Event::UpstreamRemoved { relation_id: 4 },
        Event::PeersChanged,
    ];
    let json = serde_json::to_string(&events).unwrap();
    assert_eq!(
        json,
        r#"[{"event":"install"},{"event":"upstream-changed","relation_id":3},{"event":"upstream-removed","relation_id":4},{"event":"peers-changed"}]"#
    );
    assert_eq!(serde_json::from_str::<Vec<Event>>(&json).unwrap(), events);
}
