//! Route sets in, published snapshot out.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{https_only_settings, route_set, tls_route_set};
use edgesync::desired::{parse_route_sets, Translator};
use edgesync::xds::snapshot::Resource;
use edgesync::xds::{
    Caches, InMemorySnapshotStore, NodeLocks, OwnerKey, ResourceKind, Snapshot, SnapshotStore,
    Synchronizer,
};

#[tokio::test]
async fn two_tls_owners_share_one_https_listener() {
    let cache = Arc::new(Caches::new(https_only_settings()));
    let translator = Translator::new(false);
    for set in [
        tls_route_set("a", &["a.example.com"], "svc-a"),
        tls_route_set("b", &["b.example.com"], "svc-b"),
    ] {
        let (owner, resources) = translator.translate(&set).unwrap();
        cache.put(owner, resources).unwrap();
    }

    let graph = cache.to_graph().unwrap();
    let listeners = graph.get(ResourceKind::Listener);
    assert_eq!(listeners.len(), 1);
    let Resource::Listener(listener) = &listeners[0] else {
        panic!("expected a listener");
    };
    assert_eq!(listener.name, "listener_443");
    assert_eq!(listener.filter_chains.len(), 2);
    assert_eq!(listener.listener_filters.len(), 1);
    let expected = Snapshot::from_graph(graph);

    let store = Arc::new(InMemorySnapshotStore::new());
    let mut updates = store.subscribe_updates();
    let sync = Synchronizer::new(Arc::clone(&cache), Arc::clone(&store), Duration::from_secs(1));
    let locks = NodeLocks::new();
    let report = sync.run_pass(locks.acquire("edge-gateway").await).await.unwrap();

    let published = store.get_snapshot("edge-gateway").await.unwrap().unwrap();
    assert_eq!(published, expected);
    assert_eq!(published.get(ResourceKind::Listener), expected.get(ResourceKind::Listener));
    assert_eq!(published.names(ResourceKind::Listener), vec!["listener_443"]);
    assert_eq!(
        published.names(ResourceKind::Cluster),
        vec!["default/svc-a:80", "default/svc-b:80"]
    );
    assert_eq!(report.clusters_added.len(), 2);

    assert_eq!(updates.recv().await.unwrap().version, report.warm_version);
    assert_eq!(updates.recv().await.unwrap().version, report.new_version);
}

#[tokio::test]
async fn conflicting_route_set_is_rejected_and_others_keep_serving() {
    let cache = Arc::new(Caches::new(common::http_settings()));
    let translator = Translator::new(false);

    let (owner_a, resources_a) =
        translator.translate(&route_set("a", &["foo.example.com"], "svc-a")).unwrap();
    cache.put(owner_a.clone(), resources_a).unwrap();

    let (owner_b, resources_b) =
        translator.translate(&route_set("b", &["foo.example.com"], "svc-b")).unwrap();
    let err = cache.put(owner_b, resources_b).unwrap_err();
    assert!(err.is_domain_conflict());

    let store = Arc::new(InMemorySnapshotStore::new());
    let sync = Synchronizer::new(Arc::clone(&cache), Arc::clone(&store), Duration::from_secs(1));
    let locks = NodeLocks::new();
    sync.run_pass(locks.acquire("edge-gateway").await).await.unwrap();

    let published = store.get_snapshot("edge-gateway").await.unwrap().unwrap();
    assert_eq!(published.names(ResourceKind::Cluster), vec!["default/svc-a:80"]);
    assert_eq!(cache.owner_of("foo.example.com").unwrap(), Some(owner_a));
    assert_eq!(cache.owners().unwrap(), vec![OwnerKey::new("default", "a")]);
}

#[tokio::test]
async fn yaml_route_sets_publish_weighted_routes() {
    let route_sets = parse_route_sets(
        r#"
name: hello
rules:
  - hosts: [hello.example.com]
    paths:
      - backends:
          - service: hello-v1
            port: 80
            weight: 90
          - service: hello-v2
            port: 80
            weight: 10
"#,
    )
    .unwrap();

    let cache = Arc::new(Caches::new(common::http_settings()));
    let (owner, resources) = Translator::new(false).translate(&route_sets[0]).unwrap();
    cache.put(owner, resources).unwrap();

    let store = Arc::new(InMemorySnapshotStore::new());
    let sync = Synchronizer::new(Arc::clone(&cache), Arc::clone(&store), Duration::from_secs(1));
    let locks = NodeLocks::new();
    sync.run_pass(locks.acquire("edge-gateway").await).await.unwrap();

    let published = store.get_snapshot("edge-gateway").await.unwrap().unwrap();
    assert!(published.consistent().is_ok());
    assert_eq!(
        published.names(ResourceKind::Cluster),
        vec!["default/hello-v1:80", "default/hello-v2:80"]
    );
    assert_eq!(published.names(ResourceKind::Listener), vec!["listener_8080", "listener_8081"]);
}
