use super::*;
use crate::fake::{object, FakeClient};
use fleet_gateway_k8s_api::{dynamic::api_resource, ConfigMap, CoreEvent, Namespace, Secret};

fn seeded() -> Arc<FakeClient> {
    let fake = Arc::new(FakeClient::default());
    let namespaces = api_resource::<Namespace>();
    let configmaps = api_resource::<ConfigMap>();
    fake.add(&namespaces, object(&namespaces, None, "ns1"));
    fake.add(&configmaps, object(&configmaps, Some("ns1"), "cm1"));
    fake.add(&configmaps, object(&configmaps, Some("ns1"), "cm2"));
    fake.add(&configmaps, object(&configmaps, Some("ns2"), "cm3"));
    fake
}

#[tokio::test]
async fn probes_each_kind_once() {
    let fake = seeded();
    let cache = DelegatingReadCache::start(fake.clone(), &DelegatingOptions::default())
        .await
        .expect("cache must start");

    let namespaces = api_resource::<Namespace>();
    let configmaps = api_resource::<ConfigMap>();
    for _ in 0..10 {
        let ns = cache
            .get(&namespaces, None, "ns1")
            .await
            .expect("namespace must be cached");
        assert_eq!(ns.metadata.name.as_deref(), Some("ns1"));
    }
    for _ in 0..10 {
        let cm = cache
            .get(&configmaps, Some("ns1"), "cm1")
            .await
            .expect("configmap must be cached");
        assert_eq!(cm.metadata.name.as_deref(), Some("cm1"));
    }

    assert_eq!(fake.metadata_gets(), 2);
    assert_eq!(fake.gets(), 0);
    assert_eq!(fake.watches(), 2);
}

#[tokio::test]
async fn lists_from_cache() {
    let fake = seeded();
    let cache = DelegatingReadCache::start(fake.clone(), &DelegatingOptions::default())
        .await
        .expect("cache must start");

    let configmaps = api_resource::<ConfigMap>();
    for _ in 0..5 {
        let page = cache
            .list(&configmaps, Some("ns1"), &ListParams::default())
            .await
            .expect("list must succeed");
        let names = page
            .items
            .iter()
            .filter_map(|o| o.metadata.name.as_deref())
            .collect::<Vec<_>>();
        assert_eq!(names, ["cm1", "cm2"]);
    }
    let all = cache
        .list(&configmaps, None, &ListParams::default())
        .await
        .expect("list must succeed");
    assert_eq!(all.items.len(), 3);

    assert_eq!(fake.metadata_lists(), 1);
    assert_eq!(fake.lists(), 0);
}

#[tokio::test]
async fn missing_objects_are_not_found() {
    let fake = seeded();
    let cache = DelegatingReadCache::start(fake.clone(), &DelegatingOptions::default())
        .await
        .expect("cache must start");

    let configmaps = api_resource::<ConfigMap>();
    cache
        .get(&configmaps, Some("ns1"), "cm1")
        .await
        .expect("configmap must be cached");
    fake.remove(&configmaps, Some("ns1"), "cm2");

    // The informer was synced before the removal and the fake never emits
    // deletions, so the object is still served from the cache.
    cache
        .get(&configmaps, Some("ns1"), "cm2")
        .await
        .expect("configmap must be cached");

    let err = cache
        .get(&configmaps, Some("ns1"), "nope")
        .await
        .expect_err("object does not exist");
    assert!(err.is_not_found(), "{err}");
}

#[tokio::test]
async fn events_bypass_the_cache() {
    let fake = seeded();
    let events = api_resource::<CoreEvent>();
    fake.add(&events, object(&events, Some("ns1"), "ev1"));
    let cache = DelegatingReadCache::start(fake.clone(), &DelegatingOptions::default())
        .await
        .expect("cache must start");

    for _ in 0..3 {
        cache
            .get(&events, Some("ns1"), "ev1")
            .await
            .expect("event exists");
    }
    cache
        .list(&events, Some("ns1"), &ListParams::default())
        .await
        .expect("list must succeed");

    assert_eq!(fake.gets(), 3);
    assert_eq!(fake.lists(), 1);
    assert_eq!(fake.metadata_gets(), 0);
    assert_eq!(fake.watches(), 0);
}

#[tokio::test]
async fn field_selectors_and_pages_bypass_the_cache() {
    let fake = seeded();
    let cache = DelegatingReadCache::start(fake.clone(), &DelegatingOptions::default())
        .await
        .expect("cache must start");

    let configmaps = api_resource::<ConfigMap>();
    cache
        .list(
            &configmaps,
            Some("ns1"),
            &ListParams::default().fields("metadata.name=cm1"),
        )
        .await
        .expect("list must succeed");
    let page = cache
        .list(&configmaps, None, &ListParams::default().limit(2))
        .await
        .expect("list must succeed");
    assert_eq!(page.items.len(), 2);
    assert!(page.continue_token.is_some());

    assert_eq!(fake.lists(), 2);
    assert_eq!(fake.watches(), 0);
}

#[tokio::test]
async fn forbidden_probe_reads_as_absent() {
    let fake = seeded();
    let secrets = api_resource::<Secret>();
    fake.add(&secrets, object(&secrets, Some("ns1"), "s1"));
    fake.forbid("Secret");
    let cache = DelegatingReadCache::start(fake.clone(), &DelegatingOptions::default())
        .await
        .expect("cache must start");

    let err = cache
        .get(&secrets, Some("ns1"), "s1")
        .await
        .expect_err("access is denied");
    assert!(err.is_not_found(), "{err}");
    let page = cache
        .list(&secrets, Some("ns1"), &ListParams::default())
        .await
        .expect("denied lists are empty");
    assert!(page.items.is_empty());

    // Denials are not remembered.
    cache.get(&secrets, Some("ns1"), "s1").await.ok();
    assert_eq!(fake.metadata_gets(), 2);
    assert_eq!(fake.watches(), 0);
}

#[tokio::test]
async fn probe_errors_propagate() {
    let fake = seeded();
    let cache = DelegatingReadCache::start(fake.clone(), &DelegatingOptions::default())
        .await
        .expect("cache must start");
    fake.fail_with(500);

    let err = cache
        .get(&api_resource::<ConfigMap>(), Some("ns1"), "cm1")
        .await
        .expect_err("probe fails");
    assert_eq!(err.status_code().as_u16(), 500);
}

#[tokio::test(start_paused = true)]
async fn unsynced_preload_fails_construction() {
    let fake = seeded();
    fake.fail_with(500);
    let options = DelegatingOptions {
        preload: vec![api_resource::<ConfigMap>()],
        sync_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let err = DelegatingReadCache::start(fake, &options)
        .await
        .err()
        .expect("cache cannot sync");
    assert!(matches!(err, Error::CacheSyncFailed(ref kind) if kind == "ConfigMap"), "{err}");
}

#[tokio::test]
async fn preloaded_kinds_are_synced() {
    let fake = seeded();
    let options = DelegatingOptions {
        preload: vec![api_resource::<ConfigMap>()],
        ..Default::default()
    };
    let cache = DelegatingReadCache::start(fake.clone(), &options)
        .await
        .expect("cache must start");
    assert_eq!(fake.watches(), 1);

    cache
        .get(&api_resource::<ConfigMap>(), Some("ns2"), "cm3")
        .await
        .expect("configmap must be cached");
    assert_eq!(fake.watches(), 1);
}
