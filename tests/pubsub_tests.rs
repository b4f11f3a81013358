//! End-to-end provider/subscriber scenarios

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use sharingway::{
    names, purge_provider_objects, purge_registry_objects, FabricConfig, LockSignalPair,
    PrefixFallback, Provider, ProviderStatus, SharedSegment, Subscriber,
};

fn test_config(tag: &str) -> FabricConfig {
    FabricConfig {
        privileged_prefix: format!("swtest-{}-{}.", std::process::id(), tag),
        fallback: PrefixFallback::Strict,
        ..Default::default()
    }
}

type Received = Arc<Mutex<Vec<(String, serde_json::Value)>>>;

fn collecting_subscriber(config: &FabricConfig) -> (Subscriber, Received) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let mut subscriber = Subscriber::with_config(config.clone());
    subscriber.set_data_handler(move |provider, value| {
        sink.lock().unwrap().push((provider.to_string(), value));
    });
    (subscriber, received)
}

fn wait_for<T>(timeout: Duration, mut probe: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = probe() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn solo_publish_reaches_subscriber_within_a_watch_period() {
    let config = test_config("solo");
    let (mut subscriber, received) = collecting_subscriber(&config);
    subscriber.initialize().unwrap();
    subscriber.subscribe("alpha").unwrap();

    let mut provider = Provider::with_config(config.clone(), "alpha", "solo demo", &[]);
    provider.initialize(None).unwrap();
    provider.publish(&json!({ "n": 1 })).unwrap();

    let hit = wait_for(Duration::from_secs(2), || {
        received.lock().unwrap().first().cloned()
    });
    assert_eq!(hit, Some(("alpha".to_string(), json!({ "n": 1 }))));

    provider.shutdown();
    subscriber.shutdown();
    purge_provider_objects(&config, "alpha");
    purge_registry_objects(&config);
}

#[test]
fn late_subscriber_sees_the_next_publish() {
    let config = test_config("late");
    let mut provider = Provider::with_config(config.clone(), "beta", "late demo", &[]);
    provider.initialize(None).unwrap();
    provider.publish(&json!({ "x": 42 })).unwrap();

    thread::sleep(Duration::from_millis(200));
    let (mut subscriber, received) = collecting_subscriber(&config);
    subscriber.initialize().unwrap();
    subscriber.subscribe("beta").unwrap();

    // The pre-attach publish is not replayed.
    thread::sleep(Duration::from_millis(300));
    assert!(received.lock().unwrap().is_empty());

    provider.publish(&json!({ "x": 42 })).unwrap();
    let hit = wait_for(Duration::from_secs(2), || {
        received.lock().unwrap().first().cloned()
    });
    assert_eq!(hit, Some(("beta".to_string(), json!({ "x": 42 }))));

    provider.shutdown();
    subscriber.shutdown();
    purge_provider_objects(&config, "beta");
    purge_registry_objects(&config);
}

#[test]
fn one_publish_fans_out_to_three_subscribers() {
    let config = test_config("fanout");
    let mut subscribers = Vec::new();
    let mut inboxes = Vec::new();
    for _ in 0..3 {
        let (mut subscriber, received) = collecting_subscriber(&config);
        subscriber.initialize().unwrap();
        subscriber.subscribe("gamma").unwrap();
        subscribers.push(subscriber);
        inboxes.push(received);
    }

    let mut provider = Provider::with_config(config.clone(), "gamma", "fan-out demo", &[]);
    provider.initialize(None).unwrap();
    provider.publish(&json!({ "k": "v" })).unwrap();

    for inbox in &inboxes {
        let hit = wait_for(Duration::from_secs(2), || {
            inbox.lock().unwrap().first().cloned()
        });
        assert_eq!(hit, Some(("gamma".to_string(), json!({ "k": "v" }))));
    }

    // Exactly once each: no duplicate deliveries trail in.
    thread::sleep(Duration::from_millis(300));
    for inbox in &inboxes {
        assert_eq!(inbox.lock().unwrap().len(), 1);
    }

    provider.shutdown();
    for mut subscriber in subscribers {
        subscriber.shutdown();
    }
    purge_provider_objects(&config, "gamma");
    purge_registry_objects(&config);
}

#[test]
fn dead_provider_leaves_a_readable_channel() {
    let config = test_config("death");
    let mut provider = Provider::with_config(config.clone(), "doomed", "will crash", &[]);
    provider.initialize(None).unwrap();
    provider.publish(&json!({ "a": 1 })).unwrap();

    // Die without shutdown: no drain marker, no registry update.
    std::mem::forget(provider);

    let (mut subscriber, _received) = collecting_subscriber(&config);
    subscriber.initialize().unwrap();
    subscriber.subscribe("doomed").unwrap();

    // The channel still holds the last frame.
    let segment = SharedSegment::open(
        &config,
        &names::segment_name(&config.privileged_prefix, "doomed"),
        config.segment_size,
    )
    .unwrap();
    let pair = LockSignalPair::open(&config, "doomed").unwrap();
    pair.acquire(Duration::from_secs(1)).unwrap();
    let frame = segment.read_frame().unwrap();
    pair.release().unwrap();
    assert_eq!(frame, serde_json::to_vec(&json!({ "a": 1 })).unwrap());

    // Nothing detects the death: the registry still says online until a
    // host-driven sweep flips it.
    let listed = subscriber.list_providers().unwrap();
    assert_eq!(listed[0].status, ProviderStatus::Online);

    let registry = sharingway::Registry::open(&config).unwrap();
    thread::sleep(Duration::from_millis(20));
    let swept = registry.sweep_stale(Duration::from_millis(5)).unwrap();
    assert_eq!(swept, vec!["doomed".to_string()]);
    assert_eq!(
        subscriber.list_providers().unwrap()[0].status,
        ProviderStatus::Offline
    );

    subscriber.shutdown();
    purge_provider_objects(&config, "doomed");
    purge_registry_objects(&config);
}

#[test]
fn oversize_publish_fails_cleanly() {
    let config = test_config("oversize");
    let size = 64;
    let mut provider = Provider::with_config(config.clone(), "tight", "tiny segment", &[]);
    provider.initialize(Some(size)).unwrap();
    provider.publish(&json!({ "p": 1 })).unwrap();

    // Observe the payload event from here on; a failed publish must not
    // signal it.
    let observer = LockSignalPair::open(&config, "tight").unwrap();

    let too_big = vec![b'x'; size - 3];
    assert!(provider.publish_raw(&too_big).is_err());
    assert!(!observer.wait(Duration::from_millis(300)).unwrap());

    // Segment contents are unchanged.
    let segment = SharedSegment::open(
        &config,
        &names::segment_name(&config.privileged_prefix, "tight"),
        size,
    )
    .unwrap();
    observer.acquire(Duration::from_secs(1)).unwrap();
    let frame = segment.read_frame().unwrap();
    observer.release().unwrap();
    assert_eq!(frame, serde_json::to_vec(&json!({ "p": 1 })).unwrap());

    provider.shutdown();
    purge_provider_objects(&config, "tight");
    purge_registry_objects(&config);
}

#[test]
fn subscribe_is_idempotent_and_duplicate_free() {
    let config = test_config("idem");
    let (mut subscriber, received) = collecting_subscriber(&config);
    subscriber.initialize().unwrap();
    subscriber.subscribe("echo").unwrap();
    subscriber.subscribe("echo").unwrap();
    assert_eq!(subscriber.list_subscriptions(), vec!["echo".to_string()]);

    let mut provider = Provider::with_config(config.clone(), "echo", "", &[]);
    provider.initialize(None).unwrap();
    provider.publish(&json!({ "once": true })).unwrap();

    assert!(wait_for(Duration::from_secs(2), || {
        (!received.lock().unwrap().is_empty()).then_some(())
    })
    .is_some());
    thread::sleep(Duration::from_millis(300));
    assert_eq!(received.lock().unwrap().len(), 1);

    provider.shutdown();
    subscriber.shutdown();
    purge_provider_objects(&config, "echo");
    purge_registry_objects(&config);
}

#[test]
fn unsubscribe_stops_delivery() {
    let config = test_config("unsub");
    let (mut subscriber, received) = collecting_subscriber(&config);
    subscriber.initialize().unwrap();
    subscriber.subscribe("faucet").unwrap();

    let mut provider = Provider::with_config(config.clone(), "faucet", "", &[]);
    provider.initialize(None).unwrap();
    provider.publish(&json!({ "drop": 1 })).unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        (!received.lock().unwrap().is_empty()).then_some(())
    })
    .is_some());

    subscriber.unsubscribe("faucet").unwrap();
    assert!(subscriber.list_subscriptions().is_empty());
    assert!(subscriber.unsubscribe("faucet").is_err());

    provider.publish(&json!({ "drop": 2 })).unwrap();
    thread::sleep(Duration::from_millis(500));
    assert_eq!(received.lock().unwrap().len(), 1);

    provider.shutdown();
    subscriber.shutdown();
    purge_provider_objects(&config, "faucet");
    purge_registry_objects(&config);
}

#[test]
fn membership_reports_follow_registry_changes() {
    let config = test_config("member");
    let seen: Arc<Mutex<Vec<(String, ProviderStatus)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut subscriber = Subscriber::with_config(config.clone());
    subscriber.set_membership_handler(move |provider, status| {
        sink.lock().unwrap().push((provider.to_string(), status));
    });
    subscriber.initialize().unwrap();

    let mut provider = Provider::with_config(config.clone(), "epsilon", "joins late", &[]);
    provider.initialize(None).unwrap();

    let online = wait_for(Duration::from_secs(2), || {
        seen.lock()
            .unwrap()
            .iter()
            .find(|(name, status)| name == "epsilon" && *status == ProviderStatus::Online)
            .cloned()
    });
    assert!(online.is_some(), "membership handler never saw epsilon online");

    provider.shutdown();
    let offline = wait_for(Duration::from_secs(2), || {
        seen.lock()
            .unwrap()
            .iter()
            .find(|(name, status)| name == "epsilon" && *status == ProviderStatus::Offline)
            .cloned()
    });
    assert!(offline.is_some(), "membership handler never saw epsilon offline");

    subscriber.shutdown();
    purge_provider_objects(&config, "epsilon");
    purge_registry_objects(&config);
}

#[test]
fn drained_marker_is_published_on_shutdown() {
    let config = test_config("drain");
    let (mut subscriber, received) = collecting_subscriber(&config);
    subscriber.initialize().unwrap();
    subscriber.subscribe("well").unwrap();

    let mut provider = Provider::with_config(config.clone(), "well", "", &[]);
    provider.initialize(None).unwrap();
    provider.publish(&json!({ "water": true })).unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        (!received.lock().unwrap().is_empty()).then_some(())
    })
    .is_some());

    provider.shutdown();
    assert!(!provider.is_online());

    // The drain marker is an ordinary frame: subscribers observe `{}`.
    let drained = wait_for(Duration::from_secs(2), || {
        received
            .lock()
            .unwrap()
            .iter()
            .find(|(_, value)| value == &json!({}))
            .cloned()
    });
    assert!(drained.is_some(), "drain marker never arrived");

    subscriber.shutdown();
    purge_provider_objects(&config, "well");
    purge_registry_objects(&config);
}

#[test]
fn publish_requires_an_online_provider() {
    let config = test_config("offline");
    let mut provider = Provider::with_config(config.clone(), "dormant", "", &[]);
    assert!(!provider.is_online());
    assert!(provider.publish(&json!({ "too": "early" })).is_err());

    provider.initialize(None).unwrap();
    assert!(provider.is_online());
    provider.publish(&json!({ "now": "fine" })).unwrap();

    provider.shutdown();
    assert!(provider.publish(&json!({ "too": "late" })).is_err());

    purge_provider_objects(&config, "dormant");
    purge_registry_objects(&config);
}

#[test]
fn shutdown_latency_is_bounded_by_the_watch_period() {
    let config = test_config("latency");
    let (mut subscriber, _received) = collecting_subscriber(&config);
    subscriber.initialize().unwrap();
    subscriber.subscribe("slowpoke").unwrap();

    // No publisher is active, so every watcher sits in its bounded wait.
    let start = Instant::now();
    subscriber.shutdown();
    assert!(start.elapsed() < Duration::from_secs(2));

    purge_provider_objects(&config, "slowpoke");
    purge_registry_objects(&config);
}
