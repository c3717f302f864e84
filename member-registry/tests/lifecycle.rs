//! Start / unregister / close lifecycle against the in-memory backend.

mod common;

use common::{capture_logs, eventually, FlakyClient};
use member_registry::{
    ChangeEvent, ChangeHandlers, ChangeKind, Error, MemberRecord, MemoryBackend,
    RegistrationManager, RegistrationPath,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn push_path() -> RegistrationPath {
    RegistrationPath::new("/services/push").unwrap()
}

fn push_member() -> MemberRecord {
    MemberRecord::new("10.0.0.1", 7000)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_start_registers_exactly_once() {
    let backend = Arc::new(MemoryBackend::new());
    let added = Arc::new(Mutex::new(Vec::new()));
    let sink = added.clone();
    let handlers = ChangeHandlers::new().on_added(move |_, _, path| {
        sink.lock().unwrap().push(path.to_string());
        Ok(())
    });
    let manager = Arc::new(
        RegistrationManager::new(backend.clone(), push_member(), push_path())
            .with_handlers(handlers),
    );

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.start().await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(manager.is_started());
    let members = backend.children("/services/push");
    assert_eq!(members.len(), 1, "Exactly one ephemeral node expected");

    // Hydration ran once, and saw our own node once
    let committed = manager.committed_path().unwrap();
    assert!(eventually(|| added.lock().unwrap().iter().any(|p| *p == committed)).await);
    let own = added
        .lock()
        .unwrap()
        .iter()
        .filter(|p| **p == committed)
        .count();
    assert_eq!(own, 1);

    manager.close().await;
}

#[tokio::test]
async fn test_interleaved_start_builds_one_dispatcher() {
    let (logs, _guard) = capture_logs();
    let backend = Arc::new(MemoryBackend::new());
    let manager = RegistrationManager::new(backend.clone(), push_member(), push_path());

    let (a, b, c, d) = tokio::join!(
        manager.start(),
        manager.start(),
        manager.start(),
        manager.start()
    );
    for result in [a, b, c, d] {
        result.unwrap();
    }

    assert_eq!(logs.count_containing("Change dispatcher created"), 1);
    assert_eq!(logs.count_containing("Registered member"), 1);
    assert_eq!(backend.children("/services/push").len(), 1);

    manager.close().await;
}

#[tokio::test]
async fn test_registration_scenario_round_trip() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = RegistrationManager::new(backend.clone(), push_member(), push_path());

    manager.start().await.unwrap();

    let committed = manager.committed_path().unwrap();
    let suffix = committed
        .strip_prefix("/services/push/")
        .expect("node should live under the namespace");
    assert!(!suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()));

    let stored = MemberRecord::from_bytes(&backend.get_data(&committed).unwrap()).unwrap();
    assert_eq!(stored.ip(), "10.0.0.1");
    assert_eq!(stored.port(), 7000);

    manager.unregister_app().await.unwrap();

    // A third-party read no longer lists the member
    assert!(!backend.children("/services/push").contains(&committed));
    assert_eq!(manager.committed_path(), None);

    manager.close().await;
}

#[tokio::test]
async fn test_unregister_removes_only_committed_path() {
    let backend = Arc::new(MemoryBackend::new());
    backend
        .create_persistent("/services/push/static", b"peer".to_vec())
        .unwrap();
    let manager = RegistrationManager::new(backend.clone(), push_member(), push_path());

    manager.start().await.unwrap();
    assert_eq!(backend.children("/services/push").len(), 2);

    manager.unregister_app().await.unwrap();
    assert_eq!(backend.children("/services/push"), vec!["/services/push/static"]);

    manager.close().await;
}

#[tokio::test]
async fn test_connection_loss_and_reconnect_log_in_order() {
    let (logs, _guard) = capture_logs();
    let backend = Arc::new(MemoryBackend::new());
    let manager = RegistrationManager::new(backend.clone(), push_member(), push_path());
    manager.start().await.unwrap();

    let member_before = manager.member().clone();
    let path_before = manager.path().clone();

    backend.simulate_connection_loss();
    backend.simulate_reconnect();

    assert!(eventually(|| logs.warnings().len() >= 2).await);
    assert_eq!(
        logs.warnings(),
        vec![
            "10.0.0.1, lost connection".to_string(),
            "10.0.0.1, reconnected".to_string()
        ]
    );
    assert_eq!(manager.member(), &member_before);
    assert_eq!(manager.path(), &path_before);

    manager.close().await;
}

#[tokio::test]
async fn test_session_expiry_reported_as_removal() {
    let backend = Arc::new(MemoryBackend::new());
    let removed = Arc::new(Mutex::new(Vec::new()));
    let sink = removed.clone();
    let handlers = ChangeHandlers::new().on_removed(move |ctx, event, path| {
        assert_eq!(event.kind, ChangeKind::Removed);
        if ctx.namespace().contains(path) {
            sink.lock().unwrap().push(path.to_string());
        }
        Ok(())
    });
    let manager = RegistrationManager::new(backend.clone(), push_member(), push_path())
        .with_handlers(handlers);
    manager.start().await.unwrap();
    let committed = manager.committed_path().unwrap();

    assert_eq!(backend.expire_session(), 1);
    assert!(eventually(|| removed.lock().unwrap().contains(&committed)).await);

    // The node vanished with the session; removing it again is not an error
    manager.unregister_app().await.unwrap();

    manager.close().await;
}

#[tokio::test]
async fn test_close_cancels_queued_dispatch() {
    let backend = Arc::new(MemoryBackend::new());
    let calls = Arc::new(Mutex::new(0usize));
    let sink = calls.clone();
    let handlers = ChangeHandlers::new().on_updated(move |_, _, _| {
        *sink.lock().unwrap() += 1;
        Ok(())
    });
    let manager = RegistrationManager::new(backend.clone(), push_member(), push_path())
        .with_handlers(handlers);
    manager.start().await.unwrap();

    // Sits in the queue: the drain task has not run since start() returned
    backend.emit(ChangeEvent::new(
        ChangeKind::Updated,
        "/services/push/late",
        None,
    ));

    tokio::time::timeout(Duration::from_secs(1), manager.close())
        .await
        .expect("Timeout waiting for drain task to stop");

    assert_eq!(*calls.lock().unwrap(), 0);
    assert!(manager.is_closed());
}

#[tokio::test]
async fn test_hydration_failure_removes_node_and_releases_guard() {
    let backend = Arc::new(MemoryBackend::new());
    let client = Arc::new(FlakyClient::failing_fetches(backend.clone(), 1));
    let manager = RegistrationManager::new(client, push_member(), push_path());

    let err = manager.start().await.unwrap_err();
    assert!(matches!(err, Error::Hydration(_)));
    assert!(!manager.is_started());
    assert!(manager.dispatcher().is_none());
    assert_eq!(manager.committed_path(), None);
    assert!(backend.children("/services/push").is_empty());

    manager.start().await.unwrap();
    assert!(manager.is_started());
    assert_eq!(backend.children("/services/push").len(), 1);

    manager.close().await;
}

#[tokio::test]
async fn test_hydration_failure_during_outage_keeps_one_node() {
    let backend = Arc::new(MemoryBackend::new());
    let client = Arc::new(FlakyClient::losing_connection(backend.clone(), 1));
    let manager = RegistrationManager::new(client, push_member(), push_path());

    let err = manager.start().await.unwrap_err();
    assert!(matches!(err, Error::Hydration(_)));
    assert!(!manager.is_started());

    // Cleanup could not reach the backend, so the node stays tracked
    let stale = manager
        .committed_path()
        .expect("unremoved node should stay committed");
    assert_eq!(backend.children("/services/push"), vec![stale.clone()]);

    backend.simulate_reconnect();
    manager.start().await.unwrap();

    let members = backend.children("/services/push");
    assert_eq!(members.len(), 1);
    assert_ne!(members[0], stale);
    assert_eq!(manager.committed_path(), Some(members[0].clone()));

    manager.unregister_app().await.unwrap();
    assert!(backend.children("/services/push").is_empty());

    manager.close().await;
}

#[tokio::test]
async fn test_unregister_after_failed_start_removes_leftover_node() {
    let backend = Arc::new(MemoryBackend::new());
    let client = Arc::new(FlakyClient::losing_connection(backend.clone(), 1));
    let manager = RegistrationManager::new(client, push_member(), push_path());

    assert!(manager.start().await.is_err());
    assert_eq!(backend.children("/services/push").len(), 1);

    backend.simulate_reconnect();
    manager.unregister_app().await.unwrap();
    assert_eq!(manager.committed_path(), None);
    assert!(backend.children("/services/push").is_empty());

    manager.close().await;
}

#[tokio::test]
async fn test_retried_start_subscribes_once() {
    let backend = Arc::new(MemoryBackend::new());
    let client = Arc::new(FlakyClient::failing_fetches(backend.clone(), 1));
    let added = Arc::new(Mutex::new(Vec::new()));
    let sink = added.clone();
    let handlers = ChangeHandlers::new().on_added(move |_, _, path| {
        sink.lock().unwrap().push(path.to_string());
        Ok(())
    });
    let manager = RegistrationManager::new(client.clone(), push_member(), push_path())
        .with_handlers(handlers);

    assert!(manager.start().await.is_err());
    manager.start().await.unwrap();
    assert_eq!(client.subscriptions(), 2, "One connection and one change listener");

    let before = client.deliveries();
    backend
        .create_persistent("/services/push/peer", b"peer".to_vec())
        .unwrap();
    assert_eq!(client.deliveries() - before, 1);

    assert!(eventually(|| added.lock().unwrap().iter().any(|p| p == "/services/push/peer")).await);
    let peer = added
        .lock()
        .unwrap()
        .iter()
        .filter(|p| *p == "/services/push/peer")
        .count();
    assert_eq!(peer, 1);

    manager.close().await;
}
