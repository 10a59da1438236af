//! Inbound calls delivered through the transport's push channel

use std::sync::Arc;
use std::time::Duration;

use call_session_core::duration::category;
use call_session_core::{
    CallDirection, CallHandle, CallStatus, LoopbackTransport, ManagerSettings, RetryConfig,
    SessionConfig, SessionManager,
};
use parking_lot::Mutex;

fn setup() -> (Arc<SessionManager>, Arc<LoopbackTransport>) {
    let transport = Arc::new(LoopbackTransport::new());
    let settings = ManagerSettings::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_eviction_grace(Duration::from_millis(30))
        .with_call_lookup(10, Duration::from_millis(10))
        .with_reconnect_retry(RetryConfig::fixed(2, Duration::from_millis(10)));
    (SessionManager::new(transport.clone(), settings), transport)
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn collect_calls(manager: &SessionManager) -> Arc<Mutex<Vec<CallHandle>>> {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    manager.subscribe(move |call| sink.lock().push(call), |_| {}, || {});
    calls
}

#[tokio::test]
async fn test_incoming_call_is_announced_and_tracked() {
    let (manager, transport) = setup();
    let calls = collect_calls(&manager);
    manager.initialize(SessionConfig::new("agent", "pw")).await.unwrap();

    let id = transport.inject_incoming("+15557654321");
    wait_until("on_call", || !calls.lock().is_empty()).await;

    let call = calls.lock()[0].clone();
    assert_eq!(call.id(), &id);
    assert_eq!(call.direction(), CallDirection::Inbound);
    assert_eq!(call.number(), "+15557654321");
    assert_eq!(call.status(), CallStatus::Ringing);

    tokio::time::sleep(Duration::from_millis(20)).await;
    transport.push_status(&id, CallStatus::Connected);
    wait_until("CONNECTED", || call.status() == CallStatus::Connected).await;

    let info = call.info();
    assert!(info.durations[category::RINGING] >= Duration::from_millis(20));
    assert!(info.connected_at.is_some());
}

#[tokio::test]
async fn test_push_and_poll_do_not_duplicate_handles() {
    let (manager, transport) = setup();
    let calls = collect_calls(&manager);
    manager.initialize(SessionConfig::new("agent", "pw")).await.unwrap();

    // Start polling so the inbound call is seen by both paths
    let outbound = manager.make_call("+15551234567").await.unwrap();
    transport.inject_incoming("+15557654321");

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(calls.lock().len(), 2);
    assert_eq!(manager.registry().len(), 2);
    assert_eq!(manager.stats().total_calls, 2);
    drop(outbound);
}

#[tokio::test]
async fn test_reconnect_waits_for_last_live_call() {
    let (manager, transport) = setup();
    manager.initialize(SessionConfig::new("agent", "pw")).await.unwrap();

    let inbound = transport.inject_incoming("+15557654321");
    wait_until("inbound registered", || manager.registry().contains(&inbound)).await;

    let outbound = manager.make_call("+15551234567").await.unwrap();
    transport.set_status(outbound.id(), CallStatus::Connected);
    wait_until("CONNECTED", || outbound.status() == CallStatus::Connected).await;
    outbound.hangup().await.unwrap();

    wait_until("outbound evicted", || !manager.registry().contains(outbound.id())).await;
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(transport.connect_count(), 1, "reconnect deferred while a call is live");

    transport.push_status(&inbound, CallStatus::Terminated);
    wait_until("reconnect", || manager.stats().reconnects == 1).await;
    assert_eq!(transport.connect_count(), 2);
    assert!(manager.registry().is_empty());
}
