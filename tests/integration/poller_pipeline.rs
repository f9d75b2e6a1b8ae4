//! Poller → resilience → store pipeline against mock agents

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use fleet_state::clock::SystemClock;
use fleet_state::config::StoreConfig;
use fleet_state::poller::PollerHandle;
use fleet_state::resilience::{CircuitState, Resilience};
use fleet_state::store::{MachineStatus, ResourceStore};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn pipeline() -> (Arc<ResourceStore>, Resilience) {
    let clock = SystemClock::shared();
    let store = Arc::new(ResourceStore::new(&StoreConfig::default(), clock.clone()).unwrap());
    let resilience = Resilience::from_config(&fast_retry_config(), clock);
    (store, resilience)
}

#[tokio::test]
async fn test_flaky_agent_is_retried_into_the_store() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metrics"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/metrics"))
        .respond_with(ResponseTemplate::new(200).set_body_json(create_mock_report_json(42.0, Some(51.0))))
        .mount(&mock_server)
        .await;

    let (store, resilience) = pipeline();
    let agent = create_agent_config("flaky", &mock_server.uri());
    let handle =
        PollerHandle::spawn_http(&agent, store.clone(), resilience.clone(), SystemClock::shared())
            .unwrap();

    let outcome = handle.poll_now().await.unwrap();
    assert!(outcome.registered);

    let machine = store.get_machine("flaky").unwrap().unwrap();
    assert_eq!(machine.status, MachineStatus::Online);
    assert_eq!(machine.metrics.cpu_avg, 42.0);
    assert_eq!(machine.metrics.temp_avg, Some(51.0));

    let breaker = resilience.breakers().get("flaky").unwrap().snapshot();
    assert_eq!(breaker.state, CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures, 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dead_agent_opens_its_circuit() {
    let mock_server = MockServer::start().await;
    let request_count = Arc::new(AtomicUsize::new(0));
    let request_count_clone = request_count.clone();
    Mock::given(method("GET"))
        .and(path("/metrics"))
        .respond_with(move |_req: &wiremock::Request| {
            request_count_clone.fetch_add(1, Ordering::SeqCst);
            ResponseTemplate::new(500)
        })
        .mount(&mock_server)
        .await;

    let (store, resilience) = pipeline();
    let agent = create_agent_config("dead", &mock_server.uri());
    let handle =
        PollerHandle::spawn_http(&agent, store.clone(), resilience.clone(), SystemClock::shared())
            .unwrap();

    for _ in 0..3 {
        assert!(handle.poll_now().await.is_err());
    }

    // 3 attempts, then 2 more until the 5th failure opens the circuit, then none
    assert_eq!(request_count.load(Ordering::SeqCst), 5);
    assert_eq!(
        resilience.breakers().get("dead").unwrap().state(),
        CircuitState::Open
    );
    assert_eq!(store.machine_count().unwrap(), 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pollers_share_one_store() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metrics"))
        .respond_with(ResponseTemplate::new(200).set_body_json(create_mock_report_json(10.0, None)))
        .mount(&mock_server)
        .await;

    let (store, resilience) = pipeline();
    let handles: Vec<_> = (0..5)
        .map(|i| {
            let agent = create_agent_config(&format!("node-{i}"), &mock_server.uri());
            PollerHandle::spawn_http(&agent, store.clone(), resilience.clone(), SystemClock::shared())
                .unwrap()
        })
        .collect();

    let results = futures::future::join_all(handles.iter().map(PollerHandle::poll_now)).await;
    assert!(results.iter().all(Result::is_ok));

    let summary = store.status_summary().unwrap();
    assert_eq!(summary.online, 5);
    assert_eq!(summary.total(), 5);
    assert_eq!(resilience.breakers().len(), 5);

    for handle in handles {
        handle.shutdown().await.unwrap();
    }
}
