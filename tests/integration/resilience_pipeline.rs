//! End-to-end tests of retry, circuit breaker and retry budget working together

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use fleet_state::clock::{ManualClock, SystemClock};
use fleet_state::config::{BreakerConfig, Config};
use fleet_state::resilience::{
    BreakerRegistry, CallFailure, CircuitState, Resilience, ResilienceError,
};

fn resilience() -> (Resilience, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    (Resilience::from_config(&Config::default(), clock.clone()), clock)
}

async fn failing_call(resilience: &Resilience, key: &str) -> ResilienceError<CallFailure> {
    resilience
        .call(key, || async {
            Err::<(), _>(CallFailure::Transient("connection refused".into()))
        })
        .await
        .unwrap_err()
}

#[test]
fn test_registry_creates_one_breaker_per_key_under_contention() {
    let registry = Arc::new(BreakerRegistry::new(
        BreakerConfig::default(),
        SystemClock::shared(),
    ));

    let threads: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            thread::spawn(move || registry.get_or_create("agent-1"))
        })
        .collect();
    let breakers: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    assert_eq!(registry.len(), 1);
    assert!(breakers.iter().all(|b| Arc::ptr_eq(b, &breakers[0])));
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_recovers_and_closes() {
    let (resilience, clock) = resilience();

    // 3 + 2 failed attempts open the breaker during the second call
    assert_matches!(
        failing_call(&resilience, "agent-1").await,
        ResilienceError::Failed { attempts: 3, .. }
    );
    assert_matches!(
        failing_call(&resilience, "agent-1").await,
        ResilienceError::CircuitOpen { attempts: 2, last_failure: Some(_), .. }
    );

    let rejected = failing_call(&resilience, "agent-1").await;
    assert_matches!(
        rejected,
        ResilienceError::CircuitOpen { ref key, attempts: 0, last_failure: None, .. } if key == "agent-1"
    );

    clock.advance(Duration::from_secs(60));
    let breaker = resilience.breakers().get("agent-1").unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    for expected in [CircuitState::HalfOpen, CircuitState::Closed] {
        let value = resilience
            .call("agent-1", || async { Ok::<_, CallFailure>("pong") })
            .await
            .unwrap();
        assert_eq!(value, "pong");
        assert_eq!(breaker.state(), expected);
    }
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opening_mid_retry_keeps_the_last_failure() {
    let (resilience, _) = resilience();
    let calls = AtomicU32::new(0);
    failing_call(&resilience, "agent-1").await;

    let err = resilience
        .call("agent-1", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(CallFailure::Transient(format!("refused #{n}"))) }
        })
        .await
        .unwrap_err();

    // two real attempts, then the breaker refuses the third
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(err.is_circuit_open());
    assert_eq!(err.attempts(), 2);
    assert_eq!(
        err.operation_error(),
        Some(&CallFailure::Transient("refused #1".into()))
    );
    assert!(err.to_string().ends_with("last failure: transient failure: refused #1"));
}

#[tokio::test(start_paused = true)]
async fn test_budget_caps_retries_across_keys() {
    let (resilience, _) = resilience();
    let mut refused = 0;

    for i in 0..100 {
        // a fresh key per call keeps every breaker closed
        let err = failing_call(&resilience, &format!("agent-{i}")).await;
        if err.is_budget_exceeded() {
            refused += 1;
            assert_matches!(err.operation_error(), Some(CallFailure::Transient(_)));
        }
    }

    let stats = resilience.budget().stats();
    assert!(refused > 0);
    assert!(stats.ratio <= 0.3, "retry ratio {} above ceiling", stats.ratio);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_trial_call_frees_half_open_slot() {
    let (resilience, clock) = resilience();
    let breaker = resilience.breakers().get_or_create("agent-1");
    for _ in 0..5 {
        breaker.try_acquire().unwrap().fail();
    }
    clock.advance(Duration::from_secs(60));

    let hung = tokio::time::timeout(
        Duration::from_secs(1),
        resilience.call("agent-1", || std::future::pending::<Result<(), CallFailure>>()),
    )
    .await;

    assert!(hung.is_err());
    let snapshot = breaker.snapshot();
    assert_eq!(snapshot.state, CircuitState::HalfOpen);
    assert_eq!(snapshot.half_open_in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_surfaces_unchanged() {
    let (resilience, _) = resilience();
    let calls = AtomicU32::new(0);

    let err = resilience
        .call("validator", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(CallFailure::Permanent("unknown field `cpu`".into())) }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        err.into_operation_error(),
        Some(CallFailure::Permanent("unknown field `cpu`".into()))
    );
}
