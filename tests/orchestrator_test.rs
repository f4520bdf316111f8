mod common;

use std::time::{Duration, Instant};

use common::{harness, harness_with, test_configuration, OWNER, PROJECT};
use stratus::cloud::Capability;
use stratus::server::{ServerError, State};
use stratus::store::backend::ServerStore;

#[tokio::test]
async fn test_start_from_off_reaches_running_and_bills_once() {
    let h = harness(State::Off).await;
    let id = h.test_server(State::Off).await;
    h.cloud.script(&[State::Starting, State::Running]);

    let state = h.orchestrator.start(OWNER, id).await.unwrap();
    assert_eq!(state, State::Running);

    let record = h.record(id).await;
    assert_eq!(record.state, State::Running);
    assert_eq!(record.error, None);
    assert_eq!(
        record.provisioned_configuration,
        Some(test_configuration(None))
    );
    assert_eq!(record.cost_per_hour, 1.0);

    assert_eq!(h.ledger.states(), vec![State::Running]);
    assert_eq!(h.events.count("cloud:start"), 1);

    // Key is issued before the backend is asked to start.
    assert!(h.events.position("keys:set").unwrap() < h.events.position("cloud:start").unwrap());

    let details = h.reporter.details.lock().unwrap().clone();
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].name, "vm");
    assert_eq!(details[0].state, "booting");
    assert_eq!(details[0].project_id, PROJECT);
}

#[tokio::test]
async fn test_deprovision_revokes_key_before_backend_call() {
    let h = harness(State::Running).await;
    let id = h.test_server(State::Running).await;
    h.cloud.script(&[State::Deprovisioned]);

    let state = h.orchestrator.deprovision(OWNER, id).await.unwrap();
    assert_eq!(state, State::Deprovisioned);

    let revoke = h.events.position("keys:delete").unwrap();
    let deprovision = h.events.position("cloud:deprovision").unwrap();
    assert!(revoke < deprovision);
    assert_eq!(h.record(id).await.state, State::Deprovisioned);
    assert_eq!(h.record(id).await.cost_per_hour, 0.0);

    // Revoking again on a later refresh is harmless.
    let state = h.orchestrator.state(OWNER, id).await.unwrap();
    assert_eq!(state, State::Deprovisioned);
    assert!(h.events.count("keys:delete") >= 2);
    assert_eq!(h.ledger.states(), vec![State::Deprovisioned]);
}

#[tokio::test]
async fn test_concurrent_starts_share_one_backend_call() {
    let h = harness_with(
        State::Off,
        |cloud| cloud.with_action_delay(Duration::from_millis(100)),
        true,
    )
    .await;
    let id = h.test_server(State::Off).await;
    h.cloud.script(&[State::Running]);

    let (first, second) = tokio::join!(
        h.orchestrator.start(OWNER, id),
        h.orchestrator.start(OWNER, id)
    );

    assert_eq!(first, Ok(State::Running));
    assert_eq!(second, Ok(State::Running));
    assert_eq!(h.events.count("cloud:start"), 1);
    assert_eq!(h.events.count("keys:set"), 1);
}

#[tokio::test]
async fn test_different_operations_on_one_server_are_serialized() {
    let h = harness_with(
        State::Off,
        |cloud| cloud.with_action_delay(Duration::from_millis(50)),
        true,
    )
    .await;
    let id = h.test_server(State::Off).await;
    h.cloud.script(&[State::Running, State::Running, State::Off]);

    let (started, stopped) = tokio::join!(h.orchestrator.start(OWNER, id), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.orchestrator.stop(OWNER, id).await
    });
    assert_eq!(started, Ok(State::Running));
    assert_eq!(stopped, Ok(State::Off));

    // The stop only began once the start had finished.
    let events = h.events.all();
    let start = events.iter().position(|e| e == "cloud:start").unwrap();
    let stop = events.iter().position(|e| e == "cloud:stop").unwrap();
    assert!(start < stop);
    assert!(events[start..stop].iter().any(|e| e == "cloud:state"));
}

#[tokio::test]
async fn test_state_during_start_keeps_the_marker() {
    let h = harness_with(
        State::Off,
        |cloud| cloud.with_action_delay(Duration::from_millis(200)),
        true,
    )
    .await;
    let id = h.test_server(State::Off).await;
    h.cloud.script(&[State::Starting, State::Running]);

    let (started, observed) = tokio::join!(h.orchestrator.start(OWNER, id), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let before = h.record(id).await.state;
        let live = h.orchestrator.state(OWNER, id).await;
        let after = h.record(id).await.state;
        (before, live, after)
    });

    assert_eq!(
        observed,
        (State::Starting, Ok(State::Starting), State::Starting)
    );
    assert_eq!(started, Ok(State::Running));
    assert_eq!(h.ledger.states(), vec![State::Running]);

    // Once nothing is in flight, state refreshes persist again.
    h.store.set_state(id, State::Unknown).await.unwrap();
    assert_eq!(h.orchestrator.state(OWNER, id).await, Ok(State::Running));
    assert_eq!(h.record(id).await.state, State::Running);
}

#[tokio::test]
async fn test_panicking_adapter_still_requeries_and_releases() {
    let h = harness(State::Off).await;
    let id = h.test_server(State::Off).await;
    h.cloud.panic_next("start");

    let err = h.orchestrator.start(OWNER, id).await.unwrap_err();
    assert!(matches!(err, ServerError::Internal(_)), "{:?}", err);

    let record = h.record(id).await;
    assert_eq!(record.state, State::Off);
    assert!(record.error.unwrap().contains("blew up"));

    h.cloud.script(&[State::Running]);
    assert_eq!(h.orchestrator.start(OWNER, id).await, Ok(State::Running));
    assert_eq!(h.events.count("cloud:start"), 2);
}

#[tokio::test]
async fn test_transitional_polls_refresh_the_rate() {
    let h = harness(State::Starting).await;
    let id = h.test_server(State::Starting).await;
    assert_eq!(h.record(id).await.cost_per_hour, 0.0);

    let err = h
        .orchestrator
        .wait_for_stable_state(OWNER, id, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Timeout { .. }));

    // Starting is priced as running; nothing is billed until it settles.
    assert_eq!(h.record(id).await.cost_per_hour, 1.0);
    assert!(h.ledger.states().is_empty());
}

#[tokio::test]
async fn test_backend_failure_is_recorded_and_state_requeried() {
    let h = harness(State::Off).await;
    let id = h.test_server(State::Off).await;
    h.cloud.fail_next("start", "quota exceeded");

    let err = h.orchestrator.start(OWNER, id).await.unwrap_err();
    assert_eq!(err, ServerError::Backend("quota exceeded".to_string()));

    let record = h.record(id).await;
    assert_eq!(record.error.as_deref(), Some("quota exceeded"));
    // The transitional marker was replaced by the live state.
    assert_eq!(record.state, State::Off);
    assert!(h.events.count("cloud:state") >= 1);

    // A new attempt clears the stale error.
    h.cloud.script(&[State::Running]);
    assert_eq!(h.orchestrator.start(OWNER, id).await, Ok(State::Running));
    assert_eq!(h.record(id).await.error, None);
}

#[tokio::test]
async fn test_flaky_state_query_is_retried() {
    let h = harness(State::Off).await;
    let id = h.test_server(State::Off).await;
    h.cloud.script(&[State::Running]);
    h.cloud.fail_next("state", "connection reset");

    assert_eq!(h.orchestrator.start(OWNER, id).await, Ok(State::Running));
    assert_eq!(h.record(id).await.error, None);
}

#[tokio::test]
async fn test_unsupported_capability_fails_before_any_mutation() {
    let h = harness_with(State::Running, |cloud| cloud.without(Capability::Suspend), true).await;
    let id = h.test_server(State::Running).await;

    let err = h.orchestrator.suspend(OWNER, id).await.unwrap_err();
    assert!(matches!(err, ServerError::Unsupported { .. }));
    assert!(h.events.all().is_empty());
    assert_eq!(h.record(id).await.state, State::Running);
}

#[tokio::test]
async fn test_onprem_cannot_suspend() {
    let h = harness(State::Off).await;
    let id = h
        .server(
            State::Running,
            stratus::Configuration::Onprem(Default::default()),
        )
        .await;

    let err = h.orchestrator.suspend(OWNER, id).await.unwrap_err();
    assert_eq!(
        err,
        ServerError::Unsupported {
            cloud: stratus::Cloud::Onprem,
            capability: "suspend".to_string(),
        }
    );
}

#[tokio::test]
async fn test_invalid_transition_is_rejected() {
    let h = harness(State::Off).await;
    let id = h.test_server(State::Off).await;

    let err = h.orchestrator.suspend(OWNER, id).await.unwrap_err();
    assert!(matches!(err, ServerError::InvalidState { state: State::Off, .. }));
    assert_eq!(h.events.count("cloud:suspend"), 0);
    assert_eq!(h.record(id).await.error, None);
}

#[tokio::test]
async fn test_start_when_running_only_refreshes() {
    let h = harness(State::Running).await;
    let id = h.test_server(State::Running).await;

    assert_eq!(h.orchestrator.start(OWNER, id).await, Ok(State::Running));
    assert_eq!(h.events.all(), vec!["cloud:state".to_string()]);
}

#[tokio::test]
async fn test_wait_for_stable_state_times_out() {
    let h = harness(State::Starting).await;
    let id = h.test_server(State::Starting).await;

    let began = Instant::now();
    let err = h
        .orchestrator
        .wait_for_stable_state(OWNER, id, Duration::from_millis(200))
        .await
        .unwrap_err();
    let elapsed = began.elapsed();

    assert!(matches!(
        err,
        ServerError::Timeout {
            last: State::Starting,
            ..
        }
    ));
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_wait_for_stable_state_abandons_hung_query() {
    let h = harness_with(
        State::Starting,
        |cloud| cloud.with_state_delay(Duration::from_secs(30)),
        true,
    )
    .await;
    let id = h.test_server(State::Starting).await;

    let began = Instant::now();
    let err = h
        .orchestrator
        .wait_for_stable_state(OWNER, id, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Timeout { .. }));
    assert!(began.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_reboot_returns_without_waiting() {
    let h = harness(State::Running).await;
    let id = h.test_server(State::Running).await;
    h.cloud.script(&[State::Starting]);

    let state = h.orchestrator.reboot(OWNER, id).await.unwrap();
    assert_eq!(state, State::Starting);
    assert_eq!(h.events.count("cloud:reboot"), 1);
    assert_eq!(h.events.count("cloud:state"), 1);
    assert_eq!(h.record(id).await.state, State::Starting);
    // Starting is priced as running.
    assert_eq!(h.record(id).await.cost_per_hour, 1.0);
}

#[tokio::test]
async fn test_suspend_and_resume() {
    let h = harness(State::Running).await;
    let id = h.test_server(State::Running).await;

    h.cloud.script(&[State::Suspending, State::Suspended]);
    assert_eq!(h.orchestrator.suspend(OWNER, id).await, Ok(State::Suspended));
    assert_eq!(h.record(id).await.cost_per_hour, 0.2);

    h.cloud.script(&[State::Running]);
    assert_eq!(h.orchestrator.resume(OWNER, id).await, Ok(State::Running));
    assert_eq!(h.ledger.states(), vec![State::Suspended, State::Running]);
}

#[tokio::test]
async fn test_dns_follows_start_and_stop() {
    let h = harness(State::Off).await;
    let id = h
        .server(State::Off, test_configuration(Some("gpu1.example.com")))
        .await;

    h.cloud.script(&[State::Running]);
    h.orchestrator.start(OWNER, id).await.unwrap();
    h.cloud.script(&[State::Off]);
    h.orchestrator.stop(OWNER, id).await.unwrap();

    let changes = h.dns.changes.lock().unwrap().clone();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].previous_name, None);
    assert_eq!(changes[0].name.as_deref(), Some("gpu1.example.com"));
    assert_eq!(changes[1].previous_name.as_deref(), Some("gpu1.example.com"));
    assert_eq!(changes[1].name, None);
}

#[tokio::test]
async fn test_ledger_failure_does_not_fail_operation() {
    let h = harness(State::Off).await;
    let id = h.test_server(State::Off).await;
    *h.ledger.fail.lock().unwrap() = true;
    h.cloud.script(&[State::Running]);

    assert_eq!(h.orchestrator.start(OWNER, id).await, Ok(State::Running));
    assert_eq!(h.events.count("ledger:running"), 1);
    assert_eq!(h.record(id).await.error, None);
}

#[tokio::test]
async fn test_only_owner_may_mutate() {
    let h = harness(State::Off).await;
    let id = h.test_server(State::Off).await;

    let err = h.orchestrator.start("mallory", id).await.unwrap_err();
    assert!(matches!(err, ServerError::Unauthorized { .. }));

    h.store.add_collaborator(PROJECT, "bob").await.unwrap();
    assert_eq!(h.orchestrator.state("bob", id).await, Ok(State::Off));
    let err = h.orchestrator.stop("bob", id).await.unwrap_err();
    assert!(matches!(err, ServerError::Unauthorized { action: "modify", .. }));

    assert!(h.events.count("cloud:start") == 0 && h.events.count("cloud:stop") == 0);
}

#[tokio::test]
async fn test_unknown_server() {
    let h = harness(State::Off).await;
    let err = h.orchestrator.start(OWNER, 404).await.unwrap_err();
    assert_eq!(err, ServerError::NotFound(404));
}

#[tokio::test]
async fn test_network_usage_window_must_be_ordered() {
    let h = harness(State::Running).await;
    let id = h.test_server(State::Running).await;
    let now = chrono::Utc::now();
    let err = h
        .orchestrator
        .network_usage(OWNER, id, now, now - chrono::Duration::hours(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Validation(_)));
}

#[tokio::test]
async fn test_drift_after_configuration_change() {
    let h = harness(State::Off).await;
    let id = h.test_server(State::Off).await;
    assert!(h.orchestrator.drift(OWNER, id).await.unwrap().is_empty());

    h.cloud.script(&[State::Running]);
    h.orchestrator.start(OWNER, id).await.unwrap();
    assert!(h.orchestrator.drift(OWNER, id).await.unwrap().is_empty());

    h.orchestrator
        .set_configuration(OWNER, id, &common::changes(serde_json::json!({"dns": "a.example.com"})))
        .await
        .unwrap();
    let drift = h.orchestrator.drift(OWNER, id).await.unwrap();
    assert_eq!(drift.len(), 1);
    assert_eq!(drift[0].key, "dns");
    assert_eq!(drift[0].drift_type, stratus::drift::DriftType::Added);
}
