//! Dispatch-engine integration tests over the in-memory fakes: local and
//! cross-replica fulfillment, supervisor failures, timeouts, and the
//! worker-lifecycle invariants.

mod support;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sim_operator::dispatcher::Dispatcher;
use sim_operator::orchestrator::{worker_name, WorkerPhase};
use sim_operator::substrate::{result_key, Substrate};
use sim_operator::OperatorError;

use support::{
    correlation_id_of, run_config, test_config, wait_for, InMemoryOrchestrator, InMemorySubstrate,
};

fn dispatcher_with(
    orchestrator: &Arc<InMemoryOrchestrator>,
    substrate: &Arc<InMemorySubstrate>,
) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        Arc::clone(orchestrator) as Arc<dyn sim_operator::orchestrator::Orchestrator>,
        Arc::clone(substrate) as Arc<dyn Substrate>,
        test_config(),
    ))
}

#[tokio::test]
async fn happy_path_fulfills_locally() {
    let orchestrator = Arc::new(InMemoryOrchestrator::default());
    let substrate = Arc::new(InMemorySubstrate::default());
    let dispatcher = dispatcher_with(&orchestrator, &substrate);

    let run = tokio::spawn({
        let dispatcher = Arc::clone(&dispatcher);
        async move { dispatcher.run_experiment(run_config()).await }
    });

    wait_for(|| dispatcher.pending_requests() == 1).await;
    let spec = orchestrator.created_specs().remove(0);
    let correlation_id = correlation_id_of(&spec);

    dispatcher.spawn_success_delivery(correlation_id.clone(), b"tarball-bytes".to_vec());

    let result = run.await.unwrap().expect("experiment should succeed");
    assert_eq!(result.pdb_id, "1aki");
    assert_eq!(result.data, b"tarball-bytes");

    // Exactly one worker created, exactly one deletion attempted.
    assert_eq!(orchestrator.created_count(), 1);
    assert_eq!(orchestrator.deleted_names(), vec![spec.name.clone()]);
    assert_eq!(dispatcher.pending_requests(), 0);
    // Local delivery never touched the substrate.
    assert_eq!(substrate.entry_count(), 0);
}

#[tokio::test]
async fn worker_error_surfaces_verbatim() {
    let orchestrator = Arc::new(InMemoryOrchestrator::default());
    let substrate = Arc::new(InMemorySubstrate::default());
    let dispatcher = dispatcher_with(&orchestrator, &substrate);

    let run = tokio::spawn({
        let dispatcher = Arc::clone(&dispatcher);
        async move { dispatcher.run_experiment(run_config()).await }
    });

    wait_for(|| dispatcher.pending_requests() == 1).await;
    let correlation_id = correlation_id_of(&orchestrator.created_specs()[0]);

    dispatcher
        .fail_experiment(&correlation_id, "pdb 'abcd' not found")
        .await
        .unwrap();

    let error = run.await.unwrap().expect_err("experiment should fail");
    assert!(matches!(error, OperatorError::Worker(_)));
    assert_eq!(error.to_string(), "pdb 'abcd' not found");
    assert_eq!(orchestrator.deleted_names().len(), 1);
}

#[tokio::test]
async fn timeout_tears_down_worker_and_registry() {
    let orchestrator = Arc::new(InMemoryOrchestrator::default());
    let substrate = Arc::new(InMemorySubstrate::default());
    let mut config = test_config();
    config.request_timeout = Duration::from_millis(500);
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&orchestrator) as Arc<dyn sim_operator::orchestrator::Orchestrator>,
        Arc::clone(&substrate) as Arc<dyn Substrate>,
        config,
    ));

    let error = dispatcher
        .run_experiment(run_config())
        .await
        .expect_err("nothing ever completes this request");
    assert!(matches!(error, OperatorError::Timeout(_)));
    assert_eq!(error.to_string(), "timed out after 500ms");

    assert_eq!(orchestrator.created_count(), 1);
    assert_eq!(orchestrator.deleted_names().len(), 1);
    assert_eq!(dispatcher.pending_requests(), 0);
}

#[tokio::test]
async fn failed_worker_phase_fails_the_request() {
    let orchestrator = Arc::new(InMemoryOrchestrator::default());
    orchestrator.set_phase(WorkerPhase::Failed);
    let substrate = Arc::new(InMemorySubstrate::default());
    let dispatcher = dispatcher_with(&orchestrator, &substrate);

    let started = std::time::Instant::now();
    let error = dispatcher
        .run_experiment(run_config())
        .await
        .expect_err("supervisor should fail the request");
    assert_eq!(error.to_string(), "encountered unexpected phase 'Failed'");
    // Within roughly one poll interval, far before the request timeout.
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(orchestrator.deleted_names().len(), 1);
    assert_eq!(dispatcher.pending_requests(), 0);
}

#[tokio::test]
async fn unknown_worker_phase_fails_the_request() {
    let orchestrator = Arc::new(InMemoryOrchestrator::default());
    orchestrator.set_phase(WorkerPhase::Unknown("Evicted".to_string()));
    let substrate = Arc::new(InMemorySubstrate::default());
    let dispatcher = dispatcher_with(&orchestrator, &substrate);

    let error = dispatcher
        .run_experiment(run_config())
        .await
        .expect_err("supervisor should fail the request");
    assert_eq!(error.to_string(), "encountered unexpected phase 'Evicted'");
}

#[tokio::test]
async fn create_failure_is_surfaced_with_nothing_to_clean() {
    let orchestrator = Arc::new(InMemoryOrchestrator::default());
    orchestrator.fail_creates();
    let substrate = Arc::new(InMemorySubstrate::default());
    let dispatcher = dispatcher_with(&orchestrator, &substrate);

    let error = dispatcher
        .run_experiment(run_config())
        .await
        .expect_err("create should fail");
    assert!(matches!(error, OperatorError::Orchestrator(_)));
    assert_eq!(dispatcher.pending_requests(), 0);
    assert!(orchestrator.deleted_names().is_empty());
}

#[tokio::test]
async fn cross_replica_success_is_relayed() {
    let substrate = Arc::new(InMemorySubstrate::default());
    let orchestrator_a = Arc::new(InMemoryOrchestrator::default());
    let orchestrator_b = Arc::new(InMemoryOrchestrator::default());
    let replica_a = dispatcher_with(&orchestrator_a, &substrate);
    let replica_b = dispatcher_with(&orchestrator_b, &substrate);

    let _listener_a = replica_a.start_relay_listener().await.unwrap();
    let _listener_b = replica_b.start_relay_listener().await.unwrap();

    let run = tokio::spawn({
        let replica_a = Arc::clone(&replica_a);
        async move { replica_a.run_experiment(run_config()).await }
    });

    wait_for(|| replica_a.pending_requests() == 1).await;
    let correlation_id = correlation_id_of(&orchestrator_a.created_specs()[0]);

    // The worker's callback lands on replica B, which has no local entry.
    replica_b.spawn_success_delivery(correlation_id.clone(), b"relayed-bytes".to_vec());

    let result = run.await.unwrap().expect("relay should complete the run");
    assert_eq!(result.data, b"relayed-bytes");
    // The payload was consumed exactly once.
    assert!(!substrate.has_key(&result_key(&correlation_id)));
    assert_eq!(replica_a.pending_requests(), 0);
    assert_eq!(replica_b.pending_requests(), 0);
}

#[tokio::test]
async fn cross_replica_error_is_relayed() {
    let substrate = Arc::new(InMemorySubstrate::default());
    let orchestrator_a = Arc::new(InMemoryOrchestrator::default());
    let orchestrator_b = Arc::new(InMemoryOrchestrator::default());
    let replica_a = dispatcher_with(&orchestrator_a, &substrate);
    let replica_b = dispatcher_with(&orchestrator_b, &substrate);

    let _listener_a = replica_a.start_relay_listener().await.unwrap();

    let run = tokio::spawn({
        let replica_a = Arc::clone(&replica_a);
        async move { replica_a.run_experiment(run_config()).await }
    });

    wait_for(|| replica_a.pending_requests() == 1).await;
    let correlation_id = correlation_id_of(&orchestrator_a.created_specs()[0]);

    replica_b
        .fail_experiment(&correlation_id, "model \"1\" not found in \"broken\", options are []")
        .await
        .unwrap();

    let error = run.await.unwrap().expect_err("relayed error should fail the run");
    assert_eq!(
        error.to_string(),
        "model \"1\" not found in \"broken\", options are []"
    );
    assert!(!substrate.has_key(&result_key(&correlation_id)));
}

#[tokio::test]
async fn relay_for_unknown_correlation_is_dropped_and_payload_kept() {
    let substrate = Arc::new(InMemorySubstrate::default());
    let orchestrator = Arc::new(InMemoryOrchestrator::default());
    let dispatcher = dispatcher_with(&orchestrator, &substrate);
    let _listener = dispatcher.start_relay_listener().await.unwrap();

    // Simulate another replica fulfilling a request nobody here owns.
    let key = result_key("00000000-dead-beef-0000-000000000000");
    substrate
        .set_and_publish(
            &key,
            b"payload",
            Duration::from_secs(60),
            sim_operator::substrate::RESULT_TOPIC,
            "00000000-dead-beef-0000-000000000000",
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    // Dropped locally; the payload stays for its TTL.
    assert_eq!(dispatcher.pending_requests(), 0);
    assert!(substrate.has_key(&key));
}

#[tokio::test]
async fn late_callback_after_timeout_goes_remote_without_leaking() {
    let orchestrator = Arc::new(InMemoryOrchestrator::default());
    let substrate = Arc::new(InMemorySubstrate::default());
    let mut config = test_config();
    config.request_timeout = Duration::from_millis(100);
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&orchestrator) as Arc<dyn sim_operator::orchestrator::Orchestrator>,
        Arc::clone(&substrate) as Arc<dyn Substrate>,
        config,
    ));

    let error = dispatcher.run_experiment(run_config()).await.unwrap_err();
    assert!(matches!(error, OperatorError::Timeout(_)));

    let correlation_id = correlation_id_of(&orchestrator.created_specs()[0]);
    dispatcher.spawn_success_delivery(correlation_id.clone(), b"too late".to_vec());

    wait_for(|| substrate.has_key(&result_key(&correlation_id))).await;
    assert_eq!(dispatcher.pending_requests(), 0);
}

#[tokio::test]
async fn seed_zero_is_normalized_in_the_worker_command() {
    let orchestrator = Arc::new(InMemoryOrchestrator::default());
    let substrate = Arc::new(InMemorySubstrate::default());
    let dispatcher = dispatcher_with(&orchestrator, &substrate);

    let run = tokio::spawn({
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            let mut config = run_config();
            config.seed = 0;
            dispatcher.run_experiment(config).await
        }
    });

    wait_for(|| orchestrator.created_count() == 1).await;
    let spec = orchestrator.created_specs().remove(0);
    let seed_pos = spec.command.iter().position(|a| a == "--seed").unwrap();
    assert_eq!(spec.command[seed_pos + 1], "-1");

    dispatcher.spawn_success_delivery(correlation_id_of(&spec), Vec::new());
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_get_unique_workers_and_single_delivery() {
    const REQUESTS: usize = 8;

    let orchestrator = Arc::new(InMemoryOrchestrator::default());
    let substrate = Arc::new(InMemorySubstrate::default());
    let dispatcher = dispatcher_with(&orchestrator, &substrate);

    let mut runs = Vec::new();
    for _ in 0..REQUESTS {
        runs.push(tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.run_experiment(run_config()).await }
        }));
    }

    wait_for(|| dispatcher.pending_requests() == REQUESTS).await;

    let specs = orchestrator.created_specs();
    let names: HashSet<String> = specs.iter().map(|spec| spec.name.clone()).collect();
    assert_eq!(names.len(), REQUESTS, "worker names must not collide");
    for spec in &specs {
        let correlation_id = correlation_id_of(spec);
        assert_eq!(
            spec.name,
            worker_name(&spec.app_label, "1aki", &correlation_id)
        );
        // Each request gets its own correlation id back as payload.
        dispatcher.spawn_success_delivery(correlation_id.clone(), correlation_id.into_bytes());
    }

    let mut seen = HashSet::new();
    for run in runs {
        let result = run.await.unwrap().expect("all requests should complete");
        assert!(seen.insert(result.data), "payloads must pair one-to-one");
    }
    assert_eq!(orchestrator.deleted_names().len(), REQUESTS);
    assert_eq!(dispatcher.pending_requests(), 0);
}

#[tokio::test]
async fn remote_fulfillment_failure_is_swallowed_for_success_callbacks() {
    let orchestrator = Arc::new(InMemoryOrchestrator::default());
    let substrate = Arc::new(InMemorySubstrate::default());
    substrate.fail_writes();
    let dispatcher = dispatcher_with(&orchestrator, &substrate);

    // No pending entry, so delivery goes remote and fails; that must stay
    // an internal log line, not a panic or a hang.
    dispatcher.spawn_success_delivery("no-such-id".to_string(), b"data".to_vec());
    dispatcher.shutdown().await;
    assert_eq!(substrate.entry_count(), 0);
}

#[tokio::test]
async fn prune_workers_reports_without_deleting() {
    let orchestrator = Arc::new(InMemoryOrchestrator::default());
    let substrate = Arc::new(InMemorySubstrate::default());
    let dispatcher = dispatcher_with(&orchestrator, &substrate);

    let run = tokio::spawn({
        let dispatcher = Arc::clone(&dispatcher);
        async move { dispatcher.run_experiment(run_config()).await }
    });
    wait_for(|| orchestrator.created_count() == 1).await;

    dispatcher.prune_workers().await.unwrap();
    // The survey must not have deleted anything.
    assert!(orchestrator.deleted_names().is_empty());

    let correlation_id = correlation_id_of(&orchestrator.created_specs()[0]);
    dispatcher.spawn_success_delivery(correlation_id, Vec::new());
    run.await.unwrap().unwrap();
}
