//! Orchestrator lifecycle, routing, and history tests against in-memory backends

use db_shootout::config::{ExperimentConfig, ReadinessPolicy};
use db_shootout::environment::runtime::{ContainerRuntime, ContainerStatus};
use db_shootout::environment::EnvironmentState;
use db_shootout::orchestrator::ExperimentOrchestrator;
use db_shootout::query::driver::SqlDriver;
use db_shootout::query::{QueryDispatcher, SqlValue};
use db_shootout::selector::{FixedSelector, LocalSplitSelector, VariantSelector, QUERY_EXECUTION_METRIC};
use db_shootout::simulated::{MemoryDriver, MemoryRuntime};
use db_shootout::{Error, Variant};
use std::sync::Arc;
use std::time::Duration;

const COUNT_QUERY: &str = "SELECT COUNT(*) FROM test_table";

struct Harness {
    runtime: Arc<MemoryRuntime>,
    driver: Arc<MemoryDriver>,
    orchestrator: Arc<ExperimentOrchestrator>,
}

fn config(rows: usize) -> ExperimentConfig {
    ExperimentConfig::default()
        .with_row_count(rows)
        .with_readiness(ReadinessPolicy {
            attempts: 3,
            interval: Duration::from_millis(1),
        })
}

fn harness_with(config: ExperimentConfig, runtime: MemoryRuntime, selector: Arc<dyn VariantSelector>) -> Harness {
    let runtime = Arc::new(runtime);
    let driver = Arc::new(MemoryDriver::new());
    let orchestrator = Arc::new(ExperimentOrchestrator::new(
        config,
        Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        Arc::clone(&driver) as Arc<dyn SqlDriver>,
        selector,
    ));
    Harness {
        runtime,
        driver,
        orchestrator,
    }
}

fn harness(rows: usize, selector: impl VariantSelector + 'static) -> Harness {
    harness_with(config(rows), MemoryRuntime::new(), Arc::new(selector))
}

async fn count(orchestrator: &ExperimentOrchestrator, variant: Variant) -> Option<i64> {
    QueryDispatcher::new()
        .execute(orchestrator.environment(variant), COUNT_QUERY)
        .await
        .ok()
        .and_then(|r| r.scalar().and_then(SqlValue::as_i64))
}

async fn count_err(orchestrator: &ExperimentOrchestrator, variant: Variant) -> Option<Error> {
    QueryDispatcher::new()
        .execute(orchestrator.environment(variant), COUNT_QUERY)
        .await
        .err()
}

// ============================================================================
// ensure_ready
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ensure_ready_provisions_and_seeds_once() {
    let h = harness_with(
        config(2500),
        MemoryRuntime::new().with_start_delay(Duration::from_millis(20)),
        Arc::new(LocalSplitSelector::default()),
    );

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let orchestrator = Arc::clone(&h.orchestrator);
            tokio::spawn(async move { orchestrator.ensure_ready().await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    for (variant, container) in [(Variant::Postgres, "postgres-test"), (Variant::MariaDb, "mariadb-test")] {
        assert_eq!(h.runtime.run_count(container), 1, "{variant} started more than once");
        assert_eq!(h.driver.create_count(variant), 1, "{variant} seeded more than once");
        assert_eq!(h.driver.insert_batch_count(variant), 3);
        assert_eq!(h.orchestrator.environment(variant).state(), EnvironmentState::Ready);
    }
    assert!(h.orchestrator.is_ready());
}

#[tokio::test]
async fn test_row_count_matches_on_both_variants() {
    let h = harness(1000, LocalSplitSelector::default());
    h.orchestrator.ensure_ready().await.unwrap();

    assert_eq!(count(&h.orchestrator, Variant::Postgres).await, Some(1000));
    assert_eq!(count(&h.orchestrator, Variant::MariaDb).await, Some(1000));
}

#[tokio::test]
async fn test_both_variants_hold_identical_rows() {
    let h = harness(250, LocalSplitSelector::default());
    h.orchestrator.ensure_ready().await.unwrap();

    let postgres = h.driver.rows(Variant::Postgres).unwrap();
    let mariadb = h.driver.rows(Variant::MariaDb).unwrap();
    assert_eq!(postgres.len(), 250);
    assert_eq!(postgres, mariadb);

    let h = &h;
    let sum = |variant| async move {
        QueryDispatcher::new()
            .execute(h.orchestrator.environment(variant), "SELECT SUM(value) FROM test_table")
            .await
            .unwrap()
            .scalar()
            .and_then(SqlValue::as_f64)
            .unwrap()
    };
    let (pg_sum, my_sum) = (sum(Variant::Postgres).await, sum(Variant::MariaDb).await);
    assert!((pg_sum - my_sum).abs() < f64::EPSILON);
    assert!((pg_sum - 1.5 * f64::from(249 * 250 / 2)).abs() < 1e-6);
}

#[tokio::test]
async fn test_provisioning_failure_then_explicit_retry() {
    let h = harness(10, LocalSplitSelector::default());
    h.runtime.fail_runs(true);

    let err = h.orchestrator.ensure_ready().await.unwrap_err();
    assert!(matches!(err, Error::Provisioning { .. }));
    assert_eq!(h.orchestrator.environment(Variant::Postgres).state(), EnvironmentState::Failed);

    h.runtime.fail_runs(false);
    h.orchestrator.ensure_ready().await.unwrap();
    assert!(h.orchestrator.is_ready());
}

#[tokio::test]
async fn test_seeding_failure_leaves_dataset_unseeded_until_retry() {
    let h = harness(10, LocalSplitSelector::default());
    h.driver.fail_statements_containing("INSERT INTO");

    let err = h.orchestrator.ensure_ready().await.unwrap_err();
    assert!(matches!(err, Error::Seeding { .. }));
    assert!(!h.orchestrator.environment(Variant::Postgres).is_seeded());

    for variant in Variant::ALL {
        assert_eq!(h.orchestrator.environment(variant).state(), EnvironmentState::Failed);
    }
    assert!(matches!(
        count_err(&h.orchestrator, Variant::Postgres).await,
        Some(Error::NotReady {
            state: EnvironmentState::Failed,
            ..
        })
    ));

    h.driver.clear_failures();
    h.orchestrator.ensure_ready().await.unwrap();
    assert_eq!(h.orchestrator.environment(Variant::Postgres).state(), EnvironmentState::Ready);
    assert_eq!(count(&h.orchestrator, Variant::Postgres).await, Some(10));
    assert_eq!(h.runtime.run_count("postgres-test"), 1);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_failed_seeding() {
    let h = harness_with(
        config(2500),
        MemoryRuntime::new().with_start_delay(Duration::from_millis(20)),
        Arc::new(LocalSplitSelector::default()),
    );
    for variant in Variant::ALL {
        h.driver.set_latency(variant, Duration::from_millis(2));
    }
    h.driver.fail_statements_containing("INSERT INTO");

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let orchestrator = Arc::clone(&h.orchestrator);
            tokio::spawn(async move { orchestrator.ensure_ready().await })
        })
        .collect();
    for task in tasks {
        assert!(matches!(task.await.unwrap(), Err(Error::Seeding { .. })));
    }

    for variant in Variant::ALL {
        assert_eq!(h.driver.create_count(variant), 1, "{variant} seeded more than once");
    }
}

#[tokio::test]
async fn test_existing_stopped_containers_are_reused() {
    let runtime = MemoryRuntime::new();
    runtime.insert("postgres-test", ContainerStatus::Stopped);
    runtime.insert("mariadb-test", ContainerStatus::Running);
    let h = harness_with(config(10), runtime, Arc::new(LocalSplitSelector::default()));

    h.orchestrator.ensure_ready().await.unwrap();

    assert_eq!(h.runtime.run_count("postgres-test"), 0);
    assert_eq!(h.runtime.run_count("mariadb-test"), 0);
    assert_eq!(h.runtime.status_of("postgres-test"), ContainerStatus::Running);
}

// ============================================================================
// handle_request
// ============================================================================

#[tokio::test]
async fn test_request_lazily_prepares_and_records() {
    let selector = Arc::new(LocalSplitSelector::default());
    let h = harness_with(config(100), MemoryRuntime::new(), selector.clone());

    let outcome = h.orchestrator.handle_request("alice", Some(COUNT_QUERY)).await.unwrap();

    assert_eq!(outcome.variant, selector.bucket("alice", "db_performance_comparison"));
    assert_eq!(outcome.result.column_names, vec!["count".to_string()]);
    assert_eq!(outcome.history.len(), 1);
    assert_eq!(outcome.history[0].query, COUNT_QUERY);

    let tracked = selector.tracked();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].metric, QUERY_EXECUTION_METRIC);
    assert_eq!(tracked[0].metadata["database"], outcome.variant.label());
    assert_eq!(tracked[0].metadata["query"], COUNT_QUERY);
}

#[tokio::test]
async fn test_unknown_label_falls_back_to_default() {
    let config = config(1000).with_default_variant(Variant::MariaDb);
    let h = harness_with(config, MemoryRuntime::new(), Arc::new(FixedSelector::new("control")));

    let outcome = h.orchestrator.handle_request("alice", Some(COUNT_QUERY)).await.unwrap();

    assert_eq!(outcome.variant, Variant::MariaDb);
    assert_eq!(outcome.result.scalar().and_then(SqlValue::as_i64), Some(1000));
}

#[tokio::test]
async fn test_unavailable_selector_falls_back_to_default() {
    let h = harness(10, FixedSelector::unavailable());

    let outcome = h.orchestrator.handle_request("alice", None).await.unwrap();

    assert_eq!(outcome.variant, Variant::Postgres);
    assert!(h.orchestrator.config().sample_queries.contains(&outcome.query));
}

#[tokio::test]
async fn test_history_keeps_latest_ten_in_order() {
    let h = harness(10, FixedSelector::new("postgres"));

    for n in 0..15 {
        let query = format!("SELECT name FROM test_table WHERE id > {n}");
        let outcome = h.orchestrator.handle_request("alice", Some(&query)).await.unwrap();
        assert!(outcome.history.len() <= 10);
    }
    h.orchestrator.handle_request("bob", Some(COUNT_QUERY)).await.unwrap();

    let queries: Vec<String> = h.orchestrator.history("alice").into_iter().map(|r| r.query).collect();
    let expected: Vec<String> = (5..15)
        .map(|n| format!("SELECT name FROM test_table WHERE id > {n}"))
        .collect();
    assert_eq!(queries, expected);
    assert_eq!(h.orchestrator.history("bob").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_same_identity_lose_no_history() {
    let config = config(10).with_history_capacity(100);
    let h = harness_with(config, MemoryRuntime::new(), Arc::new(FixedSelector::new("mariadb")));
    h.orchestrator.ensure_ready().await.unwrap();

    let tasks: Vec<_> = (0..40)
        .map(|_| {
            let orchestrator = Arc::clone(&h.orchestrator);
            tokio::spawn(async move { orchestrator.handle_request("shared", Some(COUNT_QUERY)).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(h.orchestrator.history("shared").len(), 40);
}

#[tokio::test]
async fn test_query_error_is_local_to_request() {
    let h = harness(10, FixedSelector::new("postgres"));

    let err = h
        .orchestrator
        .handle_request("alice", Some("SELECT * FROM nowhere"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Query { variant: Variant::Postgres, .. }));
    assert!(h.orchestrator.environment(Variant::Postgres).is_ready());
    assert!(h.orchestrator.history("alice").is_empty());
    assert!(h.orchestrator.handle_request("alice", Some(COUNT_QUERY)).await.is_ok());
}

// ============================================================================
// shutdown
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_shutdown_tears_down_once() {
    let h = harness(10, LocalSplitSelector::default());
    h.orchestrator.ensure_ready().await.unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let orchestrator = Arc::clone(&h.orchestrator);
            tokio::spawn(async move { orchestrator.shutdown().await })
        })
        .collect();
    let mut performed = 0;
    for task in tasks {
        if task.await.unwrap() {
            performed += 1;
        }
    }

    assert_eq!(performed, 1);
    assert_eq!(h.runtime.remove_count("postgres-test"), 1);
    assert_eq!(h.runtime.remove_count("mariadb-test"), 1);
    assert!(!h.orchestrator.shutdown().await);
}

#[tokio::test]
async fn test_requests_after_shutdown_are_rejected() {
    let h = harness(10, LocalSplitSelector::default());
    h.orchestrator.ensure_ready().await.unwrap();
    h.orchestrator.shutdown().await;

    assert_eq!(
        h.orchestrator.handle_request("alice", Some(COUNT_QUERY)).await.unwrap_err(),
        Error::ShutDown
    );
    for variant in Variant::ALL {
        assert_eq!(h.orchestrator.environment(variant).state(), EnvironmentState::TornDown);
    }
}

#[tokio::test]
async fn test_shutdown_before_provisioning_is_harmless() {
    let h = harness(10, LocalSplitSelector::default());

    assert!(h.orchestrator.shutdown().await);
    assert_eq!(h.runtime.remove_count("postgres-test"), 0);
}

#[tokio::test]
async fn test_in_flight_query_fails_cleanly_when_backend_goes_away() {
    let h = harness(10, FixedSelector::new("postgres"));
    h.orchestrator.ensure_ready().await.unwrap();
    h.driver.set_latency(Variant::Postgres, Duration::from_millis(200));

    let orchestrator = Arc::clone(&h.orchestrator);
    let in_flight = tokio::spawn(async move { orchestrator.handle_request("alice", Some(COUNT_QUERY)).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.driver.set_offline(Variant::Postgres, true);
    assert!(h.orchestrator.shutdown().await);

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Query { variant: Variant::Postgres, .. }));
    assert!(h.orchestrator.history("alice").is_empty());
    assert_eq!(h.orchestrator.environment(Variant::Postgres).state(), EnvironmentState::TornDown);
}

#[tokio::test]
async fn test_statement_timeout_fails_request_only() {
    let h = harness_with(
        config(10).with_statement_timeout(Duration::from_millis(20)),
        MemoryRuntime::new(),
        Arc::new(FixedSelector::new("mariadb")),
    );
    h.orchestrator.ensure_ready().await.unwrap();
    h.driver.set_latency(Variant::MariaDb, Duration::from_millis(200));

    let err = h.orchestrator.handle_request("alice", Some(COUNT_QUERY)).await.unwrap_err();

    assert!(matches!(err, Error::Query { variant: Variant::MariaDb, .. }));
    assert_eq!(h.orchestrator.environment(Variant::MariaDb).state(), EnvironmentState::Ready);
    assert!(h.orchestrator.history("alice").is_empty());
}
