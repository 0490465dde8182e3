//! Load coordinator tests: fault isolation, cancellation, and end-to-end runs

use async_trait::async_trait;
use db_shootout::config::{ExperimentConfig, ReadinessPolicy};
use db_shootout::environment::runtime::ContainerRuntime;
use db_shootout::load::{
    DriverFactory, InProcessDriverFactory, LoadCoordinator, LoadPlan, SessionConfig, SessionDriver, SessionState,
};
use db_shootout::orchestrator::ExperimentOrchestrator;
use db_shootout::selector::FixedSelector;
use db_shootout::simulated::{MemoryDriver, MemoryRuntime};
use db_shootout::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    Healthy,
    FailOnRefresh,
    Panic,
    CannotCreate,
}

/// Factory whose drivers behave per session id
#[derive(Default)]
struct ScriptedFactory {
    behaviours: HashMap<String, Behaviour>,
    created: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedFactory {
    fn with(mut self, session: &str, behaviour: Behaviour) -> Self {
        self.behaviours.insert(session.to_string(), behaviour);
        self
    }
}

impl DriverFactory for ScriptedFactory {
    fn create(&self, session_id: &str, query: Option<&str>) -> Result<Box<dyn SessionDriver>> {
        self.created
            .lock()
            .push((session_id.to_string(), query.map(ToString::to_string)));
        let behaviour = self.behaviours.get(session_id).copied().unwrap_or(Behaviour::Healthy);
        if behaviour == Behaviour::CannotCreate {
            return Err(Error::Session("browser failed to launch".to_string()));
        }
        Ok(Box::new(ScriptedDriver { behaviour }))
    }
}

struct ScriptedDriver {
    behaviour: Behaviour,
}

#[async_trait]
impl SessionDriver for ScriptedDriver {
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn refresh(&mut self) -> Result<()> {
        match self.behaviour {
            Behaviour::FailOnRefresh => Err(Error::Session("connection reset".to_string())),
            Behaviour::Panic => panic!("driver bug"),
            _ => Ok(()),
        }
    }

    async fn start_auto_refresh(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stop_auto_refresh(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) {}
}

fn plan(sessions: usize) -> LoadPlan {
    LoadPlan::new(
        sessions,
        SessionConfig::manual(Duration::from_secs(3), Duration::from_secs(1)),
    )
}

#[tokio::test(start_paused = true)]
async fn test_all_sessions_complete() {
    let coordinator = LoadCoordinator::new(plan(5), Arc::new(ScriptedFactory::default())).unwrap();

    let outcome = coordinator.run().await;

    assert_eq!(outcome.completed, 5);
    assert!(outcome.all_completed());
    assert!(outcome.triggers() >= 5);
    assert!(outcome.elapsed >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_failures_do_not_affect_siblings() {
    let factory = ScriptedFactory::default()
        .with("session-2", Behaviour::FailOnRefresh)
        .with("session-3", Behaviour::Panic)
        .with("session-4", Behaviour::CannotCreate);
    let coordinator = LoadCoordinator::new(plan(6), Arc::new(factory)).unwrap();

    let outcome = coordinator.run().await;

    assert_eq!(outcome.completed, 3);
    assert_eq!(outcome.failed, 3);
    assert!(!outcome.all_completed());

    let state_of = |id: &str| outcome.reports.iter().find(|r| r.id == id).map(|r| r.state);
    assert_eq!(state_of("session-1"), Some(SessionState::Completed));
    assert_eq!(state_of("session-2"), Some(SessionState::Failed));
    assert_eq!(state_of("session-3"), Some(SessionState::Failed));
    assert_eq!(state_of("session-4"), Some(SessionState::Failed));
    assert_eq!(state_of("session-6"), Some(SessionState::Completed));
}

#[tokio::test(start_paused = true)]
async fn test_stop_handle_cancels_every_session() {
    let plan = LoadPlan::new(
        4,
        SessionConfig::manual(Duration::from_secs(600), Duration::from_secs(1)),
    );
    let coordinator = Arc::new(LoadCoordinator::new(plan, Arc::new(ScriptedFactory::default())).unwrap());
    let stop = coordinator.stop_handle();

    let runner = Arc::clone(&coordinator);
    let run = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_secs(2)).await;
    stop.stop_all();

    let outcome = run.await.unwrap();
    assert_eq!(outcome.cancelled, 4);
    assert!(outcome.elapsed < Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_queries_assigned_round_robin() {
    let factory = Arc::new(ScriptedFactory::default());
    let plan = plan(4).with_queries(vec!["q-a".to_string(), "q-b".to_string(), "q-c".to_string()]);
    let coordinator = LoadCoordinator::new(plan, Arc::clone(&factory) as Arc<dyn DriverFactory>).unwrap();

    coordinator.run().await;

    let mut created = factory.created.lock().clone();
    created.sort();
    assert_eq!(
        created,
        vec![
            ("session-1".to_string(), Some("q-a".to_string())),
            ("session-2".to_string(), Some("q-b".to_string())),
            ("session-3".to_string(), Some("q-c".to_string())),
            ("session-4".to_string(), Some("q-a".to_string())),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_pool_size_bounds_concurrency() {
    let coordinator = LoadCoordinator::new(plan(4).with_pool_size(2), Arc::new(ScriptedFactory::default())).unwrap();

    let outcome = coordinator.run().await;

    assert_eq!(outcome.completed, 4);
    assert!(outcome.elapsed >= Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_in_process_sessions_drive_orchestrator() {
    let config = ExperimentConfig::default()
        .with_row_count(100)
        .with_readiness(ReadinessPolicy {
            attempts: 1,
            interval: Duration::from_millis(1),
        });
    let orchestrator = Arc::new(ExperimentOrchestrator::new(
        config,
        Arc::new(MemoryRuntime::new()),
        Arc::new(MemoryDriver::new()),
        Arc::new(FixedSelector::new("mariadb")),
    ));
    let plan = LoadPlan::new(
        3,
        SessionConfig::manual(Duration::from_secs(2), Duration::from_secs(1)),
    )
    .with_queries(vec!["SELECT COUNT(*) FROM test_table".to_string()]);
    let factory = InProcessDriverFactory::new(Arc::clone(&orchestrator));
    let coordinator = LoadCoordinator::new(plan, Arc::new(factory)).unwrap();

    let outcome = coordinator.run().await;

    assert!(outcome.all_completed());
    for report in &outcome.reports {
        let history = orchestrator.history(&report.id);
        assert_eq!(history.len() as u64, report.triggers);
        assert!(history.iter().all(|r| r.query == "SELECT COUNT(*) FROM test_table"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_in_process_session_fails_after_shutdown() {
    let orchestrator = Arc::new(ExperimentOrchestrator::new(
        ExperimentConfig::default().with_row_count(10),
        Arc::new(MemoryRuntime::new()),
        Arc::new(MemoryDriver::new()),
        Arc::new(FixedSelector::new("postgres")),
    ));
    orchestrator.shutdown().await;

    let factory = InProcessDriverFactory::new(Arc::clone(&orchestrator));
    let coordinator = LoadCoordinator::new(plan(1), Arc::new(factory)).unwrap();
    let outcome = coordinator.run().await;

    assert_eq!(outcome.failed, 1);
    assert!(outcome.reports[0].error.as_deref().unwrap().contains("shut down"));
}

#[tokio::test]
async fn test_invalid_plan_rejected_before_provisioning() {
    let runtime = Arc::new(MemoryRuntime::new());
    let orchestrator = Arc::new(ExperimentOrchestrator::new(
        ExperimentConfig::default().with_row_count(10),
        Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        Arc::new(MemoryDriver::new()),
        Arc::new(FixedSelector::new("postgres")),
    ));
    let factory = Arc::new(InProcessDriverFactory::new(Arc::clone(&orchestrator)));

    for plan in [
        LoadPlan::new(0, SessionConfig::auto(Duration::from_secs(1))),
        LoadPlan::new(2, SessionConfig::manual(Duration::from_secs(1), Duration::ZERO)),
    ] {
        let err = LoadCoordinator::new(plan, Arc::clone(&factory) as Arc<dyn DriverFactory>).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    assert_eq!(runtime.run_count("postgres-test"), 0);
    assert_eq!(runtime.run_count("mariadb-test"), 0);
    assert!(!orchestrator.is_ready());
}
