// tests/distributed_job_tests.rs
//
// Manager against real gRPC foremen running in this process on ephemeral
// ports, all benchmarking the same temp directory.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use fleet_bench::connection::{BackendFactory, ConnResult, Connection, ConnectionFactory};
use fleet_bench::error::{BenchError, ConfigErrorKind, ConnectionError};
use fleet_bench::foreman::{serve_with_shutdown, ForemanConfig, ForemanPhase, ForemanService, ForemanState};
use fleet_bench::order::{Assignment, ConnectionType, GeneratorType, Order, PhaseTiming, WorkOrder};
use fleet_bench::pb::foreman_client::ForemanClient;
use fleet_bench::pb::{foreman_message, manager_message};
use fleet_bench::phase::Stage;
use fleet_bench::report::FailureKind;
use fleet_bench::{pb, wire, Job, Manager, ManagerSettings};

/// Refuses every connection, as a foreman without access to the backend would.
struct DeniedFactory;

#[async_trait]
impl ConnectionFactory for DeniedFactory {
    async fn connect(&self, _order: &Order, target: &str) -> ConnResult<Arc<dyn Connection>> {
        Err(ConnectionError::PermissionDenied(format!("{target}: injected")))
    }
}

/// A backend whose puts and gets never return, like a wedged gateway.
struct StuckConnection;

#[async_trait]
impl Connection for StuckConnection {
    fn target(&self) -> &str {
        "stuck"
    }
    async fn create_namespace(&self) -> ConnResult<()> {
        Ok(())
    }
    async fn delete_namespace(&self) -> ConnResult<()> {
        Ok(())
    }
    async fn put(&self, _key: &str, _id: u64, _buf: &[u8]) -> ConnResult<()> {
        std::future::pending().await
    }
    async fn get(&self, _key: &str, _id: u64, _buf: &mut [u8]) -> ConnResult<()> {
        std::future::pending().await
    }
}

struct StuckFactory;

#[async_trait]
impl ConnectionFactory for StuckFactory {
    async fn connect(&self, _order: &Order, _target: &str) -> ConnResult<Arc<dyn Connection>> {
        Ok(Arc::new(StuckConnection))
    }
}

struct TestForeman {
    addr: String,
    state: ForemanState,
    // Dropping the sender stops the server.
    _shutdown: oneshot::Sender<()>,
}

async fn spawn_foreman(factory: Arc<dyn ConnectionFactory>) -> Result<TestForeman> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let service = ForemanService::new(
        factory,
        ForemanConfig {
            default_workers_per_target: 2,
        },
    );
    let state = service.state();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = serve_with_shutdown(listener, service, async {
            let _ = rx.await;
        })
        .await;
    });
    Ok(TestForeman {
        addr,
        state,
        _shutdown: tx,
    })
}

fn unused_addr() -> Result<String> {
    let l = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(l.local_addr()?.to_string())
}

fn file_order(root: &TempDir, objects: u64) -> Order {
    Order {
        job_id: 0,
        object_size: 2048,
        seed: 99,
        generator_type: GeneratorType::Prng,
        range_start: 0,
        range_end: objects,
        targets: vec![root.path().display().to_string()],
        connection_type: ConnectionType::File,
        bucket: "fleet".into(),
        credentials: Default::default(),
        port: 0,
        workers_per_target: 0,
        verify_content: true,
        cleanup: false,
    }
}

fn short_timing() -> PhaseTiming {
    PhaseTiming {
        ramp_up: Duration::from_millis(100),
        run_time: Duration::from_millis(400),
        ramp_down: Duration::from_millis(100),
    }
}

fn test_manager() -> Manager {
    Manager::new(ManagerSettings {
        connect_timeout: Duration::from_secs(2),
        configure_timeout: Duration::from_secs(10),
        report_grace: Duration::from_secs(10),
        cleanup_timeout: Duration::from_secs(10),
        ..ManagerSettings::default()
    })
}

async fn wait_for_idle(state: &ForemanState) -> bool {
    for _ in 0..100 {
        if state.get().await == ForemanPhase::Idle {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_failing_foreman_gives_partial_report() -> Result<()> {
    let root = TempDir::new()?;
    let good_a = spawn_foreman(Arc::new(BackendFactory::default())).await?;
    let good_b = spawn_foreman(Arc::new(BackendFactory::default())).await?;
    let bad = spawn_foreman(Arc::new(DeniedFactory)).await?;

    let servers = vec![good_a.addr.clone(), bad.addr.clone(), good_b.addr.clone()];
    let mut job = Job::new(file_order(&root, 300), servers, short_timing());
    test_manager().run(&mut job).await?;

    let report = job.report.as_ref().expect("partial job still reports");
    assert!(report.is_partial());
    assert_eq!(report.succeeded().count(), 2);

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].address, bad.addr);
    assert_eq!(
        failures[0].kind,
        FailureKind::Config(ConfigErrorKind::PermissionDenied)
    );

    let reads = report.measurement(Stage::Read);
    assert!(report.measurement(Stage::Write).successes > 0);
    assert!(reads.successes > 0);
    assert_eq!(reads.failures, 0, "{:?}", reads.first_error);
    assert_eq!(reads.correctness_failures(), 0);

    let doc = report.to_document();
    assert_eq!(doc.foremen.len(), 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_foremen_unreachable_is_total_failure() -> Result<()> {
    let root = TempDir::new()?;
    let servers = vec![unused_addr()?, unused_addr()?];
    let mut job = Job::new(file_order(&root, 100), servers.clone(), short_timing());

    match test_manager().run(&mut job).await {
        Err(BenchError::TotalJobFailure { failures }) => {
            assert_eq!(failures.len(), 2);
            for f in &failures {
                assert!(servers.contains(&f.address));
                assert_eq!(f.kind, FailureKind::Network, "{f}");
            }
        }
        other => panic!("expected total failure, got {other:?}"),
    }
    assert!(job.report.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_busy_foreman_rejects_second_order() -> Result<()> {
    let root = TempDir::new()?;
    let foreman = spawn_foreman(Arc::new(BackendFactory::default())).await?;

    // Another manager's job holds the foreman.
    foreman.state.try_claim().await.expect("fresh foreman is idle");

    let mut job = Job::new(file_order(&root, 50), vec![foreman.addr.clone()], short_timing());
    match test_manager().run(&mut job).await {
        Err(BenchError::TotalJobFailure { failures }) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].kind, FailureKind::Config(ConfigErrorKind::Busy));
        }
        other => panic!("expected busy rejection, got {other:?}"),
    }

    // Once released it takes work again, and goes back to idle afterwards.
    foreman.state.reset("test released").await;
    test_manager().run(&mut job).await?;
    assert!(job.report.is_some());
    assert!(wait_for_idle(&foreman.state).await, "foreman did not return to idle");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cleanup_removes_the_namespace() -> Result<()> {
    let root = TempDir::new()?;
    let a = spawn_foreman(Arc::new(BackendFactory::default())).await?;
    let b = spawn_foreman(Arc::new(BackendFactory::default())).await?;

    let mut order = file_order(&root, 100);
    order.cleanup = true;
    let mut job = Job::new(order, vec![a.addr.clone(), b.addr.clone()], short_timing());
    test_manager().run(&mut job).await?;

    let report = job.report.as_ref().expect("report");
    let cleanup = report.cleanup.as_ref().expect("cleanup ran");
    assert!(cleanup.ok, "{}", cleanup.message);
    assert!(!root.path().join("fleet").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_job_ids_increase_per_manager() -> Result<()> {
    let root = TempDir::new()?;
    let foreman = spawn_foreman(Arc::new(BackendFactory::default())).await?;
    let timing = PhaseTiming {
        ramp_up: Duration::ZERO,
        run_time: Duration::from_millis(100),
        ramp_down: Duration::ZERO,
    };

    let mut manager = test_manager();
    let mut first = Job::new(file_order(&root, 20), vec![foreman.addr.clone()], timing);
    manager.run(&mut first).await?;
    assert!(wait_for_idle(&foreman.state).await);
    let mut second = Job::new(file_order(&root, 20), vec![foreman.addr.clone()], timing);
    manager.run(&mut second).await?;

    assert_eq!(first.order.job_id + 1, second.order.job_id);
    Ok(())
}

#[tokio::test]
async fn test_ping_reports_version() -> Result<()> {
    let foreman = spawn_foreman(Arc::new(BackendFactory::default())).await?;
    let version = test_manager().ping(&foreman.addr).await?;
    assert_eq!(version, env!("CARGO_PKG_VERSION"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_manager_run_can_be_spawned() -> Result<()> {
    let root = TempDir::new()?;
    let foreman = spawn_foreman(Arc::new(BackendFactory::default())).await?;
    let mut job = Job::new(file_order(&root, 50), vec![foreman.addr.clone()], short_timing());

    let handle = tokio::spawn(async move {
        let mut manager = test_manager();
        manager.run(&mut job).await.map(|()| job)
    });
    let job = handle.await??;
    assert!(job.report.is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_foreman_times_out_into_partial_report() -> Result<()> {
    let root = TempDir::new()?;
    let good = spawn_foreman(Arc::new(BackendFactory::default())).await?;
    let stuck = spawn_foreman(Arc::new(StuckFactory)).await?;

    let mut manager = Manager::new(ManagerSettings {
        connect_timeout: Duration::from_secs(2),
        configure_timeout: Duration::from_secs(10),
        report_grace: Duration::from_secs(1),
        cleanup_timeout: Duration::from_secs(10),
        ..ManagerSettings::default()
    });
    let servers = vec![good.addr.clone(), stuck.addr.clone()];
    let mut job = Job::new(file_order(&root, 100), servers, short_timing());

    let t0 = std::time::Instant::now();
    manager.run(&mut job).await?;
    assert!(t0.elapsed() < Duration::from_secs(10));

    let report = job.report.as_ref().expect("partial job still reports");
    assert!(report.is_partial());
    assert_eq!(report.succeeded().count(), 1);
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].address, stuck.addr);
    assert_eq!(failures[0].kind, FailureKind::Timeout, "{}", failures[0]);
    assert!(report.measurement(Stage::Write).successes > 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_manager_disconnect_mid_run_returns_foreman_to_idle() -> Result<()> {
    let root = TempDir::new()?;
    let foreman = spawn_foreman(Arc::new(BackendFactory::default())).await?;

    let order = file_order(&root, 50);
    let work_order = WorkOrder {
        assignment: Assignment::for_foreman(&order, 0, 1),
        order,
        timing: PhaseTiming {
            ramp_up: Duration::ZERO,
            run_time: Duration::from_secs(60),
            ramp_down: Duration::ZERO,
        },
    };

    let mut client = ForemanClient::connect(format!("http://{}", foreman.addr)).await?;
    let (tx, rx) = mpsc::channel(4);
    tx.send(pb::ManagerMessage {
        body: Some(manager_message::Body::Order(wire::work_order_to_pb(&work_order))),
    })
    .await?;
    let mut inbound = client.session(ReceiverStream::new(rx)).await?.into_inner();
    match inbound.message().await? {
        Some(pb::ForemanMessage {
            body: Some(foreman_message::Body::Ack(_)),
        }) => {}
        other => panic!("expected ack, got {other:?}"),
    }
    tx.send(pb::ManagerMessage {
        body: Some(manager_message::Body::Start(pb::Start {})),
    })
    .await?;

    let mut running = false;
    for _ in 0..100 {
        if foreman.state.get().await == ForemanPhase::Running {
            running = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(running, "foreman never started the run");

    // The manager goes away with a minute of run time left.
    drop(tx);
    drop(inbound);
    drop(client);
    assert!(wait_for_idle(&foreman.state).await, "foreman did not abort and reset");
    assert!(foreman.state.try_claim().await.is_ok(), "foreman should take new work");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_configured_foremen_that_never_report_are_total_failure() -> Result<()> {
    let root = TempDir::new()?;
    let stuck = spawn_foreman(Arc::new(StuckFactory)).await?;
    let mut manager = Manager::new(ManagerSettings {
        connect_timeout: Duration::from_secs(2),
        configure_timeout: Duration::from_secs(10),
        report_grace: Duration::from_millis(300),
        cleanup_timeout: Duration::from_secs(10),
        ..ManagerSettings::default()
    });
    let mut job = Job::new(file_order(&root, 20), vec![stuck.addr.clone()], short_timing());

    match manager.run(&mut job).await {
        Err(BenchError::TotalJobFailure { failures }) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].kind, FailureKind::Timeout);
        }
        other => panic!("expected total failure, got {other:?}"),
    }
    assert!(job.report.is_none());
    Ok(())
}
