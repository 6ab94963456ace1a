// src/foreman.rs
//
// The per-machine coordinator: takes one order at a time, sets up the
// backend and a worker pool, runs the phase clock locally, and hands the
// merged statistics back to the manager.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{sleep_until, Instant};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};

use crate::connection::{
    delete_namespace_best_effort, invalidate_cache_best_effort, Connection, ConnectionFactory,
};
use crate::error::{BenchError, ConfigErrorKind, Result};
use crate::keygen::KeyGenerator;
use crate::order::WorkOrder;
use crate::partition;
use crate::pb;
use crate::pb::foreman_server::{Foreman, ForemanServer};
use crate::pb::{foreman_message, manager_message};
use crate::phase::{Phase, PhaseCell, PhaseSchedule, Stage};
use crate::report::ForemanReport;
use crate::stats::PhaseStatsSet;
use crate::wire;
use crate::worker::{Worker, WorkerPlan};

/// Lifecycle of a foreman.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ForemanPhase {
    /// Listening for an order; nothing allocated.
    Idle,
    /// Order accepted, backend and workers being or already set up.
    Configured,
    /// The phase clock is running.
    Running,
    /// Workers told to stop; waiting for in-flight operations.
    Draining,
    /// Statistics merged; answering report and cleanup requests.
    Reporting,
}

/// Foreman state shared between the gRPC service and the running job.
#[derive(Clone)]
pub struct ForemanState {
    phase: Arc<Mutex<ForemanPhase>>,
    /// Cuts the phase clock short (manager went away).
    abort_tx: broadcast::Sender<()>,
}

impl Default for ForemanState {
    fn default() -> Self {
        Self::new()
    }
}

impl ForemanState {
    pub fn new() -> Self {
        let (abort_tx, _) = broadcast::channel(16);
        Self {
            phase: Arc::new(Mutex::new(ForemanPhase::Idle)),
            abort_tx,
        }
    }

    pub fn can_transition(from: ForemanPhase, to: ForemanPhase) -> bool {
        use ForemanPhase::*;
        matches!(
            (from, to),
            (Idle, Configured)          // order accepted
                | (Configured, Running) // start received
                | (Configured, Idle)    // setup failed, or manager left before start
                | (Running, Draining)   // clock finished or aborted
                | (Draining, Reporting) // workers joined
                | (Draining, Idle)      // aborted, nobody to report to
                | (Reporting, Idle)     // session closed
        )
    }

    pub async fn transition_to(&self, next: ForemanPhase, reason: &str) -> std::result::Result<(), String> {
        let mut phase = self.phase.lock().await;
        if *phase == next {
            debug!("foreman already {}, ignoring redundant transition ({})", *phase, reason);
            return Ok(());
        }
        if !Self::can_transition(*phase, next) {
            let msg = format!("invalid foreman transition: {} -> {} ({})", *phase, next, reason);
            error!("{}", msg);
            return Err(msg);
        }
        info!("foreman state: {} -> {} ({})", *phase, next, reason);
        *phase = next;
        Ok(())
    }

    /// Claim an idle foreman for a new job; reports the current phase if busy.
    pub async fn try_claim(&self) -> std::result::Result<(), ForemanPhase> {
        let mut phase = self.phase.lock().await;
        if *phase != ForemanPhase::Idle {
            return Err(*phase);
        }
        info!("foreman state: {} -> {} (order received)", *phase, ForemanPhase::Configured);
        *phase = ForemanPhase::Configured;
        Ok(())
    }

    /// Return to idle from wherever the session stopped.
    pub async fn reset(&self, reason: &str) {
        let mut phase = self.phase.lock().await;
        if *phase != ForemanPhase::Idle {
            info!("foreman state: {} -> {} ({})", *phase, ForemanPhase::Idle, reason);
            *phase = ForemanPhase::Idle;
        }
    }

    pub async fn get(&self) -> ForemanPhase {
        *self.phase.lock().await
    }

    pub fn send_abort(&self) {
        let _ = self.abort_tx.send(());
        info!("abort signal broadcast to the running job");
    }

    pub fn subscribe_abort(&self) -> broadcast::Receiver<()> {
        self.abort_tx.subscribe()
    }
}

/// Foreman-side settings that are not part of the order.
#[derive(Debug, Clone)]
pub struct ForemanConfig {
    /// Workers per target when the order leaves the count at zero.
    pub default_workers_per_target: u32,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            default_workers_per_target: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
        }
    }
}

/// A validated order with its connections open and worker plans laid out.
pub struct PreparedJob {
    work_order: WorkOrder,
    connections: Vec<Arc<dyn Connection>>,
    plans: Vec<WorkerPlan>,
}

/// Validate, connect to every assigned target, create the namespace and lay
/// out the worker pool.
pub async fn configure(
    work_order: WorkOrder,
    factory: &dyn ConnectionFactory,
    config: &ForemanConfig,
) -> Result<PreparedJob> {
    work_order.validate()?;
    let order = &work_order.order;
    let targets = &work_order.assignment.targets;

    let mut connections = Vec::with_capacity(targets.len());
    for target in targets {
        let conn = factory.connect(order, target).await?;
        conn.create_namespace().await?;
        connections.push(conn);
    }
    info!(
        "job {}: {} namespace `{}` ready on {} target(s)",
        order.job_id,
        order.connection_type,
        order.bucket,
        connections.len()
    );

    let slice = work_order.assignment.key_range(order);
    let per_target = match order.workers_per_target {
        0 => config.default_workers_per_target.max(1),
        n => n,
    };
    let wanted = per_target as u64 * targets.len() as u64;
    let count = wanted.min(slice.end - slice.start).max(1);
    let plans = partition::partition(&slice, count)
        .into_iter()
        .enumerate()
        .map(|(id, range)| WorkerPlan {
            id,
            target: targets[id % targets.len()].clone(),
            range,
        })
        .collect::<Vec<_>>();
    info!(
        "job {}: {} workers over keys [{}, {})",
        order.job_id,
        plans.len(),
        slice.start,
        slice.end
    );

    Ok(PreparedJob {
        work_order,
        connections,
        plans,
    })
}

impl PreparedJob {
    pub fn work_order(&self) -> &WorkOrder {
        &self.work_order
    }

    pub fn plans(&self) -> &[WorkerPlan] {
        &self.plans
    }

    pub fn workers(&self) -> u32 {
        self.plans.len() as u32
    }

    /// First connection; used for whole-namespace operations such as cleanup.
    pub fn primary_connection(&self) -> &Arc<dyn Connection> {
        &self.connections[0]
    }

    /// Hold new operations, wait for in-flight writes, then drop caches.
    /// `false` when an abort arrived first.
    async fn switch_to_reads(&self, cell: &PhaseCell, abort: &mut broadcast::Receiver<()>) -> bool {
        cell.pause();
        debug!("waiting for {} in-flight writes", cell.in_flight());
        tokio::select! {
            _ = cell.drained() => {}
            _ = abort.recv() => return false,
        }
        for conn in &self.connections {
            invalidate_cache_best_effort(conn.as_ref()).await;
        }
        true
    }

    /// Run every phase by the local clock, then drain and merge the workers.
    /// The read stage starts only once writes have drained and caches are
    /// dropped. An abort stops the clock early; in-flight operations still
    /// finish.
    pub async fn execute(
        &self,
        mut abort: broadcast::Receiver<()>,
        state: &ForemanState,
    ) -> ForemanReport {
        let order = &self.work_order.order;
        let schedule = PhaseSchedule::new(&self.work_order.timing);
        let keygen = KeyGenerator::new(order.generator_type, order.seed);
        // Checked by Order::validate.
        let object_size = order.object_size as usize;

        // Paused until the first phase is set, so a run that opens with reads
        // still invalidates caches before the first get.
        let cell = PhaseCell::new(Phase::WriteRampUp);
        cell.pause();

        let started = Utc::now();
        let start = Instant::now();
        let handles: Vec<_> = self
            .plans
            .iter()
            .map(|plan| {
                let target_idx = plan.id % self.connections.len();
                let worker = Worker::new(
                    plan.clone(),
                    Arc::clone(&self.connections[target_idx]),
                    keygen,
                    object_size,
                    order.verify_content,
                    cell.clone(),
                );
                tokio::spawn(worker.run())
            })
            .collect();

        let mut aborted = false;
        let mut reading = false;
        let mut clock = start;
        for &(phase, duration) in schedule.steps() {
            if duration.is_zero() {
                continue;
            }
            if phase.stage() == Stage::Read && !reading {
                reading = true;
                if !self.switch_to_reads(&cell, &mut abort).await {
                    warn!("job {}: aborted while draining writes", order.job_id);
                    aborted = true;
                    break;
                }
                // The read ramp-up gets its full window after the cache drop.
                clock = Instant::now();
            }
            cell.set(phase);
            info!("job {}: phase {} for {:?}", order.job_id, phase, duration);
            let deadline = clock + duration;
            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = abort.recv() => {
                    warn!("job {}: aborted during {}", order.job_id, phase);
                    aborted = true;
                    break;
                }
            }
            clock = deadline;
        }

        cell.finish();
        let _ = state.transition_to(ForemanPhase::Draining, "phases complete").await;

        let mut stats = PhaseStatsSet::new();
        for joined in join_all(handles).await {
            match joined {
                Ok(report) => {
                    debug!("worker {} wrote {} distinct objects", report.id, report.written);
                    stats.merge(&report.stats);
                }
                Err(e) => error!("worker task failed: {}", e),
            }
        }
        info!("job {}: drained after {:?}", order.job_id, start.elapsed());

        ForemanReport {
            stats,
            workers: self.workers(),
            started,
            ended: Utc::now(),
            aborted,
        }
    }
}

// =============================================================================
// gRPC service
// =============================================================================

pub struct ForemanService {
    state: ForemanState,
    factory: Arc<dyn ConnectionFactory>,
    config: ForemanConfig,
}

impl ForemanService {
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: ForemanConfig) -> Self {
        Self {
            state: ForemanState::new(),
            factory,
            config,
        }
    }

    pub fn state(&self) -> ForemanState {
        self.state.clone()
    }
}

type Outbound = mpsc::Sender<std::result::Result<pb::ForemanMessage, Status>>;

fn msg(body: foreman_message::Body) -> pb::ForemanMessage {
    pb::ForemanMessage { body: Some(body) }
}

async fn send(tx: &Outbound, body: foreman_message::Body) -> bool {
    tx.send(Ok(msg(body))).await.is_ok()
}

/// Next manager message; `None` when the stream ended or broke.
async fn next_body(inbound: &mut Streaming<pb::ManagerMessage>) -> Option<manager_message::Body> {
    loop {
        match inbound.message().await {
            Ok(Some(pb::ManagerMessage { body: Some(body) })) => return Some(body),
            Ok(Some(_)) => warn!("ignoring empty manager message"),
            Ok(None) => return None,
            Err(status) => {
                warn!("manager stream error: {}", status);
                return None;
            }
        }
    }
}

/// Walk one manager session through the protocol.
async fn run_session(
    state: ForemanState,
    factory: Arc<dyn ConnectionFactory>,
    config: ForemanConfig,
    mut inbound: Streaming<pb::ManagerMessage>,
    tx: Outbound,
) {
    let order_msg = match next_body(&mut inbound).await {
        Some(manager_message::Body::Order(o)) => o,
        Some(other) => {
            let _ = tx
                .send(Err(Status::failed_precondition(format!(
                    "expected an order, got {other:?}"
                ))))
                .await;
            return;
        }
        None => return,
    };

    if let Err(current) = state.try_claim().await {
        warn!("rejecting order: foreman is {}", current);
        let _ = tx
            .send(Ok(wire::config_error(
                ConfigErrorKind::Busy,
                format!("foreman is busy ({current})"),
            )))
            .await;
        return;
    }

    let prepared = match wire::work_order_from_pb(order_msg) {
        Ok(work_order) => configure(work_order, factory.as_ref(), &config).await,
        Err(e) => Err(e),
    };
    let job = match prepared {
        Ok(job) => job,
        Err(e) => {
            warn!("order rejected: {}", e);
            let _ = tx.send(Ok(wire::config_error(e.config_kind(), e.to_string()))).await;
            state.reset("configuration failed").await;
            return;
        }
    };
    let job_id = job.work_order().order.job_id;
    if !send(&tx, foreman_message::Body::Ack(pb::Ack { workers: job.workers() })).await {
        state.reset("manager left before ack").await;
        return;
    }

    match next_body(&mut inbound).await {
        Some(manager_message::Body::Start(_)) => {}
        other => {
            warn!("job {}: expected start, got {:?}; dropping job", job_id, other);
            state.reset("no start").await;
            return;
        }
    }
    let _ = state.transition_to(ForemanPhase::Running, "start received").await;

    // Keep reading while the clock runs: a closed stream means the manager is
    // gone, and the report request may arrive before draining is done.
    let run = job.execute(state.subscribe_abort(), &state);
    tokio::pin!(run);
    let mut report_requested = false;
    let mut manager_gone = false;
    let report = loop {
        tokio::select! {
            report = &mut run => break report,
            body = next_body(&mut inbound), if !manager_gone => match body {
                Some(manager_message::Body::ReportRequest(_)) => report_requested = true,
                Some(other) => warn!("job {}: unexpected message while running: {:?}", job_id, other),
                None => {
                    warn!("job {}: manager disconnected, aborting", job_id);
                    manager_gone = true;
                    state.send_abort();
                }
            },
        }
    };

    if manager_gone {
        state.reset("manager disconnected").await;
        return;
    }
    let _ = state.transition_to(ForemanPhase::Reporting, "workers joined").await;

    if !report_requested {
        match next_body(&mut inbound).await {
            Some(manager_message::Body::ReportRequest(_)) => {}
            other => {
                warn!("job {}: expected report request, got {:?}", job_id, other);
                state.reset("no report request").await;
                return;
            }
        }
    }

    let body = match wire::foreman_report_to_pb(&report) {
        Ok(r) => foreman_message::Body::Report(r),
        Err(e) => {
            error!("job {}: could not encode report: {}", job_id, e);
            foreman_message::Body::ReportError(pb::ReportError {
                message: e.to_string(),
            })
        }
    };
    if !send(&tx, body).await {
        state.reset("manager left before report").await;
        return;
    }
    info!("job {}: report sent", job_id);

    // Cleanup requests until the manager closes the session.
    while let Some(body) = next_body(&mut inbound).await {
        match body {
            manager_message::Body::Cleanup(_) => {
                let res = delete_namespace_best_effort(job.primary_connection().as_ref()).await;
                let done = pb::CleanupDone {
                    ok: res.is_ok(),
                    message: res.err().unwrap_or_default(),
                };
                if !send(&tx, foreman_message::Body::CleanupDone(done)).await {
                    break;
                }
            }
            other => warn!("job {}: unexpected message after report: {:?}", job_id, other),
        }
    }
    state.reset("session closed").await;
}

#[tonic::async_trait]
impl Foreman for ForemanService {
    async fn ping(
        &self,
        _req: Request<pb::Empty>,
    ) -> std::result::Result<Response<pb::PingReply>, Status> {
        Ok(Response::new(pb::PingReply {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }

    type SessionStream =
        Pin<Box<dyn Stream<Item = std::result::Result<pb::ForemanMessage, Status>> + Send>>;

    async fn session(
        &self,
        req: Request<Streaming<pb::ManagerMessage>>,
    ) -> std::result::Result<Response<Self::SessionStream>, Status> {
        debug!("session opened by {:?}", req.remote_addr());
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(run_session(
            self.state.clone(),
            Arc::clone(&self.factory),
            self.config.clone(),
            req.into_inner(),
            tx,
        ));
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve_with_shutdown(
    listener: TcpListener,
    service: ForemanService,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    info!("foreman listening on {:?}", addr);
    tonic::transport::Server::builder()
        .add_service(ForemanServer::new(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
        .map_err(BenchError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::BackendFactory;
    use crate::order::{Assignment, ConnectionType, PhaseTiming};
    use std::time::Duration;

    #[test]
    fn test_can_transition_normal_flow() {
        use ForemanPhase::*;
        assert!(ForemanState::can_transition(Idle, Configured));
        assert!(ForemanState::can_transition(Configured, Running));
        assert!(ForemanState::can_transition(Running, Draining));
        assert!(ForemanState::can_transition(Draining, Reporting));
        assert!(ForemanState::can_transition(Reporting, Idle));
    }

    #[test]
    fn test_can_transition_invalid() {
        use ForemanPhase::*;
        assert!(!ForemanState::can_transition(Idle, Running));
        assert!(!ForemanState::can_transition(Idle, Reporting));
        assert!(!ForemanState::can_transition(Running, Idle));
        assert!(!ForemanState::can_transition(Reporting, Running));
        assert!(!ForemanState::can_transition(Configured, Reporting));
    }

    #[tokio::test]
    async fn test_transition_to_rejects_skips() {
        let state = ForemanState::new();
        assert!(state.transition_to(ForemanPhase::Running, "test").await.is_err());
        assert_eq!(state.get().await, ForemanPhase::Idle);
        assert!(state.transition_to(ForemanPhase::Idle, "noop").await.is_ok());
    }

    #[tokio::test]
    async fn test_claim_makes_foreman_busy() {
        let state = ForemanState::new();
        assert!(state.try_claim().await.is_ok());
        assert_eq!(state.try_claim().await, Err(ForemanPhase::Configured));
        state.reset("test").await;
        assert!(state.try_claim().await.is_ok());
    }

    fn file_work_order(root: &str, objects: u64, workers: u32) -> WorkOrder {
        let mut order = crate::order::tests::sample_order();
        order.connection_type = ConnectionType::File;
        order.targets = vec![root.to_string()];
        order.range_end = objects;
        order.workers_per_target = workers;
        WorkOrder {
            assignment: Assignment::for_foreman(&order, 0, 1),
            order,
            timing: PhaseTiming {
                ramp_up: Duration::from_millis(100),
                run_time: Duration::from_millis(300),
                ramp_down: Duration::from_millis(100),
            },
        }
    }

    #[tokio::test]
    async fn test_worker_count_capped_by_slice() {
        let dir = tempfile::tempdir().unwrap();
        let wo = file_work_order(dir.path().to_str().unwrap(), 3, 8);
        let job = configure(wo, &BackendFactory::default(), &ForemanConfig::default())
            .await
            .unwrap();
        assert_eq!(job.workers(), 3);
        let ranges: Vec<_> = job.plans().iter().map(|p| p.range.clone()).collect();
        assert_eq!(ranges, vec![0..1, 1..2, 2..3]);
    }

    #[tokio::test]
    async fn test_missing_root_is_backend_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-mounted");
        let wo = file_work_order(missing.to_str().unwrap(), 10, 1);
        let err = configure(wo, &BackendFactory::default(), &ForemanConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.config_kind(), ConfigErrorKind::BackendUnavailable);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_abort_stops_the_clock() {
        let dir = tempfile::tempdir().unwrap();
        let mut wo = file_work_order(dir.path().to_str().unwrap(), 20, 2);
        wo.timing.run_time = Duration::from_secs(60);
        let job = configure(wo, &BackendFactory::default(), &ForemanConfig::default())
            .await
            .unwrap();
        let state = ForemanState::new();
        let abort = state.subscribe_abort();
        let aborter = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            aborter.send_abort();
        });
        let t0 = std::time::Instant::now();
        let report = job.execute(abort, &state).await;
        assert!(report.aborted);
        assert!(t0.elapsed() < Duration::from_secs(10));
    }

    /// Slow puts; records what it saw when asked to drop its cache.
    #[derive(Default)]
    struct StageWatch {
        puts_in_flight: std::sync::atomic::AtomicUsize,
        puts_at_invalidate: std::sync::Mutex<Option<usize>>,
        puts_after_invalidate: std::sync::atomic::AtomicUsize,
        gets_before_invalidate: std::sync::atomic::AtomicUsize,
        invalidated: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl Connection for StageWatch {
        fn target(&self) -> &str {
            "watch"
        }
        async fn create_namespace(&self) -> crate::connection::ConnResult<()> {
            Ok(())
        }
        async fn delete_namespace(&self) -> crate::connection::ConnResult<()> {
            Ok(())
        }
        async fn put(&self, _key: &str, _id: u64, _buf: &[u8]) -> crate::connection::ConnResult<()> {
            use std::sync::atomic::Ordering::SeqCst;
            self.puts_in_flight.fetch_add(1, SeqCst);
            tokio::time::sleep(Duration::from_millis(15)).await;
            if self.invalidated.load(SeqCst) {
                self.puts_after_invalidate.fetch_add(1, SeqCst);
            }
            self.puts_in_flight.fetch_sub(1, SeqCst);
            Ok(())
        }
        async fn get(&self, _key: &str, _id: u64, _buf: &mut [u8]) -> crate::connection::ConnResult<()> {
            use std::sync::atomic::Ordering::SeqCst;
            if !self.invalidated.load(SeqCst) {
                self.gets_before_invalidate.fetch_add(1, SeqCst);
            }
            Ok(())
        }
        async fn invalidate_cache(&self) -> crate::connection::ConnResult<()> {
            use std::sync::atomic::Ordering::SeqCst;
            *self.puts_at_invalidate.lock().unwrap() = Some(self.puts_in_flight.load(SeqCst));
            // A slow cache drop must not eat into the read ramp-up.
            tokio::time::sleep(Duration::from_millis(150)).await;
            self.invalidated.store(true, SeqCst);
            Ok(())
        }
    }

    struct WatchFactory(Arc<StageWatch>);

    #[async_trait::async_trait]
    impl ConnectionFactory for WatchFactory {
        async fn connect(
            &self,
            _order: &crate::order::Order,
            _target: &str,
        ) -> crate::connection::ConnResult<Arc<dyn Connection>> {
            Ok(Arc::clone(&self.0) as Arc<dyn Connection>)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cache_is_dropped_only_after_writes_drain() {
        let watch = Arc::new(StageWatch::default());
        let mut wo = file_work_order("/unused", 40, 4);
        wo.order.verify_content = false;
        let job = configure(wo, &WatchFactory(Arc::clone(&watch)), &ForemanConfig::default())
            .await
            .unwrap();
        let state = ForemanState::new();
        let report = job.execute(state.subscribe_abort(), &state).await;

        use std::sync::atomic::Ordering::SeqCst;
        assert!(!report.aborted);
        assert_eq!(*watch.puts_at_invalidate.lock().unwrap(), Some(0));
        assert_eq!(watch.puts_after_invalidate.load(SeqCst), 0);
        assert_eq!(watch.gets_before_invalidate.load(SeqCst), 0);

        // Reads own their whole window: ramp-up still saw traffic, and no
        // write landed in a read bucket.
        assert!(report.stats.get(Phase::ReadRampUp).successes > 0);
        assert!(report.stats.get(Phase::WriteRampDown).successes > 0);
        assert!(report.stats.measurement(Stage::Read).successes > 0);
    }
}
