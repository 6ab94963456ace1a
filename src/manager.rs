// src/manager.rs
//
// The control plane: hands one order to every foreman, starts them together,
// waits out the phases, and merges whatever comes back. Individual foreman
// failures end up in the Report; only a job with no surviving foreman is an
// error.

use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tonic::Streaming;
use tracing::{debug, info, warn};

use crate::constants::{
    CLEANUP_TIMEOUT, CONFIGURE_TIMEOUT, CONNECT_TIMEOUT, DEFAULT_PORT, REPORT_GRACE,
};
use crate::connection::http_url;
use crate::error::{BenchError, Result};
use crate::order::{Assignment, Order, PhaseTiming, WorkOrder};
use crate::pb;
use crate::pb::foreman_client::ForemanClient;
use crate::pb::{foreman_message, manager_message};
use crate::phase::PhaseSchedule;
use crate::report::{
    check_total_failure, total_failure, CleanupOutcome, FailureKind, ForemanFailure,
    ForemanReport, Report,
};
use crate::wire;

/// One run: the order, the foremen, the timing, and (once run) the report.
#[derive(Debug, Clone)]
pub struct Job {
    pub order: Order,
    /// Foreman addresses, `host` or `host:port`.
    pub servers: Vec<String>,
    pub timing: PhaseTiming,
    /// Set by [`Manager::run`] when at least one foreman reported.
    pub report: Option<Report>,
}

impl Job {
    pub fn new(order: Order, servers: Vec<String>, timing: PhaseTiming) -> Self {
        Self {
            order,
            servers,
            timing,
            report: None,
        }
    }
}

/// Manager deadlines and the port used for addresses without one.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub foreman_port: u16,
    pub connect_timeout: Duration,
    pub configure_timeout: Duration,
    pub report_grace: Duration,
    pub cleanup_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            foreman_port: DEFAULT_PORT,
            connect_timeout: CONNECT_TIMEOUT,
            configure_timeout: CONFIGURE_TIMEOUT,
            report_grace: REPORT_GRACE,
            cleanup_timeout: CLEANUP_TIMEOUT,
        }
    }
}

/// Foreman address to channel URL; see [`http_url`].
pub fn foreman_url(server: &str, default_port: u16) -> String {
    http_url(server, default_port)
}

/// An open session with a configured foreman.
struct Link {
    address: String,
    tx: mpsc::Sender<pb::ManagerMessage>,
    rx: Streaming<pb::ForemanMessage>,
}

fn manager_msg(body: manager_message::Body) -> pb::ManagerMessage {
    pb::ManagerMessage { body: Some(body) }
}

impl Link {
    /// `&mut self`: a shared borrow of the `!Sync` inbound stream held across
    /// the await would make [`Manager::run`] `!Send`.
    async fn send(&mut self, body: manager_message::Body) -> std::result::Result<(), ForemanFailure> {
        self.tx.send(manager_msg(body)).await.map_err(|_| {
            ForemanFailure::new(&self.address, FailureKind::Network, "session closed")
        })
    }

    /// Next reply within `limit`.
    async fn recv(&mut self, limit: Duration) -> std::result::Result<foreman_message::Body, ForemanFailure> {
        match timeout(limit, self.rx.message()).await {
            Err(_) => Err(ForemanFailure::new(
                &self.address,
                FailureKind::Timeout,
                format!("no answer within {limit:?}"),
            )),
            Ok(Err(status)) => Err(ForemanFailure::new(
                &self.address,
                FailureKind::Network,
                format!("{}: {}", status.code(), status.message()),
            )),
            Ok(Ok(None)) => Err(ForemanFailure::new(
                &self.address,
                FailureKind::Network,
                "foreman closed the session",
            )),
            Ok(Ok(Some(pb::ForemanMessage { body: None }))) => Err(ForemanFailure::new(
                &self.address,
                FailureKind::Protocol,
                "empty message",
            )),
            Ok(Ok(Some(pb::ForemanMessage { body: Some(body) }))) => Ok(body),
        }
    }
}

fn unexpected(address: &str, expected: &str, got: &foreman_message::Body) -> ForemanFailure {
    ForemanFailure::new(
        address,
        FailureKind::Protocol,
        format!("expected {expected}, got {got:?}"),
    )
}

async fn connect(address: &str, settings: &ManagerSettings) -> Result<ForemanClient<Channel>> {
    let url = foreman_url(address, settings.foreman_port);
    let channel = Endpoint::from_shared(url.clone())
        .map_err(|e| BenchError::Config(format!("bad foreman address {url}: {e}")))?
        .connect_timeout(settings.connect_timeout)
        .tcp_nodelay(true)
        .connect()
        .await?;
    Ok(ForemanClient::new(channel))
}

/// Connect, send the order, and wait for the acknowledgement.
async fn open_link(
    address: String,
    work_order: WorkOrder,
    settings: &ManagerSettings,
) -> std::result::Result<(Link, u32), ForemanFailure> {
    let mut client = connect(&address, settings)
        .await
        .map_err(|e| ForemanFailure::from_error(&address, &e))?;

    let (tx, rx) = mpsc::channel(8);
    // Queued first so the session stream opens with the order.
    tx.send(manager_msg(manager_message::Body::Order(wire::work_order_to_pb(&work_order))))
        .await
        .map_err(|_| ForemanFailure::new(&address, FailureKind::Network, "session closed"))?;
    let inbound = client
        .session(ReceiverStream::new(rx))
        .await
        .map_err(|s| ForemanFailure::from_error(&address, &BenchError::from(s)))?
        .into_inner();

    let mut link = Link {
        address,
        tx,
        rx: inbound,
    };
    match link.recv(settings.configure_timeout).await? {
        foreman_message::Body::Ack(ack) => Ok((link, ack.workers)),
        foreman_message::Body::ConfigError(e) => Err(ForemanFailure::new(
            &link.address,
            FailureKind::Config(wire::config_kind_from_pb(e.kind)),
            e.message,
        )),
        other => Err(unexpected(&link.address, "ack", &other)),
    }
}

async fn collect_report(
    mut link: Link,
    grace: Duration,
) -> (Link, std::result::Result<ForemanReport, ForemanFailure>) {
    if let Err(f) = link.send(manager_message::Body::ReportRequest(pb::ReportRequest {})).await {
        return (link, Err(f));
    }
    let res = match link.recv(grace).await {
        Ok(foreman_message::Body::Report(r)) => wire::foreman_report_from_pb(r)
            .map_err(|e| ForemanFailure::new(&link.address, FailureKind::Protocol, e.to_string())),
        Ok(foreman_message::Body::ReportError(e)) => Err(ForemanFailure::new(
            &link.address,
            FailureKind::Report,
            e.message,
        )),
        Ok(other) => Err(unexpected(&link.address, "report", &other)),
        Err(f) => Err(f),
    };
    (link, res)
}

async fn cleanup(link: &mut Link, limit: Duration) -> CleanupOutcome {
    let res = match link.send(manager_message::Body::Cleanup(pb::Cleanup {})).await {
        Ok(()) => link.recv(limit).await,
        Err(f) => Err(f),
    };
    let (ok, message) = match res {
        Ok(foreman_message::Body::CleanupDone(d)) => (d.ok, d.message),
        Ok(other) => (false, unexpected(&link.address, "cleanup done", &other).message),
        Err(f) => (false, f.message),
    };
    if ok {
        info!("cleanup done on {}", link.address);
    } else {
        warn!("cleanup on {} failed: {}", link.address, message);
    }
    CleanupOutcome {
        foreman: link.address.clone(),
        ok,
        message,
    }
}

/// Runs jobs. Owns the job-id counter, so ids are unique per manager.
#[derive(Debug)]
pub struct Manager {
    next_job_id: u64,
    settings: ManagerSettings,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new(ManagerSettings::default())
    }
}

impl Manager {
    pub fn new(settings: ManagerSettings) -> Self {
        Self {
            next_job_id: 1,
            settings,
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    fn allocate_job_id(&mut self) -> u64 {
        let id = self.next_job_id;
        self.next_job_id += 1;
        id
    }

    /// Run `job` to completion and leave the merged result in `job.report`.
    ///
    /// Returns `Err` only for an invalid job (before any network traffic) or
    /// when no foreman produced a report (`TotalJobFailure`).
    pub async fn run(&mut self, job: &mut Job) -> Result<()> {
        job.report = None;
        if job.servers.is_empty() {
            return Err(BenchError::Config("no foremen given".into()));
        }
        job.order.job_id = self.allocate_job_id();
        job.order.validate()?;
        let foreman_count = u32::try_from(job.servers.len())
            .map_err(|_| BenchError::Config("too many foremen".into()))?;
        if job.order.object_count() < foreman_count as u64 {
            return Err(BenchError::Config(format!(
                "{} objects cannot be shared among {} foremen",
                job.order.object_count(),
                foreman_count
            )));
        }

        let order = &job.order;
        let timing = job.timing;
        let job_id = order.job_id;
        let mut report = Report::new(order.clone(), timing);
        info!(
            "job {}: {} foremen, {} objects of {} bytes, {:?} per stage",
            job_id,
            foreman_count,
            order.object_count(),
            order.object_size,
            timing.stage_duration()
        );

        // Configure everywhere in parallel; the slowest foreman sets the start.
        let attempts = join_all(job.servers.iter().enumerate().map(|(i, address)| {
            let work_order = WorkOrder {
                order: order.clone(),
                timing,
                assignment: Assignment::for_foreman(order, i as u32, foreman_count),
            };
            open_link(address.clone(), work_order, &self.settings)
        }))
        .await;

        let mut links = Vec::new();
        for attempt in attempts {
            match attempt {
                Ok((link, workers)) => {
                    debug!("{} configured with {} workers", link.address, workers);
                    links.push(link);
                }
                Err(f) => {
                    warn!("job {}: {}", job_id, f);
                    report.record_failure(f);
                }
            }
        }
        if links.is_empty() {
            return Err(total_failure(&report));
        }
        info!("job {}: {} of {} foremen configured", job_id, links.len(), foreman_count);

        // Start.
        report.started = Utc::now();
        let start = Instant::now();
        let sends = join_all(
            links
                .iter_mut()
                .map(|l| l.send(manager_message::Body::Start(pb::Start {}))),
        )
        .await;
        let mut running = Vec::with_capacity(links.len());
        for (link, sent) in links.into_iter().zip(sends) {
            match sent {
                Ok(()) => running.push(link),
                Err(f) => {
                    warn!("job {}: {}", job_id, f);
                    report.record_failure(f);
                }
            }
        }

        // The foremen run on their own clocks; this only paces the log.
        let schedule = PhaseSchedule::new(&timing);
        for &(phase, duration) in schedule.steps() {
            if duration.is_zero() {
                continue;
            }
            info!("job {}: {} ({:?})", job_id, phase, duration);
            sleep_until(start + schedule.start_of(phase) + duration).await;
        }

        let collected = join_all(
            running
                .into_iter()
                .map(|l| collect_report(l, self.settings.report_grace)),
        )
        .await;
        let mut reported = Vec::new();
        for (link, res) in collected {
            match res {
                Ok(r) => {
                    if r.aborted {
                        warn!("job {}: {} cut its run short", job_id, link.address);
                    }
                    report.merge_foreman(&link.address, &r);
                    reported.push(link);
                }
                Err(f) => {
                    warn!("job {}: {}", job_id, f);
                    report.record_failure(f);
                }
            }
        }
        report.ended = Utc::now();

        if order.cleanup {
            if let Some(link) = reported.first_mut() {
                report.cleanup = Some(cleanup(link, self.settings.cleanup_timeout).await);
            }
        }
        drop(reported);

        check_total_failure(&report)?;
        if report.is_partial() {
            warn!(
                "job {}: partial result, {} foremen failed",
                job_id,
                report.failures().count()
            );
        }
        info!("job {}: complete", job_id);
        job.report = Some(report);
        Ok(())
    }

    /// Foreman version string.
    pub async fn ping(&self, server: &str) -> Result<String> {
        let mut client = connect(server, &self.settings).await?;
        let reply = client.ping(pb::Empty {}).await?.into_inner();
        Ok(reply.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::tests::sample_order;

    #[test]
    fn test_foreman_url() {
        assert_eq!(foreman_url("node1", 5150), "http://node1:5150");
        assert_eq!(foreman_url("node1:6000", 5150), "http://node1:6000");
        assert_eq!(foreman_url("http://node1:7", 5150), "http://node1:7");
        assert_eq!(foreman_url("fe80::2", 5150), "http://[fe80::2]:5150");
        assert!(Endpoint::from_shared(foreman_url("::1", 5150)).is_ok());
    }

    #[tokio::test]
    async fn test_job_ids_are_per_manager() {
        let mut a = Manager::default();
        let mut b = Manager::default();
        assert_eq!(a.allocate_job_id(), 1);
        assert_eq!(a.allocate_job_id(), 2);
        assert_eq!(b.allocate_job_id(), 1);
    }

    #[tokio::test]
    async fn test_empty_server_list_is_config_error() {
        let mut m = Manager::default();
        let mut job = Job::new(sample_order(), vec![], PhaseTiming::from_secs(1, 0, 0));
        assert!(matches!(m.run(&mut job).await, Err(BenchError::Config(_))));
    }

    #[tokio::test]
    async fn test_fewer_objects_than_foremen_is_config_error() {
        let mut m = Manager::default();
        let mut order = sample_order();
        order.range_end = 2;
        let servers = vec!["a".into(), "b".into(), "c".into()];
        let mut job = Job::new(order, servers, PhaseTiming::from_secs(1, 0, 0));
        assert!(matches!(m.run(&mut job).await, Err(BenchError::Config(_))));
        assert!(job.report.is_none());
    }
}
