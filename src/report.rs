// src/report.rs
//
// Results: what one foreman hands back, and the job-level Report the manager
// assembles from them. The JSON document and the console summary are both
// read-only views of a finished Report.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::constants::REPORT_QUANTILES;
use crate::error::{BenchError, ConfigErrorKind, Result};
use crate::order::{Order, PhaseTiming};
use crate::phase::{Phase, PhaseSchedule, Stage};
use crate::stats::{PhaseStats, PhaseStatsSet};

/// One foreman's merged worker statistics.
#[derive(Debug, Clone)]
pub struct ForemanReport {
    pub stats: PhaseStatsSet,
    pub workers: u32,
    pub started: DateTime<Utc>,
    pub ended: DateTime<Utc>,
    /// The run was cut short (manager disconnected).
    pub aborted: bool,
}

/// Why a foreman contributed nothing to the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "kind")]
pub enum FailureKind {
    /// The foreman refused the order.
    Config(ConfigErrorKind),
    /// Could not connect, or the session dropped.
    Network,
    /// No answer within the deadline.
    Timeout,
    /// The foreman ran but could not produce its statistics.
    Report,
    /// The foreman answered out of sequence or with garbage.
    Protocol,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Config(kind) => write!(f, "config error ({kind})"),
            FailureKind::Network => f.write_str("network error"),
            FailureKind::Timeout => f.write_str("timeout"),
            FailureKind::Report => f.write_str("report error"),
            FailureKind::Protocol => f.write_str("protocol error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForemanFailure {
    pub address: String,
    pub kind: FailureKind,
    pub message: String,
}

impl ForemanFailure {
    pub fn new(address: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            kind,
            message: message.into(),
        }
    }

    /// Classify a manager-side error for this foreman.
    pub fn from_error(address: &str, err: &BenchError) -> Self {
        let kind = match err {
            BenchError::Network(_) => FailureKind::Network,
            BenchError::Protocol(_) => FailureKind::Protocol,
            other => FailureKind::Config(other.config_kind()),
        };
        Self::new(address, kind, err.to_string())
    }
}

impl std::fmt::Display for ForemanFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}: {}", self.address, self.kind, self.message)
    }
}

/// Per-foreman line of the report.
#[derive(Debug, Clone, Serialize)]
pub struct ForemanOutcome {
    pub address: String,
    pub succeeded: bool,
    pub workers: u32,
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ForemanFailure>,
}

/// Result of the optional post-run namespace deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupOutcome {
    pub foreman: String,
    pub ok: bool,
    pub message: String,
}

/// The job's merged result. Only the manager mutates it, and only before
/// `Manager::run` returns.
#[derive(Debug, Clone)]
pub struct Report {
    pub order: Order,
    pub timing: PhaseTiming,
    pub started: DateTime<Utc>,
    pub ended: DateTime<Utc>,
    pub stats: PhaseStatsSet,
    pub foremen: Vec<ForemanOutcome>,
    pub cleanup: Option<CleanupOutcome>,
}

impl Report {
    pub fn new(order: Order, timing: PhaseTiming) -> Self {
        let now = Utc::now();
        Self {
            order,
            timing,
            started: now,
            ended: now,
            stats: PhaseStatsSet::new(),
            foremen: Vec::new(),
            cleanup: None,
        }
    }

    pub fn merge_foreman(&mut self, address: &str, report: &ForemanReport) {
        self.stats.merge(&report.stats);
        self.foremen.push(ForemanOutcome {
            address: address.to_string(),
            succeeded: true,
            workers: report.workers,
            aborted: report.aborted,
            failure: None,
        });
    }

    pub fn record_failure(&mut self, failure: ForemanFailure) {
        self.foremen.push(ForemanOutcome {
            address: failure.address.clone(),
            succeeded: false,
            workers: 0,
            aborted: false,
            failure: Some(failure),
        });
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &ForemanOutcome> {
        self.foremen.iter().filter(|f| f.succeeded)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ForemanFailure> {
        self.foremen.iter().filter_map(|f| f.failure.as_ref())
    }

    /// Some, but not all, foremen failed.
    pub fn is_partial(&self) -> bool {
        self.failures().next().is_some() && self.succeeded().next().is_some()
    }

    pub fn measurement(&self, stage: Stage) -> &PhaseStats {
        self.stats.measurement(stage)
    }

    pub fn to_document(&self) -> ReportDocument {
        let schedule = PhaseSchedule::new(&self.timing);
        ReportDocument {
            job_id: self.order.job_id,
            order: self.order.clone(),
            timing: self.timing,
            started: self.started,
            ended: self.ended,
            partial: self.is_partial(),
            foremen: self.foremen.clone(),
            phases: self
                .stats
                .iter()
                .map(|(p, s)| PhaseDocument::new(p, s, schedule.duration_of(p).as_secs_f64()))
                .collect(),
            cleanup: self.cleanup.clone(),
        }
    }

    /// Pretty JSON to `path`.
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.to_document())?;
        writer.flush()
    }

    /// Console summary of the measurement phases and any failed foremen.
    pub fn print_summary(&self, out: &mut impl Write) -> std::io::Result<()> {
        let doc = self.to_document();
        writeln!(out, "\n=== Results (job {}) ===", doc.job_id)?;
        writeln!(
            out,
            "Backend: {} {:?}, object size {} bytes, {} objects",
            self.order.connection_type,
            self.order.targets,
            self.order.object_size,
            self.order.object_count()
        )?;
        writeln!(
            out,
            "Foremen: {} ok, {} failed",
            self.succeeded().count(),
            self.failures().count()
        )?;
        for p in doc.phases.iter().filter(|p| p.measurement) {
            writeln!(out, "\n{}:", p.phase)?;
            writeln!(
                out,
                "  Ops: {} ok, {} failed ({} not found), {} size mismatches, {} content mismatches",
                p.successes, p.failures, p.not_found, p.size_mismatches, p.content_mismatches
            )?;
            writeln!(
                out,
                "  Throughput: {:.2} ops/s, {:.2} MiB/s",
                p.ops_per_sec, p.mib_per_sec
            )?;
            writeln!(
                out,
                "  Latency mean: {:.0}µs, min: {}µs, p50: {}µs, p95: {}µs, p99: {}µs, max: {}µs",
                p.latency_us.mean,
                p.latency_us.min,
                p.latency_us.quantile("p50"),
                p.latency_us.quantile("p95"),
                p.latency_us.quantile("p99"),
                p.latency_us.max
            )?;
            if let Some(e) = &p.first_error {
                writeln!(out, "  First error: {}", e)?;
            }
        }
        let failed: Vec<_> = self.failures().collect();
        if !failed.is_empty() {
            writeln!(out, "\nFailed foremen:")?;
            for f in failed {
                writeln!(out, "  {}", f)?;
            }
        }
        if let Some(c) = &self.cleanup {
            writeln!(
                out,
                "\nCleanup on {}: {}",
                c.foreman,
                if c.ok { "done" } else { c.message.as_str() }
            )?;
        }
        Ok(())
    }
}

/// Serialized form of a [`Report`].
#[derive(Debug, Serialize)]
pub struct ReportDocument {
    pub job_id: u64,
    pub order: Order,
    pub timing: PhaseTiming,
    pub started: DateTime<Utc>,
    pub ended: DateTime<Utc>,
    pub partial: bool,
    pub foremen: Vec<ForemanOutcome>,
    pub phases: Vec<PhaseDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupOutcome>,
}

#[derive(Debug, Serialize)]
pub struct LatencyDocument {
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub quantiles: BTreeMap<String, u64>,
}

impl LatencyDocument {
    pub fn quantile(&self, name: &str) -> u64 {
        self.quantiles.get(name).copied().unwrap_or(0)
    }
}

#[derive(Debug, Serialize)]
pub struct PhaseDocument {
    pub phase: Phase,
    pub measurement: bool,
    pub successes: u64,
    pub failures: u64,
    pub not_found: u64,
    pub size_mismatches: u64,
    pub content_mismatches: u64,
    pub bytes: u64,
    pub ops_per_sec: f64,
    pub mib_per_sec: f64,
    pub latency_us: LatencyDocument,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_error: Option<String>,
}

impl PhaseDocument {
    fn new(phase: Phase, s: &PhaseStats, secs: f64) -> Self {
        let per_sec = |v: f64| if secs > 0.0 { v / secs } else { 0.0 };
        Self {
            phase,
            measurement: phase.is_measurement(),
            successes: s.successes,
            failures: s.failures,
            not_found: s.not_found,
            size_mismatches: s.size_mismatches,
            content_mismatches: s.content_mismatches,
            bytes: s.bytes,
            ops_per_sec: per_sec(s.successes as f64),
            mib_per_sec: per_sec(s.bytes as f64 / (1024.0 * 1024.0)),
            latency_us: LatencyDocument {
                min: s.min_us(),
                max: s.max_us(),
                mean: s.mean_us(),
                quantiles: REPORT_QUANTILES
                    .iter()
                    .map(|(name, q)| (name.to_string(), s.percentile_us(*q)))
                    .collect(),
            },
            first_error: s
                .first_error
                .as_ref()
                .map(|e| format!("{} {}", e.at.to_rfc3339(), e.message)),
        }
    }
}

/// Turn a collection of per-foreman failures into the job-level error.
pub fn total_failure(report: &Report) -> BenchError {
    BenchError::TotalJobFailure {
        failures: report.failures().cloned().collect(),
    }
}

/// `Ok(())` unless no foreman succeeded.
pub fn check_total_failure(report: &Report) -> Result<()> {
    if report.succeeded().next().is_none() {
        Err(total_failure(report))
    } else {
        Ok(())
    }
}
