// src/wire.rs
//
// Conversions between the generated protobuf types and the domain types.
// Anything arriving from the network is checked here; a malformed message
// becomes a `Config` or `Protocol` error, never a panic.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{BenchError, ConfigErrorKind, Result};
use crate::order::{Assignment, ConnectionType, GeneratorType, Order, PhaseTiming, WorkOrder};
use crate::pb;
use crate::phase::Phase;
use crate::report::ForemanReport;
use crate::stats::{decode_histogram, FirstError, PhaseStats, PhaseStatsSet};

// =============================================================================
// Orders
// =============================================================================

pub fn order_to_pb(o: &Order) -> pb::Order {
    pb::Order {
        job_id: o.job_id,
        object_size: o.object_size,
        seed: o.seed,
        generator_type: o.generator_type.to_string(),
        range_start: o.range_start,
        range_end: o.range_end,
        targets: o.targets.clone(),
        connection_type: o.connection_type.to_string(),
        bucket: o.bucket.clone(),
        credentials: o.credentials.clone().into_iter().collect(),
        port: o.port as u32,
        workers_per_target: o.workers_per_target,
        verify_content: o.verify_content,
        cleanup: o.cleanup,
    }
}

pub fn order_from_pb(o: pb::Order) -> Result<Order> {
    let connection_type: ConnectionType = o.connection_type.parse().map_err(|_| {
        BenchError::Config(format!("unrecognized connection type `{}`", o.connection_type))
    })?;
    let generator_type: GeneratorType = o.generator_type.parse().map_err(|_| {
        BenchError::Config(format!("unrecognized generator type `{}`", o.generator_type))
    })?;
    let port = u16::try_from(o.port)
        .map_err(|_| BenchError::Config(format!("port {} out of range", o.port)))?;
    Ok(Order {
        job_id: o.job_id,
        object_size: o.object_size,
        seed: o.seed,
        generator_type,
        range_start: o.range_start,
        range_end: o.range_end,
        targets: o.targets,
        connection_type,
        bucket: o.bucket,
        credentials: o.credentials.into_iter().collect(),
        port,
        workers_per_target: o.workers_per_target,
        verify_content: o.verify_content,
        cleanup: o.cleanup,
    })
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

pub fn work_order_to_pb(w: &WorkOrder) -> pb::OrderMsg {
    pb::OrderMsg {
        order: Some(order_to_pb(&w.order)),
        timing: Some(pb::PhaseTiming {
            ramp_up_ms: millis(w.timing.ramp_up),
            run_time_ms: millis(w.timing.run_time),
            ramp_down_ms: millis(w.timing.ramp_down),
        }),
        assignment: Some(pb::Assignment {
            foreman_index: w.assignment.foreman_index,
            foreman_count: w.assignment.foreman_count,
            targets: w.assignment.targets.clone(),
        }),
    }
}

pub fn work_order_from_pb(m: pb::OrderMsg) -> Result<WorkOrder> {
    let missing = |what: &str| BenchError::Protocol(format!("order message without {what}"));
    let order = order_from_pb(m.order.ok_or_else(|| missing("order"))?)?;
    let t = m.timing.ok_or_else(|| missing("timing"))?;
    let a = m.assignment.ok_or_else(|| missing("assignment"))?;
    Ok(WorkOrder {
        order,
        timing: PhaseTiming {
            ramp_up: Duration::from_millis(t.ramp_up_ms),
            run_time: Duration::from_millis(t.run_time_ms),
            ramp_down: Duration::from_millis(t.ramp_down_ms),
        },
        assignment: Assignment {
            foreman_index: a.foreman_index,
            foreman_count: a.foreman_count,
            targets: a.targets,
        },
    })
}

// =============================================================================
// Configuration errors
// =============================================================================

pub fn config_kind_to_pb(kind: ConfigErrorKind) -> pb::ConfigErrorKind {
    match kind {
        ConfigErrorKind::InvalidOrder => pb::ConfigErrorKind::InvalidOrder,
        ConfigErrorKind::Busy => pb::ConfigErrorKind::Busy,
        ConfigErrorKind::BackendUnavailable => pb::ConfigErrorKind::BackendUnavailable,
        ConfigErrorKind::PermissionDenied => pb::ConfigErrorKind::PermissionDenied,
    }
}

pub fn config_kind_from_pb(raw: i32) -> ConfigErrorKind {
    match pb::ConfigErrorKind::try_from(raw) {
        Ok(pb::ConfigErrorKind::Busy) => ConfigErrorKind::Busy,
        Ok(pb::ConfigErrorKind::BackendUnavailable) => ConfigErrorKind::BackendUnavailable,
        Ok(pb::ConfigErrorKind::PermissionDenied) => ConfigErrorKind::PermissionDenied,
        _ => ConfigErrorKind::InvalidOrder,
    }
}

pub fn config_error(kind: ConfigErrorKind, message: impl Into<String>) -> pb::ForemanMessage {
    pb::ForemanMessage {
        body: Some(pb::foreman_message::Body::ConfigError(pb::ConfigError {
            kind: config_kind_to_pb(kind) as i32,
            message: message.into(),
        })),
    }
}

// =============================================================================
// Statistics
// =============================================================================

fn to_unix_us(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

fn from_unix_us(us: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us)
        .ok_or_else(|| BenchError::Protocol(format!("timestamp {us} out of range")))
}

pub fn phase_stats_to_pb(phase: Phase, s: &PhaseStats) -> Result<pb::PhaseStats> {
    Ok(pb::PhaseStats {
        phase: phase.to_string(),
        successes: s.successes,
        failures: s.failures,
        not_found: s.not_found,
        size_mismatches: s.size_mismatches,
        content_mismatches: s.content_mismatches,
        bytes: s.bytes,
        min_us: s.min_us(),
        max_us: s.max_us(),
        total_us: s.total_us(),
        histogram: s.encode_histogram().map_err(BenchError::Protocol)?,
        first_error: s.first_error.as_ref().map(|e| pb::FirstError {
            at_unix_us: to_unix_us(e.at),
            message: e.message.clone(),
        }),
    })
}

pub fn phase_stats_from_pb(p: pb::PhaseStats) -> Result<(Phase, PhaseStats)> {
    let phase: Phase = p
        .phase
        .parse()
        .map_err(|_| BenchError::Protocol(format!("unknown phase `{}`", p.phase)))?;
    let hist = decode_histogram(&p.histogram).map_err(BenchError::Protocol)?;
    if hist.len() != p.successes {
        return Err(BenchError::Protocol(format!(
            "{phase}: histogram holds {} samples but {} successes were reported",
            hist.len(),
            p.successes
        )));
    }
    let first_error = match p.first_error {
        Some(e) => Some(FirstError {
            at: from_unix_us(e.at_unix_us)?,
            message: e.message,
        }),
        None => None,
    };
    let stats = PhaseStats::from_parts(
        p.successes,
        p.failures,
        p.not_found,
        p.size_mismatches,
        p.content_mismatches,
        p.bytes,
        p.min_us,
        p.max_us,
        p.total_us,
        hist,
        first_error,
    );
    Ok((phase, stats))
}

pub fn foreman_report_to_pb(r: &ForemanReport) -> Result<pb::ForemanReport> {
    Ok(pb::ForemanReport {
        phases: r
            .stats
            .iter()
            .map(|(p, s)| phase_stats_to_pb(p, s))
            .collect::<Result<Vec<_>>>()?,
        workers: r.workers,
        started_unix_us: to_unix_us(r.started),
        ended_unix_us: to_unix_us(r.ended),
        aborted: r.aborted,
    })
}

/// Each phase may appear at most once; absent phases are empty.
pub fn foreman_report_from_pb(r: pb::ForemanReport) -> Result<ForemanReport> {
    let mut stats = PhaseStatsSet::new();
    let mut seen = [false; Phase::COUNT];
    for p in r.phases {
        let (phase, s) = phase_stats_from_pb(p)?;
        if std::mem::replace(&mut seen[phase.index()], true) {
            return Err(BenchError::Protocol(format!("phase {phase} reported twice")));
        }
        *stats.get_mut(phase) = s;
    }
    Ok(ForemanReport {
        stats,
        workers: r.workers,
        started: from_unix_us(r.started_unix_us)?,
        ended: from_unix_us(r.ended_unix_us)?,
        aborted: r.aborted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureClass;
    use crate::order::tests::sample_order;

    #[test]
    fn test_work_order_survives_the_wire() {
        let order = sample_order();
        let w = WorkOrder {
            assignment: Assignment::for_foreman(&order, 2, 3),
            order,
            timing: PhaseTiming {
                ramp_up: Duration::from_millis(250),
                run_time: Duration::from_secs(30),
                ramp_down: Duration::ZERO,
            },
        };
        assert_eq!(work_order_from_pb(work_order_to_pb(&w)).unwrap(), w);
    }

    #[test]
    fn test_unknown_connection_type_is_config_error() {
        let mut o = order_to_pb(&sample_order());
        o.connection_type = "nfs".into();
        assert!(matches!(order_from_pb(o), Err(BenchError::Config(m)) if m.contains("nfs")));
    }

    #[test]
    fn test_missing_parts_are_protocol_errors() {
        let msg = pb::OrderMsg {
            order: Some(order_to_pb(&sample_order())),
            timing: None,
            assignment: None,
        };
        assert!(matches!(work_order_from_pb(msg), Err(BenchError::Protocol(_))));
    }

    #[test]
    fn test_report_keeps_counts_and_latencies() {
        let mut stats = PhaseStatsSet::new();
        let m = stats.get_mut(Phase::ReadMeasure);
        m.record_success(Duration::from_micros(120), 4096);
        m.record_success(Duration::from_micros(80), 4096);
        m.record_failure(FailureClass::SizeMismatch, "short object");
        let r = ForemanReport {
            stats,
            workers: 4,
            started: DateTime::from_timestamp_micros(1_700_000_000_000_000).unwrap(),
            ended: DateTime::from_timestamp_micros(1_700_000_074_000_000).unwrap(),
            aborted: false,
        };
        let back = foreman_report_from_pb(foreman_report_to_pb(&r).unwrap()).unwrap();
        let s = back.stats.get(Phase::ReadMeasure);
        assert_eq!(s.successes, 2);
        assert_eq!(s.size_mismatches, 1);
        assert_eq!(s.min_us(), 80);
        assert_eq!(s.max_us(), 120);
        assert_eq!(s.histogram_counts(), r.stats.get(Phase::ReadMeasure).histogram_counts());
        assert_eq!(s.first_error.as_ref().unwrap().message, "short object");
        assert_eq!(back.started, r.started);
        assert!(back.stats.get(Phase::WriteMeasure).is_empty());
    }

    #[test]
    fn test_duplicate_phase_rejected() {
        let s = PhaseStats::new();
        let p = phase_stats_to_pb(Phase::WriteMeasure, &s).unwrap();
        let r = pb::ForemanReport {
            phases: vec![p.clone(), p],
            ..Default::default()
        };
        assert!(matches!(foreman_report_from_pb(r), Err(BenchError::Protocol(_))));
    }

    #[test]
    fn test_config_kind_round_trip() {
        for kind in [
            ConfigErrorKind::InvalidOrder,
            ConfigErrorKind::Busy,
            ConfigErrorKind::BackendUnavailable,
            ConfigErrorKind::PermissionDenied,
        ] {
            assert_eq!(config_kind_from_pb(config_kind_to_pb(kind) as i32), kind);
        }
        assert_eq!(config_kind_from_pb(99), ConfigErrorKind::InvalidOrder);
    }
}
