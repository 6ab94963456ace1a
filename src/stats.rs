//! Per-phase statistics.
//!
//! Workers own a [`PhaseStatsSet`] each and hand it to their foreman when they
//! finish; the foreman merges its workers, the manager merges its foremen. Every
//! merge is associative and commutative: counters add, histograms add
//! bucket-wise, min/max stay min/max, and the kept error sample is the
//! earliest one.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hdrhistogram::serialization::{Deserializer, Serializer, V2Serializer};
use hdrhistogram::Histogram;

use crate::constants::{HISTOGRAM_HIGH_US, HISTOGRAM_LOW_US, HISTOGRAM_SIGFIG};
use crate::error::FailureClass;
use crate::phase::{Phase, Stage};

fn new_histogram() -> Histogram<u64> {
    Histogram::<u64>::new_with_bounds(HISTOGRAM_LOW_US, HISTOGRAM_HIGH_US, HISTOGRAM_SIGFIG)
        .expect("static histogram bounds are valid")
}

/// The first failure seen in a phase, kept for the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstError {
    pub at: DateTime<Utc>,
    pub message: String,
}

impl FirstError {
    /// Earliest wins; ties broken by message so the choice is order-free.
    fn earliest(a: &FirstError, b: &FirstError) -> FirstError {
        if (b.at, &b.message) < (a.at, &a.message) {
            b.clone()
        } else {
            a.clone()
        }
    }
}

/// Aggregate for one phase on one worker, foreman, or the whole job.
#[derive(Clone)]
pub struct PhaseStats {
    pub successes: u64,
    /// Transient failures, including not-found.
    pub failures: u64,
    pub not_found: u64,
    pub size_mismatches: u64,
    pub content_mismatches: u64,
    /// Bytes moved by successful operations.
    pub bytes: u64,
    min_us: u64,
    max_us: u64,
    total_us: u64,
    hist: Histogram<u64>,
    pub first_error: Option<FirstError>,
}

impl fmt::Debug for PhaseStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseStats")
            .field("successes", &self.successes)
            .field("failures", &self.failures)
            .field("not_found", &self.not_found)
            .field("size_mismatches", &self.size_mismatches)
            .field("content_mismatches", &self.content_mismatches)
            .field("bytes", &self.bytes)
            .field("min_us", &self.min_us())
            .field("max_us", &self.max_us)
            .field("first_error", &self.first_error)
            .finish_non_exhaustive()
    }
}

impl Default for PhaseStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseStats {
    pub fn new() -> Self {
        Self {
            successes: 0,
            failures: 0,
            not_found: 0,
            size_mismatches: 0,
            content_mismatches: 0,
            bytes: 0,
            min_us: u64::MAX,
            max_us: 0,
            total_us: 0,
            hist: new_histogram(),
            first_error: None,
        }
    }

    /// Rebuild from wire parts. The histogram must use this crate's bounds.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        successes: u64,
        failures: u64,
        not_found: u64,
        size_mismatches: u64,
        content_mismatches: u64,
        bytes: u64,
        min_us: u64,
        max_us: u64,
        total_us: u64,
        hist: Histogram<u64>,
        first_error: Option<FirstError>,
    ) -> Self {
        Self {
            successes,
            failures,
            not_found,
            size_mismatches,
            content_mismatches,
            bytes,
            min_us: if successes == 0 { u64::MAX } else { min_us },
            max_us,
            total_us,
            hist,
            first_error,
        }
    }

    #[inline]
    pub fn record_success(&mut self, latency: Duration, bytes: u64) {
        let us = (latency.as_micros().min(u64::MAX as u128) as u64).max(HISTOGRAM_LOW_US);
        self.successes += 1;
        self.bytes += bytes;
        self.min_us = self.min_us.min(us);
        self.max_us = self.max_us.max(us);
        self.total_us = self.total_us.saturating_add(us);
        self.hist.saturating_record(us);
    }

    pub fn record_failure(&mut self, class: FailureClass, message: impl fmt::Display) {
        match class {
            FailureClass::Transient => self.failures += 1,
            FailureClass::NotFound => {
                self.failures += 1;
                self.not_found += 1;
            }
            FailureClass::SizeMismatch => self.size_mismatches += 1,
            FailureClass::ContentMismatch => self.content_mismatches += 1,
        }
        if self.first_error.is_none() {
            self.first_error = Some(FirstError {
                at: Utc::now(),
                message: message.to_string(),
            });
        }
    }

    pub fn merge(&mut self, other: &PhaseStats) {
        self.successes += other.successes;
        self.failures += other.failures;
        self.not_found += other.not_found;
        self.size_mismatches += other.size_mismatches;
        self.content_mismatches += other.content_mismatches;
        self.bytes += other.bytes;
        self.min_us = self.min_us.min(other.min_us);
        self.max_us = self.max_us.max(other.max_us);
        self.total_us = self.total_us.saturating_add(other.total_us);
        // Same bounds on both sides (checked on decode), so this cannot fail.
        self.hist.add(&other.hist).ok();
        self.first_error = match (&self.first_error, &other.first_error) {
            (Some(a), Some(b)) => Some(FirstError::earliest(a, b)),
            (a, b) => a.clone().or_else(|| b.clone()),
        };
    }

    pub fn correctness_failures(&self) -> u64 {
        self.size_mismatches + self.content_mismatches
    }

    /// Every completed operation, successful or not.
    pub fn total_ops(&self) -> u64 {
        self.successes + self.failures + self.correctness_failures()
    }

    pub fn is_empty(&self) -> bool {
        self.total_ops() == 0
    }

    pub fn min_us(&self) -> u64 {
        if self.successes == 0 {
            0
        } else {
            self.min_us
        }
    }

    pub fn max_us(&self) -> u64 {
        self.max_us
    }

    pub fn total_us(&self) -> u64 {
        self.total_us
    }

    pub fn mean_us(&self) -> f64 {
        if self.successes == 0 {
            0.0
        } else {
            self.total_us as f64 / self.successes as f64
        }
    }

    pub fn percentile_us(&self, quantile: f64) -> u64 {
        if self.hist.is_empty() {
            0
        } else {
            self.hist.value_at_quantile(quantile)
        }
    }

    pub fn histogram(&self) -> &Histogram<u64> {
        &self.hist
    }

    /// Non-empty histogram buckets as `(value, count)`, for comparisons.
    pub fn histogram_counts(&self) -> Vec<(u64, u64)> {
        self.hist
            .iter_recorded()
            .map(|v| (v.value_iterated_to(), v.count_at_value()))
            .collect()
    }

    /// V2 wire form of the latency histogram.
    pub fn encode_histogram(&self) -> Result<Vec<u8>, String> {
        let mut buf = Vec::new();
        V2Serializer::new()
            .serialize(&self.hist, &mut buf)
            .map_err(|e| format!("failed to serialize latency histogram: {e}"))?;
        Ok(buf)
    }
}

/// Decode a V2 histogram and insist on this crate's bounds so merges are lossless.
pub fn decode_histogram(bytes: &[u8]) -> Result<Histogram<u64>, String> {
    if bytes.is_empty() {
        return Ok(new_histogram());
    }
    let mut cursor = std::io::Cursor::new(bytes);
    let hist: Histogram<u64> = Deserializer::new()
        .deserialize(&mut cursor)
        .map_err(|e| format!("failed to deserialize latency histogram: {e}"))?;
    if hist.low() != HISTOGRAM_LOW_US
        || hist.high() != HISTOGRAM_HIGH_US
        || hist.sigfig() != HISTOGRAM_SIGFIG
    {
        return Err(format!(
            "histogram bounds {}..{} ({} sigfig) differ from {}..{} ({} sigfig)",
            hist.low(),
            hist.high(),
            hist.sigfig(),
            HISTOGRAM_LOW_US,
            HISTOGRAM_HIGH_US,
            HISTOGRAM_SIGFIG
        ));
    }
    Ok(hist)
}

/// One [`PhaseStats`] per phase.
#[derive(Debug, Clone, Default)]
pub struct PhaseStatsSet {
    phases: [PhaseStats; Phase::COUNT],
}

impl PhaseStatsSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, phase: Phase) -> &PhaseStats {
        &self.phases[phase.index()]
    }

    pub fn get_mut(&mut self, phase: Phase) -> &mut PhaseStats {
        &mut self.phases[phase.index()]
    }

    /// The measured phase of a stage; ramp buckets never leak in here.
    pub fn measurement(&self, stage: Stage) -> &PhaseStats {
        self.get(Phase::measurement(stage))
    }

    pub fn merge(&mut self, other: &PhaseStatsSet) {
        for p in Phase::ALL {
            self.phases[p.index()].merge(other.get(p));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Phase, &PhaseStats)> {
        Phase::ALL.into_iter().map(move |p| (p, self.get(p)))
    }

    pub fn is_empty(&self) -> bool {
        self.phases.iter().all(PhaseStats::is_empty)
    }
}
