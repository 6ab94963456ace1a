// src/constants.rs
//
// Central location for the defaults and tunables used throughout fleet-bench.

use std::time::Duration;

// =============================================================================
// Network defaults
// =============================================================================

/// Port the foreman listens on, and the manager dials, unless told otherwise.
pub const DEFAULT_PORT: u16 = 5150;

/// RADOS gateway / S3 endpoint port used when the job does not name one.
pub const DEFAULT_S3_PORT: u16 = 7480;

/// Bucket, pool or directory name used when the job does not name one.
pub const DEFAULT_BUCKET: &str = "fleetbench";

/// Ceph user used for RADOS jobs when none is given.
pub const DEFAULT_CEPH_USER: &str = "admin";

// =============================================================================
// Job defaults
// =============================================================================

/// Default object size (1 MiB).
pub const DEFAULT_OBJECT_SIZE: &str = "1M";

/// Default working set, in objects.
pub const DEFAULT_OBJECT_COUNT: u64 = 1000;

/// Measured seconds per stage.
pub const DEFAULT_RUN_TIME_SECS: u64 = 30;

/// Unmeasured seconds at the start of each stage.
pub const DEFAULT_RAMP_UP_SECS: u64 = 5;

/// Unmeasured seconds at the end of each stage.
pub const DEFAULT_RAMP_DOWN_SECS: u64 = 2;

// =============================================================================
// Manager timeouts
// =============================================================================

/// Time allowed to establish the gRPC channel to one foreman.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for a foreman to validate the order and set up its backend.
pub const CONFIGURE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long past the nominal end of the phases the manager waits for a report.
/// Covers draining in-flight operations on slow backends.
pub const REPORT_GRACE: Duration = Duration::from_secs(60);

/// Time allowed for the best-effort namespace cleanup after a job.
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// Backend behaviour
// =============================================================================

/// A single put/get making no progress for this long fails with `Timeout`.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Latency histograms
// =============================================================================

/// Lowest trackable latency in microseconds.
pub const HISTOGRAM_LOW_US: u64 = 1;

/// Highest trackable latency in microseconds (one hour).
pub const HISTOGRAM_HIGH_US: u64 = 3_600_000_000;

/// Significant figures kept by every latency histogram.
pub const HISTOGRAM_SIGFIG: u8 = 3;

/// Quantiles reported for each phase.
pub const REPORT_QUANTILES: [(&str, f64); 5] = [
    ("p50", 0.50),
    ("p90", 0.90),
    ("p95", 0.95),
    ("p99", 0.99),
    ("p999", 0.999),
];
