// src/order.rs
//
// The job specification shared by every foreman, plus the per-foreman pieces
// (timing and assignment) that travel next to it.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::{BenchError, Result};
use crate::partition;

/// Backend selector. Adding a backend means adding a variant here and a
/// constructor in [`crate::connection::BackendFactory`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    S3,
    Rados,
    File,
}

/// How the target list is handed out to foremen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPolicy {
    /// Every foreman gets the whole list (one cluster behind a broker, or a
    /// shared mount).
    Whole,
    /// Endpoints are dealt round-robin across foremen.
    Shard,
}

impl ConnectionType {
    pub fn target_policy(self) -> TargetPolicy {
        match self {
            ConnectionType::S3 => TargetPolicy::Shard,
            ConnectionType::Rados | ConnectionType::File => TargetPolicy::Whole,
        }
    }
}

/// Key/content generation algorithm. Open for deterministic-sequential or
/// fixed-content variants without a protocol change (it travels as a string).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorType {
    #[default]
    Prng,
}

/// Opaque backend credentials. The core never looks inside; each connection
/// variant checks the keys it needs.
pub type Credentials = BTreeMap<String, String>;

/// Immutable job specification, copied verbatim to every foreman.
#[derive(Clone, PartialEq, Serialize)]
pub struct Order {
    pub job_id: u64,
    pub object_size: u64,
    pub seed: u64,
    pub generator_type: GeneratorType,
    pub range_start: u64,
    pub range_end: u64,
    pub targets: Vec<String>,
    pub connection_type: ConnectionType,
    pub bucket: String,
    #[serde(serialize_with = "redact_credentials")]
    pub credentials: Credentials,
    pub port: u16,
    /// Workers per assigned target; 0 lets each foreman use its own default.
    pub workers_per_target: u32,
    /// Compare read data with regenerated content, not just its size.
    pub verify_content: bool,
    /// Delete the namespace once every report is in.
    pub cleanup: bool,
}

fn redact_credentials<S: Serializer>(creds: &Credentials, s: S) -> std::result::Result<S::Ok, S::Error> {
    let redacted: BTreeMap<&str, &str> = creds.keys().map(|k| (k.as_str(), "***")).collect();
    redacted.serialize(s)
}

impl fmt::Debug for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Order")
            .field("job_id", &self.job_id)
            .field("object_size", &self.object_size)
            .field("seed", &self.seed)
            .field("generator_type", &self.generator_type)
            .field("range", &(self.range_start..self.range_end))
            .field("targets", &self.targets)
            .field("connection_type", &self.connection_type)
            .field("bucket", &self.bucket)
            .field("credentials", &self.credentials.keys().collect::<Vec<_>>())
            .field("port", &self.port)
            .field("workers_per_target", &self.workers_per_target)
            .field("verify_content", &self.verify_content)
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

impl Order {
    pub fn range(&self) -> Range<u64> {
        self.range_start..self.range_end
    }

    pub fn object_count(&self) -> u64 {
        self.range_end.saturating_sub(self.range_start)
    }

    /// Checks that hold for every foreman, before any I/O.
    pub fn validate(&self) -> Result<()> {
        if self.object_size == 0 {
            return Err(BenchError::Config("object size must be greater than zero".into()));
        }
        if usize::try_from(self.object_size).is_err() {
            return Err(BenchError::Config(format!(
                "object size {} does not fit in memory on this platform",
                self.object_size
            )));
        }
        if self.range_end <= self.range_start {
            return Err(BenchError::Config(format!(
                "empty key range [{}, {})",
                self.range_start, self.range_end
            )));
        }
        if self.targets.is_empty() {
            return Err(BenchError::Config("no targets given".into()));
        }
        if self.bucket.is_empty() {
            return Err(BenchError::Config("bucket/pool/directory name is empty".into()));
        }
        Ok(())
    }
}

/// Durations of the three phases of each stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseTiming {
    #[serde(with = "humantime_serde")]
    pub ramp_up: Duration,
    #[serde(with = "humantime_serde")]
    pub run_time: Duration,
    #[serde(with = "humantime_serde")]
    pub ramp_down: Duration,
}

impl PhaseTiming {
    pub fn from_secs(run_time: u64, ramp_up: u64, ramp_down: u64) -> Self {
        Self {
            ramp_up: Duration::from_secs(ramp_up),
            run_time: Duration::from_secs(run_time),
            ramp_down: Duration::from_secs(ramp_down),
        }
    }

    /// One stage: ramp-up + measurement + ramp-down.
    pub fn stage_duration(&self) -> Duration {
        self.ramp_up + self.run_time + self.ramp_down
    }

    /// Write stage followed by read stage.
    pub fn total(&self) -> Duration {
        self.stage_duration() * 2
    }
}

/// What one foreman is given on top of the shared order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub foreman_index: u32,
    pub foreman_count: u32,
    pub targets: Vec<String>,
}

impl Assignment {
    pub fn for_foreman(order: &Order, foreman_index: u32, foreman_count: u32) -> Self {
        let targets = match order.connection_type.target_policy() {
            TargetPolicy::Whole => order.targets.clone(),
            TargetPolicy::Shard => shard_targets(&order.targets, foreman_index, foreman_count),
        };
        Self {
            foreman_index,
            foreman_count,
            targets,
        }
    }

    /// This foreman's slice of the order's key range.
    pub fn key_range(&self, order: &Order) -> Range<u64> {
        partition::part(
            &order.range(),
            self.foreman_count as u64,
            self.foreman_index as u64,
        )
    }
}

/// Round-robin endpoints across foremen. With fewer endpoints than foremen,
/// foremen share endpoints so nobody is left without one.
pub fn shard_targets(targets: &[String], index: u32, count: u32) -> Vec<String> {
    if targets.is_empty() || count == 0 {
        return Vec::new();
    }
    let (index, count) = (index as usize, count as usize);
    if targets.len() >= count {
        targets.iter().skip(index).step_by(count).cloned().collect()
    } else {
        vec![targets[index % targets.len()].clone()]
    }
}

/// Everything a foreman receives for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkOrder {
    pub order: Order,
    pub timing: PhaseTiming,
    pub assignment: Assignment,
}

impl WorkOrder {
    pub fn validate(&self) -> Result<()> {
        self.order.validate()?;
        let a = &self.assignment;
        if a.foreman_count == 0 || a.foreman_index >= a.foreman_count {
            return Err(BenchError::Config(format!(
                "foreman index {} out of range for {} foremen",
                a.foreman_index, a.foreman_count
            )));
        }
        if a.targets.is_empty() {
            return Err(BenchError::Config("no targets assigned to this foreman".into()));
        }
        if a.key_range(&self.order).is_empty() {
            return Err(BenchError::Config(format!(
                "foreman {} of {} has no keys in [{}, {})",
                a.foreman_index, a.foreman_count, self.order.range_start, self.order.range_end
            )));
        }
        Ok(())
    }
}
