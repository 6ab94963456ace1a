// src/config.rs
//
// YAML job files. Everything the CLI can say can also live in a file:
//
//   servers: [node1, node2:6000]
//   object_size: 4M
//   objects: 10000
//   run_time: 60s
//   backend:
//     type: s3
//     targets: [rgw1, rgw2]
//     credentials: { access_key: AK, secret_key: SK }

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BUCKET, DEFAULT_OBJECT_COUNT, DEFAULT_OBJECT_SIZE, DEFAULT_PORT, DEFAULT_RAMP_DOWN_SECS,
    DEFAULT_RAMP_UP_SECS, DEFAULT_RUN_TIME_SECS, DEFAULT_S3_PORT,
};
use crate::error::{BenchError, Result};
use crate::manager::Job;
use crate::order::{ConnectionType, Credentials, GeneratorType, Order, PhaseTiming};
use crate::size_parser::{deserialize_size, parse_size};

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_object_size() -> u64 {
    // The constant is a literal known to parse.
    parse_size(DEFAULT_OBJECT_SIZE).unwrap_or(1 << 20)
}

fn default_objects() -> u64 {
    DEFAULT_OBJECT_COUNT
}

fn default_run_time() -> Duration {
    Duration::from_secs(DEFAULT_RUN_TIME_SECS)
}

fn default_ramp_up() -> Duration {
    Duration::from_secs(DEFAULT_RAMP_UP_SECS)
}

fn default_ramp_down() -> Duration {
    Duration::from_secs(DEFAULT_RAMP_DOWN_SECS)
}

fn default_true() -> bool {
    true
}

fn default_bucket() -> String {
    DEFAULT_BUCKET.to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub kind: ConnectionType,

    /// Endpoints, monitors, or mounted directories.
    pub targets: Vec<String>,

    /// Bucket, pool, or sub-directory.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Backend port; S3 defaults to the RADOS gateway port.
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    /// Foreman addresses.
    pub servers: Vec<String>,

    /// Foreman port for addresses that do not carry one.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_object_size", deserialize_with = "deserialize_size")]
    pub object_size: u64,

    /// Working set size.
    #[serde(default = "default_objects")]
    pub objects: u64,

    #[serde(default = "default_run_time", with = "humantime_serde")]
    pub run_time: Duration,

    #[serde(default = "default_ramp_up", with = "humantime_serde")]
    pub ramp_up: Duration,

    #[serde(default = "default_ramp_down", with = "humantime_serde")]
    pub ramp_down: Duration,

    /// Workers per target on each foreman; 0 lets the foreman decide.
    #[serde(default)]
    pub workers: u32,

    /// Compare read content, not just size.
    #[serde(default = "default_true")]
    pub verify: bool,

    /// Delete the namespace after the run.
    #[serde(default)]
    pub cleanup: bool,

    /// Generator seed; random when omitted.
    #[serde(default)]
    pub seed: Option<u64>,

    pub backend: BackendConfig,
}

impl JobConfig {
    /// A job with every optional setting at its default.
    pub fn new(servers: Vec<String>, backend: BackendConfig) -> Self {
        Self {
            servers,
            port: default_port(),
            object_size: default_object_size(),
            objects: default_objects(),
            run_time: default_run_time(),
            ramp_up: default_ramp_up(),
            ramp_down: default_ramp_down(),
            workers: 0,
            verify: true,
            cleanup: false,
            seed: None,
            backend,
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| BenchError::Config(format!("job file: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BenchError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    pub fn timing(&self) -> PhaseTiming {
        PhaseTiming {
            ramp_up: self.ramp_up,
            run_time: self.run_time,
            ramp_down: self.ramp_down,
        }
    }

    /// The order this file describes. `job_id` is left at 0 for the manager.
    pub fn order(&self) -> Order {
        let port = self.backend.port.unwrap_or(match self.backend.kind {
            ConnectionType::S3 => DEFAULT_S3_PORT,
            ConnectionType::Rados | ConnectionType::File => 0,
        });
        Order {
            job_id: 0,
            object_size: self.object_size,
            seed: self.seed.unwrap_or_else(rand::random),
            generator_type: GeneratorType::Prng,
            range_start: 0,
            range_end: self.objects,
            targets: self.backend.targets.clone(),
            connection_type: self.backend.kind,
            bucket: self.backend.bucket.clone(),
            credentials: self.backend.credentials.clone(),
            port,
            workers_per_target: self.workers,
            verify_content: self.verify,
            cleanup: self.cleanup,
        }
    }

    pub fn to_job(&self) -> Result<Job> {
        let order = self.order();
        order.validate()?;
        if self.servers.is_empty() {
            return Err(BenchError::Config("job file lists no servers".into()));
        }
        Ok(Job::new(order, self.servers.clone(), self.timing()))
    }
}
