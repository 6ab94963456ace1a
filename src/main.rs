// src/main.rs
//
// fleetbench: the manager CLI. Builds a job from flags or a YAML file, drives
// the foremen through it, and prints the merged report.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use fleet_bench::config::{BackendConfig, JobConfig};
use fleet_bench::constants::{DEFAULT_BUCKET, DEFAULT_CEPH_USER, DEFAULT_PORT, DEFAULT_S3_PORT};
use fleet_bench::order::Credentials;
use fleet_bench::phase::PhaseSchedule;
use fleet_bench::size_parser::parse_size;
use fleet_bench::{ConnectionType, Manager, ManagerSettings};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "fleetbench", version, about = "Synchronized distributed storage benchmark")]
struct Cli {
    /// Increase verbosity (-v = info, -vv = debug, -vvv = trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a benchmark job across the foremen
    ///
    /// Examples:
    ///   fleetbench run s3 --servers n1,n2 --s3-access-key AK --s3-secret-key SK rgw1 rgw2
    ///   fleetbench run file --servers n1 -s 4K -o 10000 /mnt/cephfs
    ///   fleetbench run --config job.yaml -r 120
    Run(RunArgs),

    /// Check that foremen are reachable and report their versions
    Ping {
        /// Comma-separated foreman addresses (host or host:port)
        #[arg(long, value_delimiter = ',', required = true)]
        servers: Vec<String>,

        /// Foreman port for addresses without one
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
}

#[derive(Args)]
struct RunArgs {
    /// YAML job file; flags given here override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(flatten)]
    common: CommonOpts,

    #[command(subcommand)]
    backend: Option<BackendCmd>,
}

#[derive(Args, Clone, Default)]
struct CommonOpts {
    /// Comma-separated foreman addresses (host or host:port)
    #[arg(long, value_delimiter = ',')]
    servers: Option<Vec<String>>,

    /// Foreman port for addresses without one [default: 5150]
    #[arg(short, long)]
    port: Option<u16>,

    /// Object size, e.g. 4096, 64K, 1M, 8MB [default: 1M]
    #[arg(short, long, value_parser = parse_size_arg)]
    size: Option<u64>,

    /// Number of objects in the working set [default: 1000]
    #[arg(short, long)]
    objects: Option<u64>,

    /// Measured seconds per stage [default: 30]
    #[arg(short, long, value_name = "SECS")]
    run_time: Option<u64>,

    /// Unmeasured warm-up seconds per stage [default: 5]
    #[arg(short = 'u', long, value_name = "SECS")]
    ramp_up: Option<u64>,

    /// Unmeasured wind-down seconds per stage [default: 2]
    #[arg(short = 'd', long, value_name = "SECS")]
    ramp_down: Option<u64>,

    /// Write the full report as JSON
    #[arg(short, long, value_name = "FILE")]
    json_output: Option<PathBuf>,

    /// Workers per target on each foreman (default: the foreman's own)
    #[arg(long)]
    workers: Option<u32>,

    /// Check read sizes only, skip content comparison
    #[arg(long)]
    no_verify: bool,

    /// Delete the bucket, pool or directory afterwards
    #[arg(long)]
    cleanup: bool,

    /// Generator seed (random when omitted)
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum BackendCmd {
    /// S3 endpoints (usually RADOS gateways), dealt out across foremen
    S3 {
        #[command(flatten)]
        common: CommonOpts,

        #[arg(long, env = "FLEETBENCH_S3_ACCESS_KEY", hide_env_values = true)]
        s3_access_key: String,

        #[arg(long, env = "FLEETBENCH_S3_SECRET_KEY", hide_env_values = true)]
        s3_secret_key: String,

        #[arg(long, default_value = DEFAULT_BUCKET)]
        s3_bucket: String,

        #[arg(long, default_value_t = DEFAULT_S3_PORT)]
        s3_port: u16,

        /// Gateway hostnames or addresses
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// A Ceph pool through librados
    Rados {
        #[command(flatten)]
        common: CommonOpts,

        #[arg(long, default_value = DEFAULT_BUCKET)]
        ceph_pool: String,

        #[arg(long, default_value = DEFAULT_CEPH_USER)]
        ceph_user: String,

        #[arg(long, env = "FLEETBENCH_CEPH_KEY", hide_env_values = true)]
        ceph_key: String,

        /// Monitor addresses
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Mounted filesystems, the same paths on every foreman
    File {
        #[command(flatten)]
        common: CommonOpts,

        /// Sub-directory created under each mount
        #[arg(long, default_value = DEFAULT_BUCKET)]
        dir: String,

        /// Mount points
        #[arg(required = true)]
        targets: Vec<String>,
    },
}

fn parse_size_arg(s: &str) -> std::result::Result<u64, String> {
    parse_size(s).map_err(|e| e.to_string())
}

impl CommonOpts {
    /// Flags win over whatever the job file (or the defaults) said.
    fn apply(&self, cfg: &mut JobConfig) {
        if let Some(servers) = &self.servers {
            cfg.servers = servers.clone();
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(size) = self.size {
            cfg.object_size = size;
        }
        if let Some(objects) = self.objects {
            cfg.objects = objects;
        }
        if let Some(secs) = self.run_time {
            cfg.run_time = Duration::from_secs(secs);
        }
        if let Some(secs) = self.ramp_up {
            cfg.ramp_up = Duration::from_secs(secs);
        }
        if let Some(secs) = self.ramp_down {
            cfg.ramp_down = Duration::from_secs(secs);
        }
        if let Some(workers) = self.workers {
            cfg.workers = workers;
        }
        if self.no_verify {
            cfg.verify = false;
        }
        if self.cleanup {
            cfg.cleanup = true;
        }
        if self.seed.is_some() {
            cfg.seed = self.seed;
        }
    }
}

fn backend_job(cmd: BackendCmd) -> (CommonOpts, JobConfig) {
    let (common, backend) = match cmd {
        BackendCmd::S3 {
            common,
            s3_access_key,
            s3_secret_key,
            s3_bucket,
            s3_port,
            targets,
        } => {
            let credentials = Credentials::from([
                ("access_key".to_string(), s3_access_key),
                ("secret_key".to_string(), s3_secret_key),
            ]);
            let backend = BackendConfig {
                kind: ConnectionType::S3,
                targets,
                bucket: s3_bucket,
                port: Some(s3_port),
                credentials,
            };
            (common, backend)
        }
        BackendCmd::Rados {
            common,
            ceph_pool,
            ceph_user,
            ceph_key,
            targets,
        } => {
            let credentials = Credentials::from([
                ("user".to_string(), ceph_user),
                ("key".to_string(), ceph_key),
            ]);
            let backend = BackendConfig {
                kind: ConnectionType::Rados,
                targets,
                bucket: ceph_pool,
                port: None,
                credentials,
            };
            (common, backend)
        }
        BackendCmd::File {
            common,
            dir,
            targets,
        } => {
            let backend = BackendConfig {
                kind: ConnectionType::File,
                targets,
                bucket: dir,
                port: None,
                credentials: Credentials::new(),
            };
            (common, backend)
        }
    };
    let cfg = JobConfig::new(Vec::new(), backend);
    (common, cfg)
}

fn progress_bar(total: Duration) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total.as_millis() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {percent}% {msg}",
        )?
        .progress_chars("#>-"),
    );
    Ok(pb)
}

async fn run_job(args: RunArgs) -> Result<()> {
    let (cfg, json_output) = match (args.config, args.backend) {
        (Some(path), None) => {
            let mut cfg = JobConfig::from_file(&path)
                .with_context(|| format!("loading job file {}", path.display()))?;
            args.common.apply(&mut cfg);
            (cfg, args.common.json_output)
        }
        (None, Some(cmd)) => {
            let (common, mut cfg) = backend_job(cmd);
            // Flags before the backend name count too; the later ones win.
            args.common.apply(&mut cfg);
            common.apply(&mut cfg);
            let json = common.json_output.or(args.common.json_output);
            (cfg, json)
        }
        _ => bail!("give either a backend (s3, rados, file) or --config FILE"),
    };
    if cfg.servers.is_empty() {
        bail!("no foremen given (use --servers)");
    }

    let mut job = cfg.to_job().context("invalid job")?;
    debug!("job: {:?}", job.order);
    let settings = ManagerSettings {
        foreman_port: cfg.port,
        ..ManagerSettings::default()
    };
    let mut manager = Manager::new(settings);

    let pb = progress_bar(job.timing.total())?;
    let ticker = {
        let pb = pb.clone();
        let schedule = PhaseSchedule::new(&job.timing);
        let start = Instant::now();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(200));
            loop {
                tick.tick().await;
                let elapsed = start.elapsed();
                pb.set_position(elapsed.as_millis() as u64);
                match schedule.phase_at(elapsed) {
                    Some(phase) => pb.set_message(phase.to_string()),
                    None => pb.set_message("collecting reports"),
                }
            }
        })
    };
    let result = manager.run(&mut job).await;
    ticker.abort();
    pb.finish_and_clear();
    result.context("job failed")?;

    let Some(report) = job.report.as_ref() else {
        bail!("job finished without a report");
    };
    if report.is_partial() {
        warn!("partial result: some foremen did not report");
    }
    let mut stdout = std::io::stdout().lock();
    report.print_summary(&mut stdout)?;
    stdout.flush()?;

    if let Some(path) = json_output {
        report
            .write_json(&path)
            .with_context(|| format!("writing report to {}", path.display()))?;
        info!("report written to {}", path.display());
    }
    Ok(())
}

async fn ping(servers: Vec<String>, port: u16) -> Result<()> {
    let manager = Manager::new(ManagerSettings {
        foreman_port: port,
        ..ManagerSettings::default()
    });
    let mut unreachable = 0;
    for server in &servers {
        match manager.ping(server).await {
            Ok(version) => println!("{server}: fleetbench-foreman {version}"),
            Err(e) => {
                println!("{server}: unreachable ({e})");
                unreachable += 1;
            }
        }
    }
    if unreachable > 0 {
        bail!("{unreachable} of {} foremen unreachable", servers.len());
    }
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::new(format!("fleetbench={level},fleet_bench={level}"));
    fmt().with_env_filter(filter).with_target(false).init();
    debug!("Logging initialized at level: {}", level);

    match cli.command {
        Commands::Run(args) => run_job(args).await,
        Commands::Ping { servers, port } => ping(servers, port).await,
    }
}
