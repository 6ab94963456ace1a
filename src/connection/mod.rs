// src/connection/mod.rs
//
// Backend capability set shared by every storage variant, and the factory that
// picks a variant from the order's connection type.
//
// Workers and foremen only ever see `dyn Connection`; adding a backend means
// adding a `ConnectionType` variant and a constructor arm in `BackendFactory`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::constants::DEFAULT_OPERATION_TIMEOUT;
use crate::error::ConnectionError;
use crate::order::{ConnectionType, Order};

pub mod file;
#[cfg(feature = "rados")]
pub mod rados;
pub mod s3;

pub type ConnResult<T> = std::result::Result<T, ConnectionError>;

/// One client bound to one target.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Endpoint (or root directory) this connection talks to.
    fn target(&self) -> &str;

    /// Idempotent; an existing namespace is fine.
    async fn create_namespace(&self) -> ConnResult<()>;

    /// Idempotent, and only called after the run has finished.
    async fn delete_namespace(&self) -> ConnResult<()>;

    /// Store exactly `buf.len()` bytes under `key`.
    async fn put(&self, key: &str, id: u64, buf: &[u8]) -> ConnResult<()>;

    /// Fill `buf` completely from the stored object. A stored object of any
    /// other length is a `SizeMismatch`.
    async fn get(&self, key: &str, id: u64, buf: &mut [u8]) -> ConnResult<()>;

    /// Drop any client-side cache before the read stage.
    async fn invalidate_cache(&self) -> ConnResult<()> {
        Ok(())
    }
}

/// Builds connections for a foreman. Tests substitute their own to inject
/// failures.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, order: &Order, target: &str) -> ConnResult<Arc<dyn Connection>>;
}

/// The production factory: dispatches on [`Order::connection_type`].
#[derive(Debug, Clone)]
pub struct BackendFactory {
    pub op_timeout: Duration,
    #[cfg(feature = "rados")]
    clusters: Arc<rados::ClusterCache>,
}

impl BackendFactory {
    /// `op_timeout` bounds every put and get that makes no progress.
    pub fn new(op_timeout: Duration) -> Self {
        Self {
            op_timeout,
            #[cfg(feature = "rados")]
            clusters: Arc::default(),
        }
    }
}

impl Default for BackendFactory {
    fn default() -> Self {
        Self::new(DEFAULT_OPERATION_TIMEOUT)
    }
}

#[async_trait]
impl ConnectionFactory for BackendFactory {
    async fn connect(&self, order: &Order, target: &str) -> ConnResult<Arc<dyn Connection>> {
        let conn: Arc<dyn Connection> = match order.connection_type {
            ConnectionType::File => Arc::new(
                file::FileConnection::new(target, &order.bucket)?.with_timeout(self.op_timeout),
            ),
            ConnectionType::S3 => Arc::new(s3::S3Connection::new(
                target,
                order.port,
                &order.bucket,
                &order.credentials,
                self.op_timeout,
            )?),
            #[cfg(feature = "rados")]
            ConnectionType::Rados => Arc::new(
                rados::RadosConnection::connect(
                    target,
                    &order.targets,
                    &order.bucket,
                    &order.credentials,
                    self.op_timeout,
                    &self.clusters,
                )
                .await?,
            ),
            #[cfg(not(feature = "rados"))]
            ConnectionType::Rados => {
                return Err(ConnectionError::BackendUnavailable(
                    "this foreman was built without the `rados` feature".to_string(),
                ))
            }
        };
        Ok(conn)
    }
}

/// Fail with `Timeout(limit)` when `op` has not finished within `limit`.
/// Backends without a client-side timeout of their own wrap every call in it.
pub async fn with_timeout<T>(
    limit: Duration,
    op: impl Future<Output = ConnResult<T>>,
) -> ConnResult<T> {
    tokio::time::timeout(limit, op)
        .await
        .map_err(|_| ConnectionError::Timeout(limit))?
}

/// `host` → `http://host:port`. Addresses carrying a scheme or a port are
/// kept; IPv6 literals are bracketed (`::1` → `http://[::1]:port`).
pub fn http_url(address: &str, default_port: u16) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else if address.parse::<std::net::Ipv6Addr>().is_ok() {
        format!("http://[{address}]:{default_port}")
    } else if let Some(rest) = address.strip_prefix('[') {
        if rest.contains("]:") {
            format!("http://{address}")
        } else {
            format!("http://{address}:{default_port}")
        }
    } else if address.contains(':') {
        format!("http://{address}")
    } else {
        format!("http://{address}:{default_port}")
    }
}

/// Look up a required credential, failing with `InvalidCredentials`.
pub(crate) fn credential<'a>(
    creds: &'a crate::order::Credentials,
    key: &str,
) -> ConnResult<&'a str> {
    creds
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConnectionError::InvalidCredentials(format!("missing credential `{key}`")))
}

/// Cache invalidation that never fails the surrounding phase.
pub async fn invalidate_cache_best_effort(conn: &dyn Connection) {
    if let Err(e) = conn.invalidate_cache().await {
        warn!(endpoint = conn.target(), "cache invalidation failed: {}", e);
    }
}

/// Namespace removal that never fails the job. Returns whether it worked.
pub async fn delete_namespace_best_effort(conn: &dyn Connection) -> Result<(), String> {
    match conn.delete_namespace().await {
        Ok(()) => {
            info!(endpoint = conn.target(), "namespace deleted");
            Ok(())
        }
        Err(e) => {
            warn!(endpoint = conn.target(), "namespace cleanup failed: {}", e);
            Err(e.to_string())
        }
    }
}
