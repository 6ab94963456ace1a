// src/connection/rados.rs
//
// Ceph RADOS pool backend, built with `--features rados` (links librados).
// Targets are monitor addresses; the bucket names the pool.
//
// Credentials: `key` (cephx secret, required), `user` (defaults to admin).

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use ceph::ceph::{connect_to_ceph, IoCtx, Rados};
use ceph::error::RadosError;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{credential, with_timeout, ConnResult, Connection};
use crate::constants::DEFAULT_CEPH_USER;
use crate::error::ConnectionError;
use crate::order::Credentials;

/// An io context and the cluster handle it was opened from.
///
/// Fields drop in declaration order: `rados_ioctx_destroy` must run before
/// `rados_shutdown`, so `ioctx` stays first.
struct Pool {
    ioctx: IoCtx,
    cluster: Arc<Rados>,
}

pub struct RadosConnection {
    target: String,
    name: String,
    pool: Arc<Pool>,
    op_timeout: Duration,
}

/// Cluster handles shared by every connection a foreman opens, keyed by
/// user, monitors and key. A handle shuts down with its last connection.
#[derive(Default)]
pub struct ClusterCache {
    clusters: Mutex<HashMap<String, Weak<Rados>>>,
}

impl fmt::Debug for ClusterCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCache").finish_non_exhaustive()
    }
}

/// librados errors carry a negative errno; classify by its io kind.
fn map_rados_err(err: RadosError, what: &str) -> ConnectionError {
    match err {
        RadosError::ApiError(errno) => {
            ConnectionError::from_io(std::io::Error::from_raw_os_error(errno as i32), what)
        }
        RadosError::IoError(e) => ConnectionError::from_io(e, what),
        other => ConnectionError::Io(format!("{what}: {other}")),
    }
}

fn is_kind(err: &RadosError, kind: std::io::ErrorKind) -> bool {
    matches!(err, RadosError::ApiError(errno)
        if std::io::Error::from_raw_os_error(*errno as i32).kind() == kind)
}

async fn blocking<T, F>(what: &str, f: F) -> ConnResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ConnResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ConnectionError::Io(format!("{what}: blocking task failed: {e}")))?
}

/// Writes a throwaway ceph.conf holding the monitors and key, then connects.
async fn open_cluster(user: &str, mon_host: String, key: String) -> ConnResult<Rados> {
    let conf = tokio::task::spawn_blocking({
        let user = user.to_string();
        move || -> std::io::Result<tempfile::NamedTempFile> {
            let mut f = tempfile::Builder::new().prefix("fleetbench-ceph").suffix(".conf").tempfile()?;
            writeln!(f, "[global]")?;
            writeln!(f, "mon_host = {mon_host}")?;
            writeln!(f, "[client.{user}]")?;
            writeln!(f, "key = {key}")?;
            f.flush()?;
            Ok(f)
        }
    })
    .await
    .map_err(|e| ConnectionError::Io(format!("ceph.conf: {e}")))?
    .map_err(|e| ConnectionError::Io(format!("ceph.conf: {e}")))?;

    let conf_path = conf.path().to_string_lossy().into_owned();
    let user = user.to_string();
    let cluster = blocking("rados connect", move || {
        connect_to_ceph(&user, &conf_path).map_err(|e| {
            ConnectionError::BackendUnavailable(format!("rados connect: {e}"))
        })
    })
    .await?;
    drop(conf);
    Ok(cluster)
}

impl ClusterCache {
    async fn get_or_connect(&self, user: &str, monitors: &[String], key: &str) -> ConnResult<Arc<Rados>> {
        let mon_host = monitors.join(",");
        let id = format!("{user}@{mon_host}#{key}");
        let mut clusters = self.clusters.lock().await;
        if let Some(cluster) = clusters.get(&id).and_then(Weak::upgrade) {
            debug!("reusing rados cluster handle for {}", mon_host);
            return Ok(cluster);
        }
        clusters.retain(|_, c| c.strong_count() > 0);
        debug!("rados connection as {} to {}", user, mon_host);
        let cluster = Arc::new(open_cluster(user, mon_host, key.to_string()).await?);
        clusters.insert(id, Arc::downgrade(&cluster));
        Ok(cluster)
    }
}

impl RadosConnection {
    /// Open an io context on `pool`, creating the pool if needed. The cluster
    /// handle comes from `clusters`, so every target of one order shares it.
    pub async fn connect(
        target: &str,
        monitors: &[String],
        pool: &str,
        creds: &Credentials,
        op_timeout: Duration,
        clusters: &ClusterCache,
    ) -> ConnResult<Self> {
        let key = credential(creds, "key")?;
        let user = creds
            .get("user")
            .filter(|u| !u.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_CEPH_USER.to_string());
        let cluster = clusters.get_or_connect(&user, monitors, key).await?;

        let pool_name = pool.to_string();
        let ioctx = blocking("rados pool", {
            let cluster = Arc::clone(&cluster);
            move || {
                match cluster.rados_create_pool(&pool_name) {
                    Ok(()) => info!("created pool {}", pool_name),
                    Err(e) if is_kind(&e, std::io::ErrorKind::AlreadyExists) => {}
                    Err(e) => {
                        return Err(match map_rados_err(e, &pool_name) {
                            ConnectionError::PermissionDenied(m) => ConnectionError::PermissionDenied(m),
                            other => ConnectionError::BackendUnavailable(other.to_string()),
                        })
                    }
                }
                cluster
                    .get_rados_ioctx(&pool_name)
                    .map_err(|e| ConnectionError::BackendUnavailable(format!("{pool_name}: {e}")))
            }
        })
        .await?;

        Ok(Self {
            target: target.to_string(),
            name: pool.to_string(),
            pool: Arc::new(Pool { ioctx, cluster }),
            op_timeout,
        })
    }
}

#[async_trait]
impl Connection for RadosConnection {
    fn target(&self) -> &str {
        &self.target
    }

    /// The pool is created while connecting, since the io context needs it.
    async fn create_namespace(&self) -> ConnResult<()> {
        Ok(())
    }

    async fn delete_namespace(&self) -> ConnResult<()> {
        info!("deleting pool {}", self.name);
        let pool = Arc::clone(&self.pool);
        let name = self.name.clone();
        blocking("delete pool", move || match pool.cluster.rados_delete_pool(&name) {
            Ok(()) => Ok(()),
            Err(e) if is_kind(&e, std::io::ErrorKind::NotFound) => Ok(()),
            Err(e) => Err(map_rados_err(e, &name)),
        })
        .await
    }

    async fn put(&self, key: &str, _id: u64, buf: &[u8]) -> ConnResult<()> {
        let pool = Arc::clone(&self.pool);
        let key = key.to_string();
        let data = buf.to_vec();
        with_timeout(
            self.op_timeout,
            blocking("rados write", move || {
                pool.ioctx
                    .rados_object_write_full(&key, &data)
                    .map_err(|e| map_rados_err(e, &key))
            }),
        )
        .await
    }

    async fn get(&self, key: &str, _id: u64, buf: &mut [u8]) -> ConnResult<()> {
        let pool = Arc::clone(&self.pool);
        let name = key.to_string();
        let expected = buf.len() as u64;
        let data = with_timeout(
            self.op_timeout,
            blocking("rados read", move || {
                let (size, _) = pool
                    .ioctx
                    .rados_object_stat(&name)
                    .map_err(|e| map_rados_err(e, &name))?;
                if size != expected {
                    return Err(ConnectionError::SizeMismatch {
                        expected,
                        actual: size,
                    });
                }
                let mut data = Vec::with_capacity(expected as usize);
                pool.ioctx
                    .rados_object_read(&name, &mut data, 0)
                    .map_err(|e| map_rados_err(e, &name))?;
                Ok(data)
            }),
        )
        .await?;
        if data.len() != buf.len() {
            return Err(ConnectionError::SizeMismatch {
                expected,
                actual: data.len() as u64,
            });
        }
        buf.copy_from_slice(&data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_classification() {
        let not_found = map_rados_err(RadosError::from(-2), "obj_1");
        assert!(matches!(not_found, ConnectionError::NotFound(_)), "{not_found}");
        let denied = map_rados_err(RadosError::from(-13), "pool");
        assert!(matches!(denied, ConnectionError::PermissionDenied(_)), "{denied}");
        assert!(is_kind(&RadosError::from(-17), std::io::ErrorKind::AlreadyExists));
        assert!(!is_kind(&RadosError::from(-2), std::io::ErrorKind::AlreadyExists));
    }
}
