// src/connection/s3.rs
//
// S3-compatible object store backend (RGW, MinIO, AWS). One client per target
// endpoint, path-style addressing, static credentials from the order.
//
// Credentials: `access_key`, `secret_key`.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials as S3Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{debug, info};

use super::{credential, http_url, ConnResult, Connection};
use crate::constants::CONNECT_TIMEOUT;
use crate::error::ConnectionError;
use crate::order::Credentials;

pub struct S3Connection {
    target: String,
    bucket: String,
    client: Client,
    op_timeout: Duration,
}

/// Gateway target to endpoint URL; see [`http_url`].
pub fn endpoint_url(target: &str, port: u16) -> String {
    http_url(target, port)
}

impl S3Connection {
    pub fn new(
        target: &str,
        port: u16,
        bucket: &str,
        creds: &Credentials,
        op_timeout: Duration,
    ) -> ConnResult<Self> {
        let access_key = credential(creds, "access_key")?;
        let secret_key = credential(creds, "secret_key")?;
        let endpoint = endpoint_url(target, port);
        debug!("s3 connection to {} bucket {}", endpoint, bucket);

        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(endpoint)
            .credentials_provider(S3Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "fleetbench",
            ))
            .force_path_style(true)
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(CONNECT_TIMEOUT)
                    .operation_timeout(op_timeout)
                    .build(),
            )
            .build();

        Ok(Self {
            target: target.to_string(),
            bucket: bucket.to_string(),
            client: Client::from_conf(config),
            op_timeout,
        })
    }

    fn map_err<E>(&self, err: SdkError<E, HttpResponse>, what: &str) -> ConnectionError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match &err {
            SdkError::TimeoutError(_) => ConnectionError::Timeout(self.op_timeout),
            SdkError::DispatchFailure(_) => {
                ConnectionError::BackendUnavailable(format!("{}: {what}: {err}", self.target))
            }
            _ => match err.raw_response().map(|r| r.status().as_u16()) {
                Some(401) | Some(403) => {
                    ConnectionError::PermissionDenied(format!("{}: {what}", self.target))
                }
                Some(404) => ConnectionError::NotFound(what.to_string()),
                _ => ConnectionError::Io(format!("{what}: {}", aws_error_text(&err))),
            },
        }
    }
}

/// SdkError's Display is just the variant name; the source carries the detail.
fn aws_error_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(s) = source {
        text.push_str(": ");
        text.push_str(&s.to_string());
        source = s.source();
    }
    text
}

#[async_trait]
impl Connection for S3Connection {
    fn target(&self) -> &str {
        &self.target
    }

    async fn create_namespace(&self) -> ConnResult<()> {
        info!("creating bucket {} on {}", self.bucket, self.target);
        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error().is_some_and(|se| {
                    se.is_bucket_already_owned_by_you() || se.is_bucket_already_exists()
                }) =>
            {
                debug!("bucket {} already exists", self.bucket);
                Ok(())
            }
            Err(e) => Err(match self.map_err(e, &self.bucket) {
                // Any failure to set up the namespace takes the foreman out.
                ConnectionError::Io(m) | ConnectionError::NotFound(m) => {
                    ConnectionError::BackendUnavailable(m)
                }
                other => other,
            }),
        }
    }

    async fn delete_namespace(&self) -> ConnResult<()> {
        info!("deleting bucket {} on {}", self.bucket, self.target);
        let mut token: Option<String> = None;
        loop {
            let page = match self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_continuation_token(token.take())
                .send()
                .await
            {
                Ok(p) => p,
                Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_bucket()) => {
                    return Ok(())
                }
                Err(e) => return Err(self.map_err(e, &self.bucket)),
            };
            for obj in page.contents() {
                if let Some(key) = obj.key() {
                    self.client
                        .delete_object()
                        .bucket(&self.bucket)
                        .key(key)
                        .send()
                        .await
                        .map_err(|e| self.map_err(e, key))?;
                }
            }
            match page.next_continuation_token() {
                Some(t) if page.is_truncated().unwrap_or(false) => token = Some(t.to_string()),
                _ => break,
            }
        }
        self.client
            .delete_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| self.map_err(e, &self.bucket))?;
        Ok(())
    }

    async fn put(&self, key: &str, _id: u64, buf: &[u8]) -> ConnResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(Bytes::copy_from_slice(buf)))
            .send()
            .await
            .map_err(|e| self.map_err(e, key))?;
        Ok(())
    }

    async fn get(&self, key: &str, _id: u64, buf: &mut [u8]) -> ConnResult<()> {
        let out = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(o) => o,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Err(ConnectionError::NotFound(key.to_string()))
            }
            Err(e) => return Err(self.map_err(e, key)),
        };
        let expected = buf.len() as u64;
        if let Some(len) = out.content_length() {
            if len as u64 != expected {
                return Err(ConnectionError::SizeMismatch {
                    expected,
                    actual: len as u64,
                });
            }
        }

        let mut body = out.body;
        let mut filled = 0usize;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ConnectionError::Io(format!("{key}: {e}")))?;
            let end = filled + chunk.len();
            if end > buf.len() {
                return Err(ConnectionError::SizeMismatch {
                    expected,
                    actual: end as u64,
                });
            }
            buf[filled..end].copy_from_slice(&chunk);
            filled = end;
        }
        if filled != buf.len() {
            return Err(ConnectionError::SizeMismatch {
                expected,
                actual: filled as u64,
            });
        }
        Ok(())
    }
}
