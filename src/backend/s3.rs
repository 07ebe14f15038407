//! Production object client for S3-compatible services.
//!
//! Every method issues one service call wrapped by the retry policy; the
//! SDK's own retry layer is disabled so the policy in the configuration is
//! the only one in effect.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::trace;

use crate::backend::object_store::{Listing, ObjectApi};
use crate::config::{AuthMode, StorageConfig};
use crate::error::{CloudFsError, Result};
use crate::pipeline::{AttrMap, ObjectAttributes};
use crate::retry::{with_retry, RetryPolicy};

/// Metadata key carrying the stored content digest.
const MD5_ATTR: &str = "content-md5";

/// `ObjectApi` backed by an S3-compatible service.
pub struct S3ObjectApi {
    client: Client,
    bucket: String,
    retry: RetryPolicy,
}

impl S3ObjectApi {
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).retry_config(RetryConfig::disabled());

        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }

        match config.mode {
            AuthMode::Key => {
                let key = config.account_key.clone().ok_or_else(|| {
                    CloudFsError::Config("mode 'key' requires account-key".into())
                })?;
                loader = loader.credentials_provider(Credentials::new(
                    config.account_name.clone(),
                    key,
                    None,
                    None,
                    "cloudfs-config",
                ));
            }
            AuthMode::Token => {
                let token = config.access_token.clone().ok_or_else(|| {
                    CloudFsError::Config("mode 'token' requires access-token".into())
                })?;
                loader = loader.credentials_provider(Credentials::new(
                    config.account_name.clone(),
                    config.account_key.clone().unwrap_or_default(),
                    Some(token),
                    None,
                    "cloudfs-config",
                ));
            }
            // ambient identity: the default chain resolves the credential
            AuthMode::Msi => {}
            AuthMode::Sas => {
                return Err(CloudFsError::Config(
                    "mode 'sas' is only supported by the share backend".into(),
                ));
            }
        }

        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.container.clone(),
            retry: config.retry.clone(),
        })
    }

    fn attrs_from(key: &str, size: u64, mtime: SystemTime, attrs: AttrMap) -> ObjectAttributes {
        let md5 = attrs.get(MD5_ATTR).cloned();
        ObjectAttributes {
            path: key.to_string(),
            size,
            mtime,
            md5,
            attrs,
        }
    }

    fn mtime_from(dt: Option<&aws_sdk_s3::primitives::DateTime>) -> SystemTime {
        dt.and_then(|dt| {
            SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs(dt.secs().max(0) as u64))
        })
        .unwrap_or_else(SystemTime::now)
    }
}

/// Map an SDK failure onto the error taxonomy. Transport interruptions and
/// server-side throttling classify transient; everything else returns to
/// the caller as-is.
fn classify<E>(op: &'static str, key: &str, err: SdkError<E>) -> CloudFsError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            CloudFsError::Transient {
                op,
                message: err.to_string(),
            }
        }
        SdkError::ServiceError(ctx) => match ctx.raw().status().as_u16() {
            404 => CloudFsError::NotFound(key.to_string()),
            401 | 403 => CloudFsError::Auth(format!("{op} on {key}: {err}")),
            409 | 412 => CloudFsError::AlreadyExists(key.to_string()),
            408 | 429 | 500 | 502 | 503 | 504 => CloudFsError::Transient {
                op,
                message: err.to_string(),
            },
            _ => CloudFsError::Remote {
                op,
                message: err.to_string(),
            },
        },
        _ => CloudFsError::Remote {
            op,
            message: err.to_string(),
        },
    }
}

#[async_trait]
impl ObjectApi for S3ObjectApi {
    async fn head(&self, key: &str) -> Result<ObjectAttributes> {
        trace!(key, "head_object");
        let out = with_retry(&self.retry, "head_object", || async move {
            self.client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| classify("head_object", key, e))
        })
        .await?;

        let size = out.content_length().unwrap_or(0) as u64;
        let mtime = Self::mtime_from(out.last_modified());
        let attrs = out.metadata().cloned().unwrap_or_default();
        Ok(Self::attrs_from(key, size, mtime, attrs))
    }

    async fn get(&self, key: &str, offset: u64, len: u64) -> Result<Bytes> {
        trace!(key, offset, len, "get_object");
        let range = if len == 0 {
            format!("bytes={offset}-")
        } else {
            format!("bytes={}-{}", offset, offset + len - 1)
        };
        with_retry(&self.retry, "get_object", || {
            let range = range.clone();
            async move {
                let out = self
                    .client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .range(range)
                    .send()
                    .await
                    .map_err(|e| classify("get_object", key, e))?;
                // a dropped body stream retries along with the call itself
                out.body
                    .collect()
                    .await
                    .map(|agg| agg.into_bytes())
                    .map_err(|e| CloudFsError::Transient {
                        op: "get_object",
                        message: e.to_string(),
                    })
            }
        })
        .await
    }

    async fn put(&self, key: &str, data: Bytes, attrs: &AttrMap, md5: Option<&str>) -> Result<()> {
        trace!(key, len = data.len(), "put_object");
        let mut metadata = attrs.clone();
        if let Some(md5) = md5 {
            metadata.insert(MD5_ATTR.to_string(), md5.to_string());
        }
        with_retry(&self.retry, "put_object", || {
            let data = data.clone();
            let metadata = metadata.clone();
            async move {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .body(ByteStream::from(data))
                    .set_metadata(Some(metadata))
                    .set_content_md5(md5.map(str::to_string))
                    .send()
                    .await
                    .map_err(|e| classify("put_object", key, e))
            }
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        trace!(key, "delete_object");
        with_retry(&self.retry, "delete_object", || async move {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| classify("delete_object", key, e))
        })
        .await?;
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        trace!(src, dst, "copy_object");
        let source = format!("{}/{}", self.bucket, src);
        with_retry(&self.retry, "copy_object", || {
            let source = source.clone();
            async move {
                self.client
                    .copy_object()
                    .bucket(&self.bucket)
                    .key(dst)
                    .copy_source(source)
                    .send()
                    .await
                    .map_err(|e| classify("copy_object", src, e))
            }
        })
        .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str, delimited: bool, max: Option<usize>) -> Result<Listing> {
        trace!(prefix, delimited, "list_objects");
        let mut listing = Listing::default();
        let mut token: Option<String> = None;
        loop {
            let out = with_retry(&self.retry, "list_objects", || {
                let token = token.clone();
                async move {
                    let mut req = self
                        .client
                        .list_objects_v2()
                        .bucket(&self.bucket)
                        .prefix(prefix);
                    if delimited {
                        req = req.delimiter("/");
                    }
                    if let Some(max) = max {
                        req = req.max_keys(max as i32);
                    }
                    if let Some(t) = token {
                        req = req.continuation_token(t);
                    }
                    req.send()
                        .await
                        .map_err(|e| classify("list_objects", prefix, e))
                }
            })
            .await?;

            for obj in out.contents() {
                let Some(key) = obj.key() else { continue };
                let size = obj.size().unwrap_or(0) as u64;
                let mtime = Self::mtime_from(obj.last_modified());
                listing
                    .objects
                    .push(Self::attrs_from(key, size, mtime, AttrMap::new()));
            }
            for p in out.common_prefixes() {
                if let Some(p) = p.prefix() {
                    listing.prefixes.push(p.to_string());
                }
            }

            if max.is_some() {
                break;
            }
            match out.next_continuation_token() {
                Some(t) if out.is_truncated().unwrap_or(false) => token = Some(t.to_string()),
                _ => break,
            }
        }

        // The listing response carries no attribute data, so kind markers
        // are resolved with one head per zero-length key (the only marker
        // candidates). Bounded existence probes skip this.
        if max.is_none() {
            for obj in listing.objects.iter_mut() {
                if obj.size == 0 {
                    if let Ok(full) = self.head(&obj.path).await {
                        *obj = full;
                    }
                }
            }
        }
        Ok(listing)
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        let out = with_retry(&self.retry, "list_buckets", || async move {
            self.client
                .list_buckets()
                .send()
                .await
                .map_err(|e| classify("list_buckets", "", e))
        })
        .await?;
        Ok(out
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_string))
            .collect())
    }
}
