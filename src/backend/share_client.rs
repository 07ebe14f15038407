//! Production client for the file-share HTTP gateway.
//!
//! The gateway exposes a share as a tree of files and directories over
//! plain HTTP: `HEAD`/`GET` with `Range` for properties and reads, `PUT`
//! to allocate entries (`x-entry-kind` selecting file or directory,
//! `x-content-length` carrying the allocation size), `PUT ?comp=range`
//! with `Content-Range` for partial writes, `PUT ?comp=size` for resizes,
//! `PUT ?comp=metadata` for attribute updates, `MOVE` with `Destination`
//! for single-entry renames, `DELETE` for removal, and `?comp=list` for
//! JSON listings. User attributes travel as `x-meta-*` headers and the
//! stored digest as `Content-MD5`.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use reqwest::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, LAST_MODIFIED, RANGE,
};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use tracing::trace;

use crate::backend::file_share::ShareApi;
use crate::backend::join;
use crate::config::{AuthMode, StorageConfig};
use crate::error::{CloudFsError, Result};
use crate::pipeline::{AttrMap, ObjectAttributes, ATTR_DIRECTORY, ATTR_TRUE};
use crate::retry::{with_retry, RetryPolicy};

const ENTRY_KIND: &str = "x-entry-kind";
const ALLOC_LENGTH: &str = "x-content-length";
const META_PREFIX: &str = "x-meta-";
const CONTENT_MD5: &str = "content-md5";
const DESTINATION: &str = "destination";

/// `ShareApi` over the gateway's REST dialect.
pub struct HttpShareClient {
    http: reqwest::Client,
    /// `{endpoint}/{container}`
    base: String,
    /// `{endpoint}` for account-level listings
    account_base: String,
    sas: Option<String>,
    retry: RetryPolicy,
}

impl HttpShareClient {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| CloudFsError::Config("the share backend requires an endpoint".into()))?
            .trim_end_matches('/');

        let mut headers = HeaderMap::new();
        match config.mode {
            AuthMode::Key => {
                let key = config.account_key.as_deref().ok_or_else(|| {
                    CloudFsError::Config("mode 'key' requires account-key".into())
                })?;
                let credential = BASE64.encode(format!("{}:{}", config.account_name, key));
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Basic {credential}"))
                        .map_err(|e| CloudFsError::Config(format!("invalid account-key: {e}")))?,
                );
            }
            AuthMode::Token | AuthMode::Msi => {
                let token = config.access_token.as_deref().ok_or_else(|| {
                    CloudFsError::Config(
                        "the share backend consumes a resolved access-token for token/msi modes"
                            .into(),
                    )
                })?;
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {token}"))
                        .map_err(|e| CloudFsError::Config(format!("invalid access-token: {e}")))?,
                );
            }
            // the signature rides on the query string instead
            AuthMode::Sas => {}
        }

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(proxy) = &config.proxy_address {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy)
                    .map_err(|e| CloudFsError::Config(format!("invalid proxy-address: {e}")))?,
            );
        }
        let http = builder
            .build()
            .map_err(|e| CloudFsError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base: format!("{endpoint}/{}", config.container),
            account_base: endpoint.to_string(),
            sas: config
                .sas
                .as_deref()
                .map(|s| s.trim_start_matches('?').to_string()),
            retry: config.retry.clone(),
        })
    }

    fn url(&self, path: &str, query: Option<&str>) -> String {
        let mut url = if path.is_empty() {
            self.base.clone()
        } else {
            format!("{}/{path}", self.base)
        };
        let mut params = Vec::new();
        if let Some(q) = query {
            params.push(q);
        }
        if let Some(sas) = &self.sas {
            params.push(sas.as_str());
        }
        if !params.is_empty() {
            url.push('?');
            url.push_str(&params.join("&"));
        }
        url
    }

    fn check(op: &'static str, path: &str, resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        Err(Self::status_error(op, path, status))
    }

    fn status_error(op: &'static str, path: &str, status: StatusCode) -> CloudFsError {
        match status.as_u16() {
            404 => CloudFsError::NotFound(path.to_string()),
            401 | 403 => CloudFsError::Auth(format!("{op} on {path}: HTTP {status}")),
            409 => CloudFsError::AlreadyExists(path.to_string()),
            408 | 429 => CloudFsError::Transient {
                op,
                message: format!("HTTP {status}"),
            },
            s if s >= 500 => CloudFsError::Transient {
                op,
                message: format!("HTTP {status}"),
            },
            _ => CloudFsError::Remote {
                op,
                message: format!("HTTP {status} on {path}"),
            },
        }
    }

    fn transport(op: &'static str, err: reqwest::Error) -> CloudFsError {
        if err.is_timeout() || err.is_connect() {
            CloudFsError::Transient {
                op,
                message: err.to_string(),
            }
        } else {
            CloudFsError::Remote {
                op,
                message: err.to_string(),
            }
        }
    }

    fn attrs_from_headers(path: &str, headers: &HeaderMap) -> ObjectAttributes {
        let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let mtime = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| chrono::DateTime::parse_from_rfc2822(s).ok())
            .map(|dt| SystemTime::from(dt.with_timezone(&chrono::Utc)))
            .unwrap_or_else(SystemTime::now);

        let mut attrs = AttrMap::new();
        for (name, value) in headers {
            if let Some(key) = name.as_str().strip_prefix(META_PREFIX) {
                if let Ok(v) = value.to_str() {
                    attrs.insert(key.to_string(), v.to_string());
                }
            }
        }
        if header_str(ENTRY_KIND) == Some("directory") {
            attrs.insert(ATTR_DIRECTORY.to_string(), ATTR_TRUE.to_string());
        }

        ObjectAttributes {
            path: path.to_string(),
            size,
            mtime,
            md5: header_str(CONTENT_MD5).map(str::to_string),
            attrs,
        }
    }

    fn meta_headers(req: reqwest::RequestBuilder, attrs: &AttrMap) -> reqwest::RequestBuilder {
        attrs.iter().fold(req, |req, (k, v)| {
            let name = format!("{META_PREFIX}{k}");
            req.header(name.as_str(), v.as_str())
        })
    }
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    name: String,
    kind: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    mtime: Option<i64>,
    #[serde(default)]
    meta: AttrMap,
    #[serde(default)]
    md5: Option<String>,
}

impl ListEntry {
    fn into_attrs(self, parent: &str) -> ObjectAttributes {
        let mtime = self
            .mtime
            .filter(|s| *s >= 0)
            .and_then(|s| SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs(s as u64)))
            .unwrap_or_else(SystemTime::now);
        let mut attrs = self.meta;
        if self.kind == "directory" {
            attrs.insert(ATTR_DIRECTORY.to_string(), ATTR_TRUE.to_string());
        }
        ObjectAttributes {
            path: join(parent, &self.name),
            size: self.size,
            mtime,
            md5: self.md5,
            attrs,
        }
    }
}

#[async_trait]
impl ShareApi for HttpShareClient {
    async fn head(&self, path: &str) -> Result<ObjectAttributes> {
        trace!(path, "head");
        let url = self.url(path, None);
        let resp = with_retry(&self.retry, "head", || {
            let url = url.clone();
            async move {
                self.http
                    .head(&url)
                    .send()
                    .await
                    .map_err(|e| Self::transport("head", e))
                    .and_then(|r| Self::check("head", path, r))
            }
        })
        .await?;
        Ok(Self::attrs_from_headers(path, resp.headers()))
    }

    async fn create_file(&self, path: &str, size: u64, attrs: &AttrMap) -> Result<()> {
        trace!(path, size, "create_file");
        let url = self.url(path, None);
        with_retry(&self.retry, "create_file", || {
            let url = url.clone();
            async move {
                let req = self
                    .http
                    .put(&url)
                    .header(ENTRY_KIND, "file")
                    .header(ALLOC_LENGTH, size);
                Self::meta_headers(req, attrs)
                    .send()
                    .await
                    .map_err(|e| Self::transport("create_file", e))
                    .and_then(|r| Self::check("create_file", path, r))
            }
        })
        .await?;
        Ok(())
    }

    async fn get(&self, path: &str, offset: u64, len: u64) -> Result<Bytes> {
        trace!(path, offset, len, "get");
        let url = self.url(path, None);
        let range = if len == 0 {
            format!("bytes={offset}-")
        } else {
            format!("bytes={}-{}", offset, offset + len - 1)
        };
        with_retry(&self.retry, "get", || {
            let url = url.clone();
            let range = range.clone();
            async move {
                let resp = self
                    .http
                    .get(&url)
                    .header(RANGE, range)
                    .send()
                    .await
                    .map_err(|e| Self::transport("get", e))
                    .and_then(|r| Self::check("get", path, r))?;
                resp.bytes().await.map_err(|e| CloudFsError::Transient {
                    op: "get",
                    message: e.to_string(),
                })
            }
        })
        .await
    }

    async fn put_range(&self, path: &str, offset: u64, data: Bytes) -> Result<()> {
        trace!(path, offset, len = data.len(), "put_range");
        if data.is_empty() {
            return Ok(());
        }
        let url = self.url(path, Some("comp=range"));
        let content_range = format!("bytes {}-{}/*", offset, offset + data.len() as u64 - 1);
        with_retry(&self.retry, "put_range", || {
            let url = url.clone();
            let content_range = content_range.clone();
            let data = data.clone();
            async move {
                self.http
                    .put(&url)
                    .header(CONTENT_RANGE, content_range)
                    .body(data)
                    .send()
                    .await
                    .map_err(|e| Self::transport("put_range", e))
                    .and_then(|r| Self::check("put_range", path, r))
            }
        })
        .await?;
        Ok(())
    }

    async fn resize(&self, path: &str, size: u64) -> Result<()> {
        trace!(path, size, "resize");
        let url = self.url(path, Some("comp=size"));
        with_retry(&self.retry, "resize", || {
            let url = url.clone();
            async move {
                self.http
                    .put(&url)
                    .header(ALLOC_LENGTH, size)
                    .send()
                    .await
                    .map_err(|e| Self::transport("resize", e))
                    .and_then(|r| Self::check("resize", path, r))
            }
        })
        .await?;
        Ok(())
    }

    async fn set_attrs(&self, path: &str, attrs: &AttrMap, md5: Option<&str>) -> Result<()> {
        trace!(path, "set_attrs");
        let url = self.url(path, Some("comp=metadata"));
        with_retry(&self.retry, "set_attrs", || {
            let url = url.clone();
            async move {
                let mut req = Self::meta_headers(self.http.put(&url), attrs);
                if let Some(md5) = md5 {
                    req = req.header(CONTENT_MD5, md5);
                }
                req.send()
                    .await
                    .map_err(|e| Self::transport("set_attrs", e))
                    .and_then(|r| Self::check("set_attrs", path, r))
            }
        })
        .await?;
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        trace!(path, "delete_file");
        let url = self.url(path, None);
        with_retry(&self.retry, "delete_file", || {
            let url = url.clone();
            async move {
                self.http
                    .delete(&url)
                    .send()
                    .await
                    .map_err(|e| Self::transport("delete_file", e))
                    .and_then(|r| Self::check("delete_file", path, r))
            }
        })
        .await?;
        Ok(())
    }

    async fn create_dir(&self, path: &str, attrs: &AttrMap) -> Result<()> {
        trace!(path, "create_dir");
        let url = self.url(path, None);
        with_retry(&self.retry, "create_dir", || {
            let url = url.clone();
            async move {
                let req = self.http.put(&url).header(ENTRY_KIND, "directory");
                Self::meta_headers(req, attrs)
                    .send()
                    .await
                    .map_err(|e| Self::transport("create_dir", e))
                    .and_then(|r| Self::check("create_dir", path, r))
            }
        })
        .await?;
        Ok(())
    }

    async fn delete_dir(&self, path: &str) -> Result<()> {
        trace!(path, "delete_dir");
        let url = self.url(path, Some("restype=directory"));
        let result = with_retry(&self.retry, "delete_dir", || {
            let url = url.clone();
            async move {
                self.http
                    .delete(&url)
                    .send()
                    .await
                    .map_err(|e| Self::transport("delete_dir", e))
                    .and_then(|r| Self::check("delete_dir", path, r))
            }
        })
        .await;
        match result {
            // a conflict on directory delete means it still has children
            Err(CloudFsError::AlreadyExists(p)) => Err(CloudFsError::NotEmpty(p)),
            Err(e) => Err(e),
            Ok(_) => Ok(()),
        }
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        trace!(src, dst, "rename");
        let method = Method::from_bytes(b"MOVE")
            .map_err(|e| CloudFsError::Internal(format!("invalid MOVE method: {e}")))?;
        let url = self.url(src, None);
        let destination = self.url(dst, None);
        with_retry(&self.retry, "rename", || {
            let method = method.clone();
            let url = url.clone();
            let destination = destination.clone();
            async move {
                self.http
                    .request(method, &url)
                    .header(DESTINATION, destination)
                    .send()
                    .await
                    .map_err(|e| Self::transport("rename", e))
                    .and_then(|r| Self::check("rename", src, r))
            }
        })
        .await?;
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<ObjectAttributes>> {
        trace!(path, "list_dir");
        let url = self.url(path, Some("comp=list"));
        let entries: Vec<ListEntry> = with_retry(&self.retry, "list_dir", || {
            let url = url.clone();
            async move {
                let resp = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| Self::transport("list_dir", e))
                    .and_then(|r| Self::check("list_dir", path, r))?;
                resp.json().await.map_err(|e| CloudFsError::Remote {
                    op: "list_dir",
                    message: format!("malformed listing: {e}"),
                })
            }
        })
        .await?;
        Ok(entries.into_iter().map(|e| e.into_attrs(path)).collect())
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        let url = match &self.sas {
            Some(sas) => format!("{}?comp=list&{sas}", self.account_base),
            None => format!("{}?comp=list", self.account_base),
        };
        with_retry(&self.retry, "list_containers", || {
            let url = url.clone();
            async move {
                let resp = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| Self::transport("list_containers", e))
                    .and_then(|r| Self::check("list_containers", "", r))?;
                resp.json().await.map_err(|e| CloudFsError::Remote {
                    op: "list_containers",
                    message: format!("malformed share listing: {e}"),
                })
            }
        })
        .await
    }
}
