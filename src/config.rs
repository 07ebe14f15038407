//! Storage configuration parsing and resolution.
//!
//! The raw `storage:` YAML node is deserialized into [`RawStorageConfig`]
//! and converted to an immutable [`StorageConfig`] via `resolve()`, which
//! applies defaults and rejects invalid combinations before any network
//! call is made. The resolved value is owned by the backend instance and
//! threaded explicitly through every constructor.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CloudFsError, Result};
use crate::range::MAX_RANGE_BYTES;
use crate::retry::RetryPolicy;

/// Backend variant selected by the `type` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Flat object namespace with "/" delimiter convention.
    Object,
    /// Natively hierarchical file share.
    Share,
}

/// Credential kind consumed by the backend.
///
/// Credential acquisition happens elsewhere; the backend only consumes the
/// resolved secret carried in the matching config field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Shared account key.
    #[default]
    Key,
    /// Pre-signed shared-access signature (file share only).
    Sas,
    /// Bearer access token.
    Token,
    /// Managed identity; consumes an externally resolved access token.
    Msi,
}

fn default_kind() -> BackendKind {
    BackendKind::Object
}

/// Raw `storage:` node as deserialized from YAML.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RawStorageConfig {
    pub account_name: String,

    #[serde(default)]
    pub account_key: Option<String>,

    #[serde(default)]
    pub sas: Option<String>,

    #[serde(default)]
    pub access_token: Option<String>,

    /// Auth kind: key, sas, token, or msi
    #[serde(default)]
    pub mode: AuthMode,

    #[serde(default)]
    pub endpoint: Option<String>,

    pub container: String,

    /// Backend variant: object or share
    #[serde(rename = "type", default = "default_kind")]
    pub kind: BackendKind,

    /// Path prefix all logical paths are scoped under
    #[serde(default)]
    pub subdirectory: Option<String>,

    /// Transfer chunk override in MiB
    #[serde(default)]
    pub block_size_mb: Option<u64>,

    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// When true, chmod/chown and other unsupported metadata ops fail with
    /// NotSupported; when false they silently succeed as no-ops.
    #[serde(default)]
    pub fail_unsupported_op: bool,

    /// Suppress directory listings for this many seconds after startup.
    #[serde(default)]
    pub block_list_on_mount_sec: u64,

    #[serde(default)]
    pub update_md5: bool,

    #[serde(default)]
    pub validate_md5: bool,

    /// Infer directories from path delimiters alone, without markers.
    #[serde(default)]
    pub virtual_directory: bool,

    #[serde(default)]
    pub max_retries: Option<u32>,

    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Option<Duration>,

    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Option<Duration>,

    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub max_timeout: Option<Duration>,

    #[serde(default)]
    pub proxy_address: Option<String>,

    /// Object-store region
    #[serde(default)]
    pub region: Option<String>,

    /// Path-style addressing for S3-compatible endpoints
    #[serde(default)]
    pub force_path_style: bool,
}

/// Resolved, immutable storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub account_name: String,
    pub account_key: Option<String>,
    pub sas: Option<String>,
    pub access_token: Option<String>,
    pub mode: AuthMode,
    pub endpoint: Option<String>,
    pub container: String,
    pub kind: BackendKind,
    /// Normalized path prefix; empty when unscoped.
    pub prefix_path: String,
    /// Transfer chunk override in bytes.
    pub block_size: Option<u64>,
    pub max_concurrency: usize,
    pub fail_unsupported_op: bool,
    pub block_list_on_mount: Duration,
    pub update_md5: bool,
    pub validate_md5: bool,
    pub virtual_directory: bool,
    pub retry: RetryPolicy,
    pub proxy_address: Option<String>,
    pub region: Option<String>,
    pub force_path_style: bool,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    storage: RawStorageConfig,
}

impl RawStorageConfig {
    /// Apply defaults and validate into the final immutable config.
    pub fn resolve(self) -> Result<StorageConfig> {
        if self.account_name.is_empty() {
            return Err(CloudFsError::Config("account-name must not be empty".into()));
        }
        if self.container.is_empty() {
            return Err(CloudFsError::Config("container must not be empty".into()));
        }

        match self.mode {
            AuthMode::Key => {
                if self.account_key.as_deref().unwrap_or("").is_empty() {
                    return Err(CloudFsError::Config(
                        "mode 'key' requires account-key".into(),
                    ));
                }
            }
            AuthMode::Sas => {
                if self.sas.as_deref().unwrap_or("").is_empty() {
                    return Err(CloudFsError::Config("mode 'sas' requires sas".into()));
                }
                if self.kind == BackendKind::Object {
                    return Err(CloudFsError::Config(
                        "mode 'sas' is only supported by the share backend".into(),
                    ));
                }
            }
            AuthMode::Token => {
                if self.access_token.as_deref().unwrap_or("").is_empty() {
                    return Err(CloudFsError::Config(
                        "mode 'token' requires access-token".into(),
                    ));
                }
            }
            // managed identity resolves its credential ambiently for the
            // object store; the share client checks its own requirement
            AuthMode::Msi => {}
        }

        if self.kind == BackendKind::Share && self.endpoint.is_none() {
            return Err(CloudFsError::Config(
                "the share backend requires an endpoint".into(),
            ));
        }

        let block_size = self.block_size_mb.map(|mb| mb * 1024 * 1024);
        if let Some(bytes) = block_size {
            if bytes == 0 {
                return Err(CloudFsError::Config("block-size-mb must not be 0".into()));
            }
            if self.kind == BackendKind::Share && bytes > MAX_RANGE_BYTES {
                return Err(CloudFsError::Config(format!(
                    "block-size-mb exceeds the {} MiB range ceiling",
                    MAX_RANGE_BYTES / (1024 * 1024)
                )));
            }
        }

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            backoff: self.retry_backoff.unwrap_or(defaults.backoff),
            max_delay: self.max_retry_delay.unwrap_or(defaults.max_delay),
            max_timeout: self.max_timeout.unwrap_or(defaults.max_timeout),
        };

        let prefix_path = self
            .subdirectory
            .as_deref()
            .unwrap_or("")
            .trim_matches('/')
            .to_string();

        Ok(StorageConfig {
            account_name: self.account_name,
            account_key: self.account_key,
            sas: self.sas,
            access_token: self.access_token,
            mode: self.mode,
            endpoint: self.endpoint,
            container: self.container,
            kind: self.kind,
            prefix_path,
            block_size,
            max_concurrency: self.max_concurrency.unwrap_or(32).max(1),
            fail_unsupported_op: self.fail_unsupported_op,
            block_list_on_mount: Duration::from_secs(self.block_list_on_mount_sec),
            update_md5: self.update_md5,
            validate_md5: self.validate_md5,
            virtual_directory: self.virtual_directory,
            retry,
            proxy_address: self.proxy_address,
            region: self.region,
            force_path_style: self.force_path_style,
        })
    }
}

impl StorageConfig {
    /// Parse and resolve a configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(content)
            .map_err(|e| CloudFsError::Config(format!("failed to parse config: {e}")))?;
        file.storage.resolve()
    }

    /// Load a configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CloudFsError::Config(format!("failed to read config file {path:?}: {e}"))
        })?;
        Self::from_yaml(&content)
    }
}
