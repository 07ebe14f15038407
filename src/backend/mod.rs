//! Terminal storage backends.
//!
//! Two concrete implementations of the pipeline contract exist, selected
//! from configuration at construction: a flat object namespace emulating a
//! hierarchy through path delimiters and marker objects, and a natively
//! hierarchical file share. Both share the range calculator, integrity
//! validator, retry wrapper, and handle map as collaborators; variant
//! differences stay inside the respective backend.

pub mod file_share;
pub mod object_store;
pub mod s3;
pub mod share_client;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{BackendKind, StorageConfig};
use crate::error::Result;
use crate::pipeline::Component;

/// Build the terminal backend selected by the configuration.
pub async fn new_backend(config: StorageConfig) -> Result<Arc<dyn Component>> {
    match config.kind {
        BackendKind::Object => {
            let api = Arc::new(s3::S3ObjectApi::new(&config).await?);
            Ok(Arc::new(object_store::ObjectStoreBackend::new(config, api)))
        }
        BackendKind::Share => {
            let api = Arc::new(share_client::HttpShareClient::new(&config)?);
            Ok(Arc::new(file_share::FileShareBackend::new(config, api)))
        }
    }
}

/// Strip leading and trailing "/" so `dir`, `dir/`, and `/dir` all name
/// the same entry.
pub(crate) fn normalize(name: &str) -> &str {
    name.trim_matches('/')
}

/// Final component of a normalized path.
pub(crate) fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Join two normalized path segments.
pub(crate) fn join(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else if child.is_empty() {
        parent.to_string()
    } else {
        format!("{parent}/{child}")
    }
}

/// Active path-prefix scope.
///
/// Every inbound logical path is rewritten under the prefix before it
/// reaches the service, and the prefix is stripped from every path
/// returned to the caller. Hierarchy walks treat the prefix boundary as
/// the filesystem root and never escape above it.
pub(crate) struct PrefixScope {
    prefix: RwLock<String>,
}

impl PrefixScope {
    pub(crate) fn new(initial: &str) -> Self {
        Self {
            prefix: RwLock::new(normalize(initial).to_string()),
        }
    }

    pub(crate) fn set(&self, prefix: &str) {
        *self.prefix.write() = normalize(prefix).to_string();
    }

    /// Rewrite a normalized logical path into its service-side form.
    pub(crate) fn apply(&self, name: &str) -> String {
        join(&self.prefix.read(), name)
    }

    /// Strip the scope from a service-side path.
    pub(crate) fn strip(&self, key: &str) -> String {
        let prefix = self.prefix.read();
        if prefix.is_empty() {
            return key.to_string();
        }
        if let Some(rest) = key.strip_prefix(prefix.as_str()) {
            return rest.trim_start_matches('/').to_string();
        }
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_both_ends() {
        assert_eq!(normalize("dir/"), "dir");
        assert_eq!(normalize("/a/b/"), "a/b");
        assert_eq!(normalize("/"), "");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn prefix_scope_round_trip() {
        let scope = PrefixScope::new("");
        assert_eq!(scope.apply("a/b"), "a/b");
        assert_eq!(scope.strip("a/b"), "a/b");

        scope.set("base/");
        assert_eq!(scope.apply("a/b"), "base/a/b");
        assert_eq!(scope.apply(""), "base");
        assert_eq!(scope.strip("base/a/b"), "a/b");
        assert_eq!(scope.strip("base"), "");
    }

    #[test]
    fn join_handles_empty_segments() {
        assert_eq!(join("", "x"), "x");
        assert_eq!(join("p", ""), "p");
        assert_eq!(join("p", "x/y"), "p/x/y");
    }
}
