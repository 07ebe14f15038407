//! Natively hierarchical file-share backend.
//!
//! The service understands directories, single-entry renames, partial
//! range writes, and resizes. Range operations are capped by the service
//! ceilings in [`crate::range`], and unwritten ranges read back as zeros,
//! so growing a file materializes gap zero-fill without uploading zero
//! bytes. What the service does not have is a subtree rename: moving a
//! directory walks one listing level at a time with an explicit work
//! queue, recreating directories top-down, moving files entry by entry,
//! and removing the emptied sources leaf-first.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::try_join_all;
use parking_lot::RwLock;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, trace};

use crate::backend::{base_name, join, normalize, PrefixScope};
use crate::config::StorageConfig;
use crate::error::{CloudFsError, Result};
use crate::handle::{Handle, HandleMap};
use crate::integrity::{self, DigestStream};
use crate::pipeline::{AttrMap, Component, DirEntry, ObjectAttributes, ATTR_SYMLINK, ATTR_TRUE};
use crate::range;

/// The single-network-call seam against the file-share service.
///
/// One method, one service call; the production client wraps each call
/// with the retry policy. Paths are share-relative, "" meaning the share
/// root.
#[async_trait]
pub trait ShareApi: Send + Sync {
    /// Properties of a file or directory; directories carry the
    /// `is-directory` attribute.
    async fn head(&self, path: &str) -> Result<ObjectAttributes>;

    /// Allocate (or replace) a file of exactly `size` bytes. Unwritten
    /// ranges read as zeros.
    async fn create_file(&self, path: &str, size: u64, attrs: &AttrMap) -> Result<()>;

    /// Read `len` bytes at `offset`; `len == 0` reads to the end.
    async fn get(&self, path: &str, offset: u64, len: u64) -> Result<Bytes>;

    /// Write one range within the file's current size.
    async fn put_range(&self, path: &str, offset: u64, data: Bytes) -> Result<()>;

    /// Grow (zero-extending) or shrink the file to exactly `size`.
    async fn resize(&self, path: &str, size: u64) -> Result<()>;

    /// Merge attributes and optionally replace the stored digest.
    async fn set_attrs(&self, path: &str, attrs: &AttrMap, md5: Option<&str>) -> Result<()>;

    async fn delete_file(&self, path: &str) -> Result<()>;

    async fn create_dir(&self, path: &str, attrs: &AttrMap) -> Result<()>;

    /// Remove an empty directory; the service rejects non-empty ones.
    async fn delete_dir(&self, path: &str) -> Result<()>;

    /// Native move of a single file, preserving attributes and digest.
    async fn rename(&self, src: &str, dst: &str) -> Result<()>;

    /// Immediate children of a directory; NotFound when it does not exist.
    async fn list_dir(&self, path: &str) -> Result<Vec<ObjectAttributes>>;

    async fn list_containers(&self) -> Result<Vec<String>>;
}

/// Terminal pipeline component over a natively hierarchical share.
pub struct FileShareBackend {
    config: StorageConfig,
    api: Arc<dyn ShareApi>,
    handles: HandleMap,
    scope: PrefixScope,
    listing_blocked_until: RwLock<Option<Instant>>,
}

impl FileShareBackend {
    pub fn new(config: StorageConfig, api: Arc<dyn ShareApi>) -> Self {
        let scope = PrefixScope::new(&config.prefix_path);
        Self {
            config,
            api,
            handles: HandleMap::new(),
            scope,
            listing_blocked_until: RwLock::new(None),
        }
    }

    fn key(&self, name: &str) -> String {
        self.scope.apply(normalize(name))
    }

    fn listing_blocked(&self) -> bool {
        match *self.listing_blocked_until.read() {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    /// Effective range size for one transfer of `total` bytes.
    fn chunk_size(&self, path: &str, total: u64) -> Result<u64> {
        let limit = range::range_size(path, total)?;
        Ok(self.config.block_size.unwrap_or(limit).min(limit))
    }

    async fn upload_ranges(&self, key: &str, offset: u64, data: &[u8], chunk: u64) -> Result<()> {
        for (i, piece) in data.chunks(chunk as usize).enumerate() {
            self.api
                .put_range(key, offset + i as u64 * chunk, Bytes::copy_from_slice(piece))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Component for FileShareBackend {
    fn name(&self) -> &'static str {
        "file-share"
    }

    fn next(&self) -> Option<Arc<dyn Component>> {
        None
    }

    fn set_next(&self, _next: Arc<dyn Component>) {}

    async fn start(&self) -> Result<()> {
        self.api.list_dir("").await?;
        if !self.config.block_list_on_mount.is_zero() {
            *self.listing_blocked_until.write() =
                Some(Instant::now() + self.config.block_list_on_mount);
        }
        info!(container = %self.config.container, "file-share backend ready");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.handles.clear();
        Ok(())
    }

    async fn create_dir(&self, name: &str) -> Result<()> {
        let key = self.key(name);
        debug!(%key, "create_dir");
        let attrs = ObjectAttributes::directory(&key, SystemTime::now()).attrs;
        match self.api.create_dir(&key, &attrs).await {
            // re-creating an existing directory is tolerated; an occupied
            // file path is not
            Err(CloudFsError::AlreadyExists(_)) => match self.api.head(&key).await {
                Ok(existing) if existing.is_dir() => Ok(()),
                _ => Err(CloudFsError::AlreadyExists(normalize(name).to_string())),
            },
            other => other,
        }
    }

    async fn delete_dir(&self, name: &str) -> Result<()> {
        let key = self.key(name);
        debug!(%key, "delete_dir");
        let children = self.api.list_dir(&key).await?;
        if !children.is_empty() {
            return Err(CloudFsError::NotEmpty(normalize(name).to_string()));
        }
        self.api.delete_dir(&key).await
    }

    async fn rename_dir(&self, src: &str, dst: &str) -> Result<()> {
        let srck = self.key(src);
        let dstk = self.key(dst);
        debug!(src = %srck, dst = %dstk, "rename_dir");

        let src_attrs = self.api.head(&srck).await?;
        if !src_attrs.is_dir() {
            return Err(CloudFsError::NotFound(normalize(src).to_string()));
        }
        match self.api.head(&dstk).await {
            Ok(_) => return Err(CloudFsError::AlreadyExists(normalize(dst).to_string())),
            Err(CloudFsError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        // Walk one listing level at a time: directories are recreated
        // top-down at the destination, files move natively one by one,
        // and the emptied source directories fall leaf-first at the end.
        // Not transactional; the first failure leaves a partial move.
        self.api.create_dir(&dstk, &src_attrs.attrs).await?;
        let mut queue = VecDeque::from([(srck.clone(), dstk)]);
        let mut source_dirs = vec![srck];
        while let Some((from, to)) = queue.pop_front() {
            for child in self.api.list_dir(&from).await? {
                let name = base_name(&child.path).to_string();
                let child_src = join(&from, &name);
                let child_dst = join(&to, &name);
                if child.is_dir() {
                    self.api.create_dir(&child_dst, &child.attrs).await?;
                    source_dirs.push(child_src.clone());
                    queue.push_back((child_src, child_dst));
                } else {
                    self.api.rename(&child_src, &child_dst).await?;
                }
            }
        }
        for dir in source_dirs.iter().rev() {
            self.api.delete_dir(dir).await?;
        }
        Ok(())
    }

    async fn is_dir_empty(&self, name: &str) -> Result<bool> {
        // a missing directory is an error on this variant
        let children = self.api.list_dir(&self.key(name)).await?;
        Ok(children.is_empty())
    }

    async fn read_dir(&self, name: &str) -> Result<Vec<DirEntry>> {
        if self.listing_blocked() {
            trace!(%name, "read_dir suppressed during mount window");
            return Ok(Vec::new());
        }
        let key = self.key(name);
        let children = self.api.list_dir(&key).await?;
        let mut entries: Vec<DirEntry> = children
            .iter()
            .map(|child| {
                let logical = self.scope.strip(&child.path);
                DirEntry {
                    name: base_name(&logical).to_string(),
                    kind: child.kind(),
                    path: logical,
                }
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create_file(&self, name: &str) -> Result<Arc<Handle>> {
        let key = self.key(name);
        debug!(%key, "create_file");
        self.api.create_file(&key, 0, &AttrMap::new()).await?;
        Ok(self.handles.open(normalize(name), 0))
    }

    async fn open_file(&self, name: &str) -> Result<Arc<Handle>> {
        let key = self.key(name);
        let attrs = self.api.head(&key).await?;
        Ok(self.handles.open(normalize(name), attrs.size))
    }

    async fn close_file(&self, handle: &Handle) -> Result<()> {
        self.handles.release(handle.id());
        Ok(())
    }

    async fn read_file(&self, handle: &Handle) -> Result<Bytes> {
        if handle.size() == 0 {
            return Ok(Bytes::new());
        }
        self.api.get(&self.key(handle.path()), 0, 0).await
    }

    async fn read_in_buffer(&self, handle: &Handle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let size = handle.size();
        if size == 0 {
            return Ok(0);
        }
        if offset >= size {
            return Err(CloudFsError::RangeOutOfBounds {
                path: handle.path().to_string(),
                offset,
                size,
            });
        }
        let want = (buf.len() as u64).min(size - offset);
        if want == 0 {
            return Ok(0);
        }
        let data = self.api.get(&self.key(handle.path()), offset, want).await?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    async fn write_file(&self, handle: &Handle, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let key = self.key(handle.path());
        let end = offset + data.len() as u64;
        trace!(%key, offset, len = data.len(), "write_file");
        let chunk = self.chunk_size(&key, end)?;
        handle.set_dirty(true);

        // growing first zero-extends through a resize, so a gap between
        // the old size and `offset` reads back as zeros
        let old_size = handle.size();
        if end > old_size {
            self.api.resize(&key, end).await?;
        }
        self.upload_ranges(&key, offset, data, chunk).await?;

        handle.set_size(old_size.max(end));
        handle.set_dirty(false);
        Ok(data.len())
    }

    async fn truncate_file(&self, name: &str, size: u64) -> Result<()> {
        let key = self.key(name);
        debug!(%key, size, "truncate_file");
        range::range_size(&key, size)?;
        self.api.head(&key).await?;
        self.api.resize(&key, size).await
    }

    async fn delete_file(&self, name: &str) -> Result<()> {
        let key = self.key(name);
        debug!(%key, "delete_file");
        self.api.delete_file(&key).await
    }

    async fn rename_file(&self, src: &str, dst: &str) -> Result<()> {
        let srck = self.key(src);
        let dstk = self.key(dst);
        debug!(src = %srck, dst = %dstk, "rename_file");
        self.api.head(&srck).await?;
        self.api.rename(&srck, &dstk).await
    }

    async fn copy_to_file(&self, name: &str, dest: &Path) -> Result<()> {
        let key = self.key(name);
        let attrs = self.api.head(&key).await?;
        debug!(%key, size = attrs.size, "copy_to_file");

        let chunk = self.chunk_size(&key, attrs.size)?;
        let mut file = fs::File::create(dest).await?;
        let mut digest = DigestStream::new();
        let mut offset = 0u64;
        while offset < attrs.size {
            let len = chunk.min(attrs.size - offset);
            let data = self.api.get(&key, offset, len).await?;
            if data.is_empty() {
                break;
            }
            digest.update(&data);
            file.write_all(&data).await?;
            offset += data.len() as u64;
        }
        file.flush().await?;

        if self.config.validate_md5 {
            if let Some(stored) = &attrs.md5 {
                let computed = digest.finish();
                if &computed != stored {
                    return Err(CloudFsError::IntegrityMismatch(format!(
                        "md5 digest mismatch on download for {key}"
                    )));
                }
            }
        }
        Ok(())
    }

    async fn copy_from_file(&self, name: &str, src: &Path) -> Result<()> {
        let key = self.key(name);
        let size = fs::metadata(src).await?.len();
        debug!(%key, size, "copy_from_file");
        let chunk = self.chunk_size(&key, size)?;

        self.api.create_file(&key, size, &AttrMap::new()).await?;

        // ranges upload in bounded batches; the digest follows the
        // sequential read order
        let mut file = fs::File::open(src).await?;
        let mut digest = DigestStream::new();
        let mut offset = 0u64;
        let mut batch = Vec::new();
        while offset < size {
            let len = chunk.min(size - offset) as usize;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf).await?;
            digest.update(&buf);
            batch.push((offset, Bytes::from(buf)));
            offset += len as u64;
            if batch.len() >= self.config.max_concurrency || offset >= size {
                let puts = batch
                    .drain(..)
                    .map(|(o, piece)| self.api.put_range(&key, o, piece));
                try_join_all(puts).await?;
            }
        }

        if self.config.update_md5 {
            self.api
                .set_attrs(&key, &AttrMap::new(), Some(&digest.finish()))
                .await?;
        }
        Ok(())
    }

    async fn get_attr(&self, name: &str) -> Result<ObjectAttributes> {
        let logical = normalize(name);
        if logical.is_empty() {
            return Ok(ObjectAttributes::directory("", SystemTime::now()));
        }
        let mut attrs = self.api.head(&self.scope.apply(logical)).await?;
        attrs.path = self.scope.strip(&attrs.path);
        Ok(attrs)
    }

    async fn create_link(&self, name: &str, target: &str) -> Result<()> {
        let key = self.key(name);
        debug!(%key, target, "create_link");
        let mut attrs = AttrMap::new();
        attrs.insert(ATTR_SYMLINK.to_string(), ATTR_TRUE.to_string());
        self.api
            .create_file(&key, target.len() as u64, &attrs)
            .await?;
        if !target.is_empty() {
            self.api
                .put_range(&key, 0, Bytes::from(target.to_string()))
                .await?;
        }
        if self.config.update_md5 {
            self.api
                .set_attrs(&key, &attrs, Some(&integrity::digest(target.as_bytes())))
                .await?;
        }
        Ok(())
    }

    async fn read_link(&self, name: &str) -> Result<String> {
        let key = self.key(name);
        let attrs = self.api.head(&key).await?;
        if !attrs.is_symlink() {
            return Err(CloudFsError::NotFound(normalize(name).to_string()));
        }
        if attrs.size == 0 {
            return Ok(String::new());
        }
        let data = self.api.get(&key, 0, 0).await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    async fn chmod(&self, _name: &str, _mode: u32) -> Result<()> {
        if self.config.fail_unsupported_op {
            Err(CloudFsError::NotSupported(
                "chmod is not supported by the file-share backend",
            ))
        } else {
            Ok(())
        }
    }

    async fn chown(&self, _name: &str, _uid: u32, _gid: u32) -> Result<()> {
        if self.config.fail_unsupported_op {
            Err(CloudFsError::NotSupported(
                "chown is not supported by the file-share backend",
            ))
        } else {
            Ok(())
        }
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        self.api.list_containers().await
    }

    async fn set_prefix_path(&self, prefix: &str) -> Result<()> {
        debug!(prefix, "set_prefix_path");
        self.scope.set(prefix);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthMode, BackendKind};
    use crate::retry::RetryPolicy;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[derive(Clone)]
    enum Node {
        Dir {
            attrs: AttrMap,
        },
        File {
            data: Vec<u8>,
            attrs: AttrMap,
            md5: Option<String>,
        },
    }

    /// In-memory stand-in for the share service.
    struct MockShareApi {
        nodes: Mutex<BTreeMap<String, Node>>,
        containers: Vec<String>,
    }

    impl MockShareApi {
        fn new() -> Self {
            Self {
                nodes: Mutex::new(BTreeMap::new()),
                containers: vec!["share1".to_string(), "share2".to_string()],
            }
        }

        fn content(&self, path: &str) -> Option<Vec<u8>> {
            match self.nodes.lock().get(path) {
                Some(Node::File { data, .. }) => Some(data.clone()),
                _ => None,
            }
        }

        fn is_dir(&self, path: &str) -> bool {
            matches!(self.nodes.lock().get(path), Some(Node::Dir { .. }))
        }

        fn corrupt_md5(&self, path: &str) {
            if let Some(Node::File { md5, .. }) = self.nodes.lock().get_mut(path) {
                *md5 = Some("bogus".to_string());
            }
        }

        fn paths(&self) -> Vec<String> {
            self.nodes.lock().keys().cloned().collect()
        }

        fn to_attrs(path: &str, node: &Node) -> ObjectAttributes {
            match node {
                Node::Dir { attrs } => {
                    let mut out = ObjectAttributes::directory(path, SystemTime::now());
                    out.attrs.extend(attrs.clone());
                    out
                }
                Node::File { data, attrs, md5 } => {
                    let mut out =
                        ObjectAttributes::file(path, data.len() as u64, SystemTime::now());
                    out.attrs = attrs.clone();
                    out.md5 = md5.clone();
                    out
                }
            }
        }
    }

    #[async_trait]
    impl ShareApi for MockShareApi {
        async fn head(&self, path: &str) -> Result<ObjectAttributes> {
            if path.is_empty() {
                return Ok(ObjectAttributes::directory("", SystemTime::now()));
            }
            let nodes = self.nodes.lock();
            nodes
                .get(path)
                .map(|n| MockShareApi::to_attrs(path, n))
                .ok_or_else(|| CloudFsError::NotFound(path.to_string()))
        }

        async fn create_file(&self, path: &str, size: u64, attrs: &AttrMap) -> Result<()> {
            self.nodes.lock().insert(
                path.to_string(),
                Node::File {
                    data: vec![0u8; size as usize],
                    attrs: attrs.clone(),
                    md5: None,
                },
            );
            Ok(())
        }

        async fn get(&self, path: &str, offset: u64, len: u64) -> Result<Bytes> {
            let nodes = self.nodes.lock();
            match nodes.get(path) {
                Some(Node::File { data, .. }) => {
                    let start = (offset as usize).min(data.len());
                    let end = if len == 0 {
                        data.len()
                    } else {
                        (start + len as usize).min(data.len())
                    };
                    Ok(Bytes::copy_from_slice(&data[start..end]))
                }
                _ => Err(CloudFsError::NotFound(path.to_string())),
            }
        }

        async fn put_range(&self, path: &str, offset: u64, piece: Bytes) -> Result<()> {
            let mut nodes = self.nodes.lock();
            match nodes.get_mut(path) {
                Some(Node::File { data, .. }) => {
                    let start = offset as usize;
                    let end = start + piece.len();
                    if end > data.len() {
                        return Err(CloudFsError::RangeOutOfBounds {
                            path: path.to_string(),
                            offset,
                            size: data.len() as u64,
                        });
                    }
                    data[start..end].copy_from_slice(&piece);
                    Ok(())
                }
                _ => Err(CloudFsError::NotFound(path.to_string())),
            }
        }

        async fn resize(&self, path: &str, size: u64) -> Result<()> {
            let mut nodes = self.nodes.lock();
            match nodes.get_mut(path) {
                Some(Node::File { data, .. }) => {
                    data.resize(size as usize, 0);
                    Ok(())
                }
                _ => Err(CloudFsError::NotFound(path.to_string())),
            }
        }

        async fn set_attrs(&self, path: &str, extra: &AttrMap, new_md5: Option<&str>) -> Result<()> {
            let mut nodes = self.nodes.lock();
            match nodes.get_mut(path) {
                Some(Node::File { attrs, md5, .. }) => {
                    attrs.extend(extra.clone());
                    if let Some(m) = new_md5 {
                        *md5 = Some(m.to_string());
                    }
                    Ok(())
                }
                Some(Node::Dir { attrs }) => {
                    attrs.extend(extra.clone());
                    Ok(())
                }
                None => Err(CloudFsError::NotFound(path.to_string())),
            }
        }

        async fn delete_file(&self, path: &str) -> Result<()> {
            let mut nodes = self.nodes.lock();
            match nodes.get(path) {
                Some(Node::File { .. }) => {
                    nodes.remove(path);
                    Ok(())
                }
                _ => Err(CloudFsError::NotFound(path.to_string())),
            }
        }

        async fn create_dir(&self, path: &str, attrs: &AttrMap) -> Result<()> {
            let mut nodes = self.nodes.lock();
            if nodes.contains_key(path) {
                return Err(CloudFsError::AlreadyExists(path.to_string()));
            }
            nodes.insert(
                path.to_string(),
                Node::Dir {
                    attrs: attrs.clone(),
                },
            );
            Ok(())
        }

        async fn delete_dir(&self, path: &str) -> Result<()> {
            let mut nodes = self.nodes.lock();
            match nodes.get(path) {
                Some(Node::Dir { .. }) => {
                    let child_prefix = format!("{path}/");
                    if nodes.keys().any(|k| k.starts_with(&child_prefix)) {
                        return Err(CloudFsError::NotEmpty(path.to_string()));
                    }
                    nodes.remove(path);
                    Ok(())
                }
                _ => Err(CloudFsError::NotFound(path.to_string())),
            }
        }

        async fn rename(&self, src: &str, dst: &str) -> Result<()> {
            let mut nodes = self.nodes.lock();
            match nodes.remove(src) {
                Some(node @ Node::File { .. }) => {
                    nodes.insert(dst.to_string(), node);
                    Ok(())
                }
                Some(dir) => {
                    nodes.insert(src.to_string(), dir);
                    Err(CloudFsError::NotSupported("single-entry rename moves files"))
                }
                None => Err(CloudFsError::NotFound(src.to_string())),
            }
        }

        async fn list_dir(&self, path: &str) -> Result<Vec<ObjectAttributes>> {
            let nodes = self.nodes.lock();
            if !path.is_empty() && !matches!(nodes.get(path), Some(Node::Dir { .. })) {
                return Err(CloudFsError::NotFound(path.to_string()));
            }
            let prefix = if path.is_empty() {
                String::new()
            } else {
                format!("{path}/")
            };
            Ok(nodes
                .iter()
                .filter(|(k, _)| {
                    k.starts_with(&prefix)
                        && !k[prefix.len()..].is_empty()
                        && !k[prefix.len()..].contains('/')
                })
                .map(|(k, n)| MockShareApi::to_attrs(k, n))
                .collect())
        }

        async fn list_containers(&self) -> Result<Vec<String>> {
            Ok(self.containers.clone())
        }
    }

    fn test_config() -> StorageConfig {
        StorageConfig {
            account_name: "acct".into(),
            account_key: Some("key".into()),
            sas: None,
            access_token: None,
            mode: AuthMode::Key,
            endpoint: Some("https://share.example.com".into()),
            container: "share1".into(),
            kind: BackendKind::Share,
            prefix_path: String::new(),
            block_size: None,
            max_concurrency: 4,
            fail_unsupported_op: true,
            block_list_on_mount: Duration::ZERO,
            update_md5: false,
            validate_md5: false,
            virtual_directory: false,
            retry: RetryPolicy::default(),
            proxy_address: None,
            region: None,
            force_path_style: false,
        }
    }

    fn backend_with(config: StorageConfig) -> (Arc<MockShareApi>, FileShareBackend) {
        let api = Arc::new(MockShareApi::new());
        let backend = FileShareBackend::new(config, api.clone());
        (api, backend)
    }

    fn backend() -> (Arc<MockShareApi>, FileShareBackend) {
        backend_with(test_config())
    }

    async fn setup_hierarchy(b: &FileShareBackend, base: &str) {
        b.create_dir(base).await.unwrap();
        b.create_dir(&format!("{base}/c1")).await.unwrap();
        b.create_file(&format!("{base}/c1/gc1")).await.unwrap();
        b.create_file(&format!("{base}/c2")).await.unwrap();
        b.create_dir(&format!("{base}b")).await.unwrap();
        b.create_file(&format!("{base}b/c1")).await.unwrap();
        b.create_file(&format!("{base}c")).await.unwrap();
    }

    #[tokio::test]
    async fn write_beyond_eof_zero_fills_through_resize() {
        let (api, b) = backend();
        let h = b.create_file("f").await.unwrap();
        b.write_file(&h, 0, b"test-data").await.unwrap();
        b.write_file(&h, 12, b"newdata").await.unwrap();

        assert_eq!(h.size(), 19);
        assert_eq!(api.content("f").unwrap(), b"test-data\x00\x00\x00newdata");
    }

    #[tokio::test]
    async fn overwrite_in_place_touches_only_the_range() {
        let (api, b) = backend();
        let h = b.create_file("f").await.unwrap();
        b.write_file(&h, 0, b"test-replace-data").await.unwrap();
        b.write_file(&h, 5, b"newdata").await.unwrap();
        assert_eq!(api.content("f").unwrap(), b"test-newdata-data");
        assert_eq!(h.size(), 17);
    }

    #[tokio::test]
    async fn write_past_the_service_ceiling_is_rejected() {
        let (_, b) = backend();
        let h = b.create_file("f").await.unwrap();
        let err = b
            .write_file(&h, range::MAX_FILE_BYTES, b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, CloudFsError::SizeTooLarge { .. }));
        assert_eq!(h.size(), 0);
    }

    #[tokio::test]
    async fn read_contracts() {
        let (_, b) = backend();
        let h = b.create_file("f").await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(b.read_in_buffer(&h, 99, &mut buf).await.unwrap(), 0);

        b.write_file(&h, 0, b"0123456789").await.unwrap();
        assert!(matches!(
            b.read_in_buffer(&h, 20, &mut buf).await,
            Err(CloudFsError::RangeOutOfBounds { .. })
        ));
        assert_eq!(b.read_in_buffer(&h, 6, &mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"6789");
        assert_eq!(&b.read_file(&h).await.unwrap()[..], b"0123456789");
    }

    #[tokio::test]
    async fn truncate_uses_native_resize() {
        let (api, b) = backend();
        let h = b.create_file("f").await.unwrap();
        b.write_file(&h, 0, b"test data").await.unwrap();

        b.truncate_file("f", 4).await.unwrap();
        assert_eq!(api.content("f").unwrap(), b"test");
        b.truncate_file("f", 4).await.unwrap();
        b.truncate_file("f", 6).await.unwrap();
        assert_eq!(api.content("f").unwrap(), b"test\x00\x00");

        assert!(matches!(
            b.truncate_file("missing", 1).await,
            Err(CloudFsError::NotFound(_))
        ));
        assert!(matches!(
            b.truncate_file("f", range::MAX_FILE_BYTES + 1).await,
            Err(CloudFsError::SizeTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn open_file_reflects_service_size() {
        let (_, b) = backend();
        b.create_file("f").await.unwrap();
        b.truncate_file("f", 10).await.unwrap();
        let h = b.open_file("f").await.unwrap();
        assert_eq!(h.size(), 10);
        assert!(matches!(
            b.open_file("missing").await,
            Err(CloudFsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn native_directories() {
        let (api, b) = backend();
        b.create_dir("d/").await.unwrap();
        assert!(api.is_dir("d"));
        assert!(b.get_attr("d").await.unwrap().is_dir());

        // re-creating an existing directory is fine; a file in the way is not
        b.create_dir("d").await.unwrap();
        b.create_file("f").await.unwrap();
        assert!(matches!(
            b.create_dir("f").await,
            Err(CloudFsError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn delete_dir_semantics() {
        let (_, b) = backend();
        b.create_dir("d").await.unwrap();
        b.delete_dir("d").await.unwrap();
        assert!(matches!(
            b.delete_dir("d").await,
            Err(CloudFsError::NotFound(_))
        ));
        assert!(matches!(
            b.delete_dir("d").await,
            Err(CloudFsError::NotFound(_))
        ));

        b.create_dir("e").await.unwrap();
        b.create_file("e/child").await.unwrap();
        assert!(matches!(
            b.delete_dir("e").await,
            Err(CloudFsError::NotEmpty(_))
        ));
    }

    #[tokio::test]
    async fn missing_directory_is_an_error_on_this_variant() {
        let (_, b) = backend();
        assert!(matches!(
            b.read_dir("missing").await,
            Err(CloudFsError::NotFound(_))
        ));
        assert!(matches!(
            b.is_dir_empty("missing").await,
            Err(CloudFsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn read_dir_lists_one_level_with_native_kinds() {
        let (_, b) = backend();
        setup_hierarchy(&b, "base").await;

        let entries = b.read_dir("base").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "c1");
        assert!(entries[0].is_dir());
        assert_eq!(entries[1].name, "c2");
        assert!(!entries[1].is_dir());

        let root = b.read_dir("/").await.unwrap();
        let names: Vec<_> = root.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["base", "baseb", "basec"]);
    }

    #[tokio::test]
    async fn rename_dir_walks_the_subtree() {
        let (api, b) = backend();
        setup_hierarchy(&b, "base").await;

        b.rename_dir("base", "based").await.unwrap();

        let paths = api.paths();
        for gone in ["base", "base/c1", "base/c1/gc1", "base/c2"] {
            assert!(!paths.contains(&gone.to_string()), "{gone} should be gone");
        }
        for present in ["based", "based/c1", "based/c1/gc1", "based/c2", "baseb", "baseb/c1", "basec"]
        {
            assert!(paths.contains(&present.to_string()), "{present} missing");
        }
        assert!(api.is_dir("based/c1"));
    }

    #[tokio::test]
    async fn rename_dir_rejects_existing_target_and_missing_source() {
        let (_, b) = backend();
        b.create_dir("src").await.unwrap();
        b.create_dir("dst").await.unwrap();
        assert!(matches!(
            b.rename_dir("src", "dst").await,
            Err(CloudFsError::AlreadyExists(_))
        ));
        assert!(matches!(
            b.rename_dir("ghost", "other").await,
            Err(CloudFsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rename_scoped_under_prefix_path() {
        let (api, b) = backend();
        setup_hierarchy(&b, "base").await;

        b.set_prefix_path("base").await.unwrap();
        b.rename_dir("c1", "renamed").await.unwrap();

        let paths = api.paths();
        assert!(paths.contains(&"base/renamed".to_string()));
        assert!(paths.contains(&"base/renamed/gc1".to_string()));
        assert!(!paths.contains(&"base/c1".to_string()));
        // the sibling hierarchy outside the scope is untouched
        assert!(paths.contains(&"baseb/c1".to_string()));
    }

    #[tokio::test]
    async fn rename_file_preserves_metadata() {
        let (api, b) = backend();
        let h = b.create_file("src").await.unwrap();
        b.write_file(&h, 0, b"payload").await.unwrap();
        api.set_attrs("src", &AttrMap::from([("foo".into(), "bar".into())]), None)
            .await
            .unwrap();

        b.rename_file("src", "dst").await.unwrap();
        assert!(api.content("src").is_none());
        let attrs = b.get_attr("dst").await.unwrap();
        assert_eq!(attrs.attrs.get("foo").map(String::as_str), Some("bar"));

        assert!(matches!(
            b.rename_file("src", "elsewhere").await,
            Err(CloudFsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn symlink_round_trip() {
        let (api, b) = backend();
        b.create_file("target").await.unwrap();
        b.create_link("link", "target").await.unwrap();

        assert_eq!(b.read_link("link").await.unwrap(), "target");
        let attrs = b.get_attr("link").await.unwrap();
        assert!(attrs.is_symlink());
        assert_eq!(api.content("link").unwrap(), b"target");

        assert!(matches!(
            b.read_link("target").await,
            Err(CloudFsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn upload_sets_and_download_validates_the_digest() {
        let mut config = test_config();
        config.update_md5 = true;
        config.validate_md5 = true;
        let (api, b) = backend_with(config);

        let dir = tempfile::tempdir().unwrap();
        let up = dir.path().join("up.bin");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&up, &payload).unwrap();

        b.copy_from_file("f", &up).await.unwrap();
        let attrs = b.get_attr("f").await.unwrap();
        assert_eq!(attrs.md5.as_deref(), Some(integrity::digest(&payload).as_str()));
        assert_eq!(api.content("f").unwrap(), payload);

        let down = dir.path().join("down.bin");
        b.copy_to_file("f", &down).await.unwrap();
        assert_eq!(std::fs::read(&down).unwrap(), payload);

        api.corrupt_md5("f");
        let err = b.copy_to_file("f", &down).await.unwrap_err();
        assert!(err.to_string().contains("md5 digest mismatch on download"));

        let mut relaxed = test_config();
        relaxed.validate_md5 = false;
        let b2 = FileShareBackend::new(relaxed, api.clone());
        b2.copy_to_file("f", &down).await.unwrap();
    }

    #[tokio::test]
    async fn chmod_and_chown_follow_the_unsupported_op_flag() {
        let (_, strict) = backend();
        strict.create_file("f").await.unwrap();
        assert!(matches!(
            strict.chmod("f", 0o666).await,
            Err(CloudFsError::NotSupported(_))
        ));
        assert!(matches!(
            strict.chown("f", 6, 5).await,
            Err(CloudFsError::NotSupported(_))
        ));

        let mut config = test_config();
        config.fail_unsupported_op = false;
        let (_, lenient) = backend_with(config);
        lenient.create_file("f").await.unwrap();
        lenient.chmod("f", 0o666).await.unwrap();
        lenient.chown("f", 6, 5).await.unwrap();
    }

    #[tokio::test]
    async fn list_containers() {
        let (_, b) = backend();
        assert_eq!(
            b.list_containers().await.unwrap(),
            vec!["share1", "share2"]
        );
    }
}
