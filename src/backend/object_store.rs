//! Flat object-namespace backend.
//!
//! The service stores a single native object type in a flat namespace, so
//! the directory tree is emulated: "/" is a path-delimiter convention,
//! directories are zero-length marker objects tagged `is-directory`, and
//! symlinks are objects holding their target path tagged `is-symlink`.
//! There is no partial-range write and no native rename; writes are
//! whole-object read-modify-write and renames are server-side copy plus
//! delete per entry.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, trace};

use crate::backend::{base_name, normalize, PrefixScope};
use crate::config::StorageConfig;
use crate::error::{CloudFsError, Result};
use crate::handle::{Handle, HandleMap};
use crate::integrity::{self, DigestStream};
use crate::pipeline::{AttrMap, Component, DirEntry, ObjectAttributes, ATTR_SYMLINK, ATTR_TRUE};

/// Default transfer chunk when no block-size override is configured.
const DEFAULT_CHUNK_BYTES: u64 = 8 * 1024 * 1024;

/// One delimiter listing: objects plus collapsed child prefixes.
#[derive(Debug, Default)]
pub struct Listing {
    pub objects: Vec<ObjectAttributes>,
    pub prefixes: Vec<String>,
}

impl Listing {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.prefixes.is_empty()
    }
}

/// The single-network-call seam against the object service.
///
/// Every method issues exactly one logical service call (paginated
/// listings excepted); the production client wraps each call with the
/// retry policy, so callers here never retry themselves.
#[async_trait]
pub trait ObjectApi: Send + Sync {
    async fn head(&self, key: &str) -> Result<ObjectAttributes>;

    /// Read `len` bytes at `offset`; `len == 0` reads to the end.
    async fn get(&self, key: &str, offset: u64, len: u64) -> Result<Bytes>;

    /// Store a whole object, replacing any previous content and attributes.
    async fn put(&self, key: &str, data: Bytes, attrs: &AttrMap, md5: Option<&str>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Server-side copy preserving attributes and digest.
    async fn copy(&self, src: &str, dst: &str) -> Result<()>;

    /// List keys under `prefix`. With `delimited`, children collapse at
    /// "/"; `max` bounds the result when only existence matters.
    async fn list(&self, prefix: &str, delimited: bool, max: Option<usize>) -> Result<Listing>;

    async fn list_containers(&self) -> Result<Vec<String>>;
}

/// Terminal pipeline component over a flat object namespace.
pub struct ObjectStoreBackend {
    config: StorageConfig,
    api: Arc<dyn ObjectApi>,
    handles: HandleMap,
    scope: PrefixScope,
    listing_blocked_until: RwLock<Option<Instant>>,
}

impl ObjectStoreBackend {
    pub fn new(config: StorageConfig, api: Arc<dyn ObjectApi>) -> Self {
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

    fn chunk_size(&self) -> u64 {
        self.config.block_size.unwrap_or(DEFAULT_CHUNK_BYTES)
    }

    fn listing_blocked(&self) -> bool {
        match *self.listing_blocked_until.read() {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    /// Head a key, inferring a directory from its children when markers
    /// are optional (`virtual-directory`).
    async fn lookup(&self, key: &str) -> Result<ObjectAttributes> {
        match self.api.head(key).await {
            Ok(attrs) => Ok(attrs),
            Err(CloudFsError::NotFound(_)) if self.config.virtual_directory => {
                let listing = self.api.list(&format!("{key}/"), true, Some(1)).await?;
                if listing.is_empty() {
                    Err(CloudFsError::NotFound(key.to_string()))
                } else {
                    Ok(ObjectAttributes::directory(key, SystemTime::now()))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.lookup(key).await {
            Ok(_) => Ok(true),
            Err(CloudFsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn entry_from(&self, key: &str, attrs: Option<&ObjectAttributes>) -> DirEntry {
        let logical = self.scope.strip(key);
        DirEntry {
            name: base_name(&logical).to_string(),
            kind: match attrs {
                Some(a) => a.kind(),
                None => crate::pipeline::EntryKind::Directory,
            },
            path: logical,
        }
    }
}

#[async_trait]
impl Component for ObjectStoreBackend {
    fn name(&self) -> &'static str {
        "object-store"
    }

    fn next(&self) -> Option<Arc<dyn Component>> {
        None
    }

    fn set_next(&self, _next: Arc<dyn Component>) {}

    async fn start(&self) -> Result<()> {
        // connectivity probe; auth and endpoint failures surface here,
        // before the backend is considered ready
        self.api.list("", true, Some(1)).await?;
        if !self.config.block_list_on_mount.is_zero() {
            *self.listing_blocked_until.write() =
                Some(Instant::now() + self.config.block_list_on_mount);
        }
        info!(container = %self.config.container, "object-store backend ready");
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
        // re-creating an existing directory overwrites the marker in place
        self.api.put(&key, Bytes::new(), &attrs, None).await
    }

    async fn delete_dir(&self, name: &str) -> Result<()> {
        let key = self.key(name);
        debug!(%key, "delete_dir");
        let listing = self.api.list(&format!("{key}/"), true, Some(1)).await?;
        if !listing.is_empty() {
            return Err(CloudFsError::NotEmpty(normalize(name).to_string()));
        }
        match self.api.head(&key).await {
            Ok(attrs) if attrs.is_dir() => self.api.delete(&key).await,
            Ok(_) => Err(CloudFsError::NotFound(normalize(name).to_string())),
            Err(e) => Err(e),
        }
    }

    async fn rename_dir(&self, src: &str, dst: &str) -> Result<()> {
        let srck = self.key(src);
        let dstk = self.key(dst);
        debug!(src = %srck, dst = %dstk, "rename_dir");

        if self.exists(&dstk).await? {
            return Err(CloudFsError::AlreadyExists(normalize(dst).to_string()));
        }
        let src_attrs = self.lookup(&srck).await?;
        if !src_attrs.is_dir() {
            return Err(CloudFsError::NotFound(normalize(src).to_string()));
        }

        // Copy the marker first, then every descendant discovered by a
        // flat prefix walk, then delete the sources. A failure partway
        // through leaves the tree partially moved; no rollback.
        let mut moved = Vec::new();
        if self.api.head(&srck).await.is_ok() {
            self.api.copy(&srck, &dstk).await?;
            moved.push(srck.clone());
        }
        let subtree = self.api.list(&format!("{srck}/"), false, None).await?;
        for obj in &subtree.objects {
            let suffix = &obj.path[srck.len()..];
            let target = format!("{dstk}{suffix}");
            self.api.copy(&obj.path, &target).await?;
            moved.push(obj.path.clone());
        }
        for key in &moved {
            self.api.delete(key).await?;
        }
        Ok(())
    }

    async fn is_dir_empty(&self, name: &str) -> Result<bool> {
        let key = self.key(name);
        // an absent directory lists as empty on this variant
        let listing = self.api.list(&format!("{key}/"), true, Some(1)).await?;
        Ok(listing.is_empty())
    }

    async fn read_dir(&self, name: &str) -> Result<Vec<DirEntry>> {
        if self.listing_blocked() {
            trace!(%name, "read_dir suppressed during mount window");
            return Ok(Vec::new());
        }
        let key = self.key(name);
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        };
        let listing = self.api.list(&prefix, true, None).await?;

        let mut entries = Vec::new();
        let mut seen_dirs = HashSet::new();
        for p in &listing.prefixes {
            let trimmed = p.trim_end_matches('/');
            seen_dirs.insert(trimmed.to_string());
            entries.push(self.entry_from(trimmed, None));
        }
        for obj in &listing.objects {
            let k = obj.path.trim_end_matches('/');
            // a marker that also surfaced as a child prefix is one entry
            if seen_dirs.contains(k) {
                continue;
            }
            entries.push(self.entry_from(k, Some(obj)));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create_file(&self, name: &str) -> Result<Arc<Handle>> {
        let key = self.key(name);
        debug!(%key, "create_file");
        self.api.put(&key, Bytes::new(), &AttrMap::new(), None).await?;
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
            // known-empty object: skip the network round trip entirely
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
        trace!(%key, offset, len = data.len(), "write_file");
        handle.set_dirty(true);

        // no partial-range write on this variant: read-modify-write the
        // whole object, materializing gap bytes as zeros
        let mut content = if handle.size() == 0 {
            Vec::new()
        } else {
            self.api.get(&key, 0, 0).await?.to_vec()
        };
        let start = offset as usize;
        let end = start + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(data);

        let new_size = content.len() as u64;
        let md5 = self
            .config
            .update_md5
            .then(|| integrity::digest(&content));
        self.api
            .put(&key, Bytes::from(content), &AttrMap::new(), md5.as_deref())
            .await?;
        handle.set_size(new_size);
        handle.set_dirty(false);
        Ok(data.len())
    }

    async fn truncate_file(&self, name: &str, size: u64) -> Result<()> {
        let key = self.key(name);
        debug!(%key, size, "truncate_file");
        let attrs = self.api.head(&key).await?;
        let keep = attrs.size.min(size);
        let mut content = if keep == 0 {
            Vec::new()
        } else {
            self.api.get(&key, 0, keep).await?.to_vec()
        };
        content.resize(size as usize, 0);
        let md5 = self
            .config
            .update_md5
            .then(|| integrity::digest(&content));
        self.api
            .put(&key, Bytes::from(content), &attrs.attrs, md5.as_deref())
            .await
    }

    async fn delete_file(&self, name: &str) -> Result<()> {
        let key = self.key(name);
        debug!(%key, "delete_file");
        self.api.head(&key).await?;
        self.api.delete(&key).await
    }

    async fn rename_file(&self, src: &str, dst: &str) -> Result<()> {
        let srck = self.key(src);
        let dstk = self.key(dst);
        debug!(src = %srck, dst = %dstk, "rename_file");
        self.api.head(&srck).await?;
        self.api.copy(&srck, &dstk).await?;
        self.api.delete(&srck).await
    }

    async fn copy_to_file(&self, name: &str, dest: &Path) -> Result<()> {
        let key = self.key(name);
        let attrs = self.api.head(&key).await?;
        debug!(%key, size = attrs.size, "copy_to_file");

        let chunk = self.chunk_size();
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
        let data = fs::read(src).await?;
        debug!(%key, size = data.len(), "copy_from_file");
        let md5 = self.config.update_md5.then(|| integrity::digest(&data));
        self.api
            .put(&key, Bytes::from(data), &AttrMap::new(), md5.as_deref())
            .await
    }

    async fn get_attr(&self, name: &str) -> Result<ObjectAttributes> {
        let logical = normalize(name);
        if logical.is_empty() {
            return Ok(ObjectAttributes::directory("", SystemTime::now()));
        }
        let key = self.scope.apply(logical);
        let mut attrs = self.lookup(&key).await?;
        attrs.path = self.scope.strip(&attrs.path);
        Ok(attrs)
    }

    async fn create_link(&self, name: &str, target: &str) -> Result<()> {
        let key = self.key(name);
        debug!(%key, target, "create_link");
        let mut attrs = AttrMap::new();
        attrs.insert(ATTR_SYMLINK.to_string(), ATTR_TRUE.to_string());
        let md5 = self
            .config
            .update_md5
            .then(|| integrity::digest(target.as_bytes()));
        self.api
            .put(&key, Bytes::from(target.to_string()), &attrs, md5.as_deref())
            .await
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
                "chmod is not supported by the object-store backend",
            ))
        } else {
            Ok(())
        }
    }

    async fn chown(&self, _name: &str, _uid: u32, _gid: u32) -> Result<()> {
        if self.config.fail_unsupported_op {
            Err(CloudFsError::NotSupported(
                "chown is not supported by the object-store backend",
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
