//! Component pipeline: the uniform operation contract every stage
//! implements, and the one-shot composition that chains stages into a
//! single call path.
//!
//! A stage either satisfies a call itself or forwards it unchanged to the
//! next stage; the last stage is a terminal backend that implements every
//! operation and never forwards. Chains are assembled once at startup from
//! an ordered list and are immutable afterwards. Forwarded errors pass
//! through verbatim.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{CloudFsError, Result};
use crate::handle::Handle;

/// Attribute marking an object as a directory placeholder.
pub const ATTR_DIRECTORY: &str = "is-directory";
/// Attribute marking an object as a symbolic link.
pub const ATTR_SYMLINK: &str = "is-symlink";
/// Marker attribute value.
pub const ATTR_TRUE: &str = "true";

/// Extensible key/value attribute set attached to stored objects.
pub type AttrMap = HashMap<String, String>;

/// Entry kind as derivable from listing metadata alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// Metadata for one stored object, directory, or symlink.
///
/// The backing store has a single native object type, so directories and
/// symlinks are encoded as marker attributes rather than distinct kinds;
/// a directory marker and a regular file never share a path.
#[derive(Debug, Clone)]
pub struct ObjectAttributes {
    pub path: String,
    pub size: u64,
    pub mtime: SystemTime,
    /// Stored content digest (base64), `None` if never set.
    pub md5: Option<String>,
    pub attrs: AttrMap,
}

impl ObjectAttributes {
    pub fn file(path: impl Into<String>, size: u64, mtime: SystemTime) -> Self {
        Self {
            path: path.into(),
            size,
            mtime,
            md5: None,
            attrs: AttrMap::new(),
        }
    }

    pub fn directory(path: impl Into<String>, mtime: SystemTime) -> Self {
        let mut attrs = AttrMap::new();
        attrs.insert(ATTR_DIRECTORY.to_string(), ATTR_TRUE.to_string());
        Self {
            path: path.into(),
            size: 0,
            mtime,
            md5: None,
            attrs,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.attrs.get(ATTR_DIRECTORY).map(String::as_str) == Some(ATTR_TRUE)
    }

    pub fn is_symlink(&self) -> bool {
        self.attrs.get(ATTR_SYMLINK).map(String::as_str) == Some(ATTR_TRUE)
    }

    pub fn kind(&self) -> EntryKind {
        if self.is_dir() {
            EntryKind::Directory
        } else if self.is_symlink() {
            EntryKind::Symlink
        } else {
            EntryKind::File
        }
    }
}

/// One immediate child returned by `read_dir`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Full logical path, prefix-scope stripped.
    pub path: String,
    /// Final path component.
    pub name: String,
    pub kind: EntryKind,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// The uniform operation contract shared by every pipeline stage.
///
/// Default method bodies forward to [`Component::next`]; an intermediate
/// stage overrides only what it answers locally, while a terminal backend
/// overrides everything and returns `None` from `next`.
///
/// Paths are "/"-separated logical remote paths; trailing slashes are
/// normalized away by the terminal backend, so `dir` and `dir/` name the
/// same directory.
#[async_trait]
pub trait Component: Send + Sync {
    /// Stage name for logs and diagnostics.
    fn name(&self) -> &'static str;

    /// The next stage in the chain; terminal backends return `None`.
    fn next(&self) -> Option<Arc<dyn Component>>;

    /// Install the next stage. Invoked once per stage during assembly;
    /// terminal backends may ignore it.
    fn set_next(&self, next: Arc<dyn Component>);

    /// Resolve the next stage or fail when the chain ends unexpectedly.
    fn forward(&self, op: &'static str) -> Result<Arc<dyn Component>> {
        self.next().ok_or_else(|| {
            CloudFsError::Internal(format!("{op} fell off the end of the pipeline"))
        })
    }

    /// Connectivity self-test, run once down the whole chain at startup.
    async fn start(&self) -> Result<()> {
        self.forward("start")?.start().await
    }

    /// Release per-stage state at shutdown.
    async fn stop(&self) -> Result<()> {
        self.forward("stop")?.stop().await
    }

    // ----- directory operations -----

    async fn create_dir(&self, name: &str) -> Result<()> {
        self.forward("create_dir")?.create_dir(name).await
    }

    /// Remove an empty directory. Fails NotEmpty when it has children and
    /// NotFound when it does not exist.
    async fn delete_dir(&self, name: &str) -> Result<()> {
        self.forward("delete_dir")?.delete_dir(name).await
    }

    /// Move a directory subtree. Not transactional: a failure partway
    /// through leaves some descendants moved and others not.
    async fn rename_dir(&self, src: &str, dst: &str) -> Result<()> {
        self.forward("rename_dir")?.rename_dir(src, dst).await
    }

    async fn is_dir_empty(&self, name: &str) -> Result<bool> {
        self.forward("is_dir_empty")?.is_dir_empty(name).await
    }

    /// List the immediate children of a directory (one hierarchy level).
    async fn read_dir(&self, name: &str) -> Result<Vec<DirEntry>> {
        self.forward("read_dir")?.read_dir(name).await
    }

    // ----- file operations -----

    async fn create_file(&self, name: &str) -> Result<Arc<Handle>> {
        self.forward("create_file")?.create_file(name).await
    }

    async fn open_file(&self, name: &str) -> Result<Arc<Handle>> {
        self.forward("open_file")?.open_file(name).await
    }

    async fn close_file(&self, handle: &Handle) -> Result<()> {
        self.forward("close_file")?.close_file(handle).await
    }

    /// Read the whole file behind a handle.
    async fn read_file(&self, handle: &Handle) -> Result<Bytes> {
        self.forward("read_file")?.read_file(handle).await
    }

    /// Read into `buf` starting at `offset`, returning the bytes filled.
    ///
    /// A zero-size handle reads 0 bytes at any offset without error; a
    /// nonzero-size handle read at or past its size is RangeOutOfBounds.
    async fn read_in_buffer(&self, handle: &Handle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.forward("read_in_buffer")?
            .read_in_buffer(handle, offset, buf)
            .await
    }

    /// Write at `offset`, zero-filling any gap beyond the current size.
    async fn write_file(&self, handle: &Handle, offset: u64, data: &[u8]) -> Result<usize> {
        self.forward("write_file")?
            .write_file(handle, offset, data)
            .await
    }

    async fn truncate_file(&self, name: &str, size: u64) -> Result<()> {
        self.forward("truncate_file")?.truncate_file(name, size).await
    }

    async fn delete_file(&self, name: &str) -> Result<()> {
        self.forward("delete_file")?.delete_file(name).await
    }

    async fn rename_file(&self, src: &str, dst: &str) -> Result<()> {
        self.forward("rename_file")?.rename_file(src, dst).await
    }

    /// Stream the remote object into a local scratch file.
    async fn copy_to_file(&self, name: &str, dest: &Path) -> Result<()> {
        self.forward("copy_to_file")?.copy_to_file(name, dest).await
    }

    /// Upload a local scratch file as the remote object's new content.
    async fn copy_from_file(&self, name: &str, src: &Path) -> Result<()> {
        self.forward("copy_from_file")?.copy_from_file(name, src).await
    }

    async fn get_attr(&self, name: &str) -> Result<ObjectAttributes> {
        self.forward("get_attr")?.get_attr(name).await
    }

    // ----- link operations -----

    async fn create_link(&self, name: &str, target: &str) -> Result<()> {
        self.forward("create_link")?.create_link(name, target).await
    }

    async fn read_link(&self, name: &str) -> Result<String> {
        self.forward("read_link")?.read_link(name).await
    }

    // ----- metadata operations -----

    async fn chmod(&self, name: &str, mode: u32) -> Result<()> {
        self.forward("chmod")?.chmod(name, mode).await
    }

    async fn chown(&self, name: &str, uid: u32, gid: u32) -> Result<()> {
        self.forward("chown")?.chown(name, uid, gid).await
    }

    // ----- administrative operations -----

    async fn list_containers(&self) -> Result<Vec<String>> {
        self.forward("list_containers")?.list_containers().await
    }

    /// Re-scope every subsequent logical path under `prefix`.
    async fn set_prefix_path(&self, prefix: &str) -> Result<()> {
        self.forward("set_prefix_path")?.set_prefix_path(prefix).await
    }
}

/// An assembled chain of components.
///
/// Built once from an ordered stage list; the chain cannot be re-ordered
/// or extended afterwards.
pub struct Pipeline {
    head: Arc<dyn Component>,
    stages: Vec<&'static str>,
}

impl Pipeline {
    /// Chain `stages` in declaration order. The last entry must be a
    /// terminal backend.
    pub fn assemble(stages: Vec<Arc<dyn Component>>) -> Result<Self> {
        if stages.is_empty() {
            return Err(CloudFsError::Config(
                "pipeline needs at least one component".into(),
            ));
        }
        for pair in stages.windows(2) {
            pair[0].set_next(pair[1].clone());
        }
        let names = stages.iter().map(|s| s.name()).collect();
        Ok(Self {
            head: stages[0].clone(),
            stages: names,
        })
    }

    /// Entry point for all operations.
    pub fn head(&self) -> Arc<dyn Component> {
        self.head.clone()
    }

    /// Run the startup self-test down the chain.
    pub async fn start(&self) -> Result<()> {
        self.head.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.head.stop().await
    }

    /// Stage names in chain order.
    pub fn stage_names(&self) -> &[&'static str] {
        &self.stages
    }
}
