//! cloudfs: a pluggable component pipeline exposing remote object-store or
//! file-share storage as a POSIX-like filesystem tree.
//!
//! # Architecture
//!
//! - **Pipeline**: stages sharing one operation contract ([`pipeline::Component`]),
//!   composed once at startup into an immutable call chain. A stage either
//!   answers a call locally or forwards it unchanged.
//! - **Backends**: two terminal stages selected from configuration: a flat
//!   object namespace emulating directories through markers and path
//!   delimiters, and a natively hierarchical file share.
//! - **Collaborators**: the range calculator, integrity validator, retry
//!   wrapper, and handle map shared by both backends.
//!
//! # Example
//!
//! ```no_run
//! use cloudfs::backend::new_backend;
//! use cloudfs::config::StorageConfig;
//! use cloudfs::pipeline::{Component, Pipeline};
//!
//! # async fn example() -> cloudfs::Result<()> {
//! let config = StorageConfig::from_file(std::path::Path::new("config.yaml"))?;
//! let backend = new_backend(config).await?;
//! let pipeline = Pipeline::assemble(vec![backend])?;
//! pipeline.start().await?;
//!
//! pipeline.head().create_dir("photos").await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod handle;
pub mod integrity;
pub mod pipeline;
pub mod range;
pub mod retry;

pub use error::{CloudFsError, Result};
