use std::io;
use thiserror::Error;

/// Main error type for cloudfs operations
#[derive(Error, Debug)]
pub enum CloudFsError {
    #[error("path not found: {0}")]
    NotFound(String),

    #[error("path already exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("offset {offset} out of range for {path} (size {size})")]
    RangeOutOfBounds {
        path: String,
        offset: u64,
        size: u64,
    },

    #[error("{path}: size {size} exceeds the service ceiling of {max} bytes")]
    SizeTooLarge { path: String, size: u64, max: u64 },

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("{0}")]
    IntegrityMismatch(String),

    #[error("transient failure in {op}: {message}")]
    Transient { op: &'static str, message: String },

    #[error("remote service error in {op}: {message}")]
    Remote { op: &'static str, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CloudFsError {
    /// Whether the retry wrapper may re-issue the failed network call.
    ///
    /// Only service throttling, server-side unavailability, and transport
    /// timeouts qualify; client errors and auth/config failures never do.
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudFsError::Transient { .. })
    }

    /// Convert error to libc errno for kernel-facing responses
    pub fn to_errno(&self) -> i32 {
        match self {
            CloudFsError::NotFound(_) => libc::ENOENT,
            CloudFsError::AlreadyExists(_) => libc::EEXIST,
            CloudFsError::NotEmpty(_) => libc::ENOTEMPTY,
            CloudFsError::RangeOutOfBounds { .. } => libc::ERANGE,
            CloudFsError::SizeTooLarge { .. } => libc::EFBIG,
            CloudFsError::NotSupported(_) => libc::ENOTSUP,
            CloudFsError::IntegrityMismatch(_) => libc::EIO,
            CloudFsError::Transient { .. } => libc::EIO,
            CloudFsError::Remote { .. } => libc::EIO,
            CloudFsError::Auth(_) => libc::EACCES,
            CloudFsError::Config(_) => libc::EINVAL,
            CloudFsError::Internal(_) => libc::EIO,
            CloudFsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Result type alias for cloudfs operations
pub type Result<T> = std::result::Result<T, CloudFsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(
            CloudFsError::NotFound("a".into()).to_errno(),
            libc::ENOENT
        );
        assert_eq!(
            CloudFsError::NotEmpty("a".into()).to_errno(),
            libc::ENOTEMPTY
        );
        assert_eq!(
            CloudFsError::RangeOutOfBounds {
                path: "a".into(),
                offset: 20,
                size: 10
            }
            .to_errno(),
            libc::ERANGE
        );
        assert_eq!(CloudFsError::NotSupported("chmod").to_errno(), libc::ENOTSUP);
    }

    #[test]
    fn transient_classification() {
        let transient = CloudFsError::Transient {
            op: "get",
            message: "503".into(),
        };
        assert!(transient.is_transient());
        assert!(!CloudFsError::NotFound("a".into()).is_transient());
        assert!(!CloudFsError::Auth("expired key".into()).is_transient());
    }
}
