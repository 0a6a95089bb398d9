//! Error taxonomy for the buffered I/O layer.
//!
//! Errors fall into three groups:
//!
//! - **Retryable**: [`BioError::Interrupted`] and [`BioError::TimedOut`]. Data is
//!   preserved and the operation can be repeated.
//! - **Corrective**: [`BioError::StaleWriteVerifier`] and
//!   [`BioError::BadDirectoryCookie`] trigger recovery (mount-wide commit
//!   forgetting, directory re-read) close to where they are raised.
//! - **Hard**: [`BioError::Server`] and friends. For writes these are recorded on
//!   the buffer and deferred onto the file, surfacing at the next flush or close.

use thiserror::Error;

/// Errors produced by the buffered I/O layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BioError {
    /// A blocking wait was cancelled, or the RPC layer reported an interrupted call.
    #[error("operation interrupted")]
    Interrupted,

    /// A contended lock was released while we slept; the caller must re-validate
    /// its preconditions and try again.
    #[error("lock released while waiting, operation must restart")]
    Restart,

    /// The server's write verifier changed: uncommitted data may have been lost.
    #[error("server write verifier changed")]
    StaleWriteVerifier,

    /// The directory position cookie is no longer valid on the server.
    #[error("directory cookie is no longer valid")]
    BadDirectoryCookie,

    /// Write would exceed the caller's or the server's file size limit.
    #[error("file too large")]
    FileTooLarge,

    /// No async worker could take the buffer; the caller performs the I/O itself.
    #[error("async I/O workers busy")]
    Busy,

    /// The RPC timed out. Treated like an interruption for dirty data.
    #[error("RPC timed out")]
    TimedOut,

    /// Hard error reported by the server, as an errno value.
    #[error("server error (errno {0})")]
    Server(i32),

    /// The operation does not apply to this kind of file.
    #[error("operation not supported on this file type")]
    WrongFileKind,

    /// Malformed request.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl BioError {
    /// Whether the error leaves data intact and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BioError::Interrupted | BioError::TimedOut)
    }

    /// Converts this error to a libc error code.
    pub fn to_errno(&self) -> i32 {
        match self {
            BioError::Interrupted => libc::EINTR,
            BioError::Restart => libc::ENOLCK,
            BioError::StaleWriteVerifier | BioError::BadDirectoryCookie => libc::EIO,
            BioError::FileTooLarge => libc::EFBIG,
            BioError::Busy => libc::EAGAIN,
            BioError::TimedOut => libc::ETIMEDOUT,
            BioError::Server(errno) => *errno,
            BioError::WrongFileKind => libc::EOPNOTSUPP,
            BioError::InvalidArgument(_) => libc::EINVAL,
        }
    }

    /// Builds a hard server error from an errno value.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EINTR => BioError::Interrupted,
            libc::ETIMEDOUT => BioError::TimedOut,
            libc::EFBIG => BioError::FileTooLarge,
            _ => BioError::Server(errno),
        }
    }
}

impl From<std::io::Error> for BioError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::Interrupted => BioError::Interrupted,
            std::io::ErrorKind::TimedOut => BioError::TimedOut,
            _ => BioError::Server(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }
}

/// Result type for buffered I/O operations.
pub type BioResult<T> = Result<T, BioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BioError::Interrupted.is_retryable());
        assert!(BioError::TimedOut.is_retryable());
        assert!(!BioError::StaleWriteVerifier.is_retryable());
        assert!(!BioError::Server(libc::EIO).is_retryable());
        assert!(!BioError::Busy.is_retryable());
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(BioError::Interrupted.to_errno(), libc::EINTR);
        assert_eq!(BioError::FileTooLarge.to_errno(), libc::EFBIG);
        assert_eq!(BioError::Server(libc::ENOSPC).to_errno(), libc::ENOSPC);
        assert_eq!(BioError::Busy.to_errno(), libc::EAGAIN);
    }

    #[test]
    fn test_from_errno_roundtrips_special_codes() {
        assert_eq!(BioError::from_errno(libc::EINTR), BioError::Interrupted);
        assert_eq!(BioError::from_errno(libc::ETIMEDOUT), BioError::TimedOut);
        assert_eq!(BioError::from_errno(libc::EDQUOT), BioError::Server(libc::EDQUOT));
    }

    #[test]
    fn test_io_error_conversion() {
        let e = std::io::Error::from(std::io::ErrorKind::Interrupted);
        assert_eq!(BioError::from(e), BioError::Interrupted);

        let e = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(BioError::from(e), BioError::Server(libc::EACCES));

        // Should return EIO when no raw OS error
        let e = std::io::Error::other("custom error");
        assert_eq!(BioError::from(e), BioError::Server(libc::EIO));
    }
}
