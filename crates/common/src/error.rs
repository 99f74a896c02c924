//! Error taxonomy for filesystem operations

use crate::remote::RemoteError;

pub type Result<T, E = FsError> = std::result::Result<T, E>;

/// Errors surfaced by the operation layer to the kernel-facing dispatcher
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("No such entry: {0}")]
    NotFound(String),
    #[error("No such file handle: {0}")]
    BadHandle(u64),
    #[error("Remote {op} failed: {source}")]
    Remote {
        op: &'static str,
        #[source]
        source: RemoteError,
    },
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("No free file handle (capacity {capacity})")]
    Exhausted { capacity: u64 },
    #[error("Not a directory: {0}")]
    NotADirectory(String),
    #[error("Is a directory: {0}")]
    IsADirectory(String),
}

impl FsError {
    pub(crate) fn remote(op: &'static str) -> impl FnOnce(RemoteError) -> FsError {
        move |source| FsError::Remote { op, source }
    }

    /// Errno value to reply with
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::Remote { .. } => libc::EIO,
            FsError::Unsupported(_) => libc::EOPNOTSUPP,
            FsError::Exhausted { .. } => libc::ENFILE,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::NotFound("/a".into()).errno(), libc::ENOENT);
        assert_eq!(FsError::Unsupported("append").errno(), libc::EOPNOTSUPP);
        assert_eq!(FsError::Exhausted { capacity: 1 }.errno(), libc::ENFILE);

        let err = FsError::remote("delete")(RemoteError::Transport("reset".into()));
        assert_eq!(err.errno(), libc::EIO);
        assert_eq!(
            err.to_string(),
            "Remote delete failed: Transport error: reset"
        );
    }
}
