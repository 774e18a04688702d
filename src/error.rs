//! Module-boundary error type grouped by the error kinds the core distinguishes.

use std::fmt;

/// The six error kinds the core distinguishes at its dispatch boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad opcode/state/length, unknown peer. NAK + disconnect.
    Protocol,
    /// RID/TG disabled, permission denied. Drop + optional In-Call Control reject.
    Acl,
    /// Max peers, pool exhausted. NAK `FNE_MAX_CONN` / SNDCP reject.
    Resource,
    /// Ping, call, PDU idle timeouts. Synchronous recovery.
    Timeout,
    /// PDU CRC fail, KMM undecodable. Log and discard, no caller notification.
    Integrity,
    /// Required external capability (e.g. a cipher backend) unavailable.
    Dependency,
}

#[derive(Debug, thiserror::Error)]
pub enum FneError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("acl rejected: {0}")]
    Acl(String),
    #[error("resource exhausted: {0}")]
    Resource(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("dependency unavailable: {0}")]
    Dependency(String),
}

impl FneError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FneError::Protocol(_) => ErrorKind::Protocol,
            FneError::Acl(_) => ErrorKind::Acl,
            FneError::Resource(_) => ErrorKind::Resource,
            FneError::Timeout(_) => ErrorKind::Timeout,
            FneError::Integrity(_) => ErrorKind::Integrity,
            FneError::Dependency(_) => ErrorKind::Dependency,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Protocol => "protocol",
            ErrorKind::Acl => "acl",
            ErrorKind::Resource => "resource",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Dependency => "dependency",
        };
        f.write_str(s)
    }
}

pub type FneResult<T> = Result<T, FneError>;
