//! Error types shared across the wire codec, hierarchy, RPN engine, and SDB I/O.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SelvaError>;

/// Mirrors the Selva error code families from the wire protocol (§6/§7).
///
/// Every variant maps to a stable negative code via [`SelvaError::code`] so that
/// command handlers can turn an internal failure straight into a wire `error` value
/// without re-deriving the mapping at each call site.
#[derive(Error, Debug)]
pub enum SelvaError {
    #[error("no such entry")]
    Enoent,

    #[error("already exists")]
    Eexist,

    #[error("invalid argument: {0}")]
    Einval(String),

    #[error("out of memory")]
    Enomem,

    #[error("not supported: {0}")]
    Enotsup(String),

    #[error("unknown command")]
    Enosys,

    #[error("general error: {0}")]
    Egeneral(String),

    #[error("wrong value type")]
    Eintype,

    #[error("hierarchy: no such node")]
    HierarchyEnoent,

    #[error("hierarchy: invalid argument: {0}")]
    HierarchyEinval(String),

    #[error("hierarchy: traversal already in progress")]
    HierarchyEtrmax,

    #[error("hierarchy: out of memory")]
    HierarchyEnomem,

    #[error("hierarchy: not supported: {0}")]
    HierarchyEnotsup(String),

    #[error("rpn: compile error: {0}")]
    RpnEcomp(String),

    #[error("rpn: out of memory")]
    RpnEnomem,

    #[error("rpn: operation not supported")]
    RpnNotsup,

    #[error("rpn: illegal opcode")]
    RpnIllopc,

    #[error("rpn: illegal operand")]
    RpnIllopn,

    #[error("rpn: stack over/underflow")]
    RpnBadstk,

    #[error("rpn: type error")]
    RpnType,

    #[error("rpn: out of bounds")]
    RpnBnds,

    #[error("rpn: null pointer")]
    RpnNpe,

    #[error("rpn: not a number")]
    RpnNan,

    #[error("rpn: division by zero")]
    RpnDiv,

    /// Internal control signal for the modal `P`/`Q` operators. Never surfaced
    /// to a caller; the evaluator always intercepts it before returning.
    #[error("rpn: internal break signal")]
    RpnBreak,

    #[error("protocol error: {0}")]
    Ebadmsg(String),

    #[error("bad file descriptor")]
    Ebadf,

    #[error("no buffer space available")]
    Enobufs,

    #[error("connection reset")]
    Econnreset,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sdb hash mismatch")]
    SdbHashMismatch,

    #[error("sdb bad magic")]
    SdbBadMagic,
}

impl SelvaError {
    /// Stable negative Selva error code for wire replies (§6).
    pub fn code(&self) -> i16 {
        match self {
            SelvaError::Enoent => -2,
            SelvaError::Eexist => -17,
            SelvaError::Einval(_) => -22,
            SelvaError::Enomem => -12,
            SelvaError::Enotsup(_) => -95,
            SelvaError::Enosys => -38,
            SelvaError::Egeneral(_) => -1,
            SelvaError::Eintype => -1001,
            SelvaError::HierarchyEnoent => -1010,
            SelvaError::HierarchyEinval(_) => -1011,
            SelvaError::HierarchyEtrmax => -1012,
            SelvaError::HierarchyEnomem => -1013,
            SelvaError::HierarchyEnotsup(_) => -1014,
            SelvaError::RpnEcomp(_) => -1020,
            SelvaError::RpnEnomem => -1021,
            SelvaError::RpnNotsup => -1022,
            SelvaError::RpnIllopc => -1023,
            SelvaError::RpnIllopn => -1024,
            SelvaError::RpnBadstk => -1025,
            SelvaError::RpnType => -1026,
            SelvaError::RpnBnds => -1027,
            SelvaError::RpnNpe => -1028,
            SelvaError::RpnNan => -1029,
            SelvaError::RpnDiv => -1030,
            SelvaError::RpnBreak => -1031,
            SelvaError::Ebadmsg(_) => -74,
            SelvaError::Ebadf => -9,
            SelvaError::Enobufs => -105,
            SelvaError::Econnreset => -104,
            SelvaError::Io(_) => -5,
            SelvaError::Json(_) => -5,
            SelvaError::SdbHashMismatch => -1040,
            SelvaError::SdbBadMagic => -1041,
        }
    }

    /// Name used in `lscmd`-adjacent diagnostics and test assertions.
    pub fn name(&self) -> &'static str {
        match self {
            SelvaError::Enoent => "ENOENT",
            SelvaError::Eexist => "EEXIST",
            SelvaError::Einval(_) => "EINVAL",
            SelvaError::Enomem => "ENOMEM",
            SelvaError::Enotsup(_) => "ENOTSUP",
            SelvaError::Enosys => "ENOSYS",
            SelvaError::Egeneral(_) => "EGENERAL",
            SelvaError::Eintype => "EINTYPE",
            SelvaError::HierarchyEnoent => "HIERARCHY_ENOENT",
            SelvaError::HierarchyEinval(_) => "HIERARCHY_EINVAL",
            SelvaError::HierarchyEtrmax => "HIERARCHY_ETRMAX",
            SelvaError::HierarchyEnomem => "HIERARCHY_ENOMEM",
            SelvaError::HierarchyEnotsup(_) => "HIERARCHY_ENOTSUP",
            SelvaError::RpnEcomp(_) => "RPN_ECOMP",
            SelvaError::RpnEnomem => "RPN_ENOMEM",
            SelvaError::RpnNotsup => "RPN_NOTSUP",
            SelvaError::RpnIllopc => "RPN_ILLOPC",
            SelvaError::RpnIllopn => "RPN_ILLOPN",
            SelvaError::RpnBadstk => "RPN_BADSTK",
            SelvaError::RpnType => "RPN_TYPE",
            SelvaError::RpnBnds => "RPN_BNDS",
            SelvaError::RpnNpe => "RPN_NPE",
            SelvaError::RpnNan => "RPN_NAN",
            SelvaError::RpnDiv => "RPN_DIV",
            SelvaError::RpnBreak => "RPN_BREAK",
            SelvaError::Ebadmsg(_) => "EBADMSG",
            SelvaError::Ebadf => "EBADF",
            SelvaError::Enobufs => "ENOBUFS",
            SelvaError::Econnreset => "ECONNRESET",
            SelvaError::Io(_) => "EIO",
            SelvaError::Json(_) => "EIO",
            SelvaError::SdbHashMismatch => "SDB_EHASH",
            SelvaError::SdbBadMagic => "SDB_EMAGIC",
        }
    }

    /// Protocol-kind errors drop the connection rather than merely reply with
    /// an error value (§7).
    pub fn is_protocol_fatal(&self) -> bool {
        matches!(
            self,
            SelvaError::Ebadmsg(_) | SelvaError::Ebadf | SelvaError::Enobufs | SelvaError::Econnreset
        )
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn protocol_errors_are_fatal() {
        assert!(SelvaError::Ebadmsg("bad frame".into()).is_protocol_fatal());
        assert!(!SelvaError::Enoent.is_protocol_fatal());
    }

    #[test]
    fn codes_are_negative() {
        assert!(SelvaError::Enoent.code() < 0);
        assert!(SelvaError::HierarchyEtrmax.code() < 0);
    }

    #[test]
    fn break_never_surfaces_as_protocol_fatal() {
        assert!(!SelvaError::RpnBreak.is_protocol_fatal());
    }
}
