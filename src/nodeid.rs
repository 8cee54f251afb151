//! NodeId: fixed 10-byte identifiers whose first two bytes are the NodeType (§3).

use std::fmt;

pub const NODE_ID_LEN: usize = 10;
pub const NODE_TYPE_LEN: usize = 2;

/// All-zero id, the reserved "empty" identifier.
pub const EMPTY_ID: NodeId = NodeId([0u8; NODE_ID_LEN]);

/// `"root\0\0\0\0\0\0"` — the permanent root node.
pub const ROOT_ID: NodeId = NodeId([b'r', b'o', b'o', b't', 0, 0, 0, 0, 0, 0]);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    pub fn new(bytes: [u8; NODE_ID_LEN]) -> Self {
        NodeId(bytes)
    }

    /// Construct from a byte slice, left-padding with the type prefix and
    /// NUL-padding the remainder; used by command handlers that accept a
    /// shorter printable id such as `"ma12345678"`.
    pub fn from_slice(s: &[u8]) -> Self {
        let mut buf = [0u8; NODE_ID_LEN];
        let n = s.len().min(NODE_ID_LEN);
        buf[..n].copy_from_slice(&s[..n]);
        NodeId(buf)
    }

    pub fn from_str_padded(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }

    pub fn node_type(&self) -> [u8; NODE_TYPE_LEN] {
        [self.0[0], self.0[1]]
    }

    pub fn is_empty(&self) -> bool {
        *self == EMPTY_ID
    }

    pub fn is_root(&self) -> bool {
        *self == ROOT_ID
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Printable form: trims trailing NUL bytes, matching how the reference
    /// tooling displays ids like `ma12345678`.
    pub fn display_string(&self) -> String {
        let trimmed = self.0.iter().rposition(|&b| b != 0).map(|i| i + 1).unwrap_or(0);
        String::from_utf8_lossy(&self.0[..trimmed]).into_owned()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:?})", self.display_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_string())
    }
}

#[cfg(test)]
mod nodeid_tests {
    use super::*;

    #[test]
    fn root_is_distinct_from_empty() {
        assert_ne!(ROOT_ID, EMPTY_ID);
        assert!(ROOT_ID.is_root());
        assert!(EMPTY_ID.is_empty());
    }

    #[test]
    fn from_str_padded_pads_with_nul() {
        let id = NodeId::from_str_padded("ma12345678");
        assert_eq!(id.display_string(), "ma12345678");
        assert_eq!(id.node_type(), [b'm', b'a']);
    }

    #[test]
    fn byte_exact_comparison() {
        let a = NodeId::from_str_padded("ma00000001");
        let b = NodeId::from_str_padded("ma00000001");
        let c = NodeId::from_str_padded("ma00000002");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn truncates_overlong_input() {
        let id = NodeId::from_str_padded("ma1234567890extra");
        assert_eq!(id.display_string(), "ma12345678");
    }
}
