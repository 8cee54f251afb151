//! Subscription interface (§4.8) — external collaborator. The hierarchy
//! calls these hooks at the documented call sites; the marker/event engine
//! behind them is out of core scope, so this crate ships a `trait` contract
//! and a no-op default implementation.

use crate::nodeid::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Created,
    Updated,
    Deleted,
}

pub trait SubscriptionSink: Send + Sync {
    fn defer_field_change(&mut self, _node: NodeId, _field: &str) {}
    fn defer_hierarchy_event(&mut self, _node: NodeId) {}
    fn defer_trigger(&mut self, _node: NodeId, _kind: TriggerKind) {}
    fn defer_missing(&mut self, _key: &[u8]) {}
    fn flush(&mut self) {}
    fn inherit_parent(&mut self, _node: NodeId, _parent: NodeId) {}
    fn inherit_child(&mut self, _node: NodeId, _child: NodeId) {}
    fn clear_all_markers(&mut self, _node: NodeId) {}
}

/// The default sink: honors the contract, does nothing. Swap in a real
/// marker engine by implementing [`SubscriptionSink`] and installing it on
/// [`crate::hierarchy::Hierarchy::sink`].
#[derive(Debug, Default)]
pub struct NullSubscriptionSink;

impl SubscriptionSink for NullSubscriptionSink {}
