//! Core types for correlated work items.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Key linking an asynchronous request to its eventual reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Create a correlation ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the correlation ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a work item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(String);

impl ItemId {
    /// Create a new unique item ID.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("item-{}", Uuid::new_v4()))
    }

    /// Create an item ID from an existing string.
    #[must_use]
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the item ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a reply inside a multi-reply group.
///
/// On a request, `group_size` tells the correlator how many replies to expect.
/// On a reply, `sequence` is its 1-based position; the reply with
/// `sequence == group_size` closes the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCorrelation {
    pub group_size: u32,
    pub sequence: u32,
}

impl GroupCorrelation {
    #[must_use]
    pub const fn new(group_size: u32, sequence: u32) -> Self {
        Self {
            group_size,
            sequence,
        }
    }

    /// Whether this is the reply that closes its group.
    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.sequence == self.group_size
    }
}

/// Session state carried along with an item.
pub type Session = BTreeMap<String, serde_json::Value>;

/// An opaque unit of work: payload, metadata and optional correlation info.
///
/// Builder methods consume `self`; once an item is enqueued nothing mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    id: ItemId,
    payload: serde_json::Value,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    correlation_id: Option<CorrelationId>,
    group: Option<GroupCorrelation>,
    #[serde(default)]
    propagate_session: bool,
    #[serde(default)]
    session: Session,
    created_at: DateTime<Utc>,
}

impl WorkItem {
    /// Create a new item around a payload.
    #[must_use]
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: ItemId::new(),
            payload,
            metadata: BTreeMap::new(),
            correlation_id: None,
            group: None,
            propagate_session: false,
            session: Session::new(),
            created_at: Utc::now(),
        }
    }

    /// Build a reply to this item: same correlation id, fresh item id.
    #[must_use]
    pub fn reply(&self, payload: serde_json::Value) -> Self {
        let reply = Self::new(payload);
        match self.correlation_id() {
            Some(id) => reply.with_correlation_id(id.clone()),
            None => reply.with_correlation_id(self.id.as_str()),
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: GroupCorrelation) -> Self {
        self.group = Some(group);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the session propagation flag. A delivered reply gets the request
    /// session merged in when either the reply or its request carries it.
    #[must_use]
    pub fn with_session_propagation(mut self) -> Self {
        self.propagate_session = true;
        self
    }

    #[must_use]
    pub fn with_session_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.session.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = session;
        self
    }

    #[must_use]
    pub const fn id(&self) -> &ItemId {
        &self.id
    }

    #[must_use]
    pub const fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    #[must_use]
    pub const fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    #[must_use]
    pub const fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    #[must_use]
    pub const fn group(&self) -> Option<GroupCorrelation> {
        self.group
    }

    #[must_use]
    pub const fn propagate_session(&self) -> bool {
        self.propagate_session
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// The reply (or replies) delivered to a `dispatch` caller.
///
/// Single-reply dispatches carry exactly one item. Multi-reply groups carry
/// every reply collected for the group, in arrival order, ending with the
/// one that closed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedReply {
    correlation_id: CorrelationId,
    earlier: Vec<WorkItem>,
    last: WorkItem,
}

impl CorrelatedReply {
    #[must_use]
    pub fn single(correlation_id: CorrelationId, reply: WorkItem) -> Self {
        Self {
            correlation_id,
            earlier: Vec::new(),
            last: reply,
        }
    }

    #[must_use]
    pub fn group(correlation_id: CorrelationId, earlier: Vec<WorkItem>, last: WorkItem) -> Self {
        Self {
            correlation_id,
            earlier,
            last,
        }
    }

    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// The reply that completed the correlation.
    #[must_use]
    pub const fn reply(&self) -> &WorkItem {
        &self.last
    }

    /// All replies in arrival order.
    pub fn replies(&self) -> impl Iterator<Item = &WorkItem> {
        self.earlier.iter().chain(std::iter::once(&self.last))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.earlier.len().saturating_add(1)
    }

    /// Always false; present for clippy's `len_without_is_empty`.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    #[must_use]
    pub fn into_reply(self) -> WorkItem {
        self.last
    }

    pub(crate) fn map_last(self, f: impl FnOnce(WorkItem) -> WorkItem) -> Self {
        Self {
            last: f(self.last),
            ..self
        }
    }

    pub(crate) fn into_items(self) -> Vec<WorkItem> {
        let mut items = self.earlier;
        items.push(self.last);
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id_uniqueness() {
        let ids: Vec<ItemId> = (0..100).map(|_| ItemId::new()).collect();
        let unique_count = ids.iter().collect::<std::collections::HashSet<_>>().len();
        assert_eq!(unique_count, 100);
    }

    #[test]
    fn test_correlation_id_display() {
        let id = CorrelationId::new("abc");
        assert_eq!(format!("{id}"), "abc");
    }

    #[test]
    fn test_reply_inherits_correlation_id() {
        let request = WorkItem::new(serde_json::json!({"q": 1})).with_correlation_id("xyz");
        let reply = request.reply(serde_json::json!({"a": 1}));

        assert_eq!(reply.correlation_id(), Some(&CorrelationId::new("xyz")));
        assert_ne!(reply.id(), request.id());
    }

    #[test]
    fn test_reply_falls_back_to_request_item_id() {
        let request = WorkItem::new(serde_json::json!(null));
        let reply = request.reply(serde_json::json!(null));

        assert_eq!(
            reply.correlation_id().map(CorrelationId::as_str),
            Some(request.id().as_str())
        );
    }

    #[test]
    fn test_group_correlation_is_last() {
        assert!(GroupCorrelation::new(3, 3).is_last());
        assert!(!GroupCorrelation::new(3, 1).is_last());
    }

    #[test]
    fn test_correlated_reply_order() {
        let id = CorrelationId::new("g");
        let first = WorkItem::new(serde_json::json!(1));
        let second = WorkItem::new(serde_json::json!(2));
        let last = WorkItem::new(serde_json::json!(3));

        let reply = CorrelatedReply::group(id, vec![first, second], last);
        let payloads: Vec<_> = reply.replies().map(|r| r.payload().clone()).collect();

        assert_eq!(reply.len(), 3);
        assert_eq!(
            payloads,
            vec![
                serde_json::json!(1),
                serde_json::json!(2),
                serde_json::json!(3)
            ]
        );
        assert_eq!(reply.reply().payload(), &serde_json::json!(3));
    }
}
