//! Pluggable correlation id derivation and session merge.

use crate::types::{CorrelationId, Session, WorkItem};

/// Derives the correlation id of a request or a reply.
pub trait CorrelationMapping: Send + Sync {
    fn correlation_id(&self, item: &WorkItem) -> CorrelationId;
}

/// Explicit correlation id when present, otherwise the item id.
#[derive(Debug, Clone, Copy, Default)]
pub struct ItemCorrelation;

impl CorrelationMapping for ItemCorrelation {
    fn correlation_id(&self, item: &WorkItem) -> CorrelationId {
        item.correlation_id()
            .cloned()
            .unwrap_or_else(|| CorrelationId::new(item.id().as_str()))
    }
}

/// Merges session state from the request into a delivered reply.
///
/// Called when the reply or the request carries the propagation flag.
pub trait SessionMerge: Send + Sync {
    fn merge(&self, request_session: &Session, reply: WorkItem) -> WorkItem;
}

/// Keys missing from the reply are copied from the request; the reply wins
/// on conflicts.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSessionMerge;

impl SessionMerge for DefaultSessionMerge {
    fn merge(&self, request_session: &Session, reply: WorkItem) -> WorkItem {
        let mut merged = request_session.clone();
        merged.extend(reply.session().clone());
        reply.with_session(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_correlation_prefers_explicit_id() {
        let item = WorkItem::new(serde_json::json!(null)).with_correlation_id("abc");
        assert_eq!(ItemCorrelation.correlation_id(&item).as_str(), "abc");
    }

    #[test]
    fn test_item_correlation_falls_back_to_item_id() {
        let item = WorkItem::new(serde_json::json!(null));
        assert_eq!(
            ItemCorrelation.correlation_id(&item).as_str(),
            item.id().as_str()
        );
    }

    #[test]
    fn test_reply_session_wins_on_conflict() {
        let request = WorkItem::new(serde_json::json!(null))
            .with_session_value("user", serde_json::json!("alice"))
            .with_session_value("step", serde_json::json!(1));
        let reply = WorkItem::new(serde_json::json!(null))
            .with_session_value("step", serde_json::json!(2));

        let merged = DefaultSessionMerge.merge(request.session(), reply);

        assert_eq!(merged.session().get("user"), Some(&serde_json::json!("alice")));
        assert_eq!(merged.session().get("step"), Some(&serde_json::json!(2)));
    }
}
