//! Bounded bookkeeping of correlation ids that reached a terminal state.
//!
//! Markers live in a fixed-capacity FIFO ring: recording into a full ring
//! evicts the oldest marker. An optional TTL expires markers early. Once a
//! marker is gone, a late reply for its id looks like a fresh one.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::types::CorrelationId;

/// Terminal state of a correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerReason {
    Completed,
    TimedOut,
}

impl std::fmt::Display for MarkerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// A recorded terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedMarker {
    pub correlation_id: CorrelationId,
    pub reason: MarkerReason,
    pub recorded_at: Instant,
}

/// Outcome of [`ProcessedMarkers::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// This call declared the terminal state.
    Recorded,
    /// Someone else got there first; terminal states never change.
    AlreadyMarked(MarkerReason),
}

#[derive(Debug, Default)]
struct MarkerRing {
    order: VecDeque<CorrelationId>,
    entries: HashMap<CorrelationId, ProcessedMarker>,
}

impl MarkerRing {
    fn expire(&mut self, ttl: Option<Duration>, now: Instant) {
        let Some(ttl) = ttl else { return };
        while let Some(oldest) = self.order.front() {
            let expired = self
                .entries
                .get(oldest)
                .is_none_or(|m| now.saturating_duration_since(m.recorded_at) >= ttl);
            if !expired {
                break;
            }
            if let Some(id) = self.order.pop_front() {
                trace!(correlation_id = %id, "Processed marker expired");
                self.entries.remove(&id);
            }
        }
    }
}

/// Fixed-capacity ring of processed markers.
#[derive(Debug)]
pub struct ProcessedMarkers {
    capacity: usize,
    ttl: Option<Duration>,
    ring: Mutex<MarkerRing>,
}

impl ProcessedMarkers {
    /// Create a ring holding at most `capacity` markers (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl: None,
            ring: Mutex::new(MarkerRing::default()),
        }
    }

    /// Also expire markers older than `ttl`.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Atomically declare a terminal state for `id`.
    ///
    /// The first declaration wins; later ones report the existing reason.
    pub fn record(&self, id: &CorrelationId, reason: MarkerReason) -> MarkOutcome {
        let now = Instant::now();
        let mut ring = self.ring.lock();
        ring.expire(self.ttl, now);

        if let Some(existing) = ring.entries.get(id) {
            return MarkOutcome::AlreadyMarked(existing.reason);
        }

        while ring.order.len() >= self.capacity {
            if let Some(evicted) = ring.order.pop_front() {
                trace!(correlation_id = %evicted, "Processed marker evicted");
                ring.entries.remove(&evicted);
            }
        }

        ring.order.push_back(id.clone());
        ring.entries.insert(
            id.clone(),
            ProcessedMarker {
                correlation_id: id.clone(),
                reason,
                recorded_at: now,
            },
        );
        MarkOutcome::Recorded
    }

    /// Terminal state of `id`, if still remembered.
    pub fn get(&self, id: &CorrelationId) -> Option<MarkerReason> {
        let mut ring = self.ring.lock();
        ring.expire(self.ttl, Instant::now());
        ring.entries.get(id).map(|m| m.reason)
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Markers oldest first.
    pub fn snapshot(&self) -> Vec<ProcessedMarker> {
        let ring = self.ring.lock();
        ring.order
            .iter()
            .filter_map(|id| ring.entries.get(id).cloned())
            .collect()
    }

    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        ring.order.clear();
        ring.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::arithmetic_side_effects)]

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_first_declaration_wins() {
        let markers = ProcessedMarkers::new(4);
        let id = CorrelationId::new("abc");

        assert_eq!(
            markers.record(&id, MarkerReason::TimedOut),
            MarkOutcome::Recorded
        );
        assert_eq!(
            markers.record(&id, MarkerReason::Completed),
            MarkOutcome::AlreadyMarked(MarkerReason::TimedOut)
        );
        assert_eq!(markers.get(&id), Some(MarkerReason::TimedOut));
    }

    #[test]
    fn test_full_ring_evicts_oldest() {
        let markers = ProcessedMarkers::new(2);
        for id in ["a", "b", "c"] {
            markers.record(&id.into(), MarkerReason::Completed);
        }

        assert!(!markers.contains(&"a".into()));
        assert!(markers.contains(&"b".into()));
        assert!(markers.contains(&"c".into()));
        assert_eq!(markers.len(), 2);
    }

    #[test]
    fn test_evicted_marker_can_be_recorded_again() {
        let markers = ProcessedMarkers::new(1);
        markers.record(&"a".into(), MarkerReason::Completed);
        markers.record(&"b".into(), MarkerReason::Completed);

        assert_eq!(
            markers.record(&"a".into(), MarkerReason::TimedOut),
            MarkOutcome::Recorded
        );
    }

    #[test]
    fn test_ttl_expires_markers() {
        let markers = ProcessedMarkers::new(8).with_ttl(Some(Duration::from_millis(20)));
        markers.record(&"old".into(), MarkerReason::Completed);

        std::thread::sleep(Duration::from_millis(40));

        assert!(!markers.contains(&"old".into()));
        assert!(markers.is_empty());
    }

    #[test]
    fn test_snapshot_is_oldest_first() {
        let markers = ProcessedMarkers::new(3);
        markers.record(&"1".into(), MarkerReason::Completed);
        markers.record(&"2".into(), MarkerReason::TimedOut);

        let ids: Vec<_> = markers
            .snapshot()
            .into_iter()
            .map(|m| m.correlation_id.to_string())
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    proptest! {
        #[test]
        fn prop_ring_keeps_exactly_the_most_recent(capacity in 1usize..64, total in 0usize..256) {
            let markers = ProcessedMarkers::new(capacity);
            for n in 0..total {
                markers.record(&CorrelationId::new(n.to_string()), MarkerReason::Completed);
            }

            let expected_len = total.min(capacity);
            prop_assert_eq!(markers.len(), expected_len);

            let kept: Vec<String> = markers
                .snapshot()
                .into_iter()
                .map(|m| m.correlation_id.to_string())
                .collect();
            let expected: Vec<String> = (total - expected_len..total).map(|n| n.to_string()).collect();
            prop_assert_eq!(kept, expected);
        }
    }
}
