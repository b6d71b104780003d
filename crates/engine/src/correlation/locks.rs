//! Striped per-correlation-id locks.
//!
//! Ids hash onto a fixed set of async mutexes, so work on one id never
//! serializes behind a global lock while memory stays bounded.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

use crate::types::CorrelationId;

#[derive(Debug)]
pub struct LockStripes {
    first: Mutex<()>,
    rest: Box<[Mutex<()>]>,
}

impl LockStripes {
    /// `count` is rounded up to one.
    #[must_use]
    pub fn new(count: usize) -> Self {
        let rest = (1..count).map(|_| Mutex::new(())).collect();
        Self {
            first: Mutex::new(()),
            rest,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rest.len().saturating_add(1)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    fn index(&self, id: &CorrelationId) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let len = u64::try_from(self.len()).unwrap_or(u64::MAX);
        hasher
            .finish()
            .checked_rem(len)
            .and_then(|index| usize::try_from(index).ok())
            .unwrap_or(0)
    }

    fn stripe(&self, index: usize) -> &Mutex<()> {
        index
            .checked_sub(1)
            .and_then(|rest| self.rest.get(rest))
            .unwrap_or(&self.first)
    }

    /// Lock the stripe owning `id`. Held across store awaits.
    pub async fn lock(&self, id: &CorrelationId) -> MutexGuard<'_, ()> {
        self.stripe(self.index(id)).lock().await
    }
}
