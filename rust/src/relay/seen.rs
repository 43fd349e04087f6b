use std::num::NonZeroUsize;

use lru::LruCache;

use crate::event::EventId;

/// Bounded set of recently delivered event ids. The least recently seen id is
/// evicted first.
#[derive(Debug)]
pub(crate) struct SeenCache {
    ids: LruCache<EventId, ()>,
}

impl SeenCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ids: LruCache::new(capacity),
        }
    }

    /// True the first time `id` is seen. A repeat refreshes its recency.
    pub(crate) fn insert(&mut self, id: EventId) -> bool {
        self.ids.put(id, ()).is_none()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ids.len()
    }
}
