//! LRU victim selection shared by the range cache and the asset preloader.

/// One cached entry as seen by the eviction planner.
#[derive(Debug, Clone)]
pub struct EvictionCandidate<K> {
    pub key: K,
    pub size: u64,
    /// Recency marker; smaller is older.
    pub last_used: u64,
    /// Pinned entries count toward the total but are never evicted.
    pub pinned: bool,
}

#[derive(Debug, Clone)]
pub struct EvictionPlan<K> {
    /// Entries to delete, oldest first.
    pub victims: Vec<K>,
    pub total_before: u64,
    /// Total once every victim is gone; may still exceed the budget when
    /// pinned entries alone are larger than it.
    pub total_after: u64,
}

impl<K> EvictionPlan<K> {
    pub fn is_empty(&self) -> bool {
        self.victims.is_empty()
    }
}

/// Pick the least recently used unpinned entries until `budget` is met.
pub fn plan_eviction<K>(candidates: Vec<EvictionCandidate<K>>, budget: u64) -> EvictionPlan<K> {
    let total_before: u64 = candidates.iter().map(|c| c.size).sum();
    let mut total_after = total_before;
    let mut victims = Vec::new();

    if total_before <= budget {
        return EvictionPlan {
            victims,
            total_before,
            total_after,
        };
    }

    let mut evictable: Vec<_> = candidates.into_iter().filter(|c| !c.pinned).collect();
    evictable.sort_by_key(|c| c.last_used);

    for candidate in evictable {
        if total_after <= budget {
            break;
        }
        total_after -= candidate.size;
        victims.push(candidate.key);
    }

    EvictionPlan {
        victims,
        total_before,
        total_after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(key: &'static str, size: u64, last_used: u64, pinned: bool) -> EvictionCandidate<&'static str> {
        EvictionCandidate {
            key,
            size,
            last_used,
            pinned,
        }
    }

    #[test]
    fn under_budget_evicts_nothing() {
        let plan = plan_eviction(vec![candidate("a", 10, 1, false)], 10);
        assert!(plan.is_empty());
        assert_eq!(plan.total_after, 10);
    }

    #[test]
    fn evicts_oldest_first_until_under_budget() {
        let plan = plan_eviction(
            vec![
                candidate("new", 40, 300, false),
                candidate("old", 40, 100, false),
                candidate("mid", 40, 200, false),
            ],
            80,
        );
        assert_eq!(plan.victims, vec!["old"]);
        assert_eq!(plan.total_after, 80);
    }

    #[test]
    fn skips_pinned_entries() {
        let plan = plan_eviction(
            vec![
                candidate("live", 50, 1, true),
                candidate("idle", 50, 2, false),
                candidate("recent", 50, 3, false),
            ],
            60,
        );
        assert_eq!(plan.victims, vec!["idle", "recent"]);
        assert_eq!(plan.total_after, 50);
    }

    #[test]
    fn unreachable_budget_is_minimized() {
        let plan = plan_eviction(
            vec![candidate("live", 500, 1, true), candidate("idle", 10, 2, false)],
            100,
        );
        assert_eq!(plan.victims, vec!["idle"]);
        assert_eq!(plan.total_after, 500);
    }
}
