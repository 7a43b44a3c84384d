// Time Window - Age-bounded buffer of timestamped items
// Holds recent sweep completions; items older than the window are pruned on access

use std::collections::VecDeque;

/// Rolling window of (timestamp_ms, item) pairs, oldest first
#[derive(Debug, Clone)]
pub struct TimeWindow<T> {
    duration_ms: i64,
    max_capacity: usize,
    data: VecDeque<(i64, T)>,
}

impl<T: Clone> TimeWindow<T> {
    pub fn new(duration_ms: i64, max_capacity: usize) -> Self {
        Self {
            duration_ms,
            max_capacity: max_capacity.max(1),
            data: VecDeque::new(),
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    /// Change the window length; takes effect on the next prune
    pub fn set_duration_ms(&mut self, duration_ms: i64) {
        self.duration_ms = duration_ms;
    }

    /// Append an item; the oldest entry is evicted at capacity
    pub fn add(&mut self, timestamp: i64, item: T) {
        if self.data.len() >= self.max_capacity {
            self.data.pop_front();
        }
        self.data.push_back((timestamp, item));
    }

    /// Drop items older than `duration_ms` before `now`. Returns how many were removed.
    pub fn prune(&mut self, now: i64) -> usize {
        let cutoff = now - self.duration_ms;
        let before = self.data.len();
        while matches!(self.data.front(), Some((ts, _)) if *ts < cutoff) {
            self.data.pop_front();
        }
        before - self.data.len()
    }

    /// Newest item (after pruning) satisfying `pred`
    pub fn latest_matching<F>(&mut self, now: i64, pred: F) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        self.prune(now);
        self.data
            .iter()
            .rev()
            .find(|(_, item)| pred(item))
            .map(|(_, item)| item.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &(i64, T)> {
        self.data.iter()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn last(&self) -> Option<&(i64, T)> {
        self.data.back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_by_age() {
        let mut window: TimeWindow<&str> = TimeWindow::new(300_000, 16);
        window.add(0, "a");
        window.add(200_000, "b");
        window.add(400_000, "c");

        assert_eq!(window.prune(450_000), 1);
        assert_eq!(window.len(), 2);
        assert_eq!(window.last().map(|(_, v)| *v), Some("c"));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut window: TimeWindow<u32> = TimeWindow::new(i64::MAX / 2, 2);
        window.add(1, 1);
        window.add(2, 2);
        window.add(3, 3);
        let kept: Vec<u32> = window.iter().map(|(_, v)| *v).collect();
        assert_eq!(kept, vec![2, 3]);
    }

    #[test]
    fn test_latest_matching_respects_age() {
        let mut window: TimeWindow<(char, u32)> = TimeWindow::new(1_000, 16);
        window.add(0, ('x', 1));
        window.add(500, ('y', 2));
        window.add(900, ('x', 3));

        assert_eq!(window.latest_matching(1_000, |v| v.0 == 'x'), Some(('x', 3)));
        assert_eq!(window.latest_matching(1_600, |v| v.0 == 'y'), None);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_clear() {
        let mut window: TimeWindow<u8> = TimeWindow::new(10, 4);
        window.add(1, 1);
        window.clear();
        assert!(window.is_empty());
    }
}
