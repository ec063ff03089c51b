//! Bounded records of what happened: the per-run step history, the run
//! counters, and the fixed-capacity ring used for policy bookkeeping.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{ActionKind, HistoryEntry};

/// Fixed-capacity log that evicts its oldest entry when full.
#[derive(Debug, Clone)]
pub struct BoundedLog<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedLog<T> {
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `entry`, returning the evicted oldest entry if the log was full.
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.entries.iter()
    }

    /// Newest first, at most `n` entries.
    pub fn recent_mut(&mut self, n: usize) -> impl Iterator<Item = &mut T> {
        self.entries.iter_mut().rev().take(n)
    }
}

impl<T: Clone> BoundedLog<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

/// Ordered, append-only step record of one task run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// The last `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> &[HistoryEntry] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }

    pub fn recent_kinds(&self, n: usize) -> Vec<ActionKind> {
        self.tail(n).iter().map(|e| e.action.kind()).collect()
    }

    pub fn into_entries(self) -> Vec<HistoryEntry> {
        self.entries
    }
}

/// Counters for one task run. Only the step loop mutates them; `finish`
/// freezes the end timestamp and the derived duration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metrics {
    pub screenshots_taken: u32,
    pub actions_executed: u32,
    pub oracle_calls: u32,
    pub errors_encountered: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl Metrics {
    pub fn start() -> Self {
        Self {
            screenshots_taken: 0,
            actions_executed: 0,
            oracle_calls: 0,
            errors_encountered: 0,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
        }
    }

    pub fn finish(&mut self) {
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
            let millis = self.duration().as_millis();
            self.duration_ms = Some(u64::try_from(millis).unwrap_or(u64::MAX));
        }
    }

    /// Zero until the run has finished.
    pub fn duration(&self) -> Duration {
        self.finished_at
            .and_then(|end| (end - self.started_at).to_std().ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, ActionResult};

    fn entry(step: usize, action: Action, ok: bool) -> HistoryEntry {
        HistoryEntry {
            step,
            action,
            reasoning: String::new(),
            confidence: 50.0,
            result: if ok {
                ActionResult::ok(None, 1)
            } else {
                ActionResult::failed("x", 1)
            },
            url: "https://example.com".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn bounded_log_evicts_oldest() {
        let mut log = BoundedLog::new(3);
        assert_eq!(log.push(1), None);
        log.push(2);
        log.push(3);
        assert_eq!(log.push(4), Some(1));
        assert_eq!(log.len(), 3);
        assert_eq!(log.to_vec(), vec![2, 3, 4]);
        assert_eq!(log.recent_mut(2).map(|v| *v).collect::<Vec<_>>(), vec![4, 3]);
    }

    #[test]
    fn bounded_log_never_exceeds_capacity() {
        let mut log = BoundedLog::new(100);
        for i in 0..250 {
            log.push(i);
        }
        assert_eq!(log.len(), 100);
        assert_eq!(log.iter().next(), Some(&150));
    }

    #[test]
    fn zero_capacity_is_bumped() {
        let mut log = BoundedLog::new(0);
        log.push("a");
        log.push("b");
        assert_eq!(log.len(), 1);
        assert_eq!(log.to_vec(), vec!["b"]);
    }

    #[test]
    fn history_tail_and_kinds() {
        let mut history = History::new();
        history.push(entry(0, Action::wait(10), true));
        history.push(entry(1, Action::Extract { selector: "h1".into() }, false));
        history.push(entry(2, Action::Navigate { url: "https://a.b".into() }, true));

        assert_eq!(history.tail(2).len(), 2);
        assert_eq!(history.tail(10).len(), 3);
        assert_eq!(
            history.recent_kinds(2),
            vec![ActionKind::Extract, ActionKind::Navigate]
        );
    }

    #[test]
    fn metrics_duration_is_fixed_after_finish() {
        let mut metrics = Metrics::start();
        assert_eq!(metrics.duration(), Duration::ZERO);
        assert_eq!(metrics.duration_ms, None);
        metrics.finish();
        let first = (metrics.finished_at, metrics.duration_ms);
        assert!(metrics.duration_ms.is_some());
        metrics.finish();
        assert_eq!((metrics.finished_at, metrics.duration_ms), first);
    }
}
