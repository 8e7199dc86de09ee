//! Ambient, read-only audit trail of job dispatch and terminal
//! transitions. Never consulted by control-flow decisions; exists purely
//! so operators can answer "what did the fleet just do" via
//! `Controller.ListRecentJobs`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub job_type: String,
    pub node: Option<String>,
    pub result: String,
    pub finished_at_micros: u64,
}

/// Bounded ring buffer of the most recent records, newest last.
pub struct ExecutionTracker {
    records: Mutex<VecDeque<ExecutionRecord>>,
    capacity: usize,
    /// Toggled by `Controller.EnableMetrics`/`DisableMetrics`; `record`
    /// is a no-op while disabled.
    enabled: AtomicBool,
}

impl ExecutionTracker {
    pub fn new(capacity: usize) -> Self {
        ExecutionTracker {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn record(&self, record: ExecutionRecord) {
        if !self.is_enabled() {
            return;
        }
        let mut records = self.records.lock().expect("audit tracker mutex poisoned");
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Most recent records, newest first, capped at the tracker's
    /// capacity.
    pub fn recent(&self) -> Vec<ExecutionRecord> {
        let records = self.records.lock().expect("audit tracker mutex poisoned");
        records.iter().rev().cloned().collect()
    }
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_at_capacity() {
        let tracker = ExecutionTracker::new(2);
        for i in 0..5 {
            tracker.record(ExecutionRecord {
                job_type: "start-unit".to_string(),
                node: Some("laptop".to_string()),
                result: "done".to_string(),
                finished_at_micros: i,
            });
        }
        let recent = tracker.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].finished_at_micros, 4);
        assert_eq!(recent[1].finished_at_micros, 3);
    }

    #[test]
    fn disabled_tracker_drops_records() {
        let tracker = ExecutionTracker::new(10);
        tracker.set_enabled(false);
        tracker.record(ExecutionRecord {
            job_type: "start-unit".to_string(),
            node: Some("laptop".to_string()),
            result: "done".to_string(),
            finished_at_micros: 0,
        });
        assert!(tracker.recent().is_empty());
    }
}
