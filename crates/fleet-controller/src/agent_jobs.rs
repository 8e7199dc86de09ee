//! Correlates an agent's asynchronous `JobRemoved(job_path, result)`
//! signal back to whichever local engine (`JobEngine`/`ProxyEngine`) is
//! waiting on that specific sub-job's completion.
//!
//! A sub-job's path is only known once the synchronous RPC that started
//! it returns, so a waiter can only be registered right before the wait
//! begins, not strictly "before the call is issued". The agent's
//! `JobRemoved` would have to race ahead of the call future that
//! produced the job path even resolving for this to matter in practice;
//! treated as an accepted simplification.

use fleet_core::types::JobResult;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

#[derive(Default)]
pub struct AgentJobTracker {
    waiters: Mutex<HashMap<(String, String), oneshot::Sender<JobResult>>>,
}

impl AgentJobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `job_path` on `node`, returning a receiver
    /// that resolves once the agent reports completion — or immediately
    /// with an error if the node goes offline first.
    pub fn wait_for(&self, node: &str, job_path: &str) -> oneshot::Receiver<JobResult> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("agent job tracker mutex poisoned")
            .insert((node.to_string(), job_path.to_string()), tx);
        rx
    }

    /// Resolves a waiter registered for `(node, job_path)`, if any. No-op
    /// if nothing is waiting (the job wasn't ours, or already timed out).
    pub fn complete(&self, node: &str, job_path: &str, result: &str) {
        let tx = self
            .waiters
            .lock()
            .expect("agent job tracker mutex poisoned")
            .remove(&(node.to_string(), job_path.to_string()));
        if let Some(tx) = tx {
            let _ = tx.send(JobResult::from_agent_str(result));
        }
    }

    /// Drops every waiter registered for `node`, so callers blocked in
    /// `wait_for` resolve immediately (their sender is dropped) instead
    /// of sitting out the full call timeout.
    pub fn invalidate_node(&self, node: &str) {
        self.waiters
            .lock()
            .expect("agent job tracker mutex poisoned")
            .retain(|(n, _), _| n != node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_resolves_the_matching_waiter() {
        let tracker = AgentJobTracker::new();
        let rx = tracker.wait_for("node-a", "/org/freedesktop/systemd1/job/1");
        tracker.complete("node-a", "/org/freedesktop/systemd1/job/1", "done");
        assert_eq!(rx.await.unwrap(), JobResult::Done);
    }

    #[tokio::test]
    async fn complete_for_unknown_job_is_a_noop() {
        let tracker = AgentJobTracker::new();
        tracker.complete("node-a", "/no/such/job", "done");
    }

    #[tokio::test]
    async fn invalidate_node_drops_its_waiters() {
        let tracker = AgentJobTracker::new();
        let rx = tracker.wait_for("node-a", "/org/freedesktop/systemd1/job/1");
        tracker.invalidate_node("node-a");
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn invalidate_node_leaves_other_nodes_alone() {
        let tracker = AgentJobTracker::new();
        let rx = tracker.wait_for("node-b", "/org/freedesktop/systemd1/job/2");
        tracker.invalidate_node("node-a");
        tracker.complete("node-b", "/org/freedesktop/systemd1/job/2", "canceled");
        assert_eq!(rx.await.unwrap(), JobResult::Canceled);
    }
}
