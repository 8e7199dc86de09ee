//! Shared value types: job kinds/states/results, node status, and the
//! `UnitInfo` wire tuple. These carry no connections or locks — they are
//! plain data, owned by whichever engine holds the live object.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    StartUnit,
    StopUnit,
    RestartUnit,
    ReloadUnit,
    EnableUnitFiles,
    DisableUnitFiles,
    DaemonReload,
    IsolateAll,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::StartUnit => "start-unit",
            JobType::StopUnit => "stop-unit",
            JobType::RestartUnit => "restart-unit",
            JobType::ReloadUnit => "reload-unit",
            JobType::EnableUnitFiles => "enable",
            JobType::DisableUnitFiles => "disable",
            JobType::DaemonReload => "daemon-reload",
            JobType::IsolateAll => "isolate-all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Waiting,
    Running,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Running => "running",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobResult {
    Done,
    Canceled,
    Failed,
}

impl JobResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobResult::Done => "done",
            JobResult::Canceled => "canceled",
            JobResult::Failed => "failed",
        }
    }

    /// Maps an agent-reported result string (systemd's own job-result
    /// vocabulary, forwarded verbatim over `JobRemoved`) back onto the
    /// typed result. Anything other than `done`/`canceled` collapses to
    /// `Failed`.
    pub fn from_agent_str(s: &str) -> Self {
        match s {
            "done" => JobResult::Done,
            "canceled" => JobResult::Canceled,
            _ => JobResult::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Online,
    Offline,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyState {
    Pending,
    Ready,
    Failed,
    Stopped,
}

impl ProxyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyState::Pending => "pending",
            ProxyState::Ready => "ready",
            ProxyState::Failed => "failed",
            ProxyState::Stopped => "stopped",
        }
    }
}

/// One row of `Node.ListUnits` / the fleet-wide unit listing: (id,
/// description, load_state, active_state, sub_state, following, unit_path,
/// job_id, job_type, job_path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitInfo {
    pub id: String,
    pub description: String,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
    pub following: String,
    pub unit_path: String,
    pub job_id: u32,
    pub job_type: String,
    pub job_path: String,
}

impl UnitInfo {
    pub fn as_tuple(&self) -> (String, String, String, String, String, String, String, u32, String, String) {
        (
            self.id.clone(),
            self.description.clone(),
            self.load_state.clone(),
            self.active_state.clone(),
            self.sub_state.clone(),
            self.following.clone(),
            self.unit_path.clone(),
            self.job_id,
            self.job_type.clone(),
            self.job_path.clone(),
        )
    }
}

/// One row of `Controller.ListNodes`: (name, object_path, status, peer_ip).
/// Canonical wire signature is `(soss)` — see design notes on the
/// `ListNodes` open question.
pub type NodeListEntry = (String, zbus::zvariant::OwnedObjectPath, String, String);
