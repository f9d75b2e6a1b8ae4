//! Machine registry values
//!
//! Everything handed out by the store is an immutable value. Static info and
//! metric snapshots sit behind `Arc`s so a read is cheap, and a caller that
//! wants to change its copy has to go through `Arc::make_mut`, which clones
//! instead of touching the stored original.
//!
//! Status is never stored. It is derived from `last_seen` and the current
//! time every time a record is read.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentReport, ComponentInformation, CpuInformation};

/// Static description of a machine
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MachineInfo {
    pub hostname: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
    pub arch: String,
    pub cpu_count: usize,
    pub memory_total: u64,
}

/// One metric reading of one machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// When the agent took the reading
    pub timestamp: DateTime<Utc>,

    /// Average CPU usage across all cores (percentage 0-100)
    pub cpu_avg: f32,

    pub memory_used: u64,
    pub memory_total: u64,
    pub swap_used: u64,

    /// Average temperature across all components (Celsius)
    pub temp_avg: Option<f32>,

    pub cpus: Vec<CpuInformation>,
    pub components: Vec<ComponentInformation>,
}

impl MachineInfo {
    pub fn from_report(report: &AgentReport) -> Self {
        Self {
            hostname: report.system.host_name.clone(),
            os_name: report.system.name.clone(),
            os_version: report.system.os_version.clone(),
            kernel_version: report.system.kernel_version.clone(),
            arch: report.cpus.arch.clone(),
            cpu_count: report.cpus.total,
            memory_total: report.memory.total,
        }
    }
}

impl MetricSnapshot {
    /// Extract the time-varying part of an agent report
    pub fn from_report(report: &AgentReport, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            cpu_avg: report.cpus.average_usage,
            memory_used: report.memory.used,
            memory_total: report.memory.total,
            swap_used: report.memory.used_swap,
            temp_avg: report.components.average_temperature,
            cpus: report.cpus.cpus.clone(),
            components: report.components.components.clone(),
        }
    }
}

/// Liveness of a machine, derived from how long ago it last reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Online,
    Warning,
    Offline,
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineStatus::Online => write!(f, "online"),
            MachineStatus::Warning => write!(f, "warning"),
            MachineStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Silence thresholds separating online, warning and offline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusThresholds {
    pub warning_after: Duration,
    pub offline_after: Duration,
}

impl StatusThresholds {
    pub fn classify(&self, last_seen: DateTime<Utc>, now: DateTime<Utc>) -> MachineStatus {
        // a report stamped in the future (clock skew) counts as just seen
        let silence = (now - last_seen).to_std().unwrap_or(Duration::ZERO);

        if silence < self.warning_after {
            MachineStatus::Online
        } else if silence < self.offline_after {
            MachineStatus::Warning
        } else {
            MachineStatus::Offline
        }
    }
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            warning_after: Duration::from_secs(60),
            offline_after: Duration::from_secs(180),
        }
    }
}

/// What the registry stores per machine
#[derive(Debug, Clone)]
pub(crate) struct MachineEntry {
    pub last_seen: DateTime<Utc>,
    pub revision: u64,
    pub info: Arc<MachineInfo>,
    pub metrics: Arc<MetricSnapshot>,
}

impl MachineEntry {
    pub fn to_record(&self, id: &str, thresholds: &StatusThresholds, now: DateTime<Utc>) -> MachineRecord {
        MachineRecord {
            id: id.to_string(),
            last_seen: self.last_seen,
            revision: self.revision,
            info: Arc::clone(&self.info),
            metrics: Arc::clone(&self.metrics),
            status: thresholds.classify(self.last_seen, now),
        }
    }
}

/// A machine as seen by a reader
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineRecord {
    pub id: String,

    /// When the store last accepted a report for this machine
    pub last_seen: DateTime<Utc>,

    /// Store-wide write sequence number of the update that produced this record
    pub revision: u64,

    pub info: Arc<MachineInfo>,
    pub metrics: Arc<MetricSnapshot>,

    /// Computed at read time
    pub status: MachineStatus,
}

/// Number of machines per status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatusSummary {
    pub online: usize,
    pub warning: usize,
    pub offline: usize,
}

impl StatusSummary {
    pub fn total(&self) -> usize {
        self.online + self.warning + self.offline
    }

    pub(crate) fn count(&mut self, status: MachineStatus) {
        match status {
            MachineStatus::Online => self.online += 1,
            MachineStatus::Warning => self.warning += 1,
            MachineStatus::Offline => self.offline += 1,
        }
    }
}
