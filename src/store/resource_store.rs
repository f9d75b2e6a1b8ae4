//! The authoritative in-memory fleet state
//!
//! ## Locking
//!
//! Three independent [`RankedLock`]s guard the machine registry, the metric
//! history and the command queues. Every operation touches exactly one of
//! them, except [`ResourceStore::remove_machine`], which takes all three in
//! rank order (`machines → history → commands`).
//!
//! `update_machine` writes the registry and the history in two separate
//! critical sections. A reader may therefore observe a new registry record
//! whose history entry has not been appended yet.
//!
//! No I/O happens while a lock is held, and guards never outlive the call,
//! so the store is safe to use from async tasks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::command::{Command, CommandBook, CommandResult, CommandStage};
use super::error::{StoreError, StoreResult};
use super::history::{HistoryBuffer, HistoryEntry};
use super::machine::{
    MachineEntry, MachineInfo, MachineRecord, MetricSnapshot, StatusSummary, StatusThresholds,
};
use crate::clock::SharedClock;
use crate::config::StoreConfig;
use crate::sync::{RankedLock, Resource};

#[derive(Debug, Default)]
struct MachineTable {
    entries: BTreeMap<String, MachineEntry>,
    next_revision: u64,
}

/// Outcome of [`ResourceStore::update_machine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// True if this was the first report of the machine
    pub registered: bool,
    pub revision: u64,
}

/// Counts from a retention cleanup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupStats {
    pub history_entries: usize,
    /// Completed commands whose result was reported before the cutoff
    pub commands: usize,
    /// Delivered commands that never got a result before the cutoff
    pub abandoned_commands: usize,
}

#[derive(Debug)]
pub struct ResourceStore {
    machines: RankedLock<MachineTable>,
    history: RankedLock<HashMap<String, HistoryBuffer>>,
    commands: RankedLock<CommandBook>,
    history_limit: usize,
    thresholds: StatusThresholds,
    clock: SharedClock,
}

impl ResourceStore {
    pub fn new(config: &StoreConfig, clock: SharedClock) -> StoreResult<Self> {
        config.validate().map_err(StoreError::InvalidConfig)?;

        let timeout = config.lock_timeout();
        debug!(
            "creating resource store (history limit {}, lock timeout {:?})",
            config.history_limit, timeout
        );

        Ok(Self {
            machines: RankedLock::new(Resource::Machines, MachineTable::default(), timeout),
            history: RankedLock::new(Resource::History, HashMap::new(), timeout),
            commands: RankedLock::new(
                Resource::Commands,
                CommandBook::new(config.history_limit),
                timeout,
            ),
            history_limit: config.history_limit,
            thresholds: config.thresholds(),
            clock,
        })
    }

    pub fn thresholds(&self) -> StatusThresholds {
        self.thresholds
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    // ========================================================================
    // Machine registry
    // ========================================================================

    /// Look up one machine; the status is computed at call time
    pub fn get_machine(&self, id: &str) -> StoreResult<Option<MachineRecord>> {
        let entry = {
            let machines = self.machines.read()?;
            machines.entries.get(id).cloned()
        };

        let now = self.clock.now();
        Ok(entry.map(|entry| entry.to_record(id, &self.thresholds, now)))
    }

    /// Every known machine, ordered by id
    pub fn get_all_machines(&self) -> StoreResult<Vec<MachineRecord>> {
        let entries: Vec<(String, MachineEntry)> = {
            let machines = self.machines.read()?;
            machines
                .entries
                .iter()
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect()
        };

        let now = self.clock.now();
        Ok(entries
            .iter()
            .map(|(id, entry)| entry.to_record(id, &self.thresholds, now))
            .collect())
    }

    pub fn machine_count(&self) -> StoreResult<usize> {
        Ok(self.machines.read()?.entries.len())
    }

    pub fn status_summary(&self) -> StoreResult<StatusSummary> {
        let mut summary = StatusSummary::default();
        for record in self.get_all_machines()? {
            summary.count(record.status);
        }
        Ok(summary)
    }

    /// Apply an agent report
    ///
    /// The registry record is replaced as a whole, then the snapshot is
    /// appended to the machine's history in a second, separate critical
    /// section.
    ///
    /// Once the registry write has succeeded the update is committed: the
    /// history append waits for its lock regardless of `lock_timeout_ms`,
    /// so an `Err` always means nothing was written.
    #[instrument(skip(self, info, metrics))]
    pub fn update_machine(
        &self,
        id: &str,
        info: MachineInfo,
        metrics: MetricSnapshot,
    ) -> StoreResult<UpdateOutcome> {
        let now = self.clock.now();
        let metrics = Arc::new(metrics);
        let entry = MachineEntry {
            last_seen: now,
            revision: 0,
            info: Arc::new(info),
            metrics: Arc::clone(&metrics),
        };

        let outcome = {
            let mut machines = self.machines.write()?;
            machines.next_revision += 1;
            let revision = machines.next_revision;
            let previous = machines
                .entries
                .insert(id.to_string(), MachineEntry { revision, ..entry });
            UpdateOutcome {
                registered: previous.is_none(),
                revision,
            }
        };

        {
            let mut history = self.history.write_untimed()?;
            history
                .entry(id.to_string())
                .or_insert_with(|| HistoryBuffer::new(self.history_limit))
                .push(HistoryEntry {
                    revision: outcome.revision,
                    recorded_at: now,
                    snapshot: metrics,
                });
        }

        if outcome.registered {
            info!("registered machine {id}");
        } else {
            trace!("updated machine {id} (revision {})", outcome.revision);
        }

        Ok(outcome)
    }

    /// Forget a machine entirely
    ///
    /// This is the only operation holding more than one lock; it acquires
    /// them in rank order. Returns whether the machine was registered.
    #[instrument(skip(self))]
    pub fn remove_machine(&self, id: &str) -> StoreResult<bool> {
        let mut machines = self.machines.write()?;
        let mut history = self.history.write()?;
        let mut commands = self.commands.write()?;

        let existed = machines.entries.remove(id).is_some();
        let history_entries = history.remove(id).map_or(0, |buffer| buffer.len());
        let dropped_commands = commands.remove_machine(id);

        drop(commands);
        drop(history);
        drop(machines);

        if existed {
            info!(
                "removed machine {id} ({history_entries} history entries, {dropped_commands} commands)"
            );
        }
        Ok(existed)
    }

    // ========================================================================
    // Metric history
    // ========================================================================

    /// The `limit` most recent history entries of a machine, oldest first
    pub fn history(&self, id: &str, limit: usize) -> StoreResult<Vec<HistoryEntry>> {
        let history = self.history.read()?;
        Ok(history
            .get(id)
            .map(|buffer| buffer.latest(limit))
            .unwrap_or_default())
    }

    /// History entries recorded within `[start, end]`, oldest first
    pub fn history_range(
        &self,
        id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<HistoryEntry>> {
        let history = self.history.read()?;
        Ok(history
            .get(id)
            .map(|buffer| buffer.range(start, end))
            .unwrap_or_default())
    }

    pub fn history_len(&self, id: &str) -> StoreResult<usize> {
        let history = self.history.read()?;
        Ok(history.get(id).map_or(0, HistoryBuffer::len))
    }

    // ========================================================================
    // Command queues
    // ========================================================================

    /// Queue a command for a machine; the machine does not need to be registered yet
    pub fn enqueue_command(&self, machine_id: &str, payload: serde_json::Value) -> StoreResult<Command> {
        let command = Command {
            id: Uuid::new_v4(),
            machine_id: machine_id.to_string(),
            payload,
            enqueued_at: self.clock.now(),
            delivered_at: None,
            result: None,
        };

        self.commands.write()?.enqueue(command.clone());
        debug!("queued command {} for {machine_id}", command.id);
        Ok(command)
    }

    /// Take every pending command of a machine for delivery, oldest first
    pub fn dequeue_pending_commands(&self, machine_id: &str) -> StoreResult<Vec<Command>> {
        let now = self.clock.now();
        let delivered = self.commands.write()?.take_pending(machine_id, now);
        if !delivered.is_empty() {
            debug!("delivering {} command(s) to {machine_id}", delivered.len());
        }
        Ok(delivered)
    }

    /// Attach the agent's result to a delivered command
    ///
    /// Returns `None` if the id is unknown or the command was never delivered.
    pub fn record_command_result(
        &self,
        command_id: Uuid,
        success: bool,
        output: serde_json::Value,
    ) -> StoreResult<Option<Command>> {
        let result = CommandResult {
            success,
            output,
            reported_at: self.clock.now(),
        };
        Ok(self.commands.write()?.complete(command_id, result))
    }

    pub fn command(&self, command_id: Uuid) -> StoreResult<Option<(CommandStage, Command)>> {
        Ok(self.commands.read()?.get(command_id))
    }

    pub fn pending_count(&self, machine_id: &str) -> StoreResult<usize> {
        Ok(self.commands.read()?.pending_count(machine_id))
    }

    pub fn in_flight_commands(&self, machine_id: &str) -> StoreResult<Vec<Command>> {
        Ok(self.commands.read()?.in_flight(machine_id))
    }

    pub fn completed_commands(&self, machine_id: &str) -> StoreResult<Vec<Command>> {
        Ok(self.commands.read()?.completed(machine_id))
    }

    // ========================================================================
    // Retention
    // ========================================================================

    /// Drop history entries and finished or abandoned commands older than `before`
    ///
    /// A command counts as abandoned once it was delivered before the cutoff
    /// and still has no result. Each resource is cleaned in its own critical
    /// section so the cleanup never holds two locks at once.
    pub fn cleanup_before(&self, before: DateTime<Utc>) -> StoreResult<CleanupStats> {
        let history_entries = {
            let mut history = self.history.write()?;
            let removed = history
                .values_mut()
                .map(|buffer| buffer.remove_before(before))
                .sum();
            history.retain(|_, buffer| !buffer.is_empty());
            removed
        };

        let (commands, abandoned_commands) = {
            let mut book = self.commands.write()?;
            (
                book.remove_completed_before(before),
                book.remove_in_flight_before(before),
            )
        };
        if abandoned_commands > 0 {
            warn!("dropped {abandoned_commands} command(s) delivered before {before} without a result");
        }

        let stats = CleanupStats {
            history_entries,
            commands,
            abandoned_commands,
        };
        debug!("retention cleanup before {before}: {stats:?}");
        Ok(stats)
    }
}
