//! Per-machine command queues
//!
//! A command moves through three stages:
//!
//! ```text
//! enqueue → pending ──dequeue──▶ in flight ──result──▶ completed
//! ```
//!
//! Pending commands are delivered in FIFO order. Completed commands are kept
//! in a bounded list per machine so the outcome can still be looked up.
//! In-flight commands whose agent never reports back are only dropped by
//! retention, see [`CommandBook::remove_in_flight_before`].

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of work queued for an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub machine_id: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub result: Option<CommandResult>,
}

/// Outcome reported back by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub output: serde_json::Value,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStage {
    Pending,
    InFlight,
    Completed,
}

#[derive(Debug, Default)]
struct MachineCommands {
    pending: VecDeque<Command>,
    in_flight: Vec<Command>,
    completed: VecDeque<Command>,
}

impl MachineCommands {
    fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty() && self.completed.is_empty()
    }
}

/// All command queues, keyed by machine id
#[derive(Debug)]
pub struct CommandBook {
    machines: HashMap<String, MachineCommands>,
    /// command id → machine id, for every command still tracked
    index: HashMap<Uuid, String>,
    completed_limit: usize,
}

impl CommandBook {
    pub fn new(completed_limit: usize) -> Self {
        Self {
            machines: HashMap::new(),
            index: HashMap::new(),
            completed_limit,
        }
    }

    pub fn enqueue(&mut self, command: Command) {
        self.index.insert(command.id, command.machine_id.clone());
        self.machines
            .entry(command.machine_id.clone())
            .or_default()
            .pending
            .push_back(command);
    }

    /// Hand all pending commands of a machine over for delivery
    pub fn take_pending(&mut self, machine_id: &str, now: DateTime<Utc>) -> Vec<Command> {
        let Some(queues) = self.machines.get_mut(machine_id) else {
            return vec![];
        };

        let delivered: Vec<Command> = queues
            .pending
            .drain(..)
            .map(|mut command| {
                command.delivered_at = Some(now);
                command
            })
            .collect();
        queues.in_flight.extend(delivered.iter().cloned());
        delivered
    }

    /// Attach a result to an in-flight command and retire it
    pub fn complete(&mut self, command_id: Uuid, result: CommandResult) -> Option<Command> {
        let machine_id = self.index.get(&command_id)?.clone();
        let queues = self.machines.get_mut(&machine_id)?;

        let position = queues.in_flight.iter().position(|c| c.id == command_id)?;
        let mut command = queues.in_flight.swap_remove(position);
        command.result = Some(result);

        queues.completed.push_back(command.clone());
        while queues.completed.len() > self.completed_limit {
            if let Some(evicted) = queues.completed.pop_front() {
                self.index.remove(&evicted.id);
            }
        }

        Some(command)
    }

    pub fn get(&self, command_id: Uuid) -> Option<(CommandStage, Command)> {
        let machine_id = self.index.get(&command_id)?;
        let queues = self.machines.get(machine_id)?;

        find_command(&queues.pending, command_id)
            .map(|c| (CommandStage::Pending, c))
            .or_else(|| find_command(&queues.in_flight, command_id).map(|c| (CommandStage::InFlight, c)))
            .or_else(|| find_command(&queues.completed, command_id).map(|c| (CommandStage::Completed, c)))
    }

    pub fn pending_count(&self, machine_id: &str) -> usize {
        self.machines
            .get(machine_id)
            .map_or(0, |queues| queues.pending.len())
    }

    pub fn in_flight(&self, machine_id: &str) -> Vec<Command> {
        self.machines
            .get(machine_id)
            .map(|queues| queues.in_flight.clone())
            .unwrap_or_default()
    }

    pub fn completed(&self, machine_id: &str) -> Vec<Command> {
        self.machines
            .get(machine_id)
            .map(|queues| queues.completed.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget every command of a machine; returns how many were dropped
    pub fn remove_machine(&mut self, machine_id: &str) -> usize {
        let Some(queues) = self.machines.remove(machine_id) else {
            return 0;
        };

        let ids: Vec<Uuid> = queues
            .pending
            .iter()
            .chain(queues.in_flight.iter())
            .chain(queues.completed.iter())
            .map(|c| c.id)
            .collect();
        for id in &ids {
            self.index.remove(id);
        }
        ids.len()
    }

    /// Drop completed commands whose result was reported before `before`
    pub fn remove_completed_before(&mut self, before: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for queues in self.machines.values_mut() {
            let index = &mut self.index;
            queues.completed.retain(|command| {
                let keep = command
                    .result
                    .as_ref()
                    .is_some_and(|result| result.reported_at >= before);
                if !keep {
                    index.remove(&command.id);
                    removed += 1;
                }
                keep
            });
        }
        self.machines.retain(|_, queues| !queues.is_empty());
        removed
    }

    /// Drop in-flight commands delivered before `before` without a result
    pub fn remove_in_flight_before(&mut self, before: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for queues in self.machines.values_mut() {
            let index = &mut self.index;
            queues.in_flight.retain(|command| {
                let keep = command
                    .delivered_at
                    .is_some_and(|delivered_at| delivered_at >= before);
                if !keep {
                    index.remove(&command.id);
                    removed += 1;
                }
                keep
            });
        }
        self.machines.retain(|_, queues| !queues.is_empty());
        removed
    }
}

fn find_command<'a>(commands: impl IntoIterator<Item = &'a Command>, id: Uuid) -> Option<Command> {
    commands.into_iter().find(|c| c.id == id).cloned()
}
