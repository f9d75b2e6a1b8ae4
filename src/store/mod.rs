//! Volatile fleet state
//!
//! The store is rebuilt from scratch on every start. It holds three
//! independently locked resources:
//!
//! - **Machines**: one [`MachineRecord`] per machine id, replaced as a whole on
//!   every report
//! - **History**: a bounded ring buffer of [`HistoryEntry`] per machine
//! - **Commands**: pending, in-flight and completed [`Command`]s per machine
//!
//! ## Usage
//!
//! ```no_run
//! use fleet_state::{clock::SystemClock, config::StoreConfig, store::ResourceStore};
//!
//! fn main() -> anyhow::Result<()> {
//!     let store = ResourceStore::new(&StoreConfig::default(), SystemClock::shared())?;
//!     for machine in store.get_all_machines()? {
//!         println!("{}: {}", machine.id, machine.status);
//!     }
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod error;
pub mod history;
pub mod machine;
pub mod resource_store;

pub use command::{Command, CommandResult, CommandStage};
pub use error::{StoreError, StoreResult};
pub use history::HistoryEntry;
pub use machine::{
    MachineInfo, MachineRecord, MachineStatus, MetricSnapshot, StatusSummary, StatusThresholds,
};
pub use resource_store::{CleanupStats, ResourceStore, UpdateOutcome};
