//! Health-check scheduler
//!
//! One poller actor per agent. On every tick (or on demand) it fetches the
//! agent's report through [`Resilience::call`], keyed by machine id, and
//! applies it to the [`ResourceStore`].
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → Resilience::call(machine id) → AgentClient::fetch_report → ResourceStore::update_machine
//!     ↑
//!     └─── Commands (PollNow, UpdateInterval, Shutdown)
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{debug, error, instrument, trace, warn};

use crate::AgentReport;
use crate::clock::SharedClock;
use crate::config::AgentConfig;
use crate::resilience::{Classify, FailureKind, Resilience};
use crate::store::{MachineInfo, MetricSnapshot, ResourceStore, UpdateOutcome};

/// Why a single fetch from an agent failed
#[derive(Debug, Error)]
pub enum PollError {
    /// Connection refused, timed out or dropped mid-body
    #[error("failed to reach agent: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("agent responded with HTTP {0}")]
    Status(StatusCode),

    #[error("failed to parse agent report: {0}")]
    Decode(#[source] serde_json::Error),
}

impl Classify for PollError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            PollError::Transport(_) => FailureKind::Transient,
            PollError::Status(status)
                if status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS =>
            {
                FailureKind::Transient
            }
            PollError::Status(_) | PollError::Decode(_) => FailureKind::Permanent,
        }
    }
}

/// Source of agent reports
#[async_trait]
pub trait AgentClient: Send + Sync + std::fmt::Debug {
    async fn fetch_report(&self) -> Result<AgentReport, PollError>;
}

/// Fetches reports from an agent's `/metrics` endpoint
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpAgentClient {
    pub fn new(agent: &AgentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            url: agent.metrics_url(),
            token: agent.token.clone(),
        })
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn fetch_report(&self) -> Result<AgentReport, PollError> {
        trace!("requesting metrics from {}", self.url);

        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.token {
            request = request.header("X-MONITORING-SECRET", token);
        }

        let response = request.send().await.map_err(PollError::Transport)?;
        if !response.status().is_success() {
            return Err(PollError::Status(response.status()));
        }

        let body = response.text().await.map_err(PollError::Transport)?;
        serde_json::from_str(&body).map_err(PollError::Decode)
    }
}

/// Commands that can be sent to a poller actor
#[derive(Debug)]
pub enum PollerCommand {
    /// Poll right away, bypassing the interval timer
    PollNow {
        respond_to: oneshot::Sender<Result<UpdateOutcome>>,
    },

    UpdateInterval { interval_secs: u64 },

    /// Finish the in-flight poll, then exit
    Shutdown,
}

struct PollerActor {
    machine_id: String,
    client: Arc<dyn AgentClient>,
    store: Arc<ResourceStore>,
    resilience: Resilience,
    clock: SharedClock,
    command_rx: mpsc::Receiver<PollerCommand>,
    interval_duration: Duration,
}

fn poll_ticker(period: Duration) -> Interval {
    // the first poll happens one period after start, not immediately
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl PollerActor {
    #[instrument(skip(self), fields(machine = %self.machine_id))]
    async fn run(mut self) {
        debug!("starting poller");

        let mut ticker = poll_ticker(self.interval_duration);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll().await {
                        error!("failed to poll agent: {:#}", e);
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        PollerCommand::PollNow { respond_to } => {
                            debug!("received PollNow command");
                            let result = self.poll().await;
                            let _ = respond_to.send(result);
                        }

                        PollerCommand::UpdateInterval { interval_secs } => {
                            debug!("updating interval to {interval_secs}s");
                            self.interval_duration = Duration::from_secs(interval_secs.max(1));
                            ticker = poll_ticker(self.interval_duration);
                        }

                        PollerCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("poller stopped");
    }

    async fn poll(&self) -> Result<UpdateOutcome> {
        let client = &self.client;
        let report = self
            .resilience
            .call(&self.machine_id, || client.fetch_report())
            .await
            .with_context(|| format!("failed to fetch report of {}", self.machine_id))?;

        let now = self.clock.now();
        let outcome = self
            .store
            .update_machine(
                &self.machine_id,
                MachineInfo::from_report(&report),
                MetricSnapshot::from_report(&report, now),
            )
            .context("failed to apply report")?;

        trace!("applied report (revision {})", outcome.revision);
        Ok(outcome)
    }
}

/// Handle for controlling a poller actor
#[derive(Debug, Clone)]
pub struct PollerHandle {
    sender: mpsc::Sender<PollerCommand>,
    pub machine_id: String,
}

impl PollerHandle {
    /// Spawn a poller that reads reports from `client`
    pub fn spawn(
        agent: &AgentConfig,
        client: Arc<dyn AgentClient>,
        store: Arc<ResourceStore>,
        resilience: Resilience,
        clock: SharedClock,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let machine_id = agent.machine_id();

        let actor = PollerActor {
            machine_id: machine_id.clone(),
            client,
            store,
            resilience,
            clock,
            command_rx: cmd_rx,
            interval_duration: Duration::from_secs(agent.interval.max(1)),
        };
        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            machine_id,
        }
    }

    /// Spawn a poller for an agent reachable over HTTP
    pub fn spawn_http(
        agent: &AgentConfig,
        store: Arc<ResourceStore>,
        resilience: Resilience,
        clock: SharedClock,
    ) -> Result<Self> {
        let client = Arc::new(HttpAgentClient::new(agent)?);
        Ok(Self::spawn(agent, client, store, resilience, clock))
    }

    pub async fn poll_now(&self) -> Result<UpdateOutcome> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PollerCommand::PollNow { respond_to: tx })
            .await
            .context("failed to send PollNow command")?;

        rx.await.context("failed to receive response")?
    }

    pub async fn update_interval(&self, interval_secs: u64) -> Result<()> {
        self.sender
            .send(PollerCommand::UpdateInterval { interval_secs })
            .await
            .context("failed to send UpdateInterval command")?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(PollerCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
