use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use fleet_state::{
    clock::{SharedClock, SystemClock},
    config::{Config, read_config_file},
    poller::PollerHandle,
    resilience::Resilience,
    store::ResourceStore,
};
use futures::future::join_all;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("fleet_state", LevelFilter::TRACE),
        ("fleet_hub", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    let clock = SystemClock::shared();

    let store = Arc::new(
        ResourceStore::new(&config.store, clock.clone()).context("failed to create store")?,
    );
    let resilience = Resilience::from_config(&config, clock.clone());

    let pollers = dispatch_pollers(&config, &store, &resilience, &clock)?;
    info!("polling {} agent(s)", pollers.len());

    let summary = tokio::spawn(log_summary(store.clone(), resilience.clone()));
    let cleanup = config
        .store
        .retention()
        .map(|retention| {
            let period = Duration::from_secs(config.store.cleanup_interval_secs.max(1));
            tokio::spawn(run_cleanup(store.clone(), clock.clone(), retention, period))
        });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    let results = join_all(pollers.iter().map(PollerHandle::shutdown)).await;
    for (poller, result) in pollers.iter().zip(results) {
        if let Err(e) = result {
            warn!("failed to stop poller of {}: {e:#}", poller.machine_id);
        }
    }

    summary.abort();
    if let Some(cleanup) = cleanup {
        cleanup.abort();
    }

    Ok(())
}

fn dispatch_pollers(
    config: &Config,
    store: &Arc<ResourceStore>,
    resilience: &Resilience,
    clock: &SharedClock,
) -> anyhow::Result<Vec<PollerHandle>> {
    let mut handles = vec![];
    for agent in config.agents.iter().flatten() {
        debug!(
            "starting poller for {} ({}:{}) with interval {}s",
            agent.machine_id(),
            agent.ip,
            agent.port,
            agent.interval
        );
        handles.push(PollerHandle::spawn_http(
            agent,
            store.clone(),
            resilience.clone(),
            clock.clone(),
        )?);
    }
    Ok(handles)
}

#[instrument(skip_all)]
async fn log_summary(store: Arc<ResourceStore>, resilience: Resilience) {
    let mut ticker = interval(SUMMARY_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match store.status_summary() {
            Ok(summary) => info!(
                "fleet: {} online, {} warning, {} offline",
                summary.online, summary.warning, summary.offline
            ),
            Err(e) => error!("failed to summarize fleet: {e}"),
        }

        for breaker in resilience.breakers().snapshots() {
            if breaker.state != fleet_state::resilience::CircuitState::Closed {
                warn!("circuit `{}` is {}", breaker.name, breaker.state);
            }
        }

        let budget = resilience.budget().stats();
        debug!(
            "retry budget: {}/{} calls were retries ({:.1}%)",
            budget.retries,
            budget.total,
            budget.ratio * 100.0
        );
    }
}

#[instrument(skip_all)]
async fn run_cleanup(
    store: Arc<ResourceStore>,
    clock: SharedClock,
    retention: Duration,
    period: Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Ok(retention) = chrono::Duration::from_std(retention) else {
            error!("retention of {retention:?} is out of range");
            return;
        };
        if let Err(e) = store.cleanup_before(clock.now() - retention) {
            error!("retention cleanup failed: {e}");
        }
    }
}
