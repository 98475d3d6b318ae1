//! Option streaming & order-execution gateway: wires the pipeline
//! (broker -> validate -> enrich -> batch -> publish), the subscription
//! lifecycle, the account orchestrator and the order executor behind a
//! thin axum control plane.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streamgate::accounts::AccountOrchestrator;
use streamgate::api::{self, AppState};
use streamgate::broker::pool::{ConnectionPool, PoolConfig};
use streamgate::broker::{self, mock::MockBroker, ws::WsBroker};
use streamgate::bus::MessageBus;
use streamgate::clock::MarketCalendar;
use streamgate::config::{Cli, Config};
use streamgate::domain::{self, AccountId, InstrumentDescriptor};
use streamgate::executor::{self, Executor, TaskStore};
use streamgate::processor::{ProcessedTick, Processor};
use streamgate::registry::{HttpInstrumentSource, InstrumentRegistry, InstrumentSource, StaticInstrumentSource};
use streamgate::streaming::StreamingOrchestrator;
use streamgate::subscriptions::SubscriptionStore;
use streamgate::validator::{ValidationMode, Validator};
use streamgate::{batcher, metrics};

const RISK_FREE_RATE: f64 = 0.06;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Cli::parse().apply(Config::from_env()?);
    let config = Arc::new(config);
    info!(port = config.port, accounts = config.accounts.len(), mock = config.enable_mock_data, "starting gateway");

    let metrics_handle = metrics::install()?;

    let calendar = Arc::new(MarketCalendar::new(&config.market_timezone, &config.market_open, &config.market_close)?);

    let source: Arc<dyn InstrumentSource> = if config.enable_mock_data {
        Arc::new(StaticInstrumentSource::new(mock_instrument_catalog()))
    } else {
        Arc::new(HttpInstrumentSource::new(config.broker_api_url.clone()))
    };
    let registry = Arc::new(InstrumentRegistry::new(source));
    registry.initial_load().await?;

    let subscriptions = Arc::new(SubscriptionStore::open(&config.store_dsn)?);

    let accounts = Arc::new(AccountOrchestrator::new(
        config
            .accounts
            .iter()
            .map(|a| (a.account_id.clone(), a.credentials.clone()))
            .collect(),
        Duration::from_secs(config.lease_timeout_s),
    ));

    let bus = Arc::new(MessageBus::connect(
        &config.bus_url,
        Duration::from_millis(config.publish_timeout_ms),
        config.circuit_failure_threshold,
        Duration::from_secs(config.circuit_recovery_s),
        config.circuit_success_threshold,
    )?);

    let (tick_tx, tick_rx) = tokio::sync::mpsc::channel(8192);

    let mut pools: HashMap<AccountId, Arc<ConnectionPool>> = HashMap::new();
    for account in &config.accounts {
        let pool_config = PoolConfig {
            max_connections: config.max_connections_per_account,
            max_tokens_per_connection: config.max_tokens_per_connection,
        };
        let tick_tx_for_factory = tick_tx.clone();
        let enable_mock = config.enable_mock_data;
        let broker_ws_url = config.broker_api_url.replace("https://", "wss://").replace("http://", "ws://");
        let factory: Box<dyn Fn() -> Arc<dyn broker::BrokerConnection> + Send + Sync> = if enable_mock {
            Box::new(move || {
                Arc::new(MockBroker::new(tick_tx_for_factory.clone())) as Arc<dyn broker::BrokerConnection>
            })
        } else {
            Box::new(move || {
                Arc::new(WsBroker::connect(broker_ws_url.clone(), tick_tx_for_factory.clone())) as Arc<dyn broker::BrokerConnection>
            })
        };
        pools.insert(account.account_id.clone(), Arc::new(ConnectionPool::new(pool_config, factory)));
    }
    drop(tick_tx);

    let market = "nifty".to_string();
    let streaming = Arc::new(StreamingOrchestrator::new(
        subscriptions.clone(),
        accounts.clone(),
        pools,
        bus.clone(),
        market.clone(),
    ));
    streaming.startup_assign().await?;

    spawn_reconcile_loop(streaming.clone(), Duration::from_secs(config.reconcile_interval_s));
    spawn_registry_refresh_loop(registry.clone(), Duration::from_secs(config.registry_refresh_interval_hours * 3600));
    spawn_tick_pipeline(registry.clone(), calendar.clone(), bus.clone(), market.clone(), tick_rx);

    let task_store = Arc::new(TaskStore::open(&config.store_dsn, config.executor_max_tasks)?);
    let order_broker: Arc<dyn executor::OrderBroker> = if config.enable_mock_data {
        Arc::new(broker::mock::MockOrderBroker)
    } else {
        Arc::new(broker::ws::HttpOrderBroker::new(config.broker_api_url.clone()))
    };
    let gateway_executor = Arc::new(Executor::new(
        task_store.clone(),
        accounts.clone(),
        order_broker,
        config.circuit_failure_threshold,
        Duration::from_secs(config.circuit_recovery_s),
        config.circuit_success_threshold,
        config.executor_max_attempts,
    ));
    gateway_executor.recover_orphaned_running_tasks().await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel(1);
    tokio::spawn(executor::run(gateway_executor.clone(), shutdown_rx));

    let state = Arc::new(AppState {
        config: config.clone(),
        subscriptions,
        streaming,
        executor: gateway_executor,
        accounts,
        calendar,
        metrics_handle,
        started_at: Instant::now(),
    });

    let app = api::router(state);
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "control plane listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    Ok(())
}

fn spawn_tick_pipeline(
    registry: Arc<InstrumentRegistry>,
    calendar: Arc<MarketCalendar>,
    bus: Arc<MessageBus>,
    market: String,
    mut tick_rx: tokio::sync::mpsc::Receiver<domain::Tick>,
) {
    let validator = Arc::new(Validator::new(ValidationMode::Lenient, registry.clone()));
    let processor = Arc::new(Processor::new(registry, RISK_FREE_RATE));

    let mut batcher: batcher::Batcher<serde_json::Value> = batcher::Batcher::new(batcher::BatcherConfig {
        window: Duration::from_millis(100),
        max_size: 1000,
        channel_capacity: 16_384,
    });
    let underlying_channel = format!("ticker:{market}:underlying");
    let options_channel = format!("ticker:{market}:options");
    let mut underlying_flush = batcher.register(&underlying_channel);
    let mut options_flush = batcher.register(&options_channel);
    let batcher = Arc::new(batcher);

    {
        let bus = bus.clone();
        let channel = underlying_channel.clone();
        tokio::spawn(async move {
            while let Some(batch) = underlying_flush.recv().await {
                if let Err(e) = bus.publish_batch(&channel, &batch).await {
                    warn!(%channel, error = %e, "failed to publish underlying batch");
                }
            }
        });
    }
    {
        let bus = bus.clone();
        let channel = options_channel.clone();
        tokio::spawn(async move {
            while let Some(batch) = options_flush.recv().await {
                if let Err(e) = bus.publish_batch(&channel, &batch).await {
                    warn!(%channel, error = %e, "failed to publish options batch");
                }
            }
        });
    }

    tokio::spawn(async move {
        while let Some(mut tick) = tick_rx.recv().await {
            if let Err(e) = validator.validate(&mut tick) {
                warn!(token = tick.token, error = %e, "tick rejected by validator");
                continue;
            }
            let calendar = calendar.clone();
            let Some(processed) = processor.process(tick, move |expiry| {
                calendar.seconds_to_session_close(expiry, chrono::Utc::now())
            }) else {
                continue;
            };
            match processed {
                ProcessedTick::Underlying(snap) => {
                    batcher.add(&underlying_channel, serde_json::to_value(snap).unwrap_or_default());
                }
                ProcessedTick::Option(snap) => {
                    batcher.add(&options_channel, serde_json::to_value(snap).unwrap_or_default());
                }
            }
        }
    });
}

fn spawn_reconcile_loop(streaming: Arc<StreamingOrchestrator>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = streaming.reconcile().await {
                warn!(error = %e, "reconcile pass failed");
            }
        }
    });
}

/// Refreshes the instrument registry on the configured interval (default:
/// once per trading-day boundary). A failed refresh keeps the last good
/// snapshot, logged by `InstrumentRegistry::refresh` itself.
fn spawn_registry_refresh_loop(registry: Arc<InstrumentRegistry>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it, initial_load already ran
        loop {
            ticker.tick().await;
            if let Err(e) = registry.refresh(true).await {
                warn!(error = %e, "registry refresh pass failed");
            }
        }
    });
}

async fn shutdown_signal(shutdown_tx: tokio::sync::mpsc::Sender<()>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(()).await;
}

fn mock_instrument_catalog() -> Vec<InstrumentDescriptor> {
    use domain::{OptionType, Segment};
    vec![
        InstrumentDescriptor {
            token: 256265,
            trading_symbol: "NIFTY 50".into(),
            segment: Segment::UnderlyingIndex,
            option_type: None,
            strike: None,
            expiry: None,
            lot_size: 1,
            tick_size: 0.05,
            exchange: "NSE".into(),
            underlying_token: None,
        },
        InstrumentDescriptor {
            token: 12345,
            trading_symbol: "NIFTY24JAN22000CE".into(),
            segment: Segment::EquityOption,
            option_type: Some(OptionType::Call),
            strike: Some(22000.0),
            expiry: Some(chrono::Utc::now().date_naive() + chrono::Duration::days(21)),
            lot_size: 50,
            tick_size: 0.05,
            exchange: "NFO".into(),
            underlying_token: Some(256265),
        },
    ]
}
