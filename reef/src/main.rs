mod config;

use std::process;
use std::sync::Arc;

use futures::future::select_all;
use indexer_engine::{IndexerConfig, IndexerError, OrderIndexer};
use log::{error, info};
use order_store::{MemoryOrderStore, OrderStore};
use orderbook_ws_engine::{OrderStreamClient, StreamConfig};
use reservoir_source::{AsksFeed, BidsFeed, OrderFeed, ReservoirClient};
use state_store::{FileStateStore, StateStore};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tui::Dashboard;

use config::{AppConfig, ConfigError};

#[derive(Debug, Error)]
enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("indexer error: {0}")]
    Indexer(#[from] IndexerError),
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("reef failed: {err}");
        process::exit(1);
    }
}

#[tokio::main]
async fn run() -> Result<(), AppError> {
    let config = AppConfig::from_env()?;
    info!(
        "reef starting; REST {} WS {} state dir {:?} pool size {}",
        config.api_base_url, config.ws_url, config.state_dir, config.pool_size
    );

    let http = reqwest::Client::builder().user_agent("reef/0.1").build()?;
    let store = Arc::new(MemoryOrderStore::new());
    let state = Arc::new(FileStateStore::new(&config.state_dir));

    let rest = ReservoirClient::new(http, &config.api_base_url, &config.api_key);
    let indexer_config = IndexerConfig::default().with_pool_size(config.pool_size);
    let asks = Arc::new(OrderIndexer::new(
        indexer_config.clone(),
        Arc::new(AsksFeed::new(rest.clone())) as Arc<dyn OrderFeed>,
        Arc::clone(&store) as Arc<dyn OrderStore>,
        Arc::clone(&state) as Arc<dyn StateStore>,
    ));
    let bids = Arc::new(OrderIndexer::new(
        indexer_config,
        Arc::new(BidsFeed::new(rest)) as Arc<dyn OrderFeed>,
        Arc::clone(&store) as Arc<dyn OrderStore>,
        Arc::clone(&state) as Arc<dyn StateStore>,
    ));
    let stream = OrderStreamClient::new(
        StreamConfig::new(&config.ws_url, &config.api_key),
        Arc::clone(&store) as Arc<dyn OrderStore>,
    );
    let stream_metrics = stream.metrics();

    let cancel = CancellationToken::new();
    let mut indexer_tasks = vec![
        Arc::clone(&asks).start(cancel.clone()),
        Arc::clone(&bids).start(cancel.clone()),
    ];
    let stream_task = stream.start(cancel.clone());

    let dashboard_task = config.dashboard.then(|| {
        let mut dashboard = Dashboard::new(vec![asks, bids], stream_metrics, cancel.clone());
        tokio::spawn(async move {
            if let Err(err) = dashboard.run().await {
                error!("dashboard failed: {err}");
            }
        })
    });

    let mut finished_early: Option<usize> = None;
    let outcome: Result<(), AppError> = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
        _ = cancel.cancelled() => Ok(()),
        (result, index, _) = select_all(indexer_tasks.iter_mut()) => {
            finished_early = Some(index);
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err.into()),
                Err(join_err) => {
                    error!("indexer task panicked: {join_err}");
                    Ok(())
                }
            }
        },
    };

    cancel.cancel();
    for (index, task) in indexer_tasks.into_iter().enumerate() {
        if finished_early == Some(index) {
            continue;
        }
        let _ = task.await;
    }
    let _ = stream_task.await;
    if let Some(task) = dashboard_task {
        let _ = task.await;
    }
    info!("reef stopped");
    outcome
}
