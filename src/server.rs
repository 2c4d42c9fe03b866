//! The main server which combines the HTTP server, the record service and the
//! background jobs.

use std::{
    net::SocketAddr,
    sync::{Arc, RwLock},
};

use iroh_metrics::Registry;
use snafu::{ResultExt, Snafu};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    cache::ResolutionCache,
    config::{Config, ConfigError},
    dht::{Dht, DhtError},
    http::{HttpError, HttpServer},
    metrics::Metrics,
    republish::Republisher,
    scheduler::{ScheduleError, Scheduler},
    service::RecordService,
    state::AppState,
    store::{RecordStore, RedbRecordStore, StoreError},
};

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum ServerError {
    #[snafu(display("invalid configuration"))]
    Config { source: ConfigError },
    #[snafu(display("failed to open record store"))]
    Store { source: StoreError },
    #[snafu(display("failed to start DHT client"))]
    Dht { source: DhtError },
    #[snafu(display("failed to schedule republishing"))]
    Schedule { source: ScheduleError },
    #[snafu(display("HTTP server error"))]
    Http { source: HttpError },
    #[snafu(display("failed to listen for ctrl-c"))]
    Signal { source: std::io::Error },
}

/// Spawn the server and run until the `Ctrl-C` signal is received, then shutdown.
pub async fn run_with_config_until_ctrl_c(config: Config) -> Result<(), ServerError> {
    let store = if config.store.in_memory {
        RedbRecordStore::in_memory()
    } else {
        let path = config.record_store_path().context(ConfigSnafu)?;
        RedbRecordStore::persistent(path)
    }
    .context(StoreSnafu)?;
    let server = Server::spawn(config, Arc::new(store)).await?;
    tokio::signal::ctrl_c().await.context(SignalSnafu)?;
    info!("shutdown");
    server.shutdown().await?;
    Ok(())
}

/// The record relay server.
#[derive(Debug)]
pub struct Server {
    http_server: HttpServer,
    service: RecordService,
    scheduler: Scheduler,
    metrics_task: JoinHandle<()>,
}

impl Server {
    /// Spawn the server with the DHT client described by `config.dht`.
    ///
    /// This will spawn several background tasks:
    /// * A HTTP server task
    /// * The propagation workers
    /// * The republish job
    /// * A metrics server task, unless disabled
    pub async fn spawn(config: Config, store: Arc<dyn RecordStore>) -> Result<Self, ServerError> {
        let dht = config.dht.build().context(DhtSnafu)?;
        Self::spawn_with_dht(config, store, dht).await
    }

    /// Spawn the server with a given DHT client.
    pub async fn spawn_with_dht(
        config: Config,
        store: Arc<dyn RecordStore>,
        dht: Arc<dyn Dht>,
    ) -> Result<Self, ServerError> {
        let metrics = Arc::new(Metrics::default());

        let scheduler = Scheduler::new();
        let republisher = Republisher::new(store.clone(), dht.clone(), metrics.clone())
            .with_page_size(config.republish.page_size)
            .with_puts(
                config.records.propagate_concurrency,
                config.records.propagate_timeout,
            );
        scheduler
            .schedule(&config.republish.schedule, Arc::new(republisher))
            .context(ScheduleSnafu)?;

        let cache = ResolutionCache::new(&config.cache);
        let service = RecordService::new(store, dht, cache, &config.records, metrics.clone());

        let metrics_task = spawn_metrics_server(config.metrics_addr(), metrics.clone());

        let state = AppState {
            service: service.clone(),
            metrics,
        };
        let http_server = match HttpServer::spawn(config.http, state).await {
            Ok(server) => server,
            Err(err) => {
                metrics_task.abort();
                scheduler.shutdown().await;
                service.shutdown().await;
                return Err(err).context(HttpSnafu);
            }
        };

        Ok(Self {
            http_server,
            service,
            scheduler,
            metrics_task,
        })
    }

    /// The bound address of the HTTP server.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_server.http_addr()
    }

    /// The record service used by this server.
    pub fn service(&self) -> &RecordService {
        &self.service
    }

    /// Cancel the server tasks and wait for all tasks to complete.
    ///
    /// Queued DHT puts are finished before this returns.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        self.metrics_task.abort();
        let res = self.http_server.shutdown().await;
        self.scheduler.shutdown().await;
        self.service.shutdown().await;
        res.context(HttpSnafu)
    }

    /// Wait for all tasks to complete.
    ///
    /// This will run forever unless the HTTP server fails.
    pub async fn run_until_error(self) -> Result<(), ServerError> {
        let res = self.http_server.run_until_done().await;
        self.metrics_task.abort();
        self.scheduler.shutdown().await;
        self.service.shutdown().await;
        res.context(HttpSnafu)
    }

    /// Spawn a server suitable for testing.
    ///
    /// Uses an in-memory store and an in-process DHT, binds to a random localhost port
    /// and does not start the metrics server.
    ///
    /// It returns the server handle, the [`Url`] of the HTTP server and the DHT.
    ///
    /// [`Url`]: url::Url
    #[cfg(test)]
    pub async fn spawn_for_tests() -> n0_snafu::Result<(Self, url::Url, Arc<crate::dht::MemoryDht>)>
    {
        use std::net::{IpAddr, Ipv4Addr};

        use n0_snafu::ResultExt;

        use crate::config::MetricsConfig;

        let mut config = Config::default();
        config.http.port = 0;
        config.http.bind_addr = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        config.metrics = Some(MetricsConfig::disabled());

        let store = Arc::new(RedbRecordStore::in_memory()?);
        let dht = Arc::new(crate::dht::MemoryDht::default());
        let server = Self::spawn_with_dht(config, store, dht.clone()).await?;
        let http_url = format!("http://{}", server.http_addr()).parse::<url::Url>().e()?;
        Ok((server, http_url, dht))
    }
}

fn spawn_metrics_server(addr: Option<SocketAddr>, metrics: Arc<Metrics>) -> JoinHandle<()> {
    tokio::task::spawn(async move {
        let Some(addr) = addr else {
            return;
        };
        let mut registry = Registry::default();
        registry.register(metrics);
        let registry = Arc::new(RwLock::new(registry));
        info!("metrics server listening on {addr}");
        if let Err(err) = iroh_metrics::service::start_metrics_server(addr, registry).await {
            warn!("metrics server failed: {err:#}");
        }
    })
}
