use crate::bootstrap::Services;
use crate::config::ConductorConfig;
use anyhow::Context;
use poem::endpoint::PrometheusExporter;
use poem::listener::{Listener, TcpListener};
use poem::{EndpointExt, Route};
use prometheus::Registry;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber: an env-filter (`RUST_LOG`,
/// defaulting to `info`) plus a compact formatter, matching the ambient
/// logging setup used across the rest of the service layer.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Top-level running conductor process: owns the wired [`Services`], the
/// metrics registry, and the periodic-loop join set.
pub struct ConductorServer {
    config: ConductorConfig,
    prometheus_registry: Registry,
    services: Services,
}

impl ConductorServer {
    pub fn new(config: ConductorConfig, prometheus_registry: Registry, services: Services) -> Self {
        Self {
            config,
            prometheus_registry,
            services,
        }
    }

    /// Starts the periodic reconciliation loops and the metrics endpoint,
    /// returning once both are spawned. Join-set join errors propagate as
    /// `anyhow::Error`s through the returned join handle.
    pub async fn run(&self, join_set: &mut JoinSet<anyhow::Result<()>>) -> anyhow::Result<u16> {
        let mut loop_set = JoinSet::new();
        self.services.core.run_periodic_loops(&mut loop_set);
        join_set.spawn(async move {
            while let Some(result) = loop_set.join_next().await {
                result.context("periodic loop panicked")?;
            }
            Ok(())
        });

        let metrics_port = self.start_metrics_server(join_set).await?;
        info!(metrics_port, "conductor started");
        Ok(metrics_port)
    }

    async fn start_metrics_server(
        &self,
        join_set: &mut JoinSet<anyhow::Result<()>>,
    ) -> anyhow::Result<u16> {
        let metrics = PrometheusExporter::new(self.prometheus_registry.clone());
        let app = Route::new().nest("/metrics", metrics).with(poem::middleware::Tracing);

        let listener = TcpListener::bind(format!("0.0.0.0:{}", self.config.metrics_port));
        let acceptor = listener.into_acceptor().await?;
        let port = acceptor.local_addr()[0]
            .as_socket_addr()
            .expect("socket address")
            .port();

        join_set.spawn(async move {
            poem::Server::new_with_acceptor(acceptor)
                .run(app)
                .await
                .map_err(anyhow::Error::from)
        });

        Ok(port)
    }

    pub async fn shutdown(self: Arc<Self>) -> anyhow::Result<()> {
        self.services.core.del_host().await?;
        Ok(())
    }
}
