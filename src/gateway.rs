use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::admin::AdminService;
use crate::clock::Clock;
use crate::config::GatewayConfig;
use crate::error::StoreError;
use crate::ingest::Ingestor;
use crate::rate_limiter::RateLimiter;
use crate::sink::Sink;
use crate::storage::EventStore;
use crate::worker::{CycleReport, DeliveryWorker, WorkerContext, WorkerHandle};

struct Background {
    worker: WorkerHandle,
    compactor: JoinHandle<()>,
    compactor_stop: Arc<Notify>,
}

/// The assembled gateway: ingestion, delivery and administration over a
/// shared store.
///
/// Construction wires the components; nothing runs until [`Gateway::start`].
pub struct Gateway {
    config: GatewayConfig,
    store: Arc<dyn EventStore>,
    rate_limiter: Arc<RateLimiter>,
    ingestor: Ingestor,
    admin: AdminService,
    worker_ctx: Arc<WorkerContext>,
    background: Mutex<Option<Background>>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn EventStore>,
        sink: Arc<dyn Sink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(
            config.default_rate_limit,
            config.max_rate_limit,
            config.rate_limit_window,
        ));

        let ingestor = Ingestor::new(
            config.webhook_secret.as_bytes(),
            config.forward_url.clone(),
            rate_limiter.clone(),
            store.clone(),
            clock.clone(),
        );

        let admin = AdminService::new(store.clone(), clock.clone());

        let worker_ctx = Arc::new(WorkerContext {
            store: store.clone(),
            sink,
            clock,
            retry: config.retry_policy(),
            delivery_timeout: config.delivery_timeout,
            batch_size: config.worker_batch_size,
            poll_interval: config.worker_poll_interval,
        });

        Self {
            config,
            store,
            rate_limiter,
            ingestor,
            admin,
            worker_ctx,
            background: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub fn admin(&self) -> &AdminService {
        &self.admin
    }

    /// Run one delivery cycle on the caller's task.
    pub async fn run_delivery_cycle(&self) -> Result<CycleReport, StoreError> {
        DeliveryWorker::shared(self.worker_ctx.clone()).run_cycle().await
    }

    /// Spawn the delivery worker and the rate-limiter compactor.
    ///
    /// Calling this while already started does nothing.
    pub async fn start(&self) {
        let mut background = self.background.lock().await;
        if background.is_some() {
            return;
        }

        let worker = DeliveryWorker::shared(self.worker_ctx.clone()).spawn();
        let compactor_stop = Arc::new(Notify::new());
        let compactor = self
            .rate_limiter
            .clone()
            .spawn_compactor(self.config.rate_limit_cleanup_interval, compactor_stop.clone());

        *background = Some(Background {
            worker,
            compactor,
            compactor_stop,
        });
        tracing::info!(target: "webhook_delivery", "gateway background tasks started");
    }

    pub async fn is_running(&self) -> bool {
        self.background.lock().await.is_some()
    }

    /// Stop background tasks, letting an in-flight delivery cycle finish.
    pub async fn shutdown(&self) {
        let Some(mut background) = self.background.lock().await.take() else {
            return;
        };

        background.worker.shutdown().await;
        background.compactor_stop.notify_one();
        let _ = background.compactor.await;
        tracing::info!(target: "webhook_delivery", "gateway background tasks stopped");
    }
}
