//! Main application orchestration.
//!
//! Opens positions, margin and orders scopes for every configured user plus
//! one order book scope, logs each published view, and closes everything on
//! Ctrl-C.

use crate::config::{AppConfig, OperatingMode};
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use perpsync_cache::{FileStore, KeyValueStore, PersistedMirror};
use perpsync_core::{SyncError, UserAddress};
use perpsync_remote::{DynChainReader, GatewayClient, MockChain};
use perpsync_snapshot::{BookSnapshot, MarginSnapshot, OrderSnapshot, PositionSnapshot};
use perpsync_sync::{
    Margin, OrderBook, Orders, Positions, ScopeHandle, ScopePhase, ScopeView, SyncEngine,
    SyncOrchestrator,
};
use perpsync_telemetry::Metrics;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What a view log line reports about a snapshot.
trait ViewSummary {
    fn revision(&self) -> u64;
    fn items(&self) -> usize;
}

impl ViewSummary for PositionSnapshot {
    fn revision(&self) -> u64 {
        self.revision
    }

    fn items(&self) -> usize {
        self.len()
    }
}

impl ViewSummary for MarginSnapshot {
    fn revision(&self) -> u64 {
        self.revision
    }

    fn items(&self) -> usize {
        1
    }
}

impl ViewSummary for OrderSnapshot {
    fn revision(&self) -> u64 {
        self.revision
    }

    fn items(&self) -> usize {
        self.open_count()
    }
}

impl ViewSummary for BookSnapshot {
    fn revision(&self) -> u64 {
        self.revision
    }

    fn items(&self) -> usize {
        self.bids.len() + self.asks.len()
    }
}

/// The fields logged per view, copied out of the watch borrow.
struct Summary {
    phase: ScopePhase,
    loaded: bool,
    revision: Option<u64>,
    items: usize,
    error: Option<SyncError>,
    stale_since: Option<DateTime<Utc>>,
}

impl Summary {
    fn of<T: ViewSummary>(view: &ScopeView<T>) -> Self {
        Self {
            phase: view.phase,
            loaded: view.is_loaded(),
            revision: view.value().map(ViewSummary::revision),
            items: view.value().map_or(0, ViewSummary::items),
            error: view.error.clone(),
            stale_since: view.stale_since,
        }
    }
}

/// Log every view `rx` publishes until its scope closes.
async fn log_views<T: ViewSummary>(label: String, mut rx: watch::Receiver<ScopeView<T>>) {
    let mut last_revision = None;
    while rx.changed().await.is_ok() {
        let view = Summary::of(&rx.borrow_and_update());
        match &view.error {
            Some(e) if view.loaded => warn!(
                scope = %label,
                phase = %view.phase,
                error = %e,
                stale_since = ?view.stale_since,
                "Serving last good view"
            ),
            Some(e) => error!(scope = %label, phase = %view.phase, error = %e, "View unavailable"),
            None if view.revision != last_revision => info!(
                scope = %label,
                phase = %view.phase,
                revision = ?view.revision,
                items = view.items,
                "View updated"
            ),
            None => debug!(scope = %label, phase = %view.phase, "View unchanged"),
        }
        last_revision = view.revision;
    }
    debug!(scope = %label, "View stream closed");
}

fn spawn_logger<T>(loggers: &mut Vec<JoinHandle<()>>, label: String, rx: watch::Receiver<ScopeView<T>>)
where
    T: ViewSummary + Send + Sync + 'static,
{
    loggers.push(tokio::spawn(log_views(label, rx)));
}

/// Every scope the daemon keeps open.
struct OpenScopes {
    positions: Vec<ScopeHandle<Positions>>,
    margin: Vec<ScopeHandle<Margin>>,
    orders: Vec<ScopeHandle<Orders>>,
    book: ScopeHandle<OrderBook>,
    loggers: Vec<JoinHandle<()>>,
}

impl OpenScopes {
    async fn close(self) {
        for handle in self.positions {
            handle.shutdown().await;
        }
        for handle in self.margin {
            handle.shutdown().await;
        }
        for handle in self.orders {
            handle.shutdown().await;
        }
        self.book.shutdown().await;
        for logger in self.loggers {
            if let Err(e) = logger.await {
                warn!(error = %e, "View logger ended abnormally");
            }
        }
    }
}

/// Main application.
pub struct Application {
    config: AppConfig,
    users: Vec<UserAddress>,
    engine: SyncEngine,
}

impl Application {
    /// Create a new application instance.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let users = config.user_addresses()?;
        if users.is_empty() {
            warn!("No users configured, only the order book is synced");
        }

        let reader: DynChainReader = match config.mode {
            OperatingMode::Live => Arc::new(GatewayClient::new(config.gateway_config())?),
            OperatingMode::DryRun => {
                info!("Dry run: reading from an empty in-process chain");
                Arc::new(MockChain::new())
            }
        };

        let mut builder = SyncEngine::builder(config.engine_config()?, reader);
        if let Some(dir) = &config.cache.persist_dir {
            let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(dir)?);
            builder = builder.mirror(PersistedMirror::new(store));
            info!(dir = %dir, "Persisting user snapshots");
        }
        let engine = builder.build()?;

        Ok(Self {
            config,
            users,
            engine,
        })
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    fn open_scopes(&self, orchestrator: &SyncOrchestrator) -> OpenScopes {
        let mut loggers = Vec::new();

        let mut positions = Vec::with_capacity(self.users.len());
        let mut margin = Vec::with_capacity(self.users.len());
        let mut orders = Vec::with_capacity(self.users.len());
        for user in &self.users {
            let handle = orchestrator.open(Positions::new(user.clone()));
            spawn_logger(&mut loggers, handle.key().to_string(), handle.subscribe());
            positions.push(handle);
        }
        for user in &self.users {
            let handle = orchestrator.open(Margin::new(user.clone()));
            spawn_logger(&mut loggers, handle.key().to_string(), handle.subscribe());
            margin.push(handle);
        }
        for user in &self.users {
            let handle = orchestrator.open(Orders::new(user.clone()));
            spawn_logger(&mut loggers, handle.key().to_string(), handle.subscribe());
            orders.push(handle);
        }
        let book = orchestrator.open(OrderBook::new(self.engine.config().book_depth_levels));
        spawn_logger(&mut loggers, book.key().to_string(), book.subscribe());

        OpenScopes {
            positions,
            margin,
            orders,
            book,
            loggers,
        }
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> AppResult<()> {
        info!(
            mode = ?self.config.mode,
            network = %self.engine.network(),
            users = self.users.len(),
            "Starting sync"
        );

        let orchestrator = SyncOrchestrator::new(self.engine.clone());
        let scopes = self.open_scopes(&orchestrator);

        let mut housekeeping = tokio::time::interval(self.config.housekeeping_interval());
        housekeeping.tick().await;

        loop {
            tokio::select! {
                _ = housekeeping.tick() => {
                    let purged = self.engine.purge_expired();
                    match Metrics::gather() {
                        Ok(text) => debug!(purged, metrics_bytes = text.len(), "Housekeeping"),
                        Err(e) => warn!(error = %e, "Metrics gather failed"),
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.map_err(AppError::Io)?;
                    info!("Received Ctrl+C, shutting down...");
                    break;
                }
            }
        }

        orchestrator.shutdown();
        scopes.close().await;
        info!("Sync stopped");
        Ok(())
    }
}
