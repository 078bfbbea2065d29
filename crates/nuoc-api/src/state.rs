//! Application state wiring the engine together.
//!
//! AppState holds the concrete engine instances used by both CLI commands
//! and the HTTP server. The scheduler is generic over its store; AppState
//! pins it to the SQLite implementation.

use std::sync::Arc;
use std::time::Duration;

use nuoc_core::event::EventBus;
use nuoc_core::workflow::driver::EngineDriver;
use nuoc_core::workflow::gate::GateRegistry;
use nuoc_core::workflow::handler::HandlerRegistry;
use nuoc_core::workflow::scheduler::{Scheduler, SchedulerConfig};
use nuoc_infra::handler::builtin_handlers;
use nuoc_infra::sqlite::SqliteStore;
use nuoc_types::config::EngineConfig;

pub type ConcreteScheduler = Scheduler<SqliteStore>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<ConcreteScheduler>,
    pub store: Arc<SqliteStore>,
    pub config: Arc<EngineConfig>,
}

impl AppState {
    /// Open the journal database named by `config` and build the scheduler
    /// with the built-in handlers and gates.
    pub async fn init(config: EngineConfig) -> anyhow::Result<Self> {
        if config.database_url.is_none() {
            tokio::fs::create_dir_all(&config.data_dir).await?;
        }
        let url = config.resolved_database_url();
        let store = SqliteStore::open(&url).await?;
        tracing::info!(database = %url, "journal database opened");
        Ok(Self::from_parts(store, config, builtin_handlers()))
    }

    pub fn from_parts(store: SqliteStore, config: EngineConfig, handlers: HandlerRegistry) -> Self {
        let store = Arc::new(store);
        let scheduler = Scheduler::new(
            store.clone(),
            EventBus::default(),
            handlers,
            GateRegistry::with_builtins(),
            SchedulerConfig::from(&config),
        );
        Self {
            scheduler: Arc::new(scheduler),
            store,
            config: Arc::new(config),
        }
    }

    /// Background driver sweeping on the configured interval.
    pub fn driver(&self) -> EngineDriver<SqliteStore> {
        EngineDriver::new(
            self.scheduler.clone(),
            Duration::from_millis(self.config.sweep_interval_ms.max(10)),
        )
    }
}
