//! Process entrypoint: open the shared store and wire every service over
//! one pool and one session registry.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::adapters::sqlite::adapter::StorageAdapter;
use crate::adapters::sqlite::connection::{create_pool, create_test_pool, PoolConfig};
use crate::adapters::sqlite::event_log::EventLog;
use crate::adapters::sqlite::memory_repository::MemoryRepository;
use crate::adapters::sqlite::migrations::Migrator;
use crate::config::Config;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::inference::InferenceClient;
use crate::domain::ports::null_inference::NullInferenceClient;
use crate::services::deferred::DeferredManager;
use crate::services::hive::Hive;
use crate::services::lock::LockManager;
use crate::services::mailbox::{Mailbox, SessionRegistry};
use crate::services::memory::MemoryStore;
use crate::services::replay::Replay;
use crate::services::reservations::Reservations;

/// The assembled coordination substrate.
///
/// All services share one pool against the shared database file; the
/// session registry is owned here, by the process that opened the
/// substrate.
#[derive(Clone)]
pub struct Substrate {
    pool: SqlitePool,
    registry: SessionRegistry,
    pub adapter: StorageAdapter,
    pub log: EventLog,
    pub mailbox: Mailbox,
    pub reservations: Reservations,
    pub hive: Hive,
    pub memory: MemoryStore,
    pub locks: LockManager,
    pub deferreds: DeferredManager,
    pub replay: Replay,
}

impl Substrate {
    /// Open the substrate on the configured database, running migrations
    /// first.
    pub async fn open(
        config: &Config,
        inference: Arc<dyn InferenceClient>,
    ) -> DomainResult<Self> {
        let pool = create_pool(
            &config.database.url(),
            Some(PoolConfig {
                max_connections: config.database.max_connections,
                min_connections: config.database.min_connections,
                ..PoolConfig::default()
            }),
        )
        .await
        .map_err(|e| DomainError::Storage(e.to_string()))?;
        Self::assemble(pool, config, inference).await
    }

    /// In-memory substrate for tests.
    pub async fn open_in_memory(inference: Arc<dyn InferenceClient>) -> DomainResult<Self> {
        let pool = create_test_pool()
            .await
            .map_err(|e| DomainError::Storage(e.to_string()))?;
        Self::assemble(pool, &Config::default(), inference).await
    }

    /// In-memory substrate with no inference service at all.
    pub async fn open_in_memory_offline() -> DomainResult<Self> {
        Self::open_in_memory(Arc::new(NullInferenceClient::new())).await
    }

    async fn assemble(
        pool: SqlitePool,
        config: &Config,
        inference: Arc<dyn InferenceClient>,
    ) -> DomainResult<Self> {
        Migrator::new(pool.clone()).run().await?;

        let registry = SessionRegistry::new();
        let log = EventLog::new(pool.clone());
        let mailbox = Mailbox::new(log.clone(), registry.clone(), config.mail.clone());
        let reservations = Reservations::new(
            log.clone(),
            registry.clone(),
            config.reservations.clone(),
        );
        let hive = Hive::new(log.clone());
        let memory = MemoryStore::new(
            MemoryRepository::new(pool.clone()),
            inference,
            config.memory.clone(),
        );
        let locks = LockManager::new(pool.clone(), config.lock.clone());
        let deferreds = DeferredManager::new(pool.clone(), config.deferred.clone());
        let replay = Replay::new(log.clone());
        let adapter = StorageAdapter::new(pool.clone());

        Ok(Self {
            pool,
            registry,
            adapter,
            log,
            mailbox,
            reservations,
            hive,
            memory,
            locks,
            deferreds,
            replay,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
