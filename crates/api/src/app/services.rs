//! Pipeline wiring.
//!
//! `USE_PERSISTENT_STORES=true` (with the `redis` feature) selects Postgres +
//! Redis Streams + Redis cache; otherwise everything is in memory.

use std::sync::Arc;

use tracing::{info, warn};

use claimflow_core::{IncomingRequest, RequestingUser, WorkItemId};
use claimflow_infra::config::{CredentialConfig, EvaluatorConfig, PipelineConfig};
use claimflow_infra::evaluator::{
    AdminCredential, ClaimEvaluator, CredentialSource, HttpClaimEvaluator, LoggingEvaluator,
    PasswordGrantSource, StaticCredentialSource,
};
use claimflow_infra::pipeline::{BatchOrchestrator, BatchReceipt, PipelineError};
use claimflow_infra::queue_store::{InMemoryQueueStore, StatusView};
use claimflow_infra::reference_cache::{InMemoryReferenceCache, ReferenceCache};
use claimflow_messaging::{InMemoryMessageBus, MessageBus};

#[cfg(feature = "redis")]
use claimflow_infra::{
    message_bus::RedisStreamsMessageBus, queue_store::PostgresQueueStore,
    reference_cache::RedisReferenceCache,
};

pub enum AppServices {
    InMemory {
        pipeline: BatchOrchestrator<InMemoryQueueStore>,
    },
    #[cfg(feature = "redis")]
    Persistent {
        pipeline: BatchOrchestrator<PostgresQueueStore>,
    },
}

impl AppServices {
    /// In-memory pipeline (dev/test). The allow-list cache starts empty.
    pub fn in_memory(config: &PipelineConfig, evaluator: Arc<dyn ClaimEvaluator>) -> Self {
        let pipeline = BatchOrchestrator::assemble(
            Arc::new(InMemoryQueueStore::new()),
            Arc::new(InMemoryMessageBus::new()) as Arc<dyn MessageBus>,
            Arc::new(InMemoryReferenceCache::new()) as Arc<dyn ReferenceCache>,
            evaluator,
            config,
        );
        AppServices::InMemory { pipeline }
    }

    pub async fn submit(
        &self,
        request: &IncomingRequest,
        user: &RequestingUser,
    ) -> Result<BatchReceipt, PipelineError> {
        match self {
            AppServices::InMemory { pipeline } => pipeline.submit_batch(request, user).await,
            #[cfg(feature = "redis")]
            AppServices::Persistent { pipeline } => pipeline.submit_batch(request, user).await,
        }
    }

    pub async fn status(&self, ian: &WorkItemId) -> Result<StatusView, PipelineError> {
        match self {
            AppServices::InMemory { pipeline } => pipeline.get_status(ian).await,
            #[cfg(feature = "redis")]
            AppServices::Persistent { pipeline } => pipeline.get_status(ian).await,
        }
    }
}

pub async fn build_services() -> anyhow::Result<AppServices> {
    let config = PipelineConfig::from_env()?;
    let evaluator = build_evaluator().await?;

    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    if use_persistent {
        #[cfg(feature = "redis")]
        {
            return build_persistent_services(&config, evaluator).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            warn!("USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory");
        }
    }

    info!(
        delay_ms = config.consumption.delay.as_millis() as u64,
        max_polls = config.consumption.max_polls,
        policy = ?config.validation_policy,
        "using in-memory pipeline"
    );
    Ok(AppServices::in_memory(&config, evaluator))
}

async fn build_evaluator() -> anyhow::Result<Arc<dyn ClaimEvaluator>> {
    let Some(config) = EvaluatorConfig::from_env()? else {
        warn!("CLAIMFLOW_EVALUATOR_URL not set; forwarded claims are only logged");
        return Ok(Arc::new(LoggingEvaluator));
    };

    let source: Arc<dyn CredentialSource> = match config.credential {
        CredentialConfig::Static(token) => Arc::new(StaticCredentialSource::new(token)),
        CredentialConfig::PasswordGrant {
            token_url,
            client_id,
            client_secret,
            username,
            password,
        } => Arc::new(PasswordGrantSource::new(
            token_url,
            client_id,
            client_secret,
            username,
            password,
        )),
    };

    let credential = AdminCredential::resolve(source).await?;
    let evaluator = HttpClaimEvaluator::new(config.base_url, credential, config.timeout)?;
    Ok(Arc::new(evaluator))
}

#[cfg(feature = "redis")]
async fn build_persistent_services(
    config: &PipelineConfig,
    evaluator: Arc<dyn ClaimEvaluator>,
) -> anyhow::Result<AppServices> {
    use anyhow::Context;
    use sqlx::PgPool;

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;
    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

    let pool = PgPool::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = Arc::new(PostgresQueueStore::new(pool));
    store.ensure_schema().await?;

    let bus = RedisStreamsMessageBus::new(&redis_url, None)?;
    bus.ensure_consumer_group().await?;

    let cache = RedisReferenceCache::new(&redis_url)?;

    info!(stream_key = %bus.stream_key(), "using Postgres + Redis pipeline");

    let pipeline = BatchOrchestrator::assemble(
        store,
        Arc::new(bus) as Arc<dyn MessageBus>,
        Arc::new(cache) as Arc<dyn ReferenceCache>,
        evaluator,
        config,
    );

    Ok(AppServices::Persistent { pipeline })
}
