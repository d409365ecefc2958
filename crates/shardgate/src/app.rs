//! Process wiring: one [`Gateway`] owns every long-running task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use shardgate_broker::topology::{AUTH_VALIDATE_TOKEN_RPC, SYSTEM_COMMANDS};
use shardgate_broker::{AdapterConfig, BrokerAdapter, InMemoryBroker, MessageBroker, Topology};
use shardgate_correlation::{ContextStore, MemoryContextStore, PendingRegistry};
use shardgate_server::shutdown::DEFAULT_SHUTDOWN_TIMEOUT;
use shardgate_server::{
    BrokerTokenValidator, CommandGateway, GatewayConfig, GatewayServer, SessionTable, ShutdownCoordinator,
    ShutdownReport, StaticTokenResponder, TaskSet, start_dispatchers,
};
use shardgate_settings::{BrokerSettings, GatewaySettings, RedisSettings, ShardSeed};
use shardgate_shards::{
    AdmissionWorker, BrokerEscalation, CapacityCache, InMemoryShardRepository, MemoryCapacityCache, ShardAdmission,
    ShardRecord,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// How often expired in-memory request contexts are dropped.
pub const CONTEXT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A running gateway.
pub struct Gateway {
    addr: SocketAddr,
    server: GatewayServer,
    adapter: Arc<BrokerAdapter>,
    commands: Arc<CommandGateway>,
    tasks: TaskSet,
    shutdown_timeout: Duration,
}

impl Gateway {
    /// Build every component from `settings` and start serving.
    pub async fn start(settings: GatewaySettings, metrics: Option<PrometheusHandle>) -> Result<Self> {
        let coordinator = ShutdownCoordinator::new();
        let adapter_config = AdapterConfig {
            rpc_timeout: settings.broker.rpc_timeout(),
            reconnect: settings.broker.reconnect.clone(),
        };
        let transport = open_broker(&settings.broker).await?;
        let adapter = BrokerAdapter::connect(transport, Topology::gateway(), adapter_config)
            .await
            .context("Failed to connect broker adapter")?;

        let stores = open_stores(&settings.redis).await?;
        let mut tasks = TaskSet::new();
        if let Some(memory) = stores.memory_context {
            tasks.push(
                "context-sweeper",
                spawn_context_sweeper(memory, CONTEXT_SWEEP_INTERVAL, &coordinator),
            );
        }

        // Shard admission + its worker on system_commands
        let admission = Arc::new(
            ShardAdmission::new(
                Arc::new(InMemoryShardRepository::new()),
                stores.capacity,
                Arc::new(BrokerEscalation::new(Arc::clone(&adapter))),
            )
            .with_inactivity_threshold(settings.shards.inactivity_threshold()),
        );
        seed_shards(&admission, &settings.shards.seed).await?;
        let corrected = admission.reconcile().await.context("Failed to reconcile shard capacity")?;
        if !corrected.is_empty() {
            info!(shards = corrected.len(), "capacity cache corrected from bindings");
        }

        tasks.push(
            "admission-worker",
            adapter.consume(
                SYSTEM_COMMANDS,
                AdmissionWorker::new(Arc::clone(&admission), Arc::clone(&adapter)),
            ),
        );

        // Gateway commands + outbound consumers
        let sessions = Arc::new(SessionTable::new());
        let registry = PendingRegistry::new("gateway", stores.context, settings.correlation.context_ttl());
        let commands = Arc::new(CommandGateway::new(
            Arc::clone(&adapter),
            registry,
            Arc::clone(&sessions),
            settings.server.command_timeout(),
        ));
        tasks.extend(
            "outbound-dispatcher",
            start_dispatchers(&adapter, Arc::clone(&commands), &sessions),
        );

        if settings.auth.static_tokens.is_empty() {
            info!("no static tokens configured, expecting an external auth worker");
        } else {
            info!(tokens = settings.auth.static_tokens.len(), "serving static token validation");
            tasks.push(
                "static-token-validator",
                adapter.consume(
                    AUTH_VALIDATE_TOKEN_RPC,
                    StaticTokenResponder::new(settings.auth.static_tokens.clone(), Arc::clone(&adapter)),
                ),
            );
        }

        let validator = Arc::new(BrokerTokenValidator::new(Arc::clone(&adapter)));
        let mut server = GatewayServer::new(
            GatewayConfig::from(&settings.server),
            Arc::clone(&adapter),
            Arc::clone(&commands),
            sessions,
            validator,
            coordinator,
        );
        if let Some(handle) = metrics {
            server = server.with_metrics(handle);
        }

        let (addr, handle) = server
            .listen()
            .await
            .with_context(|| format!("Failed to bind {}", settings.bind_addr()))?;
        tasks.push("http-listener", handle);

        Ok(Self {
            addr,
            server,
            adapter,
            commands,
            tasks,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        })
    }

    /// Bound listener address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting, close sessions, cancel pending commands, close the
    /// broker and drain every task.
    pub async fn shutdown(self) -> ShutdownReport {
        self.server.shutdown().shutdown();
        let cancelled = self.commands.clear_all().await;
        if cancelled > 0 {
            info!(cancelled, "cancelled pending commands at shutdown");
        }
        self.adapter.close().await;
        self.server.shutdown().drain(self.tasks, self.shutdown_timeout).await
    }
}

/// Periodically drop expired contexts from the in-memory store until
/// shutdown.
fn spawn_context_sweeper(
    store: Arc<MemoryContextStore>,
    every: Duration,
    coordinator: &ShutdownCoordinator,
) -> JoinHandle<()> {
    let token = coordinator.child_token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick is immediate
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let purged = store.purge_expired();
            if purged > 0 {
                debug!(purged, "expired request contexts dropped");
            }
        }
        debug!("context sweeper stopped");
    })
}

async fn seed_shards(admission: &ShardAdmission, seeds: &[ShardSeed]) -> Result<()> {
    for seed in seeds {
        let mut record = ShardRecord::new(seed.shard_id.as_str(), seed.max_players);
        if !seed.name.is_empty() {
            record.name.clone_from(&seed.name);
        }
        if !seed.is_active {
            record = record.deactivated();
        }
        let _ = admission
            .save_shard(record)
            .await
            .with_context(|| format!("Failed to seed shard {}", seed.shard_id))?;
    }
    if !seeds.is_empty() {
        info!(count = seeds.len(), "shards seeded");
    }
    Ok(())
}

#[cfg(feature = "amqp")]
async fn open_broker(broker: &BrokerSettings) -> Result<Arc<dyn MessageBroker>> {
    use shardgate_broker::AmqpBroker;

    let Some(url) = broker.url.as_deref() else {
        return Ok(memory_broker());
    };
    let transport: Arc<dyn MessageBroker> = Arc::new(
        AmqpBroker::connect(url)
            .await
            .context("Failed to connect AMQP broker")?,
    );
    info!("using AMQP broker transport");
    Ok(transport)
}

#[cfg(not(feature = "amqp"))]
#[allow(clippy::unused_async)]
async fn open_broker(broker: &BrokerSettings) -> Result<Arc<dyn MessageBroker>> {
    if broker.url.is_some() {
        tracing::warn!("broker.url is set but this build has no amqp support, using the in-process broker");
    }
    Ok(memory_broker())
}

fn memory_broker() -> Arc<dyn MessageBroker> {
    info!("using in-process broker transport");
    Arc::new(InMemoryBroker::new())
}

/// Backing stores for the correlation registry and shard admission.
struct Stores {
    context: Arc<dyn ContextStore>,
    capacity: Arc<dyn CapacityCache>,
    /// Set when contexts live in process and need periodic purging.
    memory_context: Option<Arc<MemoryContextStore>>,
}

#[cfg(feature = "redis")]
async fn open_stores(redis: &RedisSettings) -> Result<Stores> {
    use shardgate_correlation::RedisContextStore;
    use shardgate_shards::RedisCapacityCache;

    let Some(url) = redis.url.as_deref() else {
        return Ok(memory_stores());
    };
    let context: Arc<dyn ContextStore> = Arc::new(
        RedisContextStore::connect(url)
            .await
            .context("Failed to connect Redis context store")?,
    );
    let capacity: Arc<dyn CapacityCache> = Arc::new(
        RedisCapacityCache::connect(url)
            .await
            .context("Failed to connect Redis capacity cache")?,
    );
    info!("using Redis-backed context store and capacity cache");
    Ok(Stores {
        context,
        capacity,
        memory_context: None,
    })
}

#[cfg(not(feature = "redis"))]
#[allow(clippy::unused_async)]
async fn open_stores(redis: &RedisSettings) -> Result<Stores> {
    if redis.url.is_some() {
        tracing::warn!("redis.url is set but this build has no redis support, using in-memory stores");
    }
    Ok(memory_stores())
}

fn memory_stores() -> Stores {
    let memory = Arc::new(MemoryContextStore::new());
    let context: Arc<dyn ContextStore> = memory.clone();
    Stores {
        context,
        capacity: Arc::new(MemoryCapacityCache::new()),
        memory_context: Some(memory),
    }
}
