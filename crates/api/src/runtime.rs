//! Per-role process wiring.
//!
//! Picks the storage, ledger and bus backends from [`Config`], builds the
//! participants this process runs, and owns the outbox relays and event
//! consumers until they are spawned.

use std::sync::Arc;
use std::time::Duration;

use common::ServiceTag;
use message_bus::{
    BusError, EventConsumer, HandlerRegistry, InMemoryMessageBus, MessagePublisher, MessageSource,
};
use outbox::{InMemoryOutboxStore, OutboxRelay, OutboxStore, PostgresOutboxStore};
use saga::cart::{CartService, CartStore, InMemoryCartStore, PostgresCartStore};
use saga::inventory::{InMemoryStockStore, InventoryService, PostgresStockStore, StockStore};
use saga::order::{HttpInventoryClient, InProcessInventoryClient, InventoryClient, OrderService};
use saga::payment::{
    BreakerGateway, CircuitBreaker, GatewayError, HttpGateway, HttpGatewayConfig, PaymentGateway,
    PaymentService, ScriptedGateway,
};
use saga::{InMemoryRepository, PostgresRepository, Repository, SagaError, Stored};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use stock_ledger::{
    InMemoryReservationMap, InMemoryStockLedger, LedgerError, RedisReservationMap,
    RedisStockLedger, ReservationMap, StockLedger,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{Config, ServiceRole};

const INVENTORY_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Anything that stops the process from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),
}

/// The participants this process runs; `None` for the others.
#[derive(Clone, Default)]
pub struct Services {
    pub orders: Option<Arc<OrderService>>,
    pub payments: Option<Arc<PaymentService>>,
    pub inventory: Option<Arc<InventoryService>>,
    pub carts: Option<Arc<CartService>>,
}

enum Bus {
    InProcess(InMemoryMessageBus),
    #[cfg(feature = "kafka")]
    Kafka {
        brokers: String,
        publisher: Arc<message_bus::KafkaPublisher>,
    },
}

impl Bus {
    fn connect(config: &Config) -> Result<Self, StartupError> {
        match &config.kafka_brokers {
            #[cfg(feature = "kafka")]
            Some(brokers) => {
                let publisher = message_bus::KafkaPublisher::new(brokers, Duration::from_secs(10))?;
                tracing::info!(%brokers, "using Kafka");
                Ok(Bus::Kafka {
                    brokers: brokers.clone(),
                    publisher: Arc::new(publisher),
                })
            }
            #[cfg(not(feature = "kafka"))]
            Some(_) => Err(StartupError::Config(
                "KAFKA_BROKERS is set but the kafka feature is not compiled in".to_string(),
            )),
            None => {
                tracing::info!(partitions = config.bus_partitions, "using the in-process bus");
                Ok(Bus::InProcess(InMemoryMessageBus::new(config.bus_partitions)))
            }
        }
    }

    fn publisher(&self) -> Arc<dyn MessagePublisher> {
        match self {
            Bus::InProcess(bus) => Arc::new(bus.clone()),
            #[cfg(feature = "kafka")]
            Bus::Kafka { publisher, .. } => publisher.clone(),
        }
    }

    /// One source per partition in process; one partition-ordered Kafka
    /// consumer otherwise.
    fn sources(&self, topic: &str, group: &str) -> Result<Vec<Box<dyn MessageSource>>, StartupError> {
        match self {
            Bus::InProcess(bus) => Ok(bus
                .sources(topic, group)
                .into_iter()
                .map(|source| Box::new(source) as Box<dyn MessageSource>)
                .collect()),
            #[cfg(feature = "kafka")]
            Bus::Kafka { brokers, .. } => {
                let source = message_bus::KafkaSource::subscribe(brokers, group, topic)?;
                Ok(vec![Box::new(source)])
            }
        }
    }
}

struct Consumer {
    consumer: Arc<EventConsumer>,
    sources: Vec<Box<dyn MessageSource>>,
}

/// Everything a process runs, built but not yet started.
pub struct Runtime {
    role: ServiceRole,
    services: Services,
    relays: Vec<OutboxRelay>,
    consumers: Vec<Consumer>,
    bus: Bus,
}

impl Runtime {
    pub async fn build(config: &Config) -> Result<Self, StartupError> {
        let pool = match &config.database_url {
            Some(url) => Some(connect_database(url).await?),
            None => {
                tracing::warn!("DATABASE_URL not set, state is kept in memory");
                None
            }
        };

        let mut runtime = Self {
            role: config.role,
            services: Services::default(),
            relays: Vec::new(),
            consumers: Vec::new(),
            bus: Bus::connect(config)?,
        };

        if config.role.runs(ServiceTag::Inventory) {
            let inventory = runtime.inventory(config, pool.as_ref()).await?;
            runtime.services.inventory = Some(inventory);
        }
        if config.role.runs(ServiceTag::Order) {
            let orders = runtime.orders(config, pool.as_ref())?;
            runtime.services.orders = Some(orders);
        }
        if config.role.runs(ServiceTag::Payment) {
            let payments = runtime.payments(config, pool.as_ref())?;
            runtime.services.payments = Some(payments);
        }
        if config.role.runs(ServiceTag::Cart) {
            let carts = runtime.carts(config, pool.as_ref())?;
            runtime.services.carts = Some(carts);
        }

        tracing::info!(
            role = config.role.as_str(),
            relays = runtime.relays.len(),
            consumers = runtime.consumers.len(),
            "runtime built"
        );
        Ok(runtime)
    }

    pub fn role(&self) -> ServiceRole {
        self.role
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// The in-process bus, when no broker is configured.
    pub fn in_process_bus(&self) -> Option<&InMemoryMessageBus> {
        match &self.bus {
            Bus::InProcess(bus) => Some(bus),
            #[cfg(feature = "kafka")]
            Bus::Kafka { .. } => None,
        }
    }

    /// Starts every relay and consumer; they stop once `shutdown` flips to true.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> (Services, Vec<JoinHandle<()>>) {
        let mut tasks = Vec::new();
        for relay in self.relays {
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move { relay.run(shutdown).await }));
        }
        for Consumer { consumer, sources } in self.consumers {
            for source in sources {
                let consumer = Arc::clone(&consumer);
                let shutdown = shutdown.clone();
                tasks.push(tokio::spawn(async move { consumer.run(source, shutdown).await }));
            }
        }
        (self.services, tasks)
    }

    async fn inventory(
        &mut self,
        config: &Config,
        pool: Option<&PgPool>,
    ) -> Result<Arc<InventoryService>, StartupError> {
        let (stock, outbox): (Arc<dyn StockStore>, Arc<dyn OutboxStore>) = match pool {
            Some(pool) => (
                Arc::new(PostgresStockStore::new(pool.clone())),
                Arc::new(PostgresOutboxStore::new(pool.clone()).for_producer(ServiceTag::Inventory)),
            ),
            None => {
                let outbox = InMemoryOutboxStore::new();
                (Arc::new(InMemoryStockStore::new(outbox.clone())), Arc::new(outbox))
            }
        };
        let (ledger, mappings): (Arc<dyn StockLedger>, Arc<dyn ReservationMap>) =
            match &config.redis_url {
                Some(url) => (
                    Arc::new(RedisStockLedger::connect(url).await?),
                    Arc::new(RedisReservationMap::connect(url, config.reservation_ttl).await?),
                ),
                None => {
                    tracing::warn!("REDIS_URL not set, the stock ledger is kept in memory");
                    (
                        Arc::new(InMemoryStockLedger::new()),
                        Arc::new(InMemoryReservationMap::new(config.reservation_ttl)),
                    )
                }
            };

        let service = Arc::new(InventoryService::new(ledger, mappings, stock));
        let synced = service.warm_up().await?;
        tracing::info!(units = synced, "stock ledger synced from durable stock");

        self.relay(config, outbox);
        self.consume(
            config,
            ServiceTag::Inventory,
            saga::inventory::handlers(Arc::clone(&service)),
        )?;
        Ok(service)
    }

    fn orders(&mut self, config: &Config, pool: Option<&PgPool>) -> Result<Arc<OrderService>, StartupError> {
        let inventory: Arc<dyn InventoryClient> = match (&self.services.inventory, &config.inventory_base_url) {
            (Some(local), _) => Arc::new(InProcessInventoryClient::new(Arc::clone(local))),
            (None, Some(url)) => Arc::new(HttpInventoryClient::new(url, INVENTORY_CALL_TIMEOUT)?),
            (None, None) => {
                return Err(StartupError::Config(
                    "INVENTORY_BASE_URL is required when inventory runs in another process".to_string(),
                ));
            }
        };
        let repository = self.repository(config, pool, ServiceTag::Order);
        let service = Arc::new(OrderService::new(repository, inventory));
        self.consume(config, ServiceTag::Order, saga::order::handlers(Arc::clone(&service)))?;
        Ok(service)
    }

    fn payments(
        &mut self,
        config: &Config,
        pool: Option<&PgPool>,
    ) -> Result<Arc<PaymentService>, StartupError> {
        let gateway: Arc<dyn PaymentGateway> = match &config.payment_gateway_url {
            Some(url) => {
                let http = HttpGateway::new(HttpGatewayConfig {
                    base_url: url.clone(),
                    secret: config.payment_gateway_secret.clone(),
                    connect_timeout: config.gateway_connect_timeout,
                    read_timeout: config.gateway_read_timeout,
                })?;
                let breaker = CircuitBreaker::new("payment-gateway", config.breaker.clone());
                Arc::new(BreakerGateway::new(Arc::new(http), breaker))
            }
            None => {
                tracing::warn!("PAYMENT_GATEWAY_URL not set, every payment is approved");
                Arc::new(ScriptedGateway::new())
            }
        };
        let repository = self.repository(config, pool, ServiceTag::Payment);
        let service = Arc::new(PaymentService::new(repository, gateway));
        self.consume(config, ServiceTag::Payment, saga::payment::handlers(Arc::clone(&service)))?;
        Ok(service)
    }

    fn carts(&mut self, config: &Config, pool: Option<&PgPool>) -> Result<Arc<CartService>, StartupError> {
        let store: Arc<dyn CartStore> = match pool {
            Some(pool) => Arc::new(PostgresCartStore::new(pool.clone())),
            None => Arc::new(InMemoryCartStore::new()),
        };
        let service = Arc::new(CartService::new(store));
        self.consume(config, ServiceTag::Cart, saga::cart::handlers(Arc::clone(&service)))?;
        Ok(service)
    }

    /// A repository plus the relay draining the outbox it writes to.
    fn repository<A: Stored>(
        &mut self,
        config: &Config,
        pool: Option<&PgPool>,
        producer: ServiceTag,
    ) -> Arc<dyn Repository<A>> {
        match pool {
            Some(pool) => {
                self.relay(
                    config,
                    Arc::new(PostgresOutboxStore::new(pool.clone()).for_producer(producer)),
                );
                Arc::new(PostgresRepository::<A>::new(pool.clone()))
            }
            None => {
                let outbox = InMemoryOutboxStore::new();
                self.relay(config, Arc::new(outbox.clone()));
                Arc::new(InMemoryRepository::<A>::new(outbox))
            }
        }
    }

    fn relay(&mut self, config: &Config, store: Arc<dyn OutboxStore>) {
        self.relays
            .push(OutboxRelay::new(store, self.bus.publisher(), config.relay()));
    }

    fn consume(
        &mut self,
        config: &Config,
        service: ServiceTag,
        registry: HandlerRegistry,
    ) -> Result<(), StartupError> {
        let consumer = EventConsumer::new(service, registry, self.bus.publisher())
            .with_topic(config.event_topic.clone())
            .with_dead_letter_topic(config.dead_letter_topic.clone())
            .with_retry(config.retry());
        let sources = self.bus.sources(&config.event_topic, &consumer.group())?;
        self.consumers.push(Consumer {
            consumer: Arc::new(consumer),
            sources,
        });
        Ok(())
    }
}

async fn connect_database(url: &str) -> Result<PgPool, StartupError> {
    let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
    saga::run_migrations(&pool).await?;
    tracing::info!("database migrated");
    Ok(pool)
}
