//! Process configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use common::ServiceTag;
use message_bus::{DEFAULT_DEAD_LETTER_TOPIC, DEFAULT_EVENT_TOPIC, RetryPolicy};
use outbox::RelayConfig;
use saga::payment::BreakerConfig;

/// Which participants this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    Order,
    Payment,
    Inventory,
    Cart,
    /// Every participant in one process, talking over the in-process bus.
    All,
}

impl ServiceRole {
    pub fn runs(&self, service: ServiceTag) -> bool {
        match self {
            ServiceRole::All => true,
            ServiceRole::Order => service == ServiceTag::Order,
            ServiceRole::Payment => service == ServiceTag::Payment,
            ServiceRole::Inventory => service == ServiceTag::Inventory,
            ServiceRole::Cart => service == ServiceTag::Cart,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceRole::Order => "order",
            ServiceRole::Payment => "payment",
            ServiceRole::Inventory => "inventory",
            ServiceRole::Cart => "cart",
            ServiceRole::All => "all",
        }
    }
}

impl FromStr for ServiceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "order" => Ok(ServiceRole::Order),
            "payment" => Ok(ServiceRole::Payment),
            "inventory" => Ok(ServiceRole::Inventory),
            "cart" => Ok(ServiceRole::Cart),
            "all" => Ok(ServiceRole::All),
            other => Err(format!("unknown service role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `SERVICE_ROLE`: `order`, `payment`, `inventory`, `cart` or `all` (default: `all`)
/// - `HOST` / `PORT`: bind address (default: `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default: `info`)
/// - `LOG_FORMAT`: `json` for JSON lines, anything else for text
/// - `DATABASE_URL`: Postgres; in-memory stores when unset
/// - `REDIS_URL`: stock ledger and reservation map; in-memory when unset
/// - `KAFKA_BROKERS`: needs the `kafka` feature; in-process bus when unset
/// - `EVENT_TOPIC`, `DEAD_LETTER_TOPIC`, `BUS_PARTITIONS`
/// - `OUTBOX_POLL_INTERVAL_MS`, `OUTBOX_BATCH_SIZE`, `OUTBOX_RETENTION_HOURS`
/// - `CONSUMER_MAX_ATTEMPTS`, `CONSUMER_RETRY_DELAY_MS`
/// - `RESERVATION_TTL_SECS`
/// - `INVENTORY_BASE_URL`: inventory service for an order-only process
/// - `PAYMENT_GATEWAY_URL`, `PAYMENT_GATEWAY_SECRET`,
///   `GATEWAY_CONNECT_TIMEOUT_MS`, `GATEWAY_READ_TIMEOUT_MS`
/// - `BREAKER_FAILURE_THRESHOLD`, `BREAKER_OPEN_SECS`, `BREAKER_SUCCESS_THRESHOLD`
#[derive(Debug, Clone)]
pub struct Config {
    pub role: ServiceRole,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub kafka_brokers: Option<String>,
    pub event_topic: String,
    pub dead_letter_topic: String,
    pub bus_partitions: usize,
    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: usize,
    pub outbox_retention: Duration,
    pub consumer_max_attempts: u32,
    pub consumer_retry_delay: Duration,
    pub reservation_ttl: Duration,
    pub inventory_base_url: Option<String>,
    pub payment_gateway_url: Option<String>,
    pub payment_gateway_secret: String,
    pub gateway_connect_timeout: Duration,
    pub gateway_read_timeout: Duration,
    pub breaker: BreakerConfig,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();
        Ok(Self {
            role: match optional("SERVICE_ROLE") {
                Some(role) => role.parse()?,
                None => defaults.role,
            },
            host: optional("HOST").unwrap_or(defaults.host),
            port: parsed("PORT", defaults.port)?,
            log_level: optional("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match optional("LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            database_url: optional("DATABASE_URL"),
            redis_url: optional("REDIS_URL"),
            kafka_brokers: optional("KAFKA_BROKERS"),
            event_topic: optional("EVENT_TOPIC").unwrap_or(defaults.event_topic),
            dead_letter_topic: optional("DEAD_LETTER_TOPIC").unwrap_or(defaults.dead_letter_topic),
            bus_partitions: parsed("BUS_PARTITIONS", defaults.bus_partitions)?,
            outbox_poll_interval: Duration::from_millis(parsed("OUTBOX_POLL_INTERVAL_MS", 1000)?),
            outbox_batch_size: parsed("OUTBOX_BATCH_SIZE", defaults.outbox_batch_size)?,
            outbox_retention: Duration::from_secs(parsed::<u64>("OUTBOX_RETENTION_HOURS", 72)? * 3600),
            consumer_max_attempts: parsed("CONSUMER_MAX_ATTEMPTS", defaults.consumer_max_attempts)?,
            consumer_retry_delay: Duration::from_millis(parsed("CONSUMER_RETRY_DELAY_MS", 1000)?),
            reservation_ttl: Duration::from_secs(parsed("RESERVATION_TTL_SECS", 3600)?),
            inventory_base_url: optional("INVENTORY_BASE_URL"),
            payment_gateway_url: optional("PAYMENT_GATEWAY_URL"),
            payment_gateway_secret: optional("PAYMENT_GATEWAY_SECRET").unwrap_or_default(),
            gateway_connect_timeout: Duration::from_millis(parsed("GATEWAY_CONNECT_TIMEOUT_MS", 3000)?),
            gateway_read_timeout: Duration::from_millis(parsed("GATEWAY_READ_TIMEOUT_MS", 10_000)?),
            breaker: BreakerConfig {
                failure_threshold: parsed(
                    "BREAKER_FAILURE_THRESHOLD",
                    defaults.breaker.failure_threshold,
                )?,
                open_timeout: Duration::from_secs(parsed("BREAKER_OPEN_SECS", 30)?),
                success_threshold: parsed(
                    "BREAKER_SUCCESS_THRESHOLD",
                    defaults.breaker.success_threshold,
                )?,
            },
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            topic: self.event_topic.clone(),
            batch_size: self.outbox_batch_size,
            poll_interval: self.outbox_poll_interval,
            retention: self.outbox_retention,
            ..RelayConfig::default()
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.consumer_max_attempts, self.consumer_retry_delay)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: ServiceRole::All,
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            redis_url: None,
            kafka_brokers: None,
            event_topic: DEFAULT_EVENT_TOPIC.to_string(),
            dead_letter_topic: DEFAULT_DEAD_LETTER_TOPIC.to_string(),
            bus_partitions: 8,
            outbox_poll_interval: Duration::from_secs(1),
            outbox_batch_size: 100,
            outbox_retention: Duration::from_secs(72 * 3600),
            consumer_max_attempts: 3,
            consumer_retry_delay: Duration::from_secs(1),
            reservation_ttl: Duration::from_secs(3600),
            inventory_base_url: None,
            payment_gateway_url: None,
            payment_gateway_secret: String::new(),
            gateway_connect_timeout: Duration::from_secs(3),
            gateway_read_timeout: Duration::from_secs(10),
            breaker: BreakerConfig::default(),
        }
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parsed<T: FromStr>(name: &str, default: T) -> Result<T, String> {
    match optional(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{name} has an invalid value: {raw}")),
        None => Ok(default),
    }
}
