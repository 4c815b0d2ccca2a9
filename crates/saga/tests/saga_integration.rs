//! End-to-end saga runs over the in-memory bus and stores.
//!
//! Every participant gets its own outbox, relay and consumer group, exactly
//! as in a deployment; `settle` pumps relays and consumers until nothing
//! moves any more.

use std::sync::Arc;
use std::time::Duration;

use common::{EventEnvelope, EventType, Money, OrderId, ReservedItem, ServiceTag, StockKey, UserId};
use domain::{OrderStatus, PaymentStatus};
use message_bus::{
    DEFAULT_DEAD_LETTER_TOPIC, DEFAULT_EVENT_TOPIC, EventConsumer, HandlerRegistry,
    InMemoryMessageBus, InMemorySource, RetryPolicy,
};
use outbox::{InMemoryOutboxStore, OutboxRelay, RelayConfig};
use saga::cart::{CartService, InMemoryCartStore};
use saga::inventory::{InMemoryStockStore, InventoryService, StockStore, StockUnit};
use saga::order::{CheckoutRequest, InProcessInventoryClient, OrderService};
use saga::payment::{ConfirmPayment, GatewayError, PaymentService, Scripted, ScriptedGateway};
use saga::{InMemoryRepository, Principal, SagaError};
use stock_ledger::{InMemoryReservationMap, InMemoryStockLedger, ReservationMap, StockLedger};

const SKU: &str = "SKU-1";
const PRICE: i64 = 1500;

struct Participant {
    consumer: EventConsumer,
    sources: Vec<InMemorySource>,
}

struct World {
    bus: InMemoryMessageBus,
    relays: Vec<OutboxRelay>,
    participants: Vec<Participant>,
    orders: Arc<OrderService>,
    payments: Arc<PaymentService>,
    inventory: Arc<InventoryService>,
    carts: Arc<CartService>,
    gateway: ScriptedGateway,
    ledger: InMemoryStockLedger,
    mappings: InMemoryReservationMap,
    stock: InMemoryStockStore,
    outboxes: Vec<InMemoryOutboxStore>,
}

impl World {
    async fn new(initial_stock: u64) -> Self {
        let bus = InMemoryMessageBus::new(4);
        let order_outbox = InMemoryOutboxStore::new();
        let payment_outbox = InMemoryOutboxStore::new();
        let inventory_outbox = InMemoryOutboxStore::new();

        let ledger = InMemoryStockLedger::new();
        let mappings = InMemoryReservationMap::default();
        let stock = InMemoryStockStore::new(inventory_outbox.clone());
        let inventory = Arc::new(InventoryService::new(
            Arc::new(ledger.clone()),
            Arc::new(mappings.clone()),
            Arc::new(stock.clone()),
        ));
        inventory
            .register_unit(StockUnit {
                key: StockKey::product(SKU),
                name: "Widget".to_string(),
                unit_price: Money::from_cents(PRICE),
                quantity: initial_stock,
            })
            .await
            .unwrap();

        let orders = Arc::new(OrderService::new(
            Arc::new(InMemoryRepository::new(order_outbox.clone())),
            Arc::new(InProcessInventoryClient::new(Arc::clone(&inventory))),
        ));
        let gateway = ScriptedGateway::new();
        let payments = Arc::new(PaymentService::new(
            Arc::new(InMemoryRepository::new(payment_outbox.clone())),
            Arc::new(gateway.clone()),
        ));
        let carts = Arc::new(CartService::new(Arc::new(InMemoryCartStore::new())));

        let relays = [&order_outbox, &payment_outbox, &inventory_outbox]
            .into_iter()
            .map(|store| {
                OutboxRelay::new(
                    Arc::new(store.clone()),
                    Arc::new(bus.clone()),
                    RelayConfig::default(),
                )
            })
            .collect();

        let participants = vec![
            participant(&bus, ServiceTag::Order, saga::order::handlers(Arc::clone(&orders))),
            participant(&bus, ServiceTag::Payment, saga::payment::handlers(Arc::clone(&payments))),
            participant(
                &bus,
                ServiceTag::Inventory,
                saga::inventory::handlers(Arc::clone(&inventory)),
            ),
            participant(&bus, ServiceTag::Cart, saga::cart::handlers(Arc::clone(&carts))),
        ];

        Self {
            bus,
            relays,
            participants,
            orders,
            payments,
            inventory,
            carts,
            gateway,
            ledger,
            mappings,
            stock,
            outboxes: vec![order_outbox, payment_outbox, inventory_outbox],
        }
    }

    /// Relays and consumes until quiescent.
    async fn settle(&mut self) {
        for _ in 0..50 {
            let mut moved = 0;
            for relay in &self.relays {
                moved += relay.tick().await.unwrap().published;
            }
            for participant in &mut self.participants {
                for source in &mut participant.sources {
                    moved += participant.consumer.process_available(source).await.unwrap();
                }
            }
            if moved == 0 {
                return;
            }
        }
        panic!("saga did not settle");
    }

    async fn checkout(&mut self, buyer: &Principal, quantity: u32) -> saga::Result<OrderId> {
        let request = CheckoutRequest {
            items: vec![ReservedItem::new(StockKey::product(SKU), quantity)],
        };
        let order = self
            .orders
            .checkout(buyer, request, Some(format!("trace-{quantity}")))
            .await?;
        self.settle().await;
        Ok(order.id())
    }

    async fn pay(&mut self, buyer: &Principal, order_id: OrderId, quantity: u32) {
        let request = ConfirmPayment {
            order_id,
            payment_key: format!("pk-{order_id}"),
            amount: Money::from_cents(PRICE * i64::from(quantity)),
        };
        self.payments.confirm(buyer, request, None).await.unwrap();
        self.settle().await;
    }

    async fn order_status(&self, order_id: OrderId) -> OrderStatus {
        self.orders
            .get(&Principal::Operator, order_id)
            .await
            .unwrap()
            .status()
    }

    async fn payment_status(&self, order_id: OrderId) -> PaymentStatus {
        self.payments
            .get(&Principal::Operator, order_id)
            .await
            .unwrap()
            .status()
    }

    async fn cached(&self) -> u64 {
        self.ledger
            .available(&StockKey::product(SKU))
            .await
            .unwrap()
            .unwrap()
    }

    async fn durable(&self) -> u64 {
        self.stock.quantity(&StockKey::product(SKU)).await.unwrap()
    }

    async fn outbox_len(&self) -> usize {
        let mut total = 0;
        for outbox in &self.outboxes {
            total += outbox.len().await;
        }
        total
    }

    async fn dead_letters(&self) -> usize {
        self.bus.messages(DEFAULT_DEAD_LETTER_TOPIC).await.len()
    }

    async fn published(&self) -> Vec<EventEnvelope> {
        self.bus
            .messages(DEFAULT_EVENT_TOPIC)
            .await
            .iter()
            .map(|m| EventEnvelope::from_bytes(&m.payload).unwrap())
            .collect()
    }
}

fn participant(bus: &InMemoryMessageBus, service: ServiceTag, registry: HandlerRegistry) -> Participant {
    let consumer = EventConsumer::new(service, registry, Arc::new(bus.clone()))
        .with_retry(RetryPolicy::fixed(2, Duration::from_millis(1)));
    let sources = bus.sources(DEFAULT_EVENT_TOPIC, &consumer.group());
    Participant { consumer, sources }
}

fn buyer() -> (UserId, Principal) {
    let user_id = UserId::new();
    (user_id, Principal::user(user_id))
}

#[tokio::test]
async fn happy_path_confirms_deducts_and_clears_the_cart() {
    let mut world = World::new(5).await;
    let (user_id, buyer) = buyer();
    world
        .carts
        .add_item(&buyer, user_id, StockKey::product(SKU), 2)
        .await
        .unwrap();

    let order_id = world.checkout(&buyer, 2).await.unwrap();
    assert_eq!(world.cached().await, 3);
    assert_eq!(world.payment_status(order_id).await, PaymentStatus::Ready);

    world.pay(&buyer, order_id, 2).await;

    assert_eq!(world.order_status(order_id).await, OrderStatus::Confirmed);
    assert_eq!(world.payment_status(order_id).await, PaymentStatus::Paid);
    assert_eq!(world.durable().await, 3);
    assert_eq!(world.cached().await, 3);
    assert!(world.mappings.get(order_id).await.unwrap().is_none());
    assert!(world.carts.get(&buyer, user_id).await.unwrap().is_empty());
    assert_eq!(world.dead_letters().await, 0);

    let types: Vec<EventType> = world.published().await.into_iter().map(|e| e.event_type).collect();
    for expected in [
        EventType::OrderCreated,
        EventType::PaymentCompleted,
        EventType::StockDeducted,
        EventType::OrderConfirmed,
    ] {
        assert!(types.contains(&expected), "missing {expected}");
    }
}

#[tokio::test]
async fn declined_payment_releases_the_reservation() {
    let mut world = World::new(5).await;
    let (_, buyer) = buyer();
    let order_id = world.checkout(&buyer, 2).await.unwrap();
    world
        .gateway
        .script_approve(Scripted::Fail(GatewayError::declined("REJECT_CARD", "card declined")))
        .await;

    world.pay(&buyer, order_id, 2).await;

    assert_eq!(world.order_status(order_id).await, OrderStatus::Failed);
    assert_eq!(world.payment_status(order_id).await, PaymentStatus::Failed);
    assert_eq!(world.cached().await, 5);
    assert_eq!(world.durable().await, 5);
    assert!(world.mappings.get(order_id).await.unwrap().is_none());
}

#[tokio::test]
async fn cancelling_a_confirmed_order_restores_everything() {
    let mut world = World::new(5).await;
    let (_, buyer) = buyer();
    let order_id = world.checkout(&buyer, 2).await.unwrap();
    world.pay(&buyer, order_id, 2).await;
    assert_eq!(world.order_status(order_id).await, OrderStatus::Confirmed);

    world
        .orders
        .cancel(&buyer, order_id, Some("changed my mind".to_string()), None)
        .await
        .unwrap();
    world.settle().await;

    assert_eq!(world.order_status(order_id).await, OrderStatus::Cancelled);
    assert_eq!(world.payment_status(order_id).await, PaymentStatus::Cancelled);
    assert_eq!(world.durable().await, 5);
    assert_eq!(world.cached().await, 5);
    assert_eq!(world.gateway.cancelled().await, vec![format!("pk-{order_id}")]);
}

#[tokio::test]
async fn cancelling_before_payment_voids_and_releases() {
    let mut world = World::new(5).await;
    let (_, buyer) = buyer();
    let order_id = world.checkout(&buyer, 2).await.unwrap();

    world.orders.cancel(&buyer, order_id, None, None).await.unwrap();
    world.settle().await;

    assert_eq!(world.order_status(order_id).await, OrderStatus::Cancelled);
    assert_eq!(world.payment_status(order_id).await, PaymentStatus::Failed);
    assert_eq!(world.cached().await, 5);
    assert_eq!(world.durable().await, 5);
    assert!(world.gateway.cancelled().await.is_empty());
}

#[tokio::test]
async fn refund_of_a_failed_payment_is_rejected_without_side_effects() {
    let mut world = World::new(5).await;
    let (_, buyer) = buyer();
    let order_id = world.checkout(&buyer, 1).await.unwrap();
    world
        .gateway
        .script_approve(Scripted::Fail(GatewayError::declined("REJECT_CARD", "card declined")))
        .await;
    world.pay(&buyer, order_id, 1).await;
    let records_before = world.outbox_len().await;

    let err = world
        .payments
        .refund(&Principal::Operator, order_id, None)
        .await
        .unwrap_err();
    world.settle().await;

    assert!(matches!(err, SagaError::Domain(ref e) if e.is_invalid_transition()));
    assert_eq!(world.payment_status(order_id).await, PaymentStatus::Failed);
    assert_eq!(world.outbox_len().await, records_before);
    assert!(world.gateway.cancelled().await.is_empty());
}

#[tokio::test]
async fn durable_shortfall_refunds_and_fails_the_order() {
    let mut world = World::new(5).await;
    let (_, buyer) = buyer();
    let order_id = world.checkout(&buyer, 4).await.unwrap();
    // Durable stock drops behind the cache's back.
    world
        .stock
        .upsert(StockUnit {
            key: StockKey::product(SKU),
            name: "Widget".to_string(),
            unit_price: Money::from_cents(PRICE),
            quantity: 1,
        })
        .await
        .unwrap();

    world.pay(&buyer, order_id, 4).await;

    assert_eq!(world.order_status(order_id).await, OrderStatus::Failed);
    assert_eq!(world.payment_status(order_id).await, PaymentStatus::Cancelled);
    assert_eq!(world.durable().await, 1);
    assert_eq!(world.cached().await, 5);
}

#[tokio::test]
async fn refused_refund_escalates_to_manual_check() {
    let mut world = World::new(5).await;
    let (_, buyer) = buyer();
    let order_id = world.checkout(&buyer, 4).await.unwrap();
    world
        .stock
        .upsert(StockUnit {
            key: StockKey::product(SKU),
            name: "Widget".to_string(),
            unit_price: Money::from_cents(PRICE),
            quantity: 0,
        })
        .await
        .unwrap();
    world
        .gateway
        .script_cancel(Scripted::Fail(GatewayError::declined("NOT_CANCELABLE", "already settled")))
        .await;

    world.pay(&buyer, order_id, 4).await;

    assert_eq!(world.order_status(order_id).await, OrderStatus::ManualCheck);
    let payment = world.payments.get(&Principal::Operator, order_id).await.unwrap();
    assert_eq!(payment.status(), PaymentStatus::Paid);
    assert!(payment.refund_failure_reason().is_some());
}

#[tokio::test]
async fn redelivery_after_completion_changes_nothing() {
    let mut world = World::new(5).await;
    let (_, buyer) = buyer();
    let order_id = world.checkout(&buyer, 2).await.unwrap();
    world.pay(&buyer, order_id, 2).await;
    let records_before = world.outbox_len().await;

    // Lose the committed offsets of the participants whose handlers are
    // idempotent against any later state.
    for service in [ServiceTag::Inventory, ServiceTag::Payment, ServiceTag::Cart] {
        world
            .bus
            .replay(DEFAULT_EVENT_TOPIC, &service.consumer_group())
            .await;
    }
    world.settle().await;

    assert_eq!(world.durable().await, 3);
    assert_eq!(world.cached().await, 3);
    assert_eq!(world.order_status(order_id).await, OrderStatus::Confirmed);
    assert_eq!(world.outbox_len().await, records_before);
    assert_eq!(world.dead_letters().await, 0);
}

#[tokio::test]
async fn concurrent_checkouts_never_oversell() {
    let world = World::new(5).await;
    let mut tasks = Vec::new();
    for _ in 0..20 {
        let orders = Arc::clone(&world.orders);
        tasks.push(tokio::spawn(async move {
            let request = CheckoutRequest {
                items: vec![ReservedItem::new(StockKey::product(SKU), 1)],
            };
            orders
                .checkout(&Principal::user(UserId::new()), request, None)
                .await
        }));
    }

    let mut placed = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => placed += 1,
            Err(SagaError::Ledger(_)) => {}
            Err(other) => panic!("unexpected checkout error: {other}"),
        }
    }

    assert_eq!(placed, 5);
    assert_eq!(world.cached().await, 0);
}

#[tokio::test]
async fn checkout_is_refused_when_stock_is_short() {
    let mut world = World::new(1).await;
    let (_, buyer) = buyer();

    let err = world.checkout(&buyer, 2).await.unwrap_err();

    assert!(matches!(err, SagaError::Ledger(_)));
    assert_eq!(world.cached().await, 1);
    assert_eq!(world.outbox_len().await, 0);
    assert!(world.inventory.unit(&StockKey::product(SKU)).await.unwrap().is_some());
}
